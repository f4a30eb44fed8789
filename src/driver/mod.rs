//! Driver capability surface.
//!
//! A driver is the low-level operation set an adapter exposes for one
//! datastore. Operations are grouped into three nested tiers, each a trait:
//!
//! - [`Connectable`]: manager and connection lifecycle
//! - [`Queryable`]: compile, send and parse native queries
//! - [`Transactional`]: begin, commit and roll back on a connection
//!
//! A [`Driver`] hands out whichever tiers it implements. Tier membership is
//! classified once by [`capability::Capabilities::of`] and cached by the
//! registered datastore instance.

pub mod capability;

pub use capability::{
    Capabilities, DriverOperation, ExposedDatastore, SUPPORTED_ADAPTER_API_VERSION, Tier,
    check_adapter_api_version, check_exposes_datastores,
};

use crate::error::{DatastoreError, DsResult};
use crate::models::{DatastoreConfig, Meta, QueryType, Statement};
use async_trait::async_trait;
use serde_json::Value;
use std::any::Any;
use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;
use uuid::Uuid;

macro_rules! opaque_handle {
    ($(#[$doc:meta])* $name:ident, $what:literal) => {
        $(#[$doc])*
        #[derive(Clone)]
        pub struct $name {
            id: Uuid,
            inner: Arc<dyn Any + Send + Sync>,
        }

        impl $name {
            pub fn new<T: Any + Send + Sync>(inner: T) -> Self {
                Self {
                    id: Uuid::new_v4(),
                    inner: Arc::new(inner),
                }
            }

            pub fn id(&self) -> Uuid {
                self.id
            }

            /// Borrow the driver-specific value, if it is a `T`.
            pub fn downcast_ref<T: Any>(&self) -> Option<&T> {
                self.inner.as_ref().downcast_ref::<T>()
            }

            /// Borrow the driver-specific value, failing with a consistency
            /// violation when the handle was issued by a different driver.
            pub fn expect_ref<T: Any>(&self, driver: &str) -> DsResult<&T> {
                self.downcast_ref::<T>().ok_or_else(|| {
                    DatastoreError::consistency(format!(
                        concat!($what, " {} was not issued by the `{}` driver"),
                        self.id, driver
                    ))
                })
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.debug_struct(stringify!($name)).field("id", &self.id).finish()
            }
        }

        impl PartialEq for $name {
            fn eq(&self, other: &Self) -> bool {
                self.id == other.id
            }
        }

        impl Eq for $name {}
    };
}

opaque_handle!(
    /// Opaque connection handle returned by [`Connectable::get_connection`].
    Connection,
    "connection"
);

opaque_handle!(
    /// Opaque pool / connection-factory handle owned by a driver.
    Manager,
    "manager"
);

/// A query in the driver's own language plus the values it escapes.
#[derive(Debug, Clone, PartialEq)]
pub struct NativeQuery {
    pub query: String,
    pub values_to_escape: Vec<Value>,
}

impl NativeQuery {
    pub fn new(query: impl Into<String>) -> Self {
        Self {
            query: query.into(),
            values_to_escape: Vec::new(),
        }
    }

    pub fn with_values(mut self, values: Vec<Value>) -> Self {
        self.values_to_escape = values;
        self
    }
}

impl From<&str> for NativeQuery {
    fn from(query: &str) -> Self {
        Self::new(query)
    }
}

impl From<String> for NativeQuery {
    fn from(query: String) -> Self {
        Self::new(query)
    }
}

/// Output of [`Queryable::compile_statement`].
#[derive(Debug, Clone, PartialEq)]
pub struct CompiledStatement {
    pub native_query: String,
    pub values_to_escape: Vec<Value>,
    /// Metadata produced by compilation; wins over caller metadata on conflict.
    pub meta: Option<Meta>,
}

impl CompiledStatement {
    pub fn new(native_query: impl Into<String>, values_to_escape: Vec<Value>) -> Self {
        Self {
            native_query: native_query.into(),
            values_to_escape,
            meta: None,
        }
    }

    pub fn native_query(&self) -> NativeQuery {
        NativeQuery {
            query: self.native_query.clone(),
            values_to_escape: self.values_to_escape.clone(),
        }
    }
}

/// Ways [`Queryable::send_native_query`] can fail.
#[derive(Debug, Clone)]
pub enum SendFailure {
    /// The round-trip happened but the database rejected the query.
    QueryFailed {
        error: DatastoreError,
        meta: Option<Meta>,
    },
    /// Anything else (lost connection, protocol error, ...).
    Other(DatastoreError),
}

impl From<DatastoreError> for SendFailure {
    fn from(err: DatastoreError) -> Self {
        Self::Other(err)
    }
}

#[async_trait]
pub trait Connectable: Send + Sync {
    async fn create_manager(&self, config: &DatastoreConfig) -> DsResult<Manager>;

    async fn destroy_manager(&self, manager: &Manager) -> DsResult<()>;

    async fn get_connection(&self, manager: &Manager, meta: &Meta) -> DsResult<Connection>;

    async fn release_connection(&self, connection: &Connection, meta: &Meta) -> DsResult<()>;
}

#[async_trait]
pub trait Queryable: Send + Sync {
    async fn send_native_query(
        &self,
        connection: &Connection,
        query: &NativeQuery,
        meta: &Meta,
    ) -> Result<Value, SendFailure>;

    fn compile_statement(&self, statement: &Statement, meta: &Meta)
    -> DsResult<CompiledStatement>;

    fn parse_native_query_result(
        &self,
        query_type: QueryType,
        raw: &Value,
        meta: &Meta,
    ) -> DsResult<Value>;

    /// Classify a query failure into a footprint.
    fn parse_native_query_error(
        &self,
        error: &DatastoreError,
        meta: &Meta,
    ) -> DsResult<crate::error::Footprint>;
}

#[async_trait]
pub trait Transactional: Send + Sync {
    async fn begin_transaction(&self, connection: &Connection, meta: &Meta) -> DsResult<()>;

    async fn commit_transaction(&self, connection: &Connection, meta: &Meta) -> DsResult<()>;

    async fn rollback_transaction(&self, connection: &Connection, meta: &Meta) -> DsResult<()>;
}

/// A driver exposes the tiers it implements.
pub trait Driver: Send + Sync + fmt::Debug {
    fn identity(&self) -> &str;

    fn connectable(&self) -> Option<&dyn Connectable>;

    fn queryable(&self) -> Option<&dyn Queryable> {
        None
    }

    fn transactional(&self) -> Option<&dyn Transactional> {
        None
    }

    /// Names of the operations this driver implements.
    fn operations(&self) -> BTreeSet<DriverOperation> {
        let mut ops = BTreeSet::new();
        if self.connectable().is_some() {
            ops.extend(Tier::Connectable.own_operations());
        }
        if self.queryable().is_some() {
            ops.extend(Tier::Queryable.own_operations());
        }
        if self.transactional().is_some() {
            ops.extend(Tier::Transactional.own_operations());
        }
        ops
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_handle_downcast() {
        let conn = Connection::new(42u32);
        assert_eq!(conn.downcast_ref::<u32>(), Some(&42));
        assert!(conn.downcast_ref::<String>().is_none());

        let err = conn.expect_ref::<String>("memory").unwrap_err();
        assert_eq!(err.code(), "E_CONSISTENCY_VIOLATION");
    }

    #[test]
    fn test_handle_identity_survives_clone() {
        let manager = Manager::new(());
        let copy = manager.clone();
        assert_eq!(manager, copy);
        assert_ne!(manager, Manager::new(()));
    }
}
