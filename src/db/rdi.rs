//! Registered datastore instances.
//!
//! A [`RegisteredDatastore`] is the public per-datastore handle. Its four
//! operations ([`lease_connection`], [`transaction`], [`send_statement`],
//! [`send_native_query`]) return builders that accept optional metadata and,
//! for queries, a caller-owned connection. Awaiting a builder runs it.
//!
//! When the adapter is incompatible or does not expose a usable entry for the
//! datastore, the handle is still built; every operation then fails with the
//! same precomputed `E_NOT_SUPPORTED` error.
//!
//! [`lease_connection`]: RegisteredDatastore::lease_connection
//! [`transaction`]: RegisteredDatastore::transaction
//! [`send_statement`]: RegisteredDatastore::send_statement
//! [`send_native_query`]: RegisteredDatastore::send_native_query

use super::executor;
use super::lease::{LeaseOptions, Resource, with_connection};
use super::transaction::run_transaction;
use crate::adapters::Adapter;
use crate::driver::{
    Capabilities, Connectable, Connection, Driver, DriverOperation, Manager, NativeQuery,
    Queryable, Tier, Transactional, check_adapter_api_version, check_exposes_datastores,
};
use crate::error::{DatastoreError, DsResult};
use crate::models::{DatastoreConfig, Meta, Statement};
use futures_util::future::BoxFuture;
use serde_json::Value;
use std::collections::BTreeSet;
use std::fmt;
use std::future::{Future, IntoFuture};
use std::sync::Arc;
use tracing::{debug, warn};

#[derive(Clone)]
struct Binding {
    driver: Arc<dyn Driver>,
    manager: Manager,
    operations: BTreeSet<DriverOperation>,
    capabilities: Capabilities,
}

pub struct RegisteredDatastore {
    name: String,
    adapter: String,
    config: DatastoreConfig,
    binding: Result<Binding, DatastoreError>,
}

impl RegisteredDatastore {
    /// Build the handle for `name` from its normalized config and adapter.
    ///
    /// Only an empty name is a hard failure. Compatibility problems are kept
    /// and returned from every operation instead.
    pub fn build(name: &str, config: DatastoreConfig, adapter: &dyn Adapter) -> DsResult<Self> {
        if name.is_empty() {
            return Err(DatastoreError::consistency(
                "cannot build a registered datastore without a name",
            ));
        }

        let binding = check_adapter_api_version(name, adapter)
            .and_then(|()| check_exposes_datastores(name, adapter))
            .map(|exposed| {
                let operations = exposed.driver.operations();
                let capabilities = Capabilities::classify(&operations);
                Binding {
                    driver: exposed.driver,
                    manager: exposed.manager,
                    operations,
                    capabilities,
                }
            })
            .map_err(|e| match e {
                DatastoreError::NotSupported { .. } => e,
                other => DatastoreError::not_supported(name, "datastore access", other.to_string()),
            });

        match &binding {
            Ok(b) => debug!(
                datastore = %name,
                connectable = b.capabilities.connectable,
                queryable = b.capabilities.queryable,
                transactional = b.capabilities.transactional,
                "Built registered datastore"
            ),
            Err(e) => warn!(datastore = %name, error = %e, "Registered datastore is unusable"),
        }

        Ok(Self {
            name: name.to_string(),
            adapter: adapter.manifest().identity.clone(),
            config,
            binding,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Identity of the adapter backing this datastore.
    pub fn adapter(&self) -> &str {
        &self.adapter
    }

    pub fn config(&self) -> &DatastoreConfig {
        &self.config
    }

    pub fn driver(&self) -> Option<&Arc<dyn Driver>> {
        self.binding.as_ref().ok().map(|b| &b.driver)
    }

    pub fn manager(&self) -> Option<&Manager> {
        self.binding.as_ref().ok().map(|b| &b.manager)
    }

    /// Classified tiers, or `None` for an unusable datastore.
    pub fn capabilities(&self) -> Option<Capabilities> {
        self.binding.as_ref().ok().map(|b| b.capabilities)
    }

    /// The error every operation returns when the datastore is unusable.
    pub fn unsupported_reason(&self) -> Option<&DatastoreError> {
        self.binding.as_ref().err()
    }

    /// Run `work` on a connection leased ad hoc from this datastore's manager.
    pub fn lease_connection<F>(&self, work: F) -> LeaseConnection<'_, F> {
        LeaseConnection {
            rdi: self,
            work,
            meta: Meta::new(),
        }
    }

    /// Run `work` inside a transaction on a leased connection.
    pub fn transaction<F>(&self, work: F) -> Transaction<'_, F> {
        Transaction {
            rdi: self,
            work,
            meta: Meta::new(),
        }
    }

    pub fn send_statement(&self, statement: Statement) -> SendStatement<'_> {
        SendStatement {
            rdi: self,
            statement,
            meta: Meta::new(),
            connection: None,
        }
    }

    pub fn send_native_query(&self, query: impl Into<NativeQuery>) -> SendNativeQuery<'_> {
        SendNativeQuery {
            rdi: self,
            query: query.into(),
            meta: Meta::new(),
            connection: None,
        }
    }

    fn options(&self, meta: Meta) -> LeaseOptions {
        LeaseOptions::new(meta).with_timeout(self.config.lease_timeout)
    }

    fn require(&self, tier: Tier, operation: &str) -> DsResult<&Binding> {
        let binding = self.binding.as_ref().map_err(Clone::clone)?;
        if binding.capabilities.supports(tier) {
            return Ok(binding);
        }

        let missing: Vec<&str> = Capabilities::missing(&binding.operations, tier)
            .into_iter()
            .map(|op| op.as_str())
            .collect();
        Err(DatastoreError::not_supported(
            &self.name,
            operation,
            format!(
                "`{}` requires a {} driver, but the `{}` adapter's driver is missing: {}",
                operation,
                tier,
                self.adapter,
                missing.join(", ")
            ),
        ))
    }

    fn connectable<'s>(&'s self, binding: &'s Binding) -> DsResult<&'s dyn Connectable> {
        binding
            .driver
            .connectable()
            .ok_or_else(|| self.tier_mismatch("connectable"))
    }

    fn queryable<'s>(&'s self, binding: &'s Binding) -> DsResult<&'s dyn Queryable> {
        binding
            .driver
            .queryable()
            .ok_or_else(|| self.tier_mismatch("queryable"))
    }

    fn transactional<'s>(&'s self, binding: &'s Binding) -> DsResult<&'s dyn Transactional> {
        binding
            .driver
            .transactional()
            .ok_or_else(|| self.tier_mismatch("transactional"))
    }

    fn tier_mismatch(&self, tier: &str) -> DatastoreError {
        DatastoreError::consistency(format!(
            "driver for datastore `{}` reports the {} operations but does not provide the {} tier",
            self.name, tier, tier
        ))
    }

    fn resource(binding: &Binding, connection: Option<Connection>) -> Resource {
        match connection {
            Some(connection) => Resource::Connection(connection),
            None => Resource::Manager(binding.manager.clone()),
        }
    }
}

impl fmt::Debug for RegisteredDatastore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RegisteredDatastore")
            .field("name", &self.name)
            .field("adapter", &self.adapter)
            .field("capabilities", &self.capabilities())
            .finish()
    }
}

/// Pending `lease_connection` call.
#[must_use = "builders do nothing unless awaited"]
pub struct LeaseConnection<'a, F> {
    rdi: &'a RegisteredDatastore,
    work: F,
    meta: Meta,
}

impl<F> LeaseConnection<'_, F> {
    pub fn meta(mut self, meta: Meta) -> Self {
        self.meta = meta;
        self
    }
}

impl<'a, T, F, Fut> IntoFuture for LeaseConnection<'a, F>
where
    F: FnOnce(Connection) -> Fut + Send + 'a,
    Fut: Future<Output = DsResult<T>> + Send + 'a,
    T: Send + 'a,
{
    type Output = DsResult<T>;
    type IntoFuture = BoxFuture<'a, DsResult<T>>;

    fn into_future(self) -> Self::IntoFuture {
        Box::pin(async move {
            let rdi = self.rdi;
            let binding = rdi.require(Tier::Connectable, "leaseConnection")?;
            let connectable = rdi.connectable(binding)?;
            let options = rdi.options(self.meta);
            with_connection(
                connectable,
                Resource::Manager(binding.manager.clone()),
                &options,
                self.work,
            )
            .await
        })
    }
}

/// Pending `transaction` call.
#[must_use = "builders do nothing unless awaited"]
pub struct Transaction<'a, F> {
    rdi: &'a RegisteredDatastore,
    work: F,
    meta: Meta,
}

impl<F> Transaction<'_, F> {
    pub fn meta(mut self, meta: Meta) -> Self {
        self.meta = meta;
        self
    }
}

impl<'a, T, F, Fut> IntoFuture for Transaction<'a, F>
where
    F: FnOnce(Connection) -> Fut + Send + 'a,
    Fut: Future<Output = DsResult<T>> + Send + 'a,
    T: Send + 'a,
{
    type Output = DsResult<T>;
    type IntoFuture = BoxFuture<'a, DsResult<T>>;

    fn into_future(self) -> Self::IntoFuture {
        Box::pin(async move {
            let rdi = self.rdi;
            let binding = rdi.require(Tier::Transactional, "transaction")?;
            let connectable = rdi.connectable(binding)?;
            let transactional = rdi.transactional(binding)?;
            let options = rdi.options(self.meta);
            run_transaction(
                connectable,
                transactional,
                binding.manager.clone(),
                &options,
                self.work,
            )
            .await
        })
    }
}

/// Pending `send_statement` call.
#[must_use = "builders do nothing unless awaited"]
pub struct SendStatement<'a> {
    rdi: &'a RegisteredDatastore,
    statement: Statement,
    meta: Meta,
    connection: Option<Connection>,
}

impl SendStatement<'_> {
    pub fn meta(mut self, meta: Meta) -> Self {
        self.meta = meta;
        self
    }

    /// Run on a connection the caller owns; it is not released afterwards.
    pub fn using_connection(mut self, connection: Connection) -> Self {
        self.connection = Some(connection);
        self
    }
}

impl<'a> IntoFuture for SendStatement<'a> {
    type Output = DsResult<Value>;
    type IntoFuture = BoxFuture<'a, DsResult<Value>>;

    fn into_future(self) -> Self::IntoFuture {
        Box::pin(async move {
            let rdi = self.rdi;
            let binding = rdi.require(Tier::Queryable, "sendStatement")?;
            let connectable = rdi.connectable(binding)?;
            let queryable = rdi.queryable(binding)?;
            let options = rdi.options(self.meta);
            executor::send_statement(
                connectable,
                queryable,
                RegisteredDatastore::resource(binding, self.connection),
                &self.statement,
                &options,
            )
            .await
        })
    }
}

/// Pending `send_native_query` call.
#[must_use = "builders do nothing unless awaited"]
pub struct SendNativeQuery<'a> {
    rdi: &'a RegisteredDatastore,
    query: NativeQuery,
    meta: Meta,
    connection: Option<Connection>,
}

impl SendNativeQuery<'_> {
    pub fn meta(mut self, meta: Meta) -> Self {
        self.meta = meta;
        self
    }

    pub fn values(mut self, values: Vec<Value>) -> Self {
        self.query.values_to_escape = values;
        self
    }

    /// Run on a connection the caller owns; it is not released afterwards.
    pub fn using_connection(mut self, connection: Connection) -> Self {
        self.connection = Some(connection);
        self
    }
}

impl<'a> IntoFuture for SendNativeQuery<'a> {
    type Output = DsResult<Value>;
    type IntoFuture = BoxFuture<'a, DsResult<Value>>;

    fn into_future(self) -> Self::IntoFuture {
        Box::pin(async move {
            let rdi = self.rdi;
            let binding = rdi.require(Tier::Queryable, "sendNativeQuery")?;
            let connectable = rdi.connectable(binding)?;
            let queryable = rdi.queryable(binding)?;
            let options = rdi.options(self.meta);
            executor::send_native_query(
                connectable,
                queryable,
                RegisteredDatastore::resource(binding, self.connection),
                &self.query,
                &options,
            )
            .await
        })
    }
}
