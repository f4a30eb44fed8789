//! Adapter capability negotiation.
//!
//! Classification is a pure function over the set of operation names a
//! driver implements. The tiers nest: transactional implies queryable,
//! which implies connectable.

use super::Driver;
use crate::adapters::{Adapter, DatastoreEntry};
use crate::error::{DatastoreError, DsResult};
use serde_json::Value;
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

/// The one adapter API version this runtime speaks.
pub const SUPPORTED_ADAPTER_API_VERSION: u64 = 1;

/// Named driver operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum DriverOperation {
    CreateManager,
    DestroyManager,
    GetConnection,
    ReleaseConnection,
    SendNativeQuery,
    CompileStatement,
    ParseNativeQueryResult,
    ParseNativeQueryError,
    BeginTransaction,
    CommitTransaction,
    RollbackTransaction,
}

impl DriverOperation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::CreateManager => "createManager",
            Self::DestroyManager => "destroyManager",
            Self::GetConnection => "getConnection",
            Self::ReleaseConnection => "releaseConnection",
            Self::SendNativeQuery => "sendNativeQuery",
            Self::CompileStatement => "compileStatement",
            Self::ParseNativeQueryResult => "parseNativeQueryResult",
            Self::ParseNativeQueryError => "parseNativeQueryError",
            Self::BeginTransaction => "beginTransaction",
            Self::CommitTransaction => "commitTransaction",
            Self::RollbackTransaction => "rollbackTransaction",
        }
    }
}

impl fmt::Display for DriverOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DriverOperation {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Tier::Transactional
            .required_operations()
            .into_iter()
            .find(|op| op.as_str() == s)
            .ok_or_else(|| format!("unknown driver operation `{}`", s))
    }
}

/// Capability tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Tier {
    Connectable,
    Queryable,
    Transactional,
}

impl Tier {
    /// Operations this tier adds on top of the tier below it.
    pub fn own_operations(&self) -> &'static [DriverOperation] {
        use DriverOperation::*;
        match self {
            Self::Connectable => &[
                CreateManager,
                DestroyManager,
                GetConnection,
                ReleaseConnection,
            ],
            Self::Queryable => &[
                SendNativeQuery,
                CompileStatement,
                ParseNativeQueryResult,
                ParseNativeQueryError,
            ],
            Self::Transactional => &[BeginTransaction, CommitTransaction, RollbackTransaction],
        }
    }

    /// Every operation needed to belong to this tier.
    pub fn required_operations(&self) -> Vec<DriverOperation> {
        [Self::Connectable, Self::Queryable, Self::Transactional]
            .into_iter()
            .filter(|tier| tier <= self)
            .flat_map(|tier| tier.own_operations().iter().copied())
            .collect()
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Connectable => "connectable",
            Self::Queryable => "queryable",
            Self::Transactional => "transactional",
        }
    }
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Classified tiers of one driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Capabilities {
    pub connectable: bool,
    pub queryable: bool,
    pub transactional: bool,
}

impl Capabilities {
    /// Classify a set of implemented operations.
    pub fn classify(operations: &BTreeSet<DriverOperation>) -> Self {
        let has = |tier: Tier| tier.own_operations().iter().all(|op| operations.contains(op));

        let connectable = has(Tier::Connectable);
        let queryable = connectable && has(Tier::Queryable);
        let transactional = queryable && has(Tier::Transactional);

        Self {
            connectable,
            queryable,
            transactional,
        }
    }

    /// Classify from operation names. Unknown names are ignored.
    pub fn classify_names<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let operations = names
            .into_iter()
            .filter_map(|name| name.as_ref().parse().ok())
            .collect();
        Self::classify(&operations)
    }

    pub fn of(driver: &dyn Driver) -> Self {
        Self::classify(&driver.operations())
    }

    pub fn supports(&self, tier: Tier) -> bool {
        match tier {
            Tier::Connectable => self.connectable,
            Tier::Queryable => self.queryable,
            Tier::Transactional => self.transactional,
        }
    }

    /// Operations missing from `operations` for `tier`.
    pub fn missing(operations: &BTreeSet<DriverOperation>, tier: Tier) -> Vec<DriverOperation> {
        tier.required_operations()
            .into_iter()
            .filter(|op| !operations.contains(op))
            .collect()
    }
}

const COMPATIBILITY_HINT: &str = "If there is an older or newer version of this adapter, try switching to it, or contact the adapter's maintainer.";

/// Fail with `E_NOT_COMPATIBLE` unless the adapter declares exactly the supported API version.
pub fn check_adapter_api_version(datastore: &str, adapter: &dyn Adapter) -> DsResult<()> {
    if datastore.is_empty() {
        return Err(DatastoreError::consistency(
            "a datastore name is required to check adapter compatibility",
        ));
    }

    let identity = &adapter.manifest().identity;
    let prefix = format!(
        "The adapter used by the `{}` datastore is not compatible with this runtime.",
        datastore
    );

    let declared = match &adapter.manifest().adapter_api_version {
        Some(Value::Number(n)) => n.as_f64(),
        _ => None,
    };
    let Some(version) = declared else {
        return Err(DatastoreError::not_compatible(
            identity,
            format!(
                "{} The adapter should expose a valid `adapterApiVersion`. {}",
                prefix, COMPATIBILITY_HINT
            ),
        ));
    };

    let expected = SUPPORTED_ADAPTER_API_VERSION as f64;
    if version != expected {
        let age = if version < expected { "too old" } else { "too new" };
        return Err(DatastoreError::not_compatible(
            identity,
            format!(
                "{} The adapter's declared `adapterApiVersion` ({}) is {}. (Expecting `{}`.) {}",
                prefix, version, age, SUPPORTED_ADAPTER_API_VERSION, COMPATIBILITY_HINT
            ),
        ));
    }

    Ok(())
}

/// A complete adapter-owned entry for one datastore.
#[derive(Debug, Clone)]
pub struct ExposedDatastore {
    pub driver: Arc<dyn Driver>,
    pub manager: super::Manager,
    pub config: crate::models::DatastoreConfig,
}

/// Fail with `E_NOT_SUPPORTED` unless the adapter exposes a complete entry for `datastore`.
pub fn check_exposes_datastores(
    datastore: &str,
    adapter: &dyn Adapter,
) -> DsResult<ExposedDatastore> {
    let unsupported = |detail: &str| {
        DatastoreError::not_supported(
            datastore,
            "datastore access",
            format!(
                "The adapter used by the `{}` datastore does not support direct access to its datastores: {}",
                datastore, detail
            ),
        )
    };

    let datastores = adapter
        .datastores()
        .ok_or_else(|| unsupported("it does not expose a `datastores` table."))?;

    let DatastoreEntry {
        driver,
        manager,
        config,
    } = datastores.get(datastore).ok_or_else(|| {
        unsupported("its `datastores` table is missing an entry for this datastore.")
    })?;

    let missing: Vec<&str> = [
        ("driver", driver.is_none()),
        ("manager", manager.is_none()),
        ("config", config.is_none()),
    ]
    .into_iter()
    .filter_map(|(key, absent)| absent.then_some(key))
    .collect();

    match (driver, manager, config) {
        (Some(driver), Some(manager), Some(config)) => Ok(ExposedDatastore {
            driver,
            manager,
            config,
        }),
        _ => Err(unsupported(&format!(
            "its entry for this datastore is missing {}.",
            missing.join(", ")
        ))),
    }
}
