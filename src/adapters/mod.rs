//! Pluggable storage adapters.
//!
//! An adapter owns a table of per-datastore entries (driver, manager,
//! normalized config) and may expose schema operations for auto-migration.
//! [`DriverAdapter`] turns any [`Driver`] into an adapter; the built-in
//! `memory` and `sqlx` adapters are assembled that way.

pub mod catalog;
pub mod footprint;
pub mod memory;
pub mod sql;

pub use catalog::{AdapterCatalog, AdapterFactory, validate_adapter};

use crate::driver::{Driver, Manager};
use crate::error::{DatastoreError, DsResult};
use crate::models::{DatastoreConfig, ModelDef, Record, TableSpec};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, PoisonError, RwLock};
use tracing::{debug, info, warn};

/// Static description of an adapter.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AdapterManifest {
    pub identity: String,
    /// Declared API version, kept raw so non-numeric declarations can be reported.
    #[serde(default)]
    pub adapter_api_version: Option<Value>,
    /// Config defaults merged underneath app-level datastore settings.
    #[serde(default = "empty_object")]
    pub defaults: Value,
}

fn empty_object() -> Value {
    Value::Object(Map::new())
}

impl AdapterManifest {
    pub fn new(identity: impl Into<String>, adapter_api_version: u64) -> Self {
        Self {
            identity: identity.into(),
            adapter_api_version: Some(Value::from(adapter_api_version)),
            defaults: empty_object(),
        }
    }

    pub fn with_defaults(mut self, defaults: Map<String, Value>) -> Self {
        self.defaults = Value::Object(defaults);
        self
    }

    /// Defaults as a map; empty when they are not an object.
    pub fn default_settings(&self) -> Map<String, Value> {
        self.defaults.as_object().cloned().unwrap_or_default()
    }
}

/// Adapter-owned state for one datastore. Any part may be missing when an
/// adapter is only partially set up.
#[derive(Debug, Clone, Default)]
pub struct DatastoreEntry {
    pub driver: Option<Arc<dyn Driver>>,
    pub manager: Option<Manager>,
    pub config: Option<DatastoreConfig>,
}

/// Table of datastore entries keyed by datastore name.
#[derive(Default)]
pub struct AdapterDatastores {
    entries: RwLock<BTreeMap<String, DatastoreEntry>>,
}

impl AdapterDatastores {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, name: &str) -> Option<DatastoreEntry> {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(name)
    }

    pub fn insert(&self, name: impl Into<String>, entry: DatastoreEntry) {
        self.entries
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(name.into(), entry);
    }

    pub fn remove(&self, name: &str) -> Option<DatastoreEntry> {
        self.entries
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(name)
    }

    pub fn names(&self) -> Vec<String> {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect()
    }
}

impl fmt::Debug for AdapterDatastores {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AdapterDatastores")
            .field("names", &self.names())
            .finish()
    }
}

/// Schema operations used by auto-migration.
#[async_trait]
pub trait SchemaMigrator: Send + Sync + fmt::Debug {
    async fn has_table(&self, manager: &Manager, table: &str) -> DsResult<bool>;

    async fn define_table(&self, manager: &Manager, table: &TableSpec) -> DsResult<()>;

    async fn drop_table(&self, manager: &Manager, table: &str) -> DsResult<()>;

    async fn fetch_all(&self, manager: &Manager, table: &str) -> DsResult<Vec<Record>>;

    async fn insert_record(
        &self,
        manager: &Manager,
        table: &TableSpec,
        record: &Record,
    ) -> DsResult<()>;
}

#[async_trait]
pub trait Adapter: Send + Sync + fmt::Debug {
    fn manifest(&self) -> &AdapterManifest;

    /// The adapter's datastore table, if it exposes one.
    fn datastores(&self) -> Option<&AdapterDatastores>;

    /// Set up a datastore: create its manager and record the entry.
    async fn register_datastore(
        &self,
        config: &DatastoreConfig,
        models: &[Arc<ModelDef>],
    ) -> DsResult<()>;

    /// Destroy the manager of one datastore, or of all when `datastore` is `None`.
    async fn teardown(&self, datastore: Option<&str>) -> DsResult<()>;

    fn migrator(&self) -> Option<&dyn SchemaMigrator> {
        None
    }
}

/// Picks the driver for one datastore from its config.
pub type DriverFactory = fn(&DatastoreConfig) -> DsResult<Arc<dyn Driver>>;

/// Adapter built from a driver and an optional migrator.
#[derive(Debug)]
pub struct DriverAdapter {
    manifest: AdapterManifest,
    driver: Arc<dyn Driver>,
    driver_factory: Option<DriverFactory>,
    migrator: Option<Arc<dyn SchemaMigrator>>,
    datastores: AdapterDatastores,
}

impl DriverAdapter {
    pub fn new(manifest: AdapterManifest, driver: Arc<dyn Driver>) -> Self {
        Self {
            manifest,
            driver,
            driver_factory: None,
            migrator: None,
            datastores: AdapterDatastores::new(),
        }
    }

    /// Build each datastore's driver from its config instead of sharing `driver`.
    pub fn with_driver_factory(mut self, factory: DriverFactory) -> Self {
        self.driver_factory = Some(factory);
        self
    }

    pub fn with_migrator(mut self, migrator: Arc<dyn SchemaMigrator>) -> Self {
        self.migrator = Some(migrator);
        self
    }

    pub fn driver(&self) -> &Arc<dyn Driver> {
        &self.driver
    }

    async fn destroy_entry(&self, name: &str, entry: DatastoreEntry) -> DsResult<()> {
        let (Some(driver), Some(manager)) = (entry.driver, entry.manager) else {
            return Ok(());
        };
        let Some(connectable) = driver.connectable() else {
            return Ok(());
        };
        connectable.destroy_manager(&manager).await?;
        debug!(adapter = %self.manifest.identity, datastore = %name, "Destroyed manager");
        Ok(())
    }
}

#[async_trait]
impl Adapter for DriverAdapter {
    fn manifest(&self) -> &AdapterManifest {
        &self.manifest
    }

    fn datastores(&self) -> Option<&AdapterDatastores> {
        Some(&self.datastores)
    }

    async fn register_datastore(
        &self,
        config: &DatastoreConfig,
        models: &[Arc<ModelDef>],
    ) -> DsResult<()> {
        if self.datastores.contains(&config.name) {
            return Err(DatastoreError::invalid_datastore(
                &config.name,
                format!(
                    "datastore is already registered with adapter `{}`",
                    self.manifest.identity
                ),
            ));
        }

        let driver = match self.driver_factory {
            Some(factory) => factory(config)?,
            None => self.driver.clone(),
        };

        // Non-connectable drivers still get an entry, without a manager.
        let manager = match driver.connectable() {
            Some(connectable) => Some(connectable.create_manager(config).await?),
            None => {
                warn!(
                    adapter = %self.manifest.identity,
                    datastore = %config.name,
                    "Driver is not connectable; datastore will have no manager"
                );
                None
            }
        };

        self.datastores.insert(
            config.name.clone(),
            DatastoreEntry {
                driver: Some(driver),
                manager,
                config: Some(config.clone()),
            },
        );

        info!(
            adapter = %self.manifest.identity,
            datastore = %config.name,
            models = models.len(),
            "Registered datastore"
        );
        Ok(())
    }

    async fn teardown(&self, datastore: Option<&str>) -> DsResult<()> {
        let names = match datastore {
            Some(name) => vec![name.to_string()],
            None => self.datastores.names(),
        };

        let mut failures = Vec::new();
        for name in names {
            let Some(entry) = self.datastores.remove(&name) else {
                continue;
            };
            if let Err(e) = self.destroy_entry(&name, entry).await {
                warn!(datastore = %name, error = %e, "Failed to destroy manager");
                failures.push(format!("`{}`: {}", name, e));
            }
        }

        if failures.is_empty() {
            Ok(())
        } else {
            Err(DatastoreError::driver(
                format!(
                    "adapter `{}` failed to tear down {}",
                    self.manifest.identity,
                    failures.join("; ")
                ),
                None,
            ))
        }
    }

    fn migrator(&self) -> Option<&dyn SchemaMigrator> {
        self.migrator.as_deref()
    }
}
