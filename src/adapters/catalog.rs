//! Adapter catalog.
//!
//! The host registers a factory per adapter name. Loading an adapter the
//! catalog does not know fails with `E_ADAPTER_NOT_INSTALLED`; a factory that
//! fails yields `E_COULD_NOT_LOAD_ADAPTER`.

use super::{Adapter, memory, sql};
use crate::error::{DatastoreError, DsResult};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use tracing::debug;

/// Builds a fresh adapter instance.
pub type AdapterFactory = Arc<dyn Fn() -> DsResult<Arc<dyn Adapter>> + Send + Sync>;

#[derive(Clone, Default)]
pub struct AdapterCatalog {
    factories: BTreeMap<String, AdapterFactory>,
    fallback: Option<String>,
}

impl AdapterCatalog {
    /// An empty catalog.
    pub fn new() -> Self {
        Self::default()
    }

    /// Catalog with the built-in `memory` and `sqlx` adapters, `memory` as fallback.
    pub fn with_builtins() -> Self {
        let mut catalog = Self::new();
        catalog.register(memory::IDENTITY, || Ok(memory::adapter()));
        catalog.register(sql::IDENTITY, || Ok(sql::adapter()));
        catalog.set_fallback(memory::IDENTITY);
        catalog
    }

    pub fn register<F>(&mut self, name: impl Into<String>, factory: F) -> &mut Self
    where
        F: Fn() -> DsResult<Arc<dyn Adapter>> + Send + Sync + 'static,
    {
        self.factories.insert(name.into(), Arc::new(factory));
        self
    }

    /// Adapter substituted for the default datastore when its own is not installed.
    pub fn set_fallback(&mut self, name: impl Into<String>) -> &mut Self {
        self.fallback = Some(name.into());
        self
    }

    pub fn fallback(&self) -> Option<&str> {
        self.fallback.as_deref()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.factories.contains_key(name)
    }

    /// Instantiate and validate the adapter called `name` for `datastore`.
    pub fn load(&self, name: &str, datastore: &str) -> DsResult<Arc<dyn Adapter>> {
        let factory =
            self.factories
                .get(name)
                .ok_or_else(|| DatastoreError::AdapterNotInstalled {
                    adapter: name.to_string(),
                    datastore: datastore.to_string(),
                })?;

        let adapter = factory().map_err(|e| DatastoreError::CouldNotLoadAdapter {
            adapter: name.to_string(),
            datastore: datastore.to_string(),
            message: e.to_string(),
        })?;

        validate_adapter(name, adapter.as_ref())?;
        debug!(adapter = %name, datastore = %datastore, "Loaded adapter");
        Ok(adapter)
    }
}

impl fmt::Debug for AdapterCatalog {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AdapterCatalog")
            .field("adapters", &self.factories.keys().collect::<Vec<_>>())
            .field("fallback", &self.fallback)
            .finish()
    }
}

/// Structural checks on a freshly loaded adapter.
pub fn validate_adapter(name: &str, adapter: &dyn Adapter) -> DsResult<()> {
    let manifest = adapter.manifest();

    if manifest.identity.trim().is_empty() {
        return Err(DatastoreError::invalid_adapter(
            name,
            "adapter does not declare an identity",
        ));
    }

    if !manifest.defaults.is_object() {
        return Err(DatastoreError::invalid_adapter(
            name,
            format!(
                "adapter `defaults` must be an object, got `{}`",
                manifest.defaults
            ),
        ));
    }

    Ok(())
}
