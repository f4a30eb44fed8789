//! Datastore discovery, adapter loading and config normalization.

use crate::adapters::{Adapter, AdapterCatalog, validate_adapter};
use crate::config::{AdapterRef, DatastoreSettings, RuntimeConfig};
use crate::error::{DatastoreError, DsResult};
use crate::models::{DEFAULT_DATASTORE, DatastoreConfig, Meta};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tracing::{debug, warn};

/// Adapters loaded for the relevant datastores, keyed by adapter identity,
/// plus which adapter each datastore uses.
#[derive(Debug, Default)]
pub struct LoadedAdapters {
    pub adapters: BTreeMap<String, Arc<dyn Adapter>>,
    pub bindings: BTreeMap<String, String>,
}

impl LoadedAdapters {
    pub fn adapter_for(&self, datastore: &str) -> DsResult<&Arc<dyn Adapter>> {
        self.bindings
            .get(datastore)
            .and_then(|identity| self.adapters.get(identity))
            .ok_or_else(|| {
                DatastoreError::consistency(format!(
                    "no adapter was loaded for datastore `{}`",
                    datastore
                ))
            })
    }
}

/// Datastore a raw model definition points at, with project defaults applied.
/// `None` when the reference is explicitly empty.
pub fn referenced_datastore(definition: &Value, defaults: &Meta) -> Option<String> {
    let raw = definition
        .get("datastore")
        .or_else(|| defaults.get("datastore"));
    match raw {
        None => Some(DEFAULT_DATASTORE.to_string()),
        Some(Value::String(name)) if !name.is_empty() => Some(name.clone()),
        Some(_) => None,
    }
}

/// Stage 1: datastores referenced by a model, the default one when configured,
/// and any marked `forceLoadAdapter`.
pub fn relevant_datastores(config: &RuntimeConfig) -> BTreeSet<String> {
    let mut names: BTreeSet<String> = config
        .model_definitions
        .values()
        .filter_map(|definition| referenced_datastore(definition, &config.models))
        .collect();

    if config.datastores.contains_key(DEFAULT_DATASTORE) {
        names.insert(DEFAULT_DATASTORE.to_string());
    }

    names.extend(
        config
            .datastores
            .iter()
            .filter(|(_, settings)| settings.force_load_adapter)
            .map(|(name, _)| name.clone()),
    );

    for name in config.datastores.keys().filter(|n| !names.contains(*n)) {
        debug!(datastore = %name, "Skipping datastore no model uses");
    }
    names
}

/// Stage 2: make sure every relevant datastore has a loaded adapter.
pub fn load_adapters(
    relevant: &BTreeSet<String>,
    config: &RuntimeConfig,
    catalog: &AdapterCatalog,
) -> DsResult<LoadedAdapters> {
    let mut loaded = LoadedAdapters::default();

    for name in relevant {
        let identity = match config.datastores.get(name) {
            Some(settings) => load_configured(name, settings, catalog, &mut loaded)?,
            None if name == DEFAULT_DATASTORE => synthesize_default(catalog, &mut loaded)?,
            None => {
                return Err(DatastoreError::UnrecognizedDatastore {
                    datastore: name.clone(),
                    message: "a model references it, but it is not configured".to_string(),
                });
            }
        };
        loaded.bindings.insert(name.clone(), identity);
    }

    Ok(loaded)
}

fn load_configured(
    name: &str,
    settings: &DatastoreSettings,
    catalog: &AdapterCatalog,
    loaded: &mut LoadedAdapters,
) -> DsResult<String> {
    match &settings.adapter {
        Some(AdapterRef::Inline(adapter)) => {
            let identity = adapter.manifest().identity.clone();
            validate_adapter(&identity, adapter.as_ref())?;
            if let Some(existing) = loaded.adapters.get(&identity) {
                if !Arc::ptr_eq(existing, adapter) {
                    return Err(DatastoreError::consistency(format!(
                        "two different adapters share the identity `{}` (datastore `{}`)",
                        identity, name
                    )));
                }
            }
            loaded.adapters.insert(identity.clone(), adapter.clone());
            Ok(identity)
        }
        Some(AdapterRef::Named(adapter)) if !adapter.is_empty() => {
            if loaded.adapters.contains_key(adapter) {
                return Ok(adapter.clone());
            }
            match catalog.load(adapter, name) {
                Ok(instance) => {
                    loaded.adapters.insert(adapter.clone(), instance);
                    Ok(adapter.clone())
                }
                Err(DatastoreError::AdapterNotInstalled { .. }) if name == DEFAULT_DATASTORE => {
                    let fallback = load_fallback(catalog, loaded)?;
                    warn!(
                        datastore = %name,
                        adapter = %adapter,
                        fallback = %fallback,
                        "Adapter is not installed; using the fallback adapter for the default datastore"
                    );
                    Ok(fallback)
                }
                Err(e) => Err(e),
            }
        }
        _ => Err(DatastoreError::invalid_datastore(
            name,
            "`adapter` must be a non-empty adapter name or an adapter instance",
        )),
    }
}

fn synthesize_default(catalog: &AdapterCatalog, loaded: &mut LoadedAdapters) -> DsResult<String> {
    let fallback = load_fallback(catalog, loaded).map_err(|_| {
        DatastoreError::UnrecognizedDatastore {
            datastore: DEFAULT_DATASTORE.to_string(),
            message: "a model references it, but it is not configured and no fallback adapter is available"
                .to_string(),
        }
    })?;
    debug!(adapter = %fallback, "Synthesized the default datastore");
    Ok(fallback)
}

fn load_fallback(catalog: &AdapterCatalog, loaded: &mut LoadedAdapters) -> DsResult<String> {
    let fallback = catalog.fallback().ok_or_else(|| DatastoreError::AdapterNotInstalled {
        adapter: "<fallback>".to_string(),
        datastore: DEFAULT_DATASTORE.to_string(),
    })?;
    if !loaded.adapters.contains_key(fallback) {
        let instance = catalog.load(fallback, DEFAULT_DATASTORE)?;
        loaded.adapters.insert(fallback.to_string(), instance);
    }
    Ok(fallback.to_string())
}

/// Stage 3: adapter defaults overlaid by app-level settings.
pub fn normalize_configs(
    config: &RuntimeConfig,
    loaded: &LoadedAdapters,
) -> DsResult<BTreeMap<String, DatastoreConfig>> {
    loaded
        .bindings
        .iter()
        .map(|(name, identity)| {
            let adapter = loaded.adapter_for(name)?;
            let app = config
                .datastores
                .get(name)
                .map(|s| &s.settings)
                .cloned()
                .unwrap_or_default();
            let normalized = normalize_config(name, identity, adapter.manifest().default_settings(), app)?;
            Ok((name.clone(), normalized))
        })
        .collect()
}

/// Merge `app` over `defaults` and strip one trailing slash from `url`.
pub fn normalize_config(
    name: &str,
    adapter: &str,
    defaults: Meta,
    app: Meta,
) -> DsResult<DatastoreConfig> {
    let mut merged = defaults;
    merged.extend(app);
    merged.remove("adapter");

    if let Some(Value::String(url)) = merged.get_mut("url") {
        if url.ends_with('/') {
            url.pop();
        }
    }

    DatastoreConfig::from_settings(name, adapter, merged)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::memory;
    use serde_json::json;

    fn meta(value: Value) -> Meta {
        value.as_object().cloned().unwrap()
    }

    #[test]
    fn test_relevant_datastores() {
        let config = RuntimeConfig::new()
            .with_datastore("default", DatastoreSettings::named("memory"))
            .with_datastore("archive", DatastoreSettings::named("memory"))
            .with_datastore("audit", DatastoreSettings::named("memory").force_load())
            .with_model("user", json!({}))
            .with_model("report", json!({"datastore": "warehouse"}));

        let names: Vec<_> = relevant_datastores(&config).into_iter().collect();
        assert_eq!(names, vec!["audit", "default", "warehouse"]);
    }

    #[test]
    fn test_referenced_datastore_uses_project_default() {
        let defaults = meta(json!({"datastore": "main"}));
        assert_eq!(referenced_datastore(&json!({}), &defaults).as_deref(), Some("main"));
        assert_eq!(
            referenced_datastore(&json!({"datastore": "other"}), &defaults).as_deref(),
            Some("other")
        );
        assert_eq!(referenced_datastore(&json!({"datastore": ""}), &defaults), None);
        assert_eq!(
            referenced_datastore(&json!({}), &Meta::new()).as_deref(),
            Some("default")
        );
    }

    #[test]
    fn test_unconfigured_reference_is_unrecognized() {
        let config = RuntimeConfig::new().with_model("report", json!({"datastore": "warehouse"}));
        let relevant = relevant_datastores(&config);
        let err = load_adapters(&relevant, &config, &AdapterCatalog::with_builtins()).unwrap_err();
        assert_eq!(err.code(), "E_UNRECOGNIZED_DATASTORE");
    }

    #[test]
    fn test_default_falls_back_when_not_installed() {
        let config = RuntimeConfig::new()
            .with_datastore("default", DatastoreSettings::named("sails-disk"));
        let relevant = relevant_datastores(&config);
        let loaded = load_adapters(&relevant, &config, &AdapterCatalog::with_builtins()).unwrap();
        assert_eq!(loaded.bindings["default"], memory::IDENTITY);
    }

    #[test]
    fn test_missing_adapter_for_other_datastore_fails() {
        let config = RuntimeConfig::new()
            .with_datastore("other", DatastoreSettings::named("sails-disk").force_load());
        let relevant = relevant_datastores(&config);
        let err = load_adapters(&relevant, &config, &AdapterCatalog::with_builtins()).unwrap_err();
        assert_eq!(err.code(), "E_ADAPTER_NOT_INSTALLED");
    }

    #[test]
    fn test_empty_adapter_name_is_invalid() {
        let config =
            RuntimeConfig::new().with_datastore("default", DatastoreSettings::named(""));
        let relevant = relevant_datastores(&config);
        let err = load_adapters(&relevant, &config, &AdapterCatalog::with_builtins()).unwrap_err();
        assert_eq!(err.code(), "E_INVALID_DATASTORE");
    }

    #[test]
    fn test_inline_adapters_with_same_identity_conflict() {
        let config = RuntimeConfig::new()
            .with_datastore("default", DatastoreSettings::inline(memory::adapter()))
            .with_datastore("other", DatastoreSettings::inline(memory::adapter()).force_load());
        let relevant = relevant_datastores(&config);
        let err = load_adapters(&relevant, &config, &AdapterCatalog::new()).unwrap_err();
        assert_eq!(err.code(), "E_CONSISTENCY_VIOLATION");
    }

    #[test]
    fn test_normalize_config_merges_and_strips_slash() {
        let config = normalize_config(
            "default",
            "sqlx",
            meta(json!({"decodeBinary": false, "migrate": "safe"})),
            meta(json!({"url": "sqlite:app.db/", "migrate": "alter", "adapter": "sqlx"})),
        )
        .unwrap();

        assert_eq!(config.url.as_deref(), Some("sqlite:app.db"));
        assert_eq!(config.migrate.map(|m| m.as_str()), Some("alter"));
        assert_eq!(config.get("decodeBinary"), Some(&json!(false)));
        assert!(config.get("adapter").is_none());
    }

    #[test]
    fn test_only_one_trailing_slash_is_stripped() {
        let config = normalize_config(
            "default",
            "sqlx",
            Meta::new(),
            meta(json!({"url": "postgres://localhost/app//"})),
        )
        .unwrap();
        assert_eq!(config.url.as_deref(), Some("postgres://localhost/app/"));
    }
}
