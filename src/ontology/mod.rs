//! Ontology build pipeline.
//!
//! [`Orm::initialize`] turns a [`RuntimeConfig`] into live datastores, in order:
//!
//! 1. find the relevant datastores
//! 2. load their adapters (falling back for `default`)
//! 3. normalize datastore configs
//! 4. normalize model definitions
//! 5. check adapter API versions
//! 6. validate associations, copy key column types, register datastores
//! 7. auto-migrate
//! 8. build one [`RegisteredDatastore`] per datastore
//!
//! Any stage failing aborts the rest. Datastores registered before the
//! failure are torn down again.

pub mod associations;
pub mod datastores;
pub mod migrate;
pub mod model;

pub use datastores::{LoadedAdapters, normalize_config, relevant_datastores};
pub use migrate::{MigrationPlan, resolve_strategy};
pub use model::{is_valid_identity, normalize_model};

use crate::adapters::{Adapter, AdapterCatalog, memory};
use crate::config::RuntimeConfig;
use crate::db::RegisteredDatastore;
use crate::driver::check_adapter_api_version;
use crate::error::{DatastoreError, DsResult};
use crate::models::{DEFAULT_DATASTORE, DatastoreConfig, MigrateStrategy, ModelDef};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use tracing::{info, warn};

/// Everything the pipeline built.
#[derive(Default)]
struct Ontology {
    adapters: BTreeMap<String, Arc<dyn Adapter>>,
    bindings: BTreeMap<String, String>,
    datastores: BTreeMap<String, Arc<RegisteredDatastore>>,
    models: BTreeMap<String, Arc<ModelDef>>,
}

/// The initialized runtime: normalized models and their registered datastores.
pub struct Orm {
    config: RuntimeConfig,
    catalog: AdapterCatalog,
    ontology: Ontology,
}

impl Orm {
    pub async fn initialize(config: RuntimeConfig, catalog: AdapterCatalog) -> DsResult<Self> {
        let ontology = build(&config, &catalog).await?;
        Ok(Self {
            config,
            catalog,
            ontology,
        })
    }

    /// Look up a registered datastore by name.
    pub fn datastore(&self, name: &str) -> DsResult<Arc<RegisteredDatastore>> {
        self.ontology
            .datastores
            .get(name)
            .cloned()
            .ok_or_else(|| DatastoreError::DatastoreNotFound {
                datastore: name.to_string(),
            })
    }

    pub fn default_datastore(&self) -> DsResult<Arc<RegisteredDatastore>> {
        self.datastore(DEFAULT_DATASTORE)
    }

    pub fn datastore_names(&self) -> impl Iterator<Item = &str> {
        self.ontology.datastores.keys().map(String::as_str)
    }

    pub fn model(&self, identity: &str) -> Option<&Arc<ModelDef>> {
        self.ontology.models.get(identity)
    }

    pub fn models(&self) -> impl Iterator<Item = &Arc<ModelDef>> {
        self.ontology.models.values()
    }

    /// Identity of the adapter backing `datastore`.
    pub fn adapter_of(&self, datastore: &str) -> Option<&str> {
        self.ontology.bindings.get(datastore).map(String::as_str)
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    /// Destroy every manager the pipeline created.
    pub async fn teardown(&self) -> DsResult<()> {
        let mut failures = Vec::new();
        for (identity, adapter) in &self.ontology.adapters {
            let names: Vec<&str> = self
                .ontology
                .bindings
                .iter()
                .filter(|(_, bound)| *bound == identity)
                .map(|(name, _)| name.as_str())
                .collect();
            for name in names {
                if let Err(e) = adapter.teardown(Some(name)).await {
                    warn!(adapter = %identity, datastore = %name, error = %e, "Teardown failed");
                    failures.push(e.to_string());
                }
            }
        }

        if failures.is_empty() {
            info!(datastores = self.ontology.datastores.len(), "Tore down datastores");
            Ok(())
        } else {
            Err(DatastoreError::driver(failures.join("; "), None))
        }
    }

    /// Tear down, then run the whole pipeline again from the same inputs.
    pub async fn reload(&mut self) -> DsResult<()> {
        let torn_down = self.teardown().await;
        // Handles from the old ontology point at destroyed managers either way.
        self.ontology = Ontology::default();
        torn_down?;
        self.ontology = build(&self.config, &self.catalog).await?;
        info!("Reloaded ontology");
        Ok(())
    }
}

impl fmt::Debug for Orm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Orm")
            .field("datastores", &self.ontology.bindings)
            .field("models", &self.ontology.models.keys().collect::<Vec<_>>())
            .finish()
    }
}

async fn build(config: &RuntimeConfig, catalog: &AdapterCatalog) -> DsResult<Ontology> {
    let relevant = datastores::relevant_datastores(config);
    info!(
        datastores = relevant.len(),
        models = config.model_definitions.len(),
        environment = %config.environment,
        "Building ontology"
    );

    let loaded = datastores::load_adapters(&relevant, config, catalog)?;
    let configs = datastores::normalize_configs(config, &loaded)?;
    let project_migrate = config.project_migrate()?;

    let mut models = BTreeMap::new();
    for (identity, definition) in &config.model_definitions {
        let model = model::normalize_model(
            identity,
            definition,
            &config.models,
            config.environment,
            &configs,
        )?;
        models.insert(identity.clone(), model);
    }
    production_check(config, &loaded, &models);

    for name in configs.keys() {
        check_adapter_api_version(name, loaded.adapter_for(name)?.as_ref())?;
    }

    associations::validate_associations(&models)?;
    associations::copy_primary_key_column_types(&mut models)?;
    let models: BTreeMap<String, Arc<ModelDef>> = models
        .into_iter()
        .map(|(identity, model)| (identity, Arc::new(model)))
        .collect();

    let mut registered = Vec::new();
    let result = assemble(&configs, &loaded, &models, project_migrate, config, &mut registered).await;

    match result {
        Ok(datastores) => {
            info!(datastores = datastores.len(), models = models.len(), "Ontology is ready");
            Ok(Ontology {
                adapters: loaded.adapters,
                bindings: loaded.bindings,
                datastores,
                models,
            })
        }
        Err(e) => {
            for (name, adapter) in registered {
                if let Err(teardown) = adapter.teardown(Some(&name)).await {
                    warn!(datastore = %name, error = %teardown, "Teardown after failed build also failed");
                }
            }
            Err(e)
        }
    }
}

/// Stages 6 (registration) to 8. Records every registered datastore so the
/// caller can tear them down on failure.
async fn assemble(
    configs: &BTreeMap<String, DatastoreConfig>,
    loaded: &LoadedAdapters,
    models: &BTreeMap<String, Arc<ModelDef>>,
    project_migrate: Option<MigrateStrategy>,
    config: &RuntimeConfig,
    registered: &mut Vec<(String, Arc<dyn Adapter>)>,
) -> DsResult<BTreeMap<String, Arc<RegisteredDatastore>>> {
    let mut plans = Vec::new();

    for (name, datastore_config) in configs {
        let adapter = loaded.adapter_for(name)?;
        let datastore_models: Vec<Arc<ModelDef>> = models
            .values()
            .filter(|m| &m.datastore == name)
            .cloned()
            .collect();

        adapter
            .register_datastore(datastore_config, &datastore_models)
            .await?;
        registered.push((name.clone(), adapter.clone()));

        plans.push(MigrationPlan {
            datastore: name.clone(),
            strategy: migrate::resolve_strategy(datastore_config, project_migrate, config.environment),
            adapter: adapter.clone(),
            models: datastore_models,
        });
    }

    migrate::run_auto_migrations(&plans).await?;

    configs
        .iter()
        .map(|(name, datastore_config)| {
            let adapter = loaded.adapter_for(name)?;
            let rdi = RegisteredDatastore::build(name, datastore_config.clone(), adapter.as_ref())?;
            Ok((name.clone(), Arc::new(rdi)))
        })
        .collect()
}

/// The memory adapter keeps everything in process; say so when it backs models in production.
fn production_check(
    config: &RuntimeConfig,
    loaded: &LoadedAdapters,
    models: &BTreeMap<String, ModelDef>,
) {
    if !config.environment.is_production() || config.skip_production_warnings {
        return;
    }

    let in_memory: Vec<&str> = models
        .values()
        .filter(|m| loaded.bindings.get(&m.datastore).map(String::as_str) == Some(memory::IDENTITY))
        .map(|m| m.identity.as_str())
        .collect();

    if !in_memory.is_empty() {
        warn!(
            models = ?in_memory,
            "The memory adapter is not meant for production; its data lives only in this process. \
             Set `skipProductionWarnings` to hide this warning"
        );
    }
}
