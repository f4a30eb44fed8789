//! Configuration for the datastore runtime.
//!
//! Two layers:
//! - [`Config`]: command line arguments and environment variables for the binary
//! - [`RuntimeConfig`]: the host configuration the ontology pipeline consumes
//!   (datastores, project-wide model defaults and model definitions)

use crate::adapters::{Adapter, sql};
use crate::error::{DatastoreError, DsResult};
use crate::models::{DEFAULT_DATASTORE, Meta, MigrateStrategy};
use clap::{Parser, ValueEnum};
use serde::{Deserialize, Deserializer};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;
use std::sync::Arc;

pub const DEFAULT_LOG_LEVEL: &str = "info";

/// Deployment environment. Production always migrates with `safe`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum Environment {
    #[default]
    Development,
    Production,
}

impl Environment {
    pub fn is_production(&self) -> bool {
        matches!(self, Self::Production)
    }
}

impl fmt::Display for Environment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Development => write!(f, "development"),
            Self::Production => write!(f, "production"),
        }
    }
}

/// How a datastore names its adapter.
#[derive(Clone)]
pub enum AdapterRef {
    /// Looked up in the adapter catalog.
    Named(String),
    /// Supplied directly by the host.
    Inline(Arc<dyn Adapter>),
}

impl fmt::Debug for AdapterRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Named(name) => f.debug_tuple("Named").field(name).finish(),
            Self::Inline(adapter) => f
                .debug_tuple("Inline")
                .field(&adapter.manifest().identity)
                .finish(),
        }
    }
}

/// App-level settings of one datastore, before adapter defaults are merged in.
#[derive(Debug, Clone, Default)]
pub struct DatastoreSettings {
    pub adapter: Option<AdapterRef>,
    /// Load this datastore even when no model references it.
    pub force_load_adapter: bool,
    /// Every other key, adapter-specific ones included.
    pub settings: Meta,
}

impl DatastoreSettings {
    pub fn named(adapter: impl Into<String>) -> Self {
        Self {
            adapter: Some(AdapterRef::Named(adapter.into())),
            ..Self::default()
        }
    }

    pub fn inline(adapter: Arc<dyn Adapter>) -> Self {
        Self {
            adapter: Some(AdapterRef::Inline(adapter)),
            ..Self::default()
        }
    }

    pub fn with_setting(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.settings.insert(key.into(), value.into());
        self
    }

    pub fn force_load(mut self) -> Self {
        self.force_load_adapter = true;
        self
    }

    fn from_map(mut map: Meta) -> Result<Self, String> {
        let adapter = match map.remove("adapter") {
            None | Some(Value::Null) => None,
            Some(Value::String(name)) => Some(AdapterRef::Named(name)),
            Some(other) => {
                return Err(format!(
                    "`adapter` must name an installed adapter, got `{}`",
                    other
                ));
            }
        };

        let force_load_adapter = match map.remove("forceLoadAdapter") {
            None | Some(Value::Null) => false,
            Some(Value::Bool(b)) => b,
            Some(other) => {
                return Err(format!("`forceLoadAdapter` must be a boolean, got `{}`", other));
            }
        };

        Ok(Self {
            adapter,
            force_load_adapter,
            settings: map,
        })
    }
}

impl<'de> Deserialize<'de> for DatastoreSettings {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let map = Meta::deserialize(deserializer)?;
        Self::from_map(map).map_err(serde::de::Error::custom)
    }
}

/// Host configuration consumed by [`crate::ontology::Orm`].
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RuntimeConfig {
    pub datastores: BTreeMap<String, DatastoreSettings>,
    /// Project-wide model defaults (`datastore`, `primaryKey`, `migrate`, `attributes`, ...).
    pub models: Meta,
    /// Raw model definitions keyed by identity.
    pub model_definitions: BTreeMap<String, Value>,
    pub environment: Environment,
    pub skip_production_warnings: bool,
}

impl RuntimeConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse a JSON configuration document.
    pub fn from_json(text: &str) -> DsResult<Self> {
        serde_json::from_str(text)
            .map_err(|e| DatastoreError::config(format!("Invalid configuration: {}", e)))
    }

    pub fn from_file(path: &Path) -> DsResult<Self> {
        let text = std::fs::read_to_string(path).map_err(|e| {
            DatastoreError::config(format!("Cannot read `{}`: {}", path.display(), e))
        })?;
        Self::from_json(&text)
    }

    pub fn with_datastore(mut self, name: impl Into<String>, settings: DatastoreSettings) -> Self {
        self.datastores.insert(name.into(), settings);
        self
    }

    pub fn with_model(mut self, identity: impl Into<String>, definition: Value) -> Self {
        self.model_definitions.insert(identity.into(), definition);
        self
    }

    pub fn with_model_defaults(mut self, defaults: Meta) -> Self {
        self.models = defaults;
        self
    }

    pub fn with_environment(mut self, environment: Environment) -> Self {
        self.environment = environment;
        self
    }

    /// Project-wide migration strategy (`models.migrate`).
    pub fn project_migrate(&self) -> DsResult<Option<MigrateStrategy>> {
        match self.models.get("migrate") {
            None | Some(Value::Null) => Ok(None),
            Some(Value::String(s)) => s.parse().map(Some),
            Some(other) => Err(DatastoreError::config(format!(
                "`models.migrate` must be a string, got `{}`",
                other
            ))),
        }
    }

    pub fn set_project_migrate(&mut self, strategy: MigrateStrategy) {
        self.models.insert(
            "migrate".to_string(),
            Value::String(strategy.as_str().to_string()),
        );
    }
}

/// A datastore given on the command line as `[NAME=]URL`.
#[derive(Debug, Clone, PartialEq)]
pub struct DatastoreUrl {
    /// Datastore name; `default` when omitted.
    pub name: String,
    pub url: String,
}

impl DatastoreUrl {
    /// Parse `url` or `name=url`. The name split only applies before `://`.
    pub fn parse(s: &str) -> Result<Self, String> {
        let scheme_pos = s.find("://").or_else(|| s.find(':')).unwrap_or(s.len());
        let (name, url) = match s[..scheme_pos].find('=') {
            Some(idx) => (s[..idx].trim(), &s[idx + 1..]),
            None => (DEFAULT_DATASTORE, s),
        };

        if name.is_empty() {
            return Err("Datastore name cannot be empty".to_string());
        }
        sql::SqlSettings::parse_url(url)?;

        Ok(Self {
            name: name.to_string(),
            url: url.to_string(),
        })
    }
}

/// Command line configuration for the `datastore-runtime` binary.
#[derive(Debug, Clone, Parser)]
#[command(
    name = "datastore-runtime",
    about = "Builds the datastore ontology, runs auto-migrations and sends statements",
    version,
    author
)]
pub struct Config {
    /// JSON host configuration file (datastores, models, modelDefinitions)
    #[arg(short, long, value_name = "FILE", env = "DATASTORE_CONFIG")]
    pub config: Option<std::path::PathBuf>,

    /// SQL datastores served by the `sqlx` adapter.
    /// Format: "url" (the default datastore) or "name=url".
    /// Can be specified multiple times.
    #[arg(
        short = 'u',
        long = "url",
        value_name = "[NAME=]URL",
        env = "DATASTORE_URL",
        value_delimiter = ','
    )]
    pub urls: Vec<String>,

    /// Project-wide migration strategy, overriding the config file
    #[arg(short, long, value_enum, env = "DATASTORE_MIGRATE")]
    pub migrate: Option<MigrateStrategy>,

    /// Deployment environment
    #[arg(short, long, value_enum, env = "APP_ENV")]
    pub environment: Option<Environment>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = DEFAULT_LOG_LEVEL, env = "DATASTORE_LOG_LEVEL")]
    pub log_level: String,

    /// Enable JSON logging format
    #[arg(long, env = "DATASTORE_JSON_LOGS")]
    pub json_logs: bool,

    /// Datastore used by --statement and --native-query
    #[arg(long, default_value = DEFAULT_DATASTORE)]
    pub datastore: String,

    /// Statement to send, as JSON (e.g. '{"select":["*"],"from":"user"}')
    #[arg(long, value_name = "JSON", conflicts_with = "native_query")]
    pub statement: Option<String>,

    /// Native query to send as-is
    #[arg(long, value_name = "QUERY")]
    pub native_query: Option<String>,
}

impl Config {
    pub fn parse_urls(&self) -> Result<Vec<DatastoreUrl>, String> {
        self.urls.iter().map(|s| DatastoreUrl::parse(s)).collect()
    }

    /// Assemble the host configuration: file first, then command line overrides.
    pub fn runtime_config(&self) -> DsResult<RuntimeConfig> {
        let mut runtime = match &self.config {
            Some(path) => RuntimeConfig::from_file(path)?,
            None => RuntimeConfig::new(),
        };

        for entry in self.parse_urls().map_err(DatastoreError::config)? {
            runtime.datastores.insert(
                entry.name,
                DatastoreSettings::named(sql::IDENTITY)
                    .with_setting("url", entry.url)
                    .force_load(),
            );
        }

        if let Some(strategy) = self.migrate {
            runtime.set_project_migrate(strategy);
        }
        if let Some(environment) = self.environment {
            runtime.environment = environment;
        }

        Ok(runtime)
    }
}
