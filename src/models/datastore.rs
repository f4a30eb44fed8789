//! Datastore configuration models.

use crate::error::{DatastoreError, DsResult};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

/// Free-form metadata passed alongside driver calls.
pub type Meta = Map<String, Value>;

/// Name of the conventional default datastore.
pub const DEFAULT_DATASTORE: &str = "default";

/// Auto-migration strategy. Exactly one applies to a datastore.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum MigrateStrategy {
    /// Never touch the schema automatically.
    Safe,
    /// Rebuild the schema while trying to keep existing records.
    Alter,
    /// Unconditionally drop and rebuild the schema.
    Drop,
}

impl MigrateStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Safe => "safe",
            Self::Alter => "alter",
            Self::Drop => "drop",
        }
    }
}

impl fmt::Display for MigrateStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MigrateStrategy {
    type Err = DatastoreError;

    fn from_str(s: &str) -> DsResult<Self> {
        match s {
            "safe" => Ok(Self::Safe),
            "alter" => Ok(Self::Alter),
            "drop" => Ok(Self::Drop),
            other => Err(DatastoreError::config(format!(
                "unrecognized migration strategy `{}` (expected safe, alter or drop)",
                other
            ))),
        }
    }
}

/// Normalized configuration of one datastore.
///
/// `settings` holds the fully merged key set (adapter defaults overlaid by
/// app-level settings); the typed fields are views over well-known keys.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DatastoreConfig {
    pub name: String,
    pub adapter: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub migrate: Option<MigrateStrategy>,
    #[serde(skip)]
    pub lease_timeout: Option<Duration>,
    pub settings: Meta,
}

impl DatastoreConfig {
    pub fn new(name: impl Into<String>, adapter: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            adapter: adapter.into(),
            url: None,
            migrate: None,
            lease_timeout: None,
            settings: Meta::new(),
        }
    }

    /// Build from merged settings, reading the well-known keys.
    pub fn from_settings(
        name: impl Into<String>,
        adapter: impl Into<String>,
        settings: Meta,
    ) -> DsResult<Self> {
        let name = name.into();

        let url = match settings.get("url") {
            None | Some(Value::Null) => None,
            Some(Value::String(url)) => Some(url.clone()),
            Some(other) => {
                return Err(DatastoreError::invalid_datastore(
                    &name,
                    format!("`url` must be a string, got `{}`", other),
                ));
            }
        };

        let migrate = match settings.get("migrate") {
            None | Some(Value::Null) => None,
            Some(Value::String(s)) => Some(s.parse::<MigrateStrategy>().map_err(|e| {
                DatastoreError::invalid_datastore(&name, e.to_string())
            })?),
            Some(other) => {
                return Err(DatastoreError::invalid_datastore(
                    &name,
                    format!("`migrate` must be a string, got `{}`", other),
                ));
            }
        };

        let lease_timeout = match settings.get("leaseTimeoutMs") {
            None | Some(Value::Null) => None,
            Some(v) => Some(Duration::from_millis(v.as_u64().ok_or_else(|| {
                DatastoreError::invalid_datastore(
                    &name,
                    "`leaseTimeoutMs` must be a non-negative integer",
                )
            })?)),
        };

        Ok(Self {
            name,
            adapter: adapter.into(),
            url,
            migrate,
            lease_timeout,
            settings,
        })
    }

    pub fn with_url(mut self, url: impl Into<String>) -> Self {
        let url = url.into();
        self.settings
            .insert("url".to_string(), Value::String(url.clone()));
        self.url = Some(url);
        self
    }

    pub fn with_migrate(mut self, strategy: MigrateStrategy) -> Self {
        self.settings.insert(
            "migrate".to_string(),
            Value::String(strategy.as_str().to_string()),
        );
        self.migrate = Some(strategy);
        self
    }

    pub fn with_lease_timeout(mut self, timeout: Duration) -> Self {
        self.lease_timeout = Some(timeout);
        self
    }

    /// Look up an adapter-specific setting.
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.settings.get(key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn settings(value: Value) -> Meta {
        value.as_object().cloned().unwrap()
    }

    #[test]
    fn test_from_settings_reads_known_keys() {
        let config = DatastoreConfig::from_settings(
            "default",
            "sqlx",
            settings(json!({"url": "sqlite::memory:", "migrate": "alter", "leaseTimeoutMs": 1500, "x": 1})),
        )
        .unwrap();

        assert_eq!(config.url.as_deref(), Some("sqlite::memory:"));
        assert_eq!(config.migrate, Some(MigrateStrategy::Alter));
        assert_eq!(config.lease_timeout, Some(Duration::from_millis(1500)));
        assert_eq!(config.get("x"), Some(&json!(1)));
    }

    #[test]
    fn test_from_settings_rejects_unknown_strategy() {
        let err = DatastoreConfig::from_settings(
            "default",
            "memory",
            settings(json!({"migrate": "create"})),
        )
        .unwrap_err();
        assert_eq!(err.code(), "E_INVALID_DATASTORE");
    }

    #[test]
    fn test_strategy_round_trips_through_str() {
        for s in ["safe", "alter", "drop"] {
            assert_eq!(s.parse::<MigrateStrategy>().unwrap().as_str(), s);
        }
        assert!("create".parse::<MigrateStrategy>().is_err());
    }
}
