//! Datastore runtime.
//!
//! Negotiates what each storage adapter can do, leases connections with
//! guaranteed release, runs transactions with exactly one commit or rollback,
//! sends statements and native queries, and bootstraps the model ontology
//! (adapter loading, config and model normalization, auto-migration).
//!
//! Built-in adapters: `memory` (in-process, transactional) and `sqlx`
//! (SQLite, PostgreSQL, MySQL).

pub mod adapters;
pub mod config;
pub mod db;
pub mod driver;
pub mod error;
pub mod models;
pub mod ontology;

pub use adapters::{Adapter, AdapterCatalog, AdapterManifest, DriverAdapter};
pub use config::{Config, DatastoreSettings, Environment, RuntimeConfig};
pub use db::{Completion, RegisteredDatastore};
pub use driver::{Connection, Driver, Manager};
pub use error::{DatastoreError, DsResult, Footprint};
pub use models::{MigrateStrategy, ModelDef, Statement};
pub use ontology::Orm;
