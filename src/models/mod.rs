//! Data models shared by the runtime, the adapters and the ontology pipeline.

pub mod datastore;
pub mod model_def;
pub mod statement;

pub use datastore::{DEFAULT_DATASTORE, DatastoreConfig, Meta, MigrateStrategy};
pub use model_def::{
    AttributeDef, AttributeKind, AutoMigrations, ColumnSpec, ModelDef, SCALAR_TYPES, TableSpec,
};
pub use statement::{
    Comparison, Predicate, QueryType, Record, SortTerm, Statement, StatementAst, compare_values,
    like_match, parse_where, values_equal,
};
