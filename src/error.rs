//! Error types for the datastore runtime.
//!
//! Every failure the runtime reports is a variant of [`DatastoreError`]. Each
//! variant has a stable `E_*` code (see [`DatastoreError::code`]) so calling
//! code can branch on the kind of failure instead of parsing messages.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Normalized classification of why a query failed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "identity", rename_all = "camelCase")]
pub enum Footprint {
    /// A uniqueness constraint was violated by the listed keys.
    NotUnique { keys: Vec<String> },
    /// The connection dropped while the query was in flight.
    ConnectionLost,
    /// Anything the driver could not classify further.
    Catchall,
}

impl Footprint {
    pub fn identity(&self) -> &'static str {
        match self {
            Self::NotUnique { .. } => "notUnique",
            Self::ConnectionLost => "connectionLost",
            Self::Catchall => "catchall",
        }
    }
}

/// Reason a statement could not be compiled into a native query.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompileReason {
    Malformed,
    NotSupported,
}

impl fmt::Display for CompileReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Malformed => f.write_str("malformed statement"),
            Self::NotSupported => f.write_str("unsupported construct"),
        }
    }
}

/// Cleanup step that failed after the primary outcome was known.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleStage {
    Release,
    Rollback,
    Commit,
}

impl fmt::Display for LifecycleStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Release => f.write_str("release"),
            Self::Rollback => f.write_str("rollback"),
            Self::Commit => f.write_str("commit"),
        }
    }
}

#[derive(Error, Debug, Clone)]
pub enum DatastoreError {
    #[error("Adapter `{adapter}` is not compatible: {message}")]
    NotCompatible { adapter: String, message: String },

    #[error("Not supported: `{operation}` on datastore `{datastore}`: {message}")]
    NotSupported {
        datastore: String,
        operation: String,
        message: String,
    },

    #[error("Could not classify statement: {message}")]
    Unclassifiable { message: String },

    #[error("Could not compile statement ({reason}): {message}")]
    Compile {
        reason: CompileReason,
        message: String,
    },

    #[error("Query failed: {message}")]
    QueryFailed {
        message: String,
        footprint: Footprint,
        raw: Box<DatastoreError>,
    },

    #[error("Could not parse the raw result of a `{query_type}` query: {message}")]
    ResultParse { query_type: String, message: String },

    #[error("{message}")]
    FootprintParse {
        message: String,
        raw: Box<DatastoreError>,
    },

    #[error("{message}")]
    Lifecycle {
        stage: LifecycleStage,
        message: String,
        /// The cleanup failure itself.
        cause: Box<DatastoreError>,
        /// The primary failure, when one preceded the cleanup failure.
        raw: Option<Box<DatastoreError>>,
    },

    #[error("Consistency violation: {message}")]
    ConsistencyViolation { message: String },

    #[error("Driver error: {message}")]
    Driver {
        message: String,
        /// Backend-native code, e.g. a SQLSTATE.
        native_code: Option<String>,
    },

    #[error("{message}")]
    Work { message: String },

    #[error("Timeout: {operation} exceeded {elapsed_ms}ms")]
    Timeout { operation: String, elapsed_ms: u64 },

    #[error("Adapter `{adapter}` (required by datastore `{datastore}`) is not installed")]
    AdapterNotInstalled { adapter: String, datastore: String },

    #[error("Could not load adapter `{adapter}` for datastore `{datastore}`: {message}")]
    CouldNotLoadAdapter {
        adapter: String,
        datastore: String,
        message: String,
    },

    #[error("Invalid adapter `{adapter}`: {message}")]
    InvalidAdapter { adapter: String, message: String },

    #[error("Unrecognized datastore `{datastore}`: {message}")]
    UnrecognizedDatastore { datastore: String, message: String },

    #[error("Invalid datastore `{datastore}`: {message}")]
    InvalidDatastore { datastore: String, message: String },

    #[error("Invalid model definition `{model}`: {message}")]
    InvalidModelDef { model: String, message: String },

    #[error("Model `{model}` has no datastore")]
    ModelHasNoDatastore { model: String },

    #[error("Datastore `{datastore}` not found")]
    DatastoreNotFound { datastore: String },

    #[error("Auto-migration failed: {message}")]
    Migration { message: String },

    #[error("Configuration error: {message}")]
    Config { message: String },
}

impl DatastoreError {
    /// Create an API version mismatch error.
    pub fn not_compatible(adapter: impl Into<String>, message: impl Into<String>) -> Self {
        Self::NotCompatible {
            adapter: adapter.into(),
            message: message.into(),
        }
    }

    /// Create a missing capability error.
    pub fn not_supported(
        datastore: impl Into<String>,
        operation: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self::NotSupported {
            datastore: datastore.into(),
            operation: operation.into(),
            message: message.into(),
        }
    }

    pub fn unclassifiable(message: impl Into<String>) -> Self {
        Self::Unclassifiable {
            message: message.into(),
        }
    }

    /// Create a compile error for a statement the driver cannot make sense of.
    pub fn malformed_statement(message: impl Into<String>) -> Self {
        Self::Compile {
            reason: CompileReason::Malformed,
            message: message.into(),
        }
    }

    /// Create a compile error for a construct the driver does not implement.
    pub fn unsupported_construct(message: impl Into<String>) -> Self {
        Self::Compile {
            reason: CompileReason::NotSupported,
            message: message.into(),
        }
    }

    /// Wrap a driver-reported query failure together with its footprint.
    pub fn query_failed(raw: DatastoreError, footprint: Footprint) -> Self {
        Self::QueryFailed {
            message: raw.to_string(),
            footprint,
            raw: Box::new(raw),
        }
    }

    /// Create a cleanup-stage error, keeping the primary failure when there was one.
    pub fn lifecycle(
        stage: LifecycleStage,
        message: impl Into<String>,
        cause: DatastoreError,
        raw: Option<DatastoreError>,
    ) -> Self {
        Self::Lifecycle {
            stage,
            message: message.into(),
            cause: Box::new(cause),
            raw: raw.map(Box::new),
        }
    }

    pub fn result_parse(query_type: impl Into<String>, message: impl Into<String>) -> Self {
        Self::ResultParse {
            query_type: query_type.into(),
            message: message.into(),
        }
    }

    /// Create a consistency violation (an internal invariant was broken).
    pub fn consistency(message: impl Into<String>) -> Self {
        Self::ConsistencyViolation {
            message: message.into(),
        }
    }

    /// Create a driver error with an optional backend-native code.
    pub fn driver(message: impl Into<String>, native_code: Option<String>) -> Self {
        Self::Driver {
            message: message.into(),
            native_code,
        }
    }

    /// Create an error raised by a unit of work.
    pub fn work(message: impl Into<String>) -> Self {
        Self::Work {
            message: message.into(),
        }
    }

    pub fn timeout(operation: impl Into<String>, elapsed_ms: u64) -> Self {
        Self::Timeout {
            operation: operation.into(),
            elapsed_ms,
        }
    }

    pub fn invalid_adapter(adapter: impl Into<String>, message: impl Into<String>) -> Self {
        Self::InvalidAdapter {
            adapter: adapter.into(),
            message: message.into(),
        }
    }

    pub fn invalid_datastore(datastore: impl Into<String>, message: impl Into<String>) -> Self {
        Self::InvalidDatastore {
            datastore: datastore.into(),
            message: message.into(),
        }
    }

    pub fn invalid_model(model: impl Into<String>, message: impl Into<String>) -> Self {
        Self::InvalidModelDef {
            model: model.into(),
            message: message.into(),
        }
    }

    pub fn migration(message: impl Into<String>) -> Self {
        Self::Migration {
            message: message.into(),
        }
    }

    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    /// Stable machine-readable code for this error.
    pub fn code(&self) -> &'static str {
        match self {
            Self::NotCompatible { .. } => "E_NOT_COMPATIBLE",
            Self::NotSupported { .. } => "E_NOT_SUPPORTED",
            Self::Unclassifiable { .. } => "E_UNCLASSIFIABLE_STATEMENT",
            Self::Compile { .. } => "E_INVALID_STATEMENT",
            Self::QueryFailed { .. } => "E_QUERY_FAILED",
            Self::ResultParse { .. } => "E_RESULT_PARSE",
            Self::FootprintParse { .. } => "E_FOOTPRINT_PARSE",
            Self::Lifecycle { stage, .. } => match stage {
                LifecycleStage::Release => "E_RELEASE_FAILED",
                LifecycleStage::Rollback => "E_ROLLBACK_FAILED",
                LifecycleStage::Commit => "E_COMMIT_FAILED",
            },
            Self::ConsistencyViolation { .. } => "E_CONSISTENCY_VIOLATION",
            Self::Driver { .. } => "E_DRIVER",
            Self::Work { .. } => "E_WORK",
            Self::Timeout { .. } => "E_TIMEOUT",
            Self::AdapterNotInstalled { .. } => "E_ADAPTER_NOT_INSTALLED",
            Self::CouldNotLoadAdapter { .. } => "E_COULD_NOT_LOAD_ADAPTER",
            Self::InvalidAdapter { .. } => "E_INVALID_ADAPTER",
            Self::UnrecognizedDatastore { .. } => "E_UNRECOGNIZED_DATASTORE",
            Self::InvalidDatastore { .. } => "E_INVALID_DATASTORE",
            Self::InvalidModelDef { .. } => "E_INVALID_MODEL_DEF",
            Self::ModelHasNoDatastore { .. } => "E_MODEL_HAS_NO_DATASTORE",
            Self::DatastoreNotFound { .. } => "E_DATASTORE_NOT_FOUND",
            Self::Migration { .. } => "E_MIGRATION_FAILED",
            Self::Config { .. } => "E_CONFIG",
        }
    }

    /// Footprint attached to a query failure, if any.
    pub fn footprint(&self) -> Option<&Footprint> {
        match self {
            Self::QueryFailed { footprint, .. } => Some(footprint),
            _ => None,
        }
    }

    /// The wrapped underlying error, if this error carries one.
    pub fn raw(&self) -> Option<&DatastoreError> {
        match self {
            Self::QueryFailed { raw, .. } | Self::FootprintParse { raw, .. } => Some(raw),
            Self::Lifecycle { raw, .. } => raw.as_deref(),
            _ => None,
        }
    }

    /// Nothing in this runtime retries automatically; retry policy belongs to the caller.
    pub fn is_retryable(&self) -> bool {
        false
    }
}

/// Convert sqlx errors to DatastoreError.
impl From<sqlx::Error> for DatastoreError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::Database(db_err) => {
                let code = db_err.code().map(|c| c.to_string());
                DatastoreError::driver(db_err.message(), code)
            }
            sqlx::Error::Configuration(msg) => {
                DatastoreError::driver(format!("Invalid connection configuration: {}", msg), None)
            }
            sqlx::Error::PoolTimedOut => DatastoreError::timeout("connection pool acquire", 0),
            sqlx::Error::PoolClosed => DatastoreError::driver("Connection pool is closed", None),
            sqlx::Error::Io(io_err) => DatastoreError::driver(format!("I/O error: {}", io_err), None),
            sqlx::Error::Tls(tls_err) => {
                DatastoreError::driver(format!("TLS error: {}", tls_err), None)
            }
            sqlx::Error::Protocol(msg) => {
                DatastoreError::driver(format!("Protocol error: {}", msg), None)
            }
            sqlx::Error::ColumnDecode { index, source } => DatastoreError::driver(
                format!("Failed to decode column {}: {}", index, source),
                None,
            ),
            other => DatastoreError::driver(format!("Database error: {}", other), None),
        }
    }
}

/// Result type alias for runtime operations.
pub type DsResult<T> = Result<T, DatastoreError>;
