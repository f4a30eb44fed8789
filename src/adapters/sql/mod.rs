//! SQL adapter backed by sqlx.
//!
//! One adapter serves SQLite, PostgreSQL and MySQL; the backend is chosen by
//! the datastore URL scheme. Statements compile to parameterized SQL, and
//! native queries are plain SQL with positional values.

mod compiler;
mod macros;
mod params;
mod pool;
mod types;

pub use compiler::{COUNT_ALIAS, compile, quote_ident, returns_rows};
pub use macros::DatabaseType;
pub use pool::{DbPool, PoolOptions, SqlSettings};

use super::{Adapter, AdapterManifest, DriverAdapter, SchemaMigrator, footprint};
use crate::driver::{
    CompiledStatement, Connectable, Connection, Driver, Manager, NativeQuery, Queryable,
    SUPPORTED_ADAPTER_API_VERSION, SendFailure, Transactional,
};
use crate::error::{DatastoreError, DsResult, Footprint};
use crate::models::{DatastoreConfig, Meta, QueryType, Record, Statement, TableSpec};
use async_trait::async_trait;
use macros::{on_connection, on_pool};
use pool::PooledConnection;
use serde_json::{Map, Value, json};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::timeout;
use tracing::{debug, info, warn};
use types::RowToRecord;

pub const IDENTITY: &str = "sqlx";

/// The built-in SQL adapter.
pub fn adapter() -> Arc<dyn Adapter> {
    let mut defaults = Map::new();
    defaults.insert("decodeBinary".to_string(), Value::Bool(false));
    let manifest =
        AdapterManifest::new(IDENTITY, SUPPORTED_ADAPTER_API_VERSION).with_defaults(defaults);
    Arc::new(
        DriverAdapter::new(manifest, Arc::new(SqlDriver::default()))
            .with_driver_factory(driver_for)
            .with_migrator(Arc::new(SqlMigrator)),
    )
}

/// Each datastore gets a driver that compiles for its own backend.
fn driver_for(config: &DatastoreConfig) -> DsResult<Arc<dyn Driver>> {
    let settings = SqlSettings::from_config(config)?;
    Ok(Arc::new(SqlDriver::new(settings.db_type)))
}

/// Pool plus settings behind one SQL datastore.
#[derive(Debug)]
pub struct SqlManager {
    datastore: String,
    pool: DbPool,
    settings: SqlSettings,
}

impl SqlManager {
    pub fn db_type(&self) -> DatabaseType {
        self.settings.db_type
    }
}

#[derive(Debug)]
struct SqlConnection {
    db_type: DatabaseType,
    /// `None` once released.
    conn: Mutex<Option<PooledConnection>>,
    in_transaction: AtomicBool,
    query_timeout: Duration,
    decode_binary: bool,
}

fn manager_of(manager: &Manager) -> DsResult<&SqlManager> {
    manager.expect_ref::<SqlManager>(IDENTITY)
}

fn connection_of(connection: &Connection) -> DsResult<&SqlConnection> {
    connection.expect_ref::<SqlConnection>(IDENTITY)
}

fn released(connection: &Connection) -> DatastoreError {
    DatastoreError::driver(
        format!("connection {} has already been released", connection.id()),
        None,
    )
}

async fn run_query(
    conn: &mut PooledConnection,
    query: &NativeQuery,
    returns_rows: bool,
    decode_binary: bool,
) -> Result<Value, sqlx::Error> {
    on_connection!(conn, c, bind => {
        let mut q = sqlx::query(&query.query);
        for value in &query.values_to_escape {
            q = bind(q, value);
        }
        if returns_rows {
            let rows = q.fetch_all(&mut **c).await?;
            let rows = rows
                .iter()
                .map(|row| row.to_record(decode_binary).map(Value::Object))
                .collect::<Result<Vec<_>, _>>()?;
            Ok(json!({ "rows": rows }))
        } else {
            let result = q.execute(&mut **c).await?;
            Ok(json!({ "rowsAffected": result.rows_affected() }))
        }
    })
}

async fn run_control(conn: &mut PooledConnection, sql: &str) -> DsResult<()> {
    on_connection!(conn, c, _bind => {
        sqlx::query(sql).execute(&mut **c).await?;
        Ok(())
    })
}

fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

#[derive(Debug, Clone, Copy)]
pub struct SqlDriver {
    db_type: DatabaseType,
}

impl Default for SqlDriver {
    fn default() -> Self {
        Self::new(DatabaseType::SQLite)
    }
}

impl SqlDriver {
    pub fn new(db_type: DatabaseType) -> Self {
        Self { db_type }
    }

    pub fn db_type(&self) -> DatabaseType {
        self.db_type
    }

    /// Run a transaction-control statement, moving the connection's
    /// transaction flag from `from` to `!from`.
    async fn control(&self, connection: &Connection, from: bool, verb: &str) -> DsResult<()> {
        let sql = connection_of(connection)?;
        let mut guard = sql.conn.lock().await;
        let conn = guard.as_mut().ok_or_else(|| released(connection))?;

        if sql.in_transaction.load(Ordering::SeqCst) != from {
            return Err(DatastoreError::driver(
                if from {
                    format!("no open transaction to {}", verb)
                } else {
                    "a transaction is already open on this connection".to_string()
                },
                None,
            ));
        }

        let statement = match (verb, sql.db_type) {
            ("begin", DatabaseType::MySql) => "START TRANSACTION",
            ("begin", _) => "BEGIN",
            ("commit", _) => "COMMIT",
            _ => "ROLLBACK",
        };
        // A failed COMMIT can leave the transaction open (SQLite does on
        // deferred constraint failures), so the flag moves only on success.
        run_control(conn, statement).await?;
        sql.in_transaction.store(!from, Ordering::SeqCst);
        debug!(connection = %connection.id(), statement, "Transaction control");
        Ok(())
    }
}

impl Driver for SqlDriver {
    fn identity(&self) -> &str {
        IDENTITY
    }

    fn connectable(&self) -> Option<&dyn Connectable> {
        Some(self)
    }

    fn queryable(&self) -> Option<&dyn Queryable> {
        Some(self)
    }

    fn transactional(&self) -> Option<&dyn Transactional> {
        Some(self)
    }
}

#[async_trait]
impl Connectable for SqlDriver {
    async fn create_manager(&self, config: &DatastoreConfig) -> DsResult<Manager> {
        let settings = SqlSettings::from_config(config)?;
        let pool = DbPool::connect(&settings).await?;
        info!(datastore = %config.name, db_type = %settings.db_type, "Created SQL manager");
        Ok(Manager::new(SqlManager {
            datastore: config.name.clone(),
            pool,
            settings,
        }))
    }

    async fn destroy_manager(&self, manager: &Manager) -> DsResult<()> {
        let sql = manager_of(manager)?;
        sql.pool.close().await;
        debug!(datastore = %sql.datastore, "Closed connection pool");
        Ok(())
    }

    async fn get_connection(&self, manager: &Manager, _meta: &Meta) -> DsResult<Connection> {
        let sql = manager_of(manager)?;
        let conn = sql.pool.acquire().await?;
        Ok(Connection::new(SqlConnection {
            db_type: sql.db_type(),
            conn: Mutex::new(Some(conn)),
            in_transaction: AtomicBool::new(false),
            query_timeout: sql.settings.pool_options.query_timeout(),
            decode_binary: sql.settings.decode_binary,
        }))
    }

    async fn release_connection(&self, connection: &Connection, _meta: &Meta) -> DsResult<()> {
        let sql = connection_of(connection)?;
        let mut conn = sql.conn.lock().await.take().ok_or_else(|| {
            DatastoreError::driver(
                format!("connection {} was released twice", connection.id()),
                None,
            )
        })?;

        if sql.in_transaction.swap(false, Ordering::SeqCst) {
            warn!(connection = %connection.id(), "Released connection with an open transaction; rolling back");
            if let Err(e) = run_control(&mut conn, "ROLLBACK").await {
                // Never hand a connection stuck in a transaction back to the pool.
                conn.close_on_drop();
                return Err(e);
            }
        }
        Ok(())
    }
}

#[async_trait]
impl Queryable for SqlDriver {
    async fn send_native_query(
        &self,
        connection: &Connection,
        query: &NativeQuery,
        _meta: &Meta,
    ) -> Result<Value, SendFailure> {
        let sql = connection_of(connection)?;
        let mut guard = sql.conn.lock().await;
        let conn = guard.as_mut().ok_or_else(|| released(connection))?;

        let returns_rows = returns_rows(&query.query, sql.db_type);
        debug!(
            sql = %query.query,
            params = query.values_to_escape.len(),
            returns_rows,
            "Sending native query"
        );

        match timeout(
            sql.query_timeout,
            run_query(conn, query, returns_rows, sql.decode_binary),
        )
        .await
        {
            Ok(Ok(raw)) => Ok(raw),
            Ok(Err(e @ sqlx::Error::Database(_))) => Err(SendFailure::QueryFailed {
                error: e.into(),
                meta: None,
            }),
            Ok(Err(e)) => Err(SendFailure::Other(e.into())),
            Err(_) => Err(SendFailure::Other(DatastoreError::timeout(
                "native query",
                millis(sql.query_timeout),
            ))),
        }
    }

    fn compile_statement(
        &self,
        statement: &Statement,
        _meta: &Meta,
    ) -> DsResult<CompiledStatement> {
        compile(&statement.parse()?, self.db_type)
    }

    fn parse_native_query_result(
        &self,
        query_type: QueryType,
        raw: &Value,
        _meta: &Meta,
    ) -> DsResult<Value> {
        let fail = |message: String| DatastoreError::result_parse(query_type.as_str(), message);
        let first_row_value = |column: &str| -> DsResult<Value> {
            let rows = raw
                .get("rows")
                .and_then(Value::as_array)
                .ok_or_else(|| fail("raw SQL result has no `rows`".to_string()))?;
            let value = rows
                .first()
                .and_then(|row| row.get(column))
                .ok_or_else(|| fail(format!("aggregate row has no `{}` column", column)))?;
            aggregate_number(value)
                .ok_or_else(|| fail(format!("`{}` is not numeric: {}", column, value)))
        };

        match query_type {
            QueryType::Select => raw
                .get("rows")
                .filter(|rows| rows.is_array())
                .cloned()
                .ok_or_else(|| fail("raw SQL result has no `rows`".to_string())),
            QueryType::Insert | QueryType::Update | QueryType::Delete => raw
                .get("rowsAffected")
                .and_then(Value::as_u64)
                .map(|n| json!({ "affectedRows": n }))
                .ok_or_else(|| fail("raw SQL result has no `rowsAffected`".to_string())),
            QueryType::Count => first_row_value(COUNT_ALIAS),
            QueryType::Sum | QueryType::Avg => first_row_value(query_type.as_str()),
        }
    }

    fn parse_native_query_error(&self, error: &DatastoreError, _meta: &Meta) -> DsResult<Footprint> {
        Ok(footprint::classify(error))
    }
}

/// Aggregates over no rows come back as NULL; DECIMAL results arrive as text.
fn aggregate_number(value: &Value) -> Option<Value> {
    match value {
        Value::Null => Some(json!(0)),
        Value::Number(_) => Some(value.clone()),
        Value::String(s) => s
            .trim()
            .parse::<f64>()
            .ok()
            .and_then(serde_json::Number::from_f64)
            .map(Value::Number),
        _ => None,
    }
}

#[async_trait]
impl Transactional for SqlDriver {
    async fn begin_transaction(&self, connection: &Connection, _meta: &Meta) -> DsResult<()> {
        self.control(connection, false, "begin").await
    }

    async fn commit_transaction(&self, connection: &Connection, _meta: &Meta) -> DsResult<()> {
        self.control(connection, true, "commit").await
    }

    async fn rollback_transaction(&self, connection: &Connection, _meta: &Meta) -> DsResult<()> {
        self.control(connection, true, "roll back").await
    }
}

/// Schema operations run directly on the pool.
#[derive(Debug, Default, Clone, Copy)]
pub struct SqlMigrator;

#[async_trait]
impl SchemaMigrator for SqlMigrator {
    async fn has_table(&self, manager: &Manager, table: &str) -> DsResult<bool> {
        let sql = manager_of(manager)?;
        let name = Value::String(table.to_string());
        let statement = compiler::has_table(sql.db_type());
        let found = on_pool!(&sql.pool, p, bind => {
            bind(sqlx::query(statement), &name).fetch_optional(p).await?.is_some()
        });
        Ok(found)
    }

    async fn define_table(&self, manager: &Manager, spec: &TableSpec) -> DsResult<()> {
        let sql = manager_of(manager)?;
        let statement = compiler::create_table(spec, sql.db_type());
        debug!(datastore = %sql.datastore, sql = %statement, "Defining table");
        on_pool!(&sql.pool, p, _bind => {
            sqlx::query(&statement).execute(p).await?;
        });
        Ok(())
    }

    async fn drop_table(&self, manager: &Manager, table: &str) -> DsResult<()> {
        let sql = manager_of(manager)?;
        let statement = compiler::drop_table(table, sql.db_type());
        on_pool!(&sql.pool, p, _bind => {
            sqlx::query(&statement).execute(p).await?;
        });
        Ok(())
    }

    async fn fetch_all(&self, manager: &Manager, table: &str) -> DsResult<Vec<Record>> {
        let sql = manager_of(manager)?;
        let statement = format!("SELECT * FROM {}", quote_ident(table, sql.db_type()));
        let decode_binary = sql.settings.decode_binary;
        let records = on_pool!(&sql.pool, p, _bind => {
            sqlx::query(&statement)
                .fetch_all(p)
                .await?
                .iter()
                .map(|row| row.to_record(decode_binary))
                .collect::<Result<Vec<_>, _>>()?
        });
        Ok(records)
    }

    /// Only columns the table defines are written.
    async fn insert_record(
        &self,
        manager: &Manager,
        spec: &TableSpec,
        record: &Record,
    ) -> DsResult<()> {
        let sql = manager_of(manager)?;
        let projected: Record = record
            .iter()
            .filter(|(key, _)| spec.column(key).is_some())
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect();
        let compiled = compiler::insert(
            sql.db_type(),
            &spec.name,
            std::slice::from_ref(&projected),
            None,
        )?;
        on_pool!(&sql.pool, p, bind => {
            let mut q = sqlx::query(&compiled.native_query);
            for value in &compiled.values_to_escape {
                q = bind(q, value);
            }
            q.execute(p).await?;
        });
        Ok(())
    }
}
