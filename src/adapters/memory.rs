//! In-process memory adapter.
//!
//! Each manager owns an independent store of tables. Native queries are the
//! JSON text of a statement. A transaction works on a private copy of the
//! tables it touches and writes them back on commit.

use super::footprint::{self, UNIQUE_PREFIX};
use super::{Adapter, AdapterManifest, DriverAdapter, SchemaMigrator};
use crate::driver::{
    CompiledStatement, Connectable, Connection, Driver, Manager, NativeQuery, Queryable,
    SUPPORTED_ADAPTER_API_VERSION, SendFailure, Transactional,
};
use crate::error::{DatastoreError, DsResult, Footprint};
use crate::models::{
    DatastoreConfig, Meta, QueryType, Record, Statement, StatementAst, TableSpec, compare_values,
    values_equal,
};
use async_trait::async_trait;
use serde_json::{Value, json};
use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering as AtomicOrdering};
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, warn};

pub const IDENTITY: &str = "memory";

/// The built-in memory adapter.
pub fn adapter() -> Arc<dyn Adapter> {
    let manifest = AdapterManifest::new(IDENTITY, SUPPORTED_ADAPTER_API_VERSION);
    Arc::new(
        DriverAdapter::new(manifest, Arc::new(MemoryDriver::new()))
            .with_migrator(Arc::new(MemoryMigrator)),
    )
}

#[derive(Debug, Clone, Default)]
struct MemoryTable {
    spec: Option<TableSpec>,
    rows: Vec<Record>,
}

type Tables = BTreeMap<String, MemoryTable>;

/// Tables behind one manager.
#[derive(Debug)]
pub struct MemoryStore {
    datastore: String,
    tables: RwLock<Tables>,
    closed: AtomicBool,
}

impl MemoryStore {
    fn new(datastore: impl Into<String>) -> Self {
        Self {
            datastore: datastore.into(),
            tables: RwLock::new(Tables::new()),
            closed: AtomicBool::new(false),
        }
    }

    fn ensure_open(&self) -> DsResult<()> {
        if self.closed.load(AtomicOrdering::SeqCst) {
            return Err(DatastoreError::driver(
                format!("memory store for `{}` has been destroyed", self.datastore),
                None,
            ));
        }
        Ok(())
    }
}

/// Working copy held by a connection while a transaction is open.
#[derive(Debug, Default)]
struct TxState {
    tables: Tables,
    touched: BTreeSet<String>,
}

#[derive(Debug)]
struct MemoryConnection {
    store: Arc<MemoryStore>,
    released: AtomicBool,
    tx: Mutex<Option<TxState>>,
}

fn store_of(manager: &Manager) -> DsResult<&Arc<MemoryStore>> {
    manager.expect_ref::<Arc<MemoryStore>>(IDENTITY)
}

fn connection_of(connection: &Connection) -> DsResult<&MemoryConnection> {
    let conn = connection.expect_ref::<MemoryConnection>(IDENTITY)?;
    if conn.released.load(AtomicOrdering::SeqCst) {
        return Err(DatastoreError::driver(
            format!("connection {} has already been released", connection.id()),
            None,
        ));
    }
    conn.store.ensure_open()?;
    Ok(conn)
}

#[derive(Debug, Default, Clone, Copy)]
pub struct MemoryDriver;

impl MemoryDriver {
    pub fn new() -> Self {
        Self
    }
}

impl Driver for MemoryDriver {
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
impl Connectable for MemoryDriver {
    async fn create_manager(&self, config: &DatastoreConfig) -> DsResult<Manager> {
        debug!(datastore = %config.name, "Creating memory store");
        Ok(Manager::new(Arc::new(MemoryStore::new(&config.name))))
    }

    async fn destroy_manager(&self, manager: &Manager) -> DsResult<()> {
        let store = store_of(manager)?;
        store.closed.store(true, AtomicOrdering::SeqCst);
        store.tables.write().await.clear();
        Ok(())
    }

    async fn get_connection(&self, manager: &Manager, _meta: &Meta) -> DsResult<Connection> {
        let store = store_of(manager)?;
        store.ensure_open()?;
        Ok(Connection::new(MemoryConnection {
            store: store.clone(),
            released: AtomicBool::new(false),
            tx: Mutex::new(None),
        }))
    }

    async fn release_connection(&self, connection: &Connection, _meta: &Meta) -> DsResult<()> {
        let conn = connection.expect_ref::<MemoryConnection>(IDENTITY)?;
        if conn.released.swap(true, AtomicOrdering::SeqCst) {
            return Err(DatastoreError::driver(
                format!("connection {} was released twice", connection.id()),
                None,
            ));
        }
        if conn.tx.lock().await.take().is_some() {
            warn!(connection = %connection.id(), "Released connection with an open transaction; discarding it");
        }
        Ok(())
    }
}

#[async_trait]
impl Queryable for MemoryDriver {
    async fn send_native_query(
        &self,
        connection: &Connection,
        query: &NativeQuery,
        _meta: &Meta,
    ) -> Result<Value, SendFailure> {
        let conn = connection_of(connection)?;

        if !query.values_to_escape.is_empty() {
            return Err(SendFailure::Other(DatastoreError::driver(
                "the memory adapter does not take escaped values",
                None,
            )));
        }

        let statement = serde_json::from_str::<Value>(&query.query)
            .map_err(|e| DatastoreError::driver(format!("invalid native query: {}", e), None))
            .and_then(Statement::from_value)
            .and_then(|s| s.parse())
            .map_err(|error| SendFailure::QueryFailed { error, meta: None })?;

        let mut tx = conn.tx.lock().await;
        let outcome = match tx.as_mut() {
            Some(state) => {
                let mut touched = BTreeSet::new();
                let outcome = execute(&mut state.tables, &statement, &mut touched);
                state.touched.extend(touched);
                outcome
            }
            None => {
                let mut tables = conn.store.tables.write().await;
                execute(&mut tables, &statement, &mut BTreeSet::new())
            }
        };

        outcome.map_err(|error| SendFailure::QueryFailed { error, meta: None })
    }

    fn compile_statement(
        &self,
        statement: &Statement,
        _meta: &Meta,
    ) -> DsResult<CompiledStatement> {
        statement.parse()?;
        let text = serde_json::to_string(statement)
            .map_err(|e| DatastoreError::malformed_statement(e.to_string()))?;
        Ok(CompiledStatement::new(text, Vec::new()))
    }

    fn parse_native_query_result(
        &self,
        query_type: QueryType,
        raw: &Value,
        _meta: &Meta,
    ) -> DsResult<Value> {
        let missing = |key: &str| {
            DatastoreError::result_parse(
                query_type.as_str(),
                format!("raw memory result has no `{}`", key),
            )
        };
        match query_type {
            QueryType::Select => raw
                .get("rows")
                .filter(|rows| rows.is_array())
                .cloned()
                .ok_or_else(|| missing("rows")),
            QueryType::Insert | QueryType::Update | QueryType::Delete => raw
                .get("rowsAffected")
                .and_then(Value::as_u64)
                .map(|n| json!({ "affectedRows": n }))
                .ok_or_else(|| missing("rowsAffected")),
            QueryType::Count | QueryType::Sum | QueryType::Avg => raw
                .get("value")
                .filter(|v| v.is_number())
                .cloned()
                .ok_or_else(|| missing("value")),
        }
    }

    fn parse_native_query_error(&self, error: &DatastoreError, _meta: &Meta) -> DsResult<Footprint> {
        Ok(footprint::classify(error))
    }
}

#[async_trait]
impl Transactional for MemoryDriver {
    async fn begin_transaction(&self, connection: &Connection, _meta: &Meta) -> DsResult<()> {
        let conn = connection_of(connection)?;
        let mut tx = conn.tx.lock().await;
        if tx.is_some() {
            return Err(DatastoreError::driver(
                "a transaction is already open on this connection",
                None,
            ));
        }
        let tables = conn.store.tables.read().await.clone();
        *tx = Some(TxState {
            tables,
            touched: BTreeSet::new(),
        });
        Ok(())
    }

    async fn commit_transaction(&self, connection: &Connection, _meta: &Meta) -> DsResult<()> {
        let conn = connection_of(connection)?;
        let state = conn
            .tx
            .lock()
            .await
            .take()
            .ok_or_else(|| DatastoreError::driver("no open transaction to commit", None))?;

        let mut tables = conn.store.tables.write().await;
        for name in state.touched {
            match state.tables.get(&name) {
                Some(table) => {
                    tables.insert(name, table.clone());
                }
                None => {
                    tables.remove(&name);
                }
            }
        }
        Ok(())
    }

    async fn rollback_transaction(&self, connection: &Connection, _meta: &Meta) -> DsResult<()> {
        let conn = connection_of(connection)?;
        conn.tx
            .lock()
            .await
            .take()
            .map(|_| ())
            .ok_or_else(|| DatastoreError::driver("no open transaction to roll back", None))
    }
}

fn matches(ast: &StatementAst, record: &Record) -> bool {
    ast.predicate.as_ref().is_none_or(|p| p.matches(record))
}

fn execute(
    tables: &mut Tables,
    ast: &StatementAst,
    touched: &mut BTreeSet<String>,
) -> DsResult<Value> {
    match ast.query_type {
        QueryType::Select => {
            let Some(table) = tables.get(&ast.table) else {
                return Ok(json!({ "rows": [] }));
            };
            let mut rows: Vec<&Record> = table.rows.iter().filter(|r| matches(ast, r)).collect();
            for term in ast.sort.iter().rev() {
                rows.sort_by(|a, b| {
                    let ordering = compare_values(
                        a.get(&term.column).unwrap_or(&Value::Null),
                        b.get(&term.column).unwrap_or(&Value::Null),
                    )
                    .unwrap_or(Ordering::Equal);
                    if term.descending {
                        ordering.reverse()
                    } else {
                        ordering
                    }
                });
            }
            let skip = ast.skip.unwrap_or(0) as usize;
            let limit = ast.limit.map_or(usize::MAX, |l| l as usize);
            let rows: Vec<Value> = rows
                .into_iter()
                .skip(skip)
                .take(limit)
                .map(|record| Value::Object(project(record, ast.columns.as_deref())))
                .collect();
            Ok(json!({ "rows": rows }))
        }
        QueryType::Insert => {
            let table = tables.entry(ast.table.clone()).or_default();
            let inserted = insert_rows(&ast.table, table, &ast.records)?;
            touched.insert(ast.table.clone());
            Ok(json!({ "rowsAffected": inserted }))
        }
        QueryType::Update => {
            let Some(table) = tables.get_mut(&ast.table) else {
                return Ok(json!({ "rowsAffected": 0 }));
            };
            let mut updated = table.rows.clone();
            let mut affected = 0u64;
            for record in updated.iter_mut().filter(|r| matches(ast, r)) {
                for (key, value) in &ast.values {
                    record.insert(key.clone(), value.clone());
                }
                affected += 1;
            }
            check_unique(&ast.table, table.spec.as_ref(), &updated)?;
            table.rows = updated;
            touched.insert(ast.table.clone());
            Ok(json!({ "rowsAffected": affected }))
        }
        QueryType::Delete => {
            let Some(table) = tables.get_mut(&ast.table) else {
                return Ok(json!({ "rowsAffected": 0 }));
            };
            let before = table.rows.len();
            table.rows.retain(|r| !matches(ast, r));
            touched.insert(ast.table.clone());
            Ok(json!({ "rowsAffected": before - table.rows.len() }))
        }
        QueryType::Count | QueryType::Sum | QueryType::Avg => {
            let rows: Vec<&Record> = tables
                .get(&ast.table)
                .map(|t| t.rows.iter().filter(|r| matches(ast, r)).collect())
                .unwrap_or_default();

            let value = match (ast.query_type, ast.aggregate.as_deref()) {
                (QueryType::Count, _) => json!(rows.len()),
                (_, Some(column)) => {
                    let numbers: Vec<f64> = rows
                        .iter()
                        .filter_map(|r| r.get(column).and_then(Value::as_f64))
                        .collect();
                    let sum: f64 = numbers.iter().sum();
                    if ast.query_type == QueryType::Sum {
                        json!(sum)
                    } else if numbers.is_empty() {
                        json!(0)
                    } else {
                        json!(sum / numbers.len() as f64)
                    }
                }
                (_, None) => {
                    return Err(DatastoreError::driver("aggregate column is missing", None));
                }
            };
            Ok(json!({ "value": value }))
        }
    }
}

fn project(record: &Record, columns: Option<&[String]>) -> Record {
    match columns {
        None => record.clone(),
        Some(columns) => columns
            .iter()
            .map(|c| (c.clone(), record.get(c).cloned().unwrap_or(Value::Null)))
            .collect(),
    }
}

/// Insert every record or none of them.
fn insert_rows(name: &str, table: &mut MemoryTable, records: &[Record]) -> DsResult<usize> {
    let mut rows = table.rows.clone();
    for record in records {
        let mut record = record.clone();
        if let Some(spec) = &table.spec {
            for column in spec.columns.iter().filter(|c| c.auto_increment) {
                if record.get(&column.name).is_none_or(Value::is_null) {
                    let next = rows
                        .iter()
                        .filter_map(|r| r.get(&column.name).and_then(Value::as_i64))
                        .max()
                        .unwrap_or(0)
                        + 1;
                    record.insert(column.name.clone(), json!(next));
                }
            }
        }
        rows.push(record);
    }
    check_unique(name, table.spec.as_ref(), &rows)?;
    table.rows = rows;
    Ok(records.len())
}

fn check_unique(name: &str, spec: Option<&TableSpec>, rows: &[Record]) -> DsResult<()> {
    let Some(spec) = spec else {
        return Ok(());
    };

    let mut violated = Vec::new();
    for column in spec.columns.iter().filter(|c| c.unique || c.primary_key) {
        let values: Vec<&Value> = rows
            .iter()
            .filter_map(|r| r.get(&column.name))
            .filter(|v| !v.is_null())
            .collect();
        let duplicate = values
            .iter()
            .enumerate()
            .any(|(i, a)| values[i + 1..].iter().any(|b| values_equal(a, b)));
        if duplicate {
            violated.push(format!("{}.{}", name, column.name));
        }
    }

    if violated.is_empty() {
        Ok(())
    } else {
        Err(DatastoreError::driver(
            format!("{}{}", UNIQUE_PREFIX, violated.join(", ")),
            Some("UNIQUE".to_string()),
        ))
    }
}

/// Schema operations for the memory adapter.
#[derive(Debug, Default, Clone, Copy)]
pub struct MemoryMigrator;

#[async_trait]
impl SchemaMigrator for MemoryMigrator {
    async fn has_table(&self, manager: &Manager, table: &str) -> DsResult<bool> {
        Ok(store_of(manager)?.tables.read().await.contains_key(table))
    }

    async fn define_table(&self, manager: &Manager, spec: &TableSpec) -> DsResult<()> {
        let store = store_of(manager)?;
        store.ensure_open()?;
        store.tables.write().await.insert(
            spec.name.clone(),
            MemoryTable {
                spec: Some(spec.clone()),
                rows: Vec::new(),
            },
        );
        Ok(())
    }

    async fn drop_table(&self, manager: &Manager, table: &str) -> DsResult<()> {
        store_of(manager)?.tables.write().await.remove(table);
        Ok(())
    }

    async fn fetch_all(&self, manager: &Manager, table: &str) -> DsResult<Vec<Record>> {
        Ok(store_of(manager)?
            .tables
            .read()
            .await
            .get(table)
            .map(|t| t.rows.clone())
            .unwrap_or_default())
    }

    async fn insert_record(
        &self,
        manager: &Manager,
        spec: &TableSpec,
        record: &Record,
    ) -> DsResult<()> {
        let store = store_of(manager)?;
        let mut tables = store.tables.write().await;
        let table = tables.entry(spec.name.clone()).or_insert_with(|| MemoryTable {
            spec: Some(spec.clone()),
            rows: Vec::new(),
        });
        insert_rows(&spec.name, table, std::slice::from_ref(record)).map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ColumnSpec;

    fn spec() -> TableSpec {
        TableSpec {
            name: "user".into(),
            columns: vec![
                ColumnSpec {
                    name: "id".into(),
                    column_type: "_numberkey".into(),
                    primary_key: true,
                    unique: true,
                    auto_increment: true,
                },
                ColumnSpec {
                    name: "email".into(),
                    column_type: "_string".into(),
                    primary_key: false,
                    unique: true,
                    auto_increment: false,
                },
            ],
        }
    }

    fn parse(value: Value) -> StatementAst {
        Statement::from_value(value).unwrap().parse().unwrap()
    }

    #[test]
    fn test_insert_assigns_auto_increment_and_enforces_unique() {
        let mut tables = Tables::new();
        tables.insert(
            "user".into(),
            MemoryTable {
                spec: Some(spec()),
                rows: Vec::new(),
            },
        );
        let mut touched = BTreeSet::new();

        execute(
            &mut tables,
            &parse(json!({"insert": [{"email": "a@x"}, {"email": "b@x"}], "into": "user"})),
            &mut touched,
        )
        .unwrap();
        let ids: Vec<_> = tables["user"].rows.iter().map(|r| r["id"].clone()).collect();
        assert_eq!(ids, vec![json!(1), json!(2)]);

        let err = execute(
            &mut tables,
            &parse(json!({"insert": {"email": "a@x"}, "into": "user"})),
            &mut touched,
        )
        .unwrap_err();
        assert_eq!(
            footprint::classify(&err),
            Footprint::NotUnique {
                keys: vec!["email".into()]
            }
        );
        assert_eq!(tables["user"].rows.len(), 2);
    }

    #[test]
    fn test_select_sort_skip_limit() {
        let mut tables = Tables::new();
        let mut touched = BTreeSet::new();
        execute(
            &mut tables,
            &parse(json!({"insert": [{"n": 3}, {"n": 1}, {"n": 2}, {"n": 4}], "into": "t"})),
            &mut touched,
        )
        .unwrap();

        let raw = execute(
            &mut tables,
            &parse(json!({
                "select": ["n"],
                "from": "t",
                "where": {"n": {">": 1}},
                "orderBy": [{"n": "DESC"}],
                "skip": 1,
                "limit": 1
            })),
            &mut touched,
        )
        .unwrap();
        assert_eq!(raw["rows"], json!([{"n": 3}]));
    }

    #[test]
    fn test_aggregates() {
        let mut tables = Tables::new();
        let mut touched = BTreeSet::new();
        execute(
            &mut tables,
            &parse(json!({"insert": [{"age": 10}, {"age": 20}], "into": "t"})),
            &mut touched,
        )
        .unwrap();

        let count = execute(&mut tables, &parse(json!({"count": true, "from": "t"})), &mut touched).unwrap();
        assert_eq!(count["value"], json!(2));
        let avg = execute(&mut tables, &parse(json!({"avg": "age", "from": "t"})), &mut touched).unwrap();
        assert_eq!(avg["value"], json!(15.0));
    }

    #[test]
    fn test_parse_result_shapes() {
        let driver = MemoryDriver::new();
        let meta = Meta::new();
        assert_eq!(
            driver
                .parse_native_query_result(QueryType::Delete, &json!({"rowsAffected": 2}), &meta)
                .unwrap(),
            json!({"affectedRows": 2})
        );
        let err = driver
            .parse_native_query_result(QueryType::Select, &json!({"value": 1}), &meta)
            .unwrap_err();
        assert_eq!(err.code(), "E_RESULT_PARSE");
    }

    #[tokio::test]
    async fn test_transaction_is_isolated_until_commit() {
        let driver = MemoryDriver::new();
        let meta = Meta::new();
        let manager = driver
            .create_manager(&DatastoreConfig::new("default", IDENTITY))
            .await
            .unwrap();
        let tx_conn = driver.get_connection(&manager, &meta).await.unwrap();
        let other = driver.get_connection(&manager, &meta).await.unwrap();

        let insert = NativeQuery::new(r#"{"insert": {"a": 1}, "into": "t"}"#);
        let count = NativeQuery::new(r#"{"count": true, "from": "t"}"#);

        driver.begin_transaction(&tx_conn, &meta).await.unwrap();
        driver.send_native_query(&tx_conn, &insert, &meta).await.unwrap();
        let seen = driver.send_native_query(&other, &count, &meta).await.unwrap();
        assert_eq!(seen["value"], json!(0));

        driver.commit_transaction(&tx_conn, &meta).await.unwrap();
        let seen = driver.send_native_query(&other, &count, &meta).await.unwrap();
        assert_eq!(seen["value"], json!(1));
    }

    #[tokio::test]
    async fn test_released_connection_is_unusable() {
        let driver = MemoryDriver::new();
        let meta = Meta::new();
        let manager = driver
            .create_manager(&DatastoreConfig::new("default", IDENTITY))
            .await
            .unwrap();
        let conn = driver.get_connection(&manager, &meta).await.unwrap();
        driver.release_connection(&conn, &meta).await.unwrap();

        assert!(driver.release_connection(&conn, &meta).await.is_err());
        let failure = driver
            .send_native_query(&conn, &NativeQuery::new("{}"), &meta)
            .await
            .unwrap_err();
        assert!(matches!(failure, SendFailure::Other(_)));
    }
}
