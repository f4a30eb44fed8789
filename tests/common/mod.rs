//! Scripted fake drivers shared by the integration tests.
//!
//! `FakeDriver` records every driver call by name and can be told to fail
//! any of them.

#![allow(dead_code)]

use async_trait::async_trait;
use datastore_runtime::adapters::{Adapter, AdapterManifest, DriverAdapter};
use datastore_runtime::db::RegisteredDatastore;
use datastore_runtime::driver::{
    CompiledStatement, Connectable, Connection, Driver, Manager, NativeQuery, Queryable,
    SendFailure, Tier, Transactional,
};
use datastore_runtime::error::{DatastoreError, DsResult, Footprint};
use datastore_runtime::models::{DatastoreConfig, Meta, QueryType, Statement};
use serde_json::{Value, json};
use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

pub const FAKE_IDENTITY: &str = "fake";

#[derive(Debug)]
pub struct FakeDriver {
    tier: Tier,
    calls: Mutex<Vec<String>>,
    failing: Mutex<HashSet<&'static str>>,
    next_connection: AtomicU64,
}

impl FakeDriver {
    pub fn new(tier: Tier) -> Arc<Self> {
        Arc::new(Self {
            tier,
            calls: Mutex::new(Vec::new()),
            failing: Mutex::new(HashSet::new()),
            next_connection: AtomicU64::new(1),
        })
    }

    pub fn transactional() -> Arc<Self> {
        Self::new(Tier::Transactional)
    }

    /// Make the named operation fail from now on.
    pub fn fail(&self, operation: &'static str) {
        self.failing.lock().unwrap().insert(operation);
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub fn count(&self, operation: &str) -> usize {
        self.calls().iter().filter(|c| c.as_str() == operation).count()
    }

    pub fn clear(&self) {
        self.calls.lock().unwrap().clear();
    }

    fn record(&self, operation: &'static str) -> DsResult<()> {
        self.calls.lock().unwrap().push(operation.to_string());
        if self.failing.lock().unwrap().contains(operation) {
            return Err(DatastoreError::driver(format!("{} exploded", operation), None));
        }
        Ok(())
    }
}

#[async_trait]
impl Connectable for FakeDriver {
    async fn create_manager(&self, _config: &DatastoreConfig) -> DsResult<Manager> {
        self.record("createManager")?;
        Ok(Manager::new(()))
    }

    async fn destroy_manager(&self, _manager: &Manager) -> DsResult<()> {
        self.record("destroyManager")
    }

    async fn get_connection(&self, _manager: &Manager, _meta: &Meta) -> DsResult<Connection> {
        self.record("getConnection")?;
        Ok(Connection::new(
            self.next_connection.fetch_add(1, Ordering::SeqCst),
        ))
    }

    async fn release_connection(&self, _connection: &Connection, _meta: &Meta) -> DsResult<()> {
        self.record("releaseConnection")
    }
}

#[async_trait]
impl Queryable for FakeDriver {
    async fn send_native_query(
        &self,
        _connection: &Connection,
        query: &NativeQuery,
        _meta: &Meta,
    ) -> Result<Value, SendFailure> {
        if self.record("sendNativeQuery").is_err() {
            return Err(SendFailure::QueryFailed {
                error: DatastoreError::driver(
                    "duplicate key value violates unique constraint \"user_email_key\"",
                    Some("23505".to_string()),
                ),
                meta: None,
            });
        }
        Ok(json!({"rows": [{"query": query.query}]}))
    }

    fn compile_statement(&self, statement: &Statement, _meta: &Meta) -> DsResult<CompiledStatement> {
        self.record("compileStatement")?;
        Ok(CompiledStatement::new(
            Value::Object(statement.as_map().clone()).to_string(),
            Vec::new(),
        ))
    }

    fn parse_native_query_result(
        &self,
        query_type: QueryType,
        raw: &Value,
        _meta: &Meta,
    ) -> DsResult<Value> {
        self.record("parseNativeQueryResult")?;
        match query_type {
            QueryType::Select => Ok(raw["rows"].clone()),
            _ => Ok(json!({"affectedRows": 0})),
        }
    }

    fn parse_native_query_error(
        &self,
        error: &DatastoreError,
        _meta: &Meta,
    ) -> DsResult<Footprint> {
        self.record("parseNativeQueryError")?;
        match error {
            DatastoreError::Driver {
                native_code: Some(code),
                ..
            } if code == "23505" => Ok(Footprint::NotUnique {
                keys: vec!["email".to_string()],
            }),
            _ => Ok(Footprint::Catchall),
        }
    }
}

#[async_trait]
impl Transactional for FakeDriver {
    async fn begin_transaction(&self, _connection: &Connection, _meta: &Meta) -> DsResult<()> {
        self.record("beginTransaction")
    }

    async fn commit_transaction(&self, _connection: &Connection, _meta: &Meta) -> DsResult<()> {
        self.record("commitTransaction")
    }

    async fn rollback_transaction(&self, _connection: &Connection, _meta: &Meta) -> DsResult<()> {
        self.record("rollbackTransaction")
    }
}

impl Driver for FakeDriver {
    fn identity(&self) -> &str {
        FAKE_IDENTITY
    }

    fn connectable(&self) -> Option<&dyn Connectable> {
        Some(self)
    }

    fn queryable(&self) -> Option<&dyn Queryable> {
        (self.tier >= Tier::Queryable).then_some(self as &dyn Queryable)
    }

    fn transactional(&self) -> Option<&dyn Transactional> {
        (self.tier >= Tier::Transactional).then_some(self as &dyn Transactional)
    }
}

/// Adapter around `driver` declaring `api_version`.
pub fn fake_adapter(driver: Arc<FakeDriver>, api_version: u64) -> Arc<dyn Adapter> {
    Arc::new(DriverAdapter::new(
        AdapterManifest::new(FAKE_IDENTITY, api_version),
        driver,
    ))
}

/// Register `driver` as the `default` datastore and build its handle.
pub async fn registered(driver: Arc<FakeDriver>) -> RegisteredDatastore {
    registered_with(driver, DatastoreConfig::new("default", FAKE_IDENTITY)).await
}

pub async fn registered_with(driver: Arc<FakeDriver>, config: DatastoreConfig) -> RegisteredDatastore {
    let adapter = fake_adapter(driver.clone(), 1);
    adapter.register_datastore(&config, &[]).await.unwrap();
    driver.clear();
    let name = config.name.clone();
    RegisteredDatastore::build(&name, config, adapter.as_ref()).unwrap()
}

pub fn statement(value: Value) -> Statement {
    Statement::from_value(value).unwrap()
}
