//! Integration tests for building registered datastore handles.

mod common;

use async_trait::async_trait;
use common::{FAKE_IDENTITY, FakeDriver, fake_adapter, registered, statement};
use datastore_runtime::adapters::{Adapter, AdapterDatastores, AdapterManifest, DatastoreEntry};
use datastore_runtime::db::RegisteredDatastore;
use datastore_runtime::driver::Driver;
use datastore_runtime::error::{DatastoreError, DsResult};
use datastore_runtime::models::{DatastoreConfig, ModelDef};
use serde_json::json;
use std::sync::Arc;

/// Adapter that keeps its datastores private.
#[derive(Debug)]
struct OpaqueAdapter {
    manifest: AdapterManifest,
}

#[async_trait]
impl Adapter for OpaqueAdapter {
    fn manifest(&self) -> &AdapterManifest {
        &self.manifest
    }

    fn datastores(&self) -> Option<&AdapterDatastores> {
        None
    }

    async fn register_datastore(
        &self,
        _config: &DatastoreConfig,
        _models: &[Arc<ModelDef>],
    ) -> DsResult<()> {
        Ok(())
    }

    async fn teardown(&self, _datastore: Option<&str>) -> DsResult<()> {
        Ok(())
    }
}

async fn assert_all_unsupported(rdi: &RegisteredDatastore) -> DatastoreError {
    let lease = rdi
        .lease_connection(|_conn| async { Ok::<_, DatastoreError>(()) })
        .await
        .unwrap_err();
    let tx = rdi
        .transaction(|_conn| async { Ok::<_, DatastoreError>(()) })
        .await
        .unwrap_err();
    let stmt = rdi
        .send_statement(statement(json!({"select": ["*"], "from": "user"})))
        .await
        .unwrap_err();
    let native = rdi.send_native_query("SELECT 1").await.unwrap_err();

    for err in [&lease, &tx, &stmt, &native] {
        assert_eq!(err.code(), "E_NOT_SUPPORTED");
        assert_eq!(err.to_string(), lease.to_string());
    }
    lease
}

#[tokio::test]
async fn test_transactional_datastore_has_all_tiers() {
    let rdi = registered(FakeDriver::transactional()).await;

    let caps = rdi.capabilities().unwrap();
    assert!(caps.connectable && caps.queryable && caps.transactional);
    assert_eq!(rdi.name(), "default");
    assert_eq!(rdi.adapter(), FAKE_IDENTITY);
    assert!(rdi.unsupported_reason().is_none());
}

#[tokio::test]
async fn test_incompatible_api_version_builds_stub() {
    let driver = FakeDriver::transactional();
    let adapter = fake_adapter(driver.clone(), 2);
    let config = DatastoreConfig::new("default", FAKE_IDENTITY);
    adapter.register_datastore(&config, &[]).await.unwrap();
    driver.clear();

    let rdi = RegisteredDatastore::build("default", config, adapter.as_ref()).unwrap();

    assert!(rdi.capabilities().is_none());
    let err = assert_all_unsupported(&rdi).await;
    assert!(err.to_string().contains("too new"));
    assert!(driver.calls().is_empty());
}

#[tokio::test]
async fn test_unregistered_datastore_builds_stub() {
    let driver = FakeDriver::transactional();
    let adapter = fake_adapter(driver.clone(), 1);

    let rdi = RegisteredDatastore::build(
        "reporting",
        DatastoreConfig::new("reporting", FAKE_IDENTITY),
        adapter.as_ref(),
    )
    .unwrap();

    let err = assert_all_unsupported(&rdi).await;
    assert!(err.to_string().contains("missing an entry"));
    assert!(driver.calls().is_empty());
}

#[tokio::test]
async fn test_adapter_without_datastores_table_builds_stub() {
    let adapter = OpaqueAdapter {
        manifest: AdapterManifest::new("opaque", 1),
    };

    let rdi = RegisteredDatastore::build(
        "default",
        DatastoreConfig::new("default", "opaque"),
        &adapter,
    )
    .unwrap();

    let err = assert_all_unsupported(&rdi).await;
    assert!(err.to_string().contains("`datastores` table"));
}

#[tokio::test]
async fn test_partial_entry_builds_stub() {
    let driver = FakeDriver::transactional();
    let adapter = fake_adapter(driver.clone(), 1);
    adapter.datastores().unwrap().insert(
        "default",
        DatastoreEntry {
            driver: Some(driver.clone() as Arc<dyn Driver>),
            manager: None,
            config: None,
        },
    );

    let rdi = RegisteredDatastore::build(
        "default",
        DatastoreConfig::new("default", FAKE_IDENTITY),
        adapter.as_ref(),
    )
    .unwrap();

    let err = assert_all_unsupported(&rdi).await;
    assert!(err.to_string().contains("missing manager, config"));
}

#[tokio::test]
async fn test_empty_name_is_rejected() {
    let adapter = fake_adapter(FakeDriver::transactional(), 1);

    let err = RegisteredDatastore::build("", DatastoreConfig::new("", FAKE_IDENTITY), adapter.as_ref())
        .unwrap_err();

    assert_eq!(err.code(), "E_CONSISTENCY_VIOLATION");
}
