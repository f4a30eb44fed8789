//! Integration tests for transactions through a registered datastore.

mod common;

use common::{FakeDriver, registered, registered_with};
use datastore_runtime::driver::{Connection, Tier};
use datastore_runtime::error::DatastoreError;
use datastore_runtime::models::DatastoreConfig;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

#[tokio::test]
async fn test_commit_on_success() {
    let driver = FakeDriver::transactional();
    let rdi = registered(driver.clone()).await;

    let value = rdi
        .transaction(|_conn| async { Ok::<_, DatastoreError>("done") })
        .await
        .unwrap();

    assert_eq!(value, "done");
    assert_eq!(
        driver.calls(),
        vec![
            "getConnection",
            "beginTransaction",
            "commitTransaction",
            "releaseConnection"
        ]
    );
}

#[tokio::test]
async fn test_rollback_on_failure() {
    let driver = FakeDriver::transactional();
    let rdi = registered(driver.clone()).await;

    let err = rdi
        .transaction(|_conn| async { Err::<(), _>(DatastoreError::work("insert went wrong")) })
        .await
        .unwrap_err();

    assert_eq!(err.code(), "E_WORK");
    assert_eq!(driver.count("rollbackTransaction"), 1);
    assert_eq!(driver.count("commitTransaction"), 0);
    assert_eq!(driver.count("releaseConnection"), 1);
}

#[tokio::test]
async fn test_commit_failure_discards_result() {
    let driver = FakeDriver::transactional();
    let rdi = registered(driver.clone()).await;
    driver.fail("commitTransaction");

    let err = rdi
        .transaction(|_conn| async { Ok::<_, DatastoreError>(99) })
        .await
        .unwrap_err();

    assert_eq!(err.code(), "E_COMMIT_FAILED");
    assert!(err.to_string().contains("commitTransaction exploded"));
    assert_eq!(driver.count("rollbackTransaction"), 0);
    assert_eq!(driver.count("releaseConnection"), 1);
}

#[tokio::test]
async fn test_rollback_failure_keeps_both_errors() {
    let driver = FakeDriver::transactional();
    let rdi = registered(driver.clone()).await;
    driver.fail("rollbackTransaction");

    let err = rdi
        .transaction(|_conn| async { Err::<(), _>(DatastoreError::work("insert went wrong")) })
        .await
        .unwrap_err();

    assert_eq!(err.code(), "E_ROLLBACK_FAILED");
    let text = err.to_string();
    assert!(text.contains("insert went wrong"));
    assert!(text.contains("rollbackTransaction exploded"));
    assert_eq!(err.raw().map(|e| e.code()), Some("E_WORK"));
    assert_eq!(driver.count("releaseConnection"), 1);
}

#[tokio::test]
async fn test_begin_failure_skips_work() {
    let driver = FakeDriver::transactional();
    let rdi = registered(driver.clone()).await;
    driver.fail("beginTransaction");
    let ran = Arc::new(AtomicBool::new(false));
    let flag = ran.clone();

    let err = rdi
        .transaction(move |_conn| async move {
            flag.store(true, Ordering::SeqCst);
            Ok::<_, DatastoreError>(())
        })
        .await
        .unwrap_err();

    assert_eq!(err.code(), "E_DRIVER");
    assert!(!ran.load(Ordering::SeqCst));
    assert_eq!(
        driver.calls(),
        vec!["getConnection", "beginTransaction", "releaseConnection"]
    );
}

#[tokio::test]
async fn test_timeout_rolls_back() {
    let driver = FakeDriver::transactional();
    let config = DatastoreConfig::new("default", common::FAKE_IDENTITY)
        .with_lease_timeout(Duration::from_millis(20));
    let rdi = registered_with(driver.clone(), config).await;

    let err = rdi
        .transaction(|_conn| async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok::<_, DatastoreError>(())
        })
        .await
        .unwrap_err();

    assert_eq!(err.code(), "E_TIMEOUT");
    assert_eq!(driver.count("rollbackTransaction"), 1);
    assert_eq!(driver.count("releaseConnection"), 1);
}

#[tokio::test]
async fn test_queryable_driver_cannot_transact() {
    let driver = FakeDriver::new(Tier::Queryable);
    let rdi = registered(driver.clone()).await;

    let err = rdi
        .transaction(|_conn| async { Ok::<_, DatastoreError>(()) })
        .await
        .unwrap_err();

    assert_eq!(err.code(), "E_NOT_SUPPORTED");
    assert!(err.to_string().contains("beginTransaction"));
    assert!(driver.calls().is_empty());
}

#[tokio::test]
async fn test_statements_inside_transaction_share_connection() {
    let driver = FakeDriver::transactional();
    let rdi = registered(driver.clone()).await;

    let handle = &rdi;

    rdi.transaction(move |conn: Connection| async move {
        handle
            .send_native_query("UPDATE account SET balance = balance - 10")
            .using_connection(conn.clone())
            .await?;
        handle
            .send_native_query("UPDATE account SET balance = balance + 10")
            .using_connection(conn)
            .await?;
        Ok::<_, DatastoreError>(())
    })
    .await
    .unwrap();

    assert_eq!(driver.count("getConnection"), 1);
    assert_eq!(driver.count("releaseConnection"), 1);
    assert_eq!(driver.count("sendNativeQuery"), 2);
}
