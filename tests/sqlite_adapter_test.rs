//! Integration tests for the sqlx adapter against a SQLite file.

use datastore_runtime::adapters::{AdapterCatalog, sql};
use datastore_runtime::config::{DatastoreSettings, RuntimeConfig};
use datastore_runtime::error::{DatastoreError, Footprint};
use datastore_runtime::models::Statement;
use datastore_runtime::ontology::Orm;
use serde_json::{Value, json};
use std::path::PathBuf;
use tempfile::NamedTempFile;

/// Create an empty SQLite file that outlives the temp handle.
fn temp_db_path() -> PathBuf {
    NamedTempFile::new().unwrap().into_temp_path().keep().unwrap()
}

async fn setup() -> (Orm, PathBuf) {
    let path = temp_db_path();
    let config = RuntimeConfig::new()
        .with_datastore(
            "default",
            DatastoreSettings::named(sql::IDENTITY)
                .with_setting("url", format!("sqlite:{}?max_connections=1", path.display()))
                .with_setting("migrate", "drop"),
        )
        .with_model(
            "user",
            json!({
                "attributes": {
                    "id": {"type": "number", "autoIncrement": true},
                    "email": {"type": "string", "unique": true},
                    "age": "number"
                }
            }),
        );

    let orm = Orm::initialize(config, AdapterCatalog::with_builtins())
        .await
        .unwrap();
    (orm, path)
}

fn statement(value: Value) -> Statement {
    Statement::from_value(value).unwrap()
}

#[tokio::test]
async fn test_insert_select_and_count() {
    let (orm, path) = setup().await;
    let rdi = orm.default_datastore().unwrap();
    assert_eq!(orm.adapter_of("default"), Some(sql::IDENTITY));

    let inserted = rdi
        .send_statement(statement(json!({
            "insert": [{"email": "a@example.com", "age": 31}, {"email": "b@example.com", "age": 45}],
            "into": "user"
        })))
        .await
        .unwrap();
    assert_eq!(inserted, json!({"affectedRows": 2}));

    let rows = rdi
        .send_statement(statement(json!({
            "select": ["email"],
            "from": "user",
            "where": {"age": {">": 40}}
        })))
        .await
        .unwrap();
    assert_eq!(rows, json!([{"email": "b@example.com"}]));

    let count = rdi
        .send_statement(statement(json!({"count": true, "from": "user"})))
        .await
        .unwrap();
    assert_eq!(count, json!(2));

    let raw = rdi
        .send_native_query("SELECT email FROM user WHERE id = ?")
        .values(vec![json!(1)])
        .await
        .unwrap();
    assert_eq!(raw["rows"][0]["email"], "a@example.com");

    orm.teardown().await.unwrap();
    let _ = std::fs::remove_file(path);
}

#[tokio::test]
async fn test_unique_violation_has_not_unique_footprint() {
    let (orm, path) = setup().await;
    let rdi = orm.default_datastore().unwrap();
    let insert = || statement(json!({"insert": {"email": "dup@example.com"}, "into": "user"}));

    rdi.send_statement(insert()).await.unwrap();
    let err = rdi.send_statement(insert()).await.unwrap_err();

    assert_eq!(err.code(), "E_QUERY_FAILED");
    assert_eq!(
        err.footprint(),
        Some(&Footprint::NotUnique {
            keys: vec!["email".to_string()]
        })
    );

    orm.teardown().await.unwrap();
    let _ = std::fs::remove_file(path);
}

#[tokio::test]
async fn test_transaction_commit_and_rollback() {
    let (orm, path) = setup().await;
    let rdi = orm.default_datastore().unwrap();
    let handle = rdi.as_ref();

    handle
        .transaction(move |conn| async move {
            handle
                .send_statement(statement(
                    json!({"insert": {"email": "kept@example.com"}, "into": "user"}),
                ))
                .using_connection(conn)
                .await
        })
        .await
        .unwrap();

    let err = handle
        .transaction(move |conn| async move {
            handle
                .send_statement(statement(
                    json!({"insert": {"email": "gone@example.com"}, "into": "user"}),
                ))
                .using_connection(conn)
                .await?;
            Err::<(), _>(DatastoreError::work("abort"))
        })
        .await
        .unwrap_err();
    assert_eq!(err.code(), "E_WORK");

    let rows = rdi
        .send_statement(statement(json!({"select": ["email"], "from": "user"})))
        .await
        .unwrap();
    assert_eq!(rows, json!([{"email": "kept@example.com"}]));

    orm.teardown().await.unwrap();
    let _ = std::fs::remove_file(path);
}

#[tokio::test]
async fn test_aggregates_decode_expression_columns() {
    let (orm, path) = setup().await;
    let rdi = orm.default_datastore().unwrap();
    let aggregate = |kind: &str| {
        let mut value = json!({"from": "user"});
        match kind {
            "count" => value["count"] = json!(true),
            other => value[other] = json!("age"),
        }
        statement(value)
    };

    assert_eq!(rdi.send_statement(aggregate("count")).await.unwrap(), json!(0));
    assert_eq!(rdi.send_statement(aggregate("sum")).await.unwrap(), json!(0));
    assert_eq!(rdi.send_statement(aggregate("avg")).await.unwrap(), json!(0));

    rdi.send_statement(statement(json!({
        "insert": [{"email": "a@example.com", "age": 30}, {"email": "b@example.com", "age": 45}],
        "into": "user"
    })))
    .await
    .unwrap();

    assert_eq!(rdi.send_statement(aggregate("count")).await.unwrap(), json!(2));
    assert_eq!(rdi.send_statement(aggregate("sum")).await.unwrap(), json!(75.0));
    assert_eq!(rdi.send_statement(aggregate("avg")).await.unwrap(), json!(37.5));

    let raw = rdi
        .send_native_query("SELECT 1 AS one, count(*) AS n, max(id) + 1 AS next, 'x' AS tag FROM user")
        .await
        .unwrap();
    assert_eq!(raw["rows"], json!([{"one": 1, "n": 2, "next": 3, "tag": "x"}]));

    orm.teardown().await.unwrap();
    let _ = std::fs::remove_file(path);
}

#[tokio::test]
async fn test_failed_commit_does_not_poison_the_pool() {
    let (orm, path) = setup().await;
    let rdi = orm.default_datastore().unwrap();
    let handle = rdi.as_ref();

    rdi.send_native_query("CREATE TABLE parent (id INTEGER PRIMARY KEY)")
        .await
        .unwrap();
    rdi.send_native_query(
        "CREATE TABLE child (id INTEGER PRIMARY KEY, \
         pid INTEGER REFERENCES parent(id) DEFERRABLE INITIALLY DEFERRED)",
    )
    .await
    .unwrap();

    // The foreign key is only checked at COMMIT, which SQLite then refuses
    // while keeping the transaction open.
    let err = handle
        .transaction(move |conn| async move {
            handle
                .send_native_query("INSERT INTO child (pid) VALUES (?)")
                .values(vec![json!(99)])
                .using_connection(conn)
                .await
        })
        .await
        .unwrap_err();
    assert_eq!(err.code(), "E_COMMIT_FAILED");
    assert!(err.to_string().contains("FOREIGN KEY"));

    // The pool holds a single connection, so this reuses the one above.
    let one = handle
        .transaction(move |conn| async move {
            handle
                .send_native_query("SELECT 1 AS one")
                .using_connection(conn)
                .await
        })
        .await
        .unwrap();
    assert_eq!(one["rows"], json!([{"one": 1}]));

    let children = rdi
        .send_native_query("SELECT count(*) AS n FROM child")
        .await
        .unwrap();
    assert_eq!(children["rows"], json!([{"n": 0}]));

    orm.teardown().await.unwrap();
    let _ = std::fs::remove_file(path);
}
