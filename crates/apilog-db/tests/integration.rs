//! Integration tests for apilog-db
//!
//! Tests schema, views and idempotent migrations against a real SQLite file

use apilog_db::entities::{request_log, RequestLog};
use apilog_db::{migrate, open, StoreOptions};
use sea_orm::{
    ActiveModelTrait, ConnectionTrait, DatabaseBackend, DatabaseConnection, EntityTrait,
    PaginatorTrait, QueryOrder, Set, Statement,
};
use serde_json::json;
use tempfile::TempDir;

/// Helper to create a migrated database in a temporary directory
async fn setup_test_db() -> (TempDir, DatabaseConnection) {
    let dir = tempfile::tempdir().expect("Failed to create temp dir");
    let db = open(&dir.path().join("requests.db"), &StoreOptions::default())
        .await
        .expect("Failed to open database");

    migrate(&db).await.expect("Failed to run migrations");

    (dir, db)
}

fn new_log(method: &str, path: &str) -> request_log::ActiveModel {
    request_log::ActiveModel {
        timestamp: Set("2025-03-01T12:00:00.000000Z".to_string()),
        method: Set(method.to_string()),
        path: Set(path.to_string()),
        target_url: Set(format!("https://api.example.com{}", path)),
        request_headers: Set(json!({"content-type": "application/json"})),
        request_body: Set(None),
        response_status: Set(Some(200)),
        response_headers: Set(Some(json!({"content-type": "application/json"}))),
        response_body: Set(Some(r#"{"ok":true}"#.to_string())),
        duration_ms: Set(Some(12)),
        ..Default::default()
    }
}

async fn insert(db: &DatabaseConnection, model: request_log::ActiveModel) -> i64 {
    RequestLog::insert(model)
        .exec(db)
        .await
        .expect("Failed to insert")
        .last_insert_id
}

async fn query_strings(db: &DatabaseConnection, sql: &str, column: &str) -> Vec<String> {
    db.query_all(Statement::from_string(DatabaseBackend::Sqlite, sql.to_string()))
        .await
        .expect("Failed to query")
        .iter()
        .map(|row| row.try_get::<String>("", column).expect("Missing column"))
        .collect()
}

async fn schema_snapshot(db: &DatabaseConnection) -> Vec<String> {
    query_strings(
        db,
        "SELECT type || ':' || name || ':' || COALESCE(sql, '') AS entry \
         FROM sqlite_master WHERE name NOT LIKE 'sqlite_%' ORDER BY type, name",
        "entry",
    )
    .await
}

#[tokio::test]
async fn test_migrations_create_table_indexes_and_views() {
    let (_dir, db) = setup_test_db().await;

    let tables = query_strings(
        &db,
        "SELECT name FROM sqlite_master WHERE type = 'table' ORDER BY name",
        "name",
    )
    .await;
    assert!(tables.contains(&"request_logs".to_string()));
    assert!(tables.contains(&"seaql_migrations".to_string()));

    let indexes = query_strings(
        &db,
        "SELECT name FROM sqlite_master WHERE type = 'index' AND tbl_name = 'request_logs'",
        "name",
    )
    .await;
    for expected in [
        "idx_request_logs_timestamp",
        "idx_request_logs_status",
        "idx_request_logs_path",
        "idx_request_logs_method",
        "idx_request_logs_status_timestamp",
        "idx_request_logs_path_timestamp",
    ] {
        assert!(indexes.contains(&expected.to_string()), "missing {}", expected);
    }

    let views = query_strings(
        &db,
        "SELECT name FROM sqlite_master WHERE type = 'view'",
        "name",
    )
    .await;
    for view in apilog_db::migrator::VIEW_NAMES {
        assert!(views.contains(&view.to_string()), "missing view {}", view);
    }
}

#[tokio::test]
async fn test_migrations_are_idempotent() {
    let (_dir, db) = setup_test_db().await;
    insert(&db, new_log("GET", "/v1/models")).await;

    let before = schema_snapshot(&db).await;
    let rows_before = RequestLog::find().count(&db).await.unwrap();

    migrate(&db).await.expect("Second migration run failed");
    migrate(&db).await.expect("Third migration run failed");

    assert_eq!(schema_snapshot(&db).await, before);
    assert_eq!(RequestLog::find().count(&db).await.unwrap(), rows_before);

    let applied = query_strings(&db, "SELECT version FROM seaql_migrations", "version").await;
    assert_eq!(applied.len(), 3);
}

#[tokio::test]
async fn test_reopening_migrated_file_is_noop() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("nested").join("requests.db");

    let db = open(&path, &StoreOptions::default()).await.unwrap();
    migrate(&db).await.unwrap();
    insert(&db, new_log("POST", "/v1/messages")).await;
    let before = schema_snapshot(&db).await;
    db.close().await.unwrap();

    let db = open(&path, &StoreOptions::default()).await.unwrap();
    migrate(&db).await.unwrap();
    assert_eq!(schema_snapshot(&db).await, before);
    assert_eq!(RequestLog::find().count(&db).await.unwrap(), 1);
}

#[tokio::test]
async fn test_insert_assigns_increasing_ids_and_created_at() {
    let (_dir, db) = setup_test_db().await;

    let first = insert(&db, new_log("GET", "/a")).await;
    let second = insert(&db, new_log("GET", "/b")).await;
    let third = insert(&db, new_log("GET", "/c")).await;
    assert!(first < second && second < third);

    let rows = RequestLog::find()
        .order_by_asc(request_log::Column::Id)
        .all(&db)
        .await
        .unwrap();
    let paths: Vec<&str> = rows.iter().map(|r| r.path.as_str()).collect();
    assert_eq!(paths, vec!["/a", "/b", "/c"]);

    let found = RequestLog::find_by_id(second).one(&db).await.unwrap().unwrap();
    assert_eq!(found.method, "GET");
    assert_eq!(found.response_status, Some(200));
    assert_eq!(found.duration_ms, Some(12));
    assert!(found.created_at.and_utc().timestamp() > 0);
}

#[tokio::test]
async fn test_failed_exchange_row_with_null_status() {
    let (_dir, db) = setup_test_db().await;

    let mut model = new_log("POST", "/v1/messages");
    model.response_status = Set(None);
    model.response_headers = Set(None);
    model.response_body = Set(Some("upstream connection failed".to_string()));
    let id = insert(&db, model).await;

    let found = RequestLog::find_by_id(id).one(&db).await.unwrap().unwrap();
    assert_eq!(found.response_status, None);
    assert_eq!(found.response_headers, None);
    assert_eq!(
        found.response_body.as_deref(),
        Some("upstream connection failed")
    );
}

#[tokio::test]
async fn test_request_headers_view_keeps_repeated_values() {
    let (_dir, db) = setup_test_db().await;

    let mut model = new_log("GET", "/v1/models");
    model.request_headers = Set(json!({"x-test": ["a", "b"], "accept": "*/*"}));
    let id = insert(&db, model).await;

    let values = query_strings(
        &db,
        &format!(
            "SELECT header_value FROM request_headers_flat \
             WHERE request_id = {} AND header_name = 'x-test' ORDER BY header_value",
            id
        ),
        "header_value",
    )
    .await;
    assert_eq!(values, vec!["a", "b"]);

    let accept = query_strings(
        &db,
        &format!(
            "SELECT header_value FROM request_headers_flat \
             WHERE request_id = {} AND header_name = 'accept'",
            id
        ),
        "header_value",
    )
    .await;
    assert_eq!(accept, vec!["*/*"]);
}

#[tokio::test]
async fn test_response_headers_view_skips_failed_rows() {
    let (_dir, db) = setup_test_db().await;

    let mut ok = new_log("GET", "/ok");
    ok.response_headers = Set(Some(json!({"request-id": "req_1"})));
    let ok_id = insert(&db, ok).await;

    let mut failed = new_log("GET", "/failed");
    failed.response_status = Set(None);
    failed.response_headers = Set(None);
    insert(&db, failed).await;

    let ids = query_strings(
        &db,
        "SELECT CAST(request_id AS TEXT) AS id FROM response_headers_flat",
        "id",
    )
    .await;
    assert_eq!(ids, vec![ok_id.to_string()]);
}

#[tokio::test]
async fn test_request_body_fields_view() {
    let (_dir, db) = setup_test_db().await;

    let mut json_body = new_log("POST", "/v1/messages");
    json_body.request_body = Set(Some(json!({"a": 1})));
    let json_id = insert(&db, json_body).await;

    // Non-JSON bodies are stored as null and contribute no rows
    let plain_id = insert(&db, new_log("POST", "/upload")).await;

    let rows = db
        .query_all(Statement::from_string(
            DatabaseBackend::Sqlite,
            "SELECT request_id, field_name, CAST(field_value AS TEXT) AS value \
             FROM request_body_fields"
                .to_string(),
        ))
        .await
        .unwrap();

    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].try_get::<i64>("", "request_id").unwrap(), json_id);
    assert_eq!(rows[0].try_get::<String>("", "field_name").unwrap(), "a");
    assert_eq!(rows[0].try_get::<String>("", "value").unwrap(), "1");

    let plain = RequestLog::find_by_id(plain_id).one(&db).await.unwrap().unwrap();
    assert_eq!(plain.request_body, None);
}

#[tokio::test]
async fn test_union_view_tags_origin() {
    let (_dir, db) = setup_test_db().await;

    let mut model = new_log("POST", "/v1/messages");
    model.request_headers = Set(json!({"anthropic-version": "2023-06-01"}));
    model.request_body = Set(Some(json!({"model": "claude", "max_tokens": 64})));
    let id = insert(&db, model).await;

    let entries = query_strings(
        &db,
        &format!(
            "SELECT source || ':' || field_name AS entry FROM request_fields_union \
             WHERE request_id = {} ORDER BY entry",
            id
        ),
        "entry",
    )
    .await;

    assert_eq!(
        entries,
        vec!["body:max_tokens", "body:model", "header:anthropic-version"]
    );
}

#[tokio::test]
async fn test_model_roundtrip_through_active_model() {
    let (_dir, db) = setup_test_db().await;

    let inserted = new_log("DELETE", "/v1/files/1")
        .insert(&db)
        .await
        .expect("Failed to insert");

    assert_eq!(inserted.method, "DELETE");
    assert_eq!(inserted.request_headers["content-type"], "application/json");
}
