//! Read-only projections of `request_logs` for faceted exploration
//!
//! Every view is a pure function of the base table. Flattening is one
//! level deep: top-level header names and top-level body keys only.
//! A repeated header (stored as a JSON array) yields one row per value.

use sea_orm_migration::prelude::*;

#[derive(DeriveMigrationName)]
pub struct Migration;

pub const VIEW_NAMES: [&str; 4] = [
    "request_headers_flat",
    "response_headers_flat",
    "request_body_fields",
    "request_fields_union",
];

const CREATE_REQUEST_HEADERS_FLAT: &str = r#"
CREATE VIEW IF NOT EXISTS request_headers_flat AS
SELECT r.id AS request_id, h.key AS header_name, h.value AS header_value
FROM request_logs r, json_each(r.request_headers) h
WHERE h.type != 'array'
UNION ALL
SELECT r.id AS request_id, h.key AS header_name, v.value AS header_value
FROM request_logs r, json_each(r.request_headers) h, json_each(h.value) v
WHERE h.type = 'array'
"#;

const CREATE_RESPONSE_HEADERS_FLAT: &str = r#"
CREATE VIEW IF NOT EXISTS response_headers_flat AS
SELECT r.id AS request_id, h.key AS header_name, h.value AS header_value
FROM request_logs r, json_each(r.response_headers) h
WHERE r.response_headers IS NOT NULL AND h.type != 'array'
UNION ALL
SELECT r.id AS request_id, h.key AS header_name, v.value AS header_value
FROM request_logs r, json_each(r.response_headers) h, json_each(h.value) v
WHERE r.response_headers IS NOT NULL AND h.type = 'array'
"#;

const CREATE_REQUEST_BODY_FIELDS: &str = r#"
CREATE VIEW IF NOT EXISTS request_body_fields AS
SELECT r.id AS request_id, b.key AS field_name, b.value AS field_value, b.type AS field_type
FROM request_logs r, json_each(r.request_body) b
WHERE r.request_body IS NOT NULL AND json_type(r.request_body) = 'object'
"#;

const CREATE_REQUEST_FIELDS_UNION: &str = r#"
CREATE VIEW IF NOT EXISTS request_fields_union AS
SELECT request_id, 'header' AS source, header_name AS field_name, header_value AS field_value
FROM request_headers_flat
UNION ALL
SELECT request_id, 'body' AS source, field_name, field_value
FROM request_body_fields
"#;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        let db = manager.get_connection();

        for sql in [
            CREATE_REQUEST_HEADERS_FLAT,
            CREATE_RESPONSE_HEADERS_FLAT,
            CREATE_REQUEST_BODY_FIELDS,
            CREATE_REQUEST_FIELDS_UNION,
        ] {
            db.execute_unprepared(sql).await?;
        }

        Ok(())
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        let db = manager.get_connection();

        // The union depends on the other views, so drop in reverse
        for view in VIEW_NAMES.iter().rev() {
            db.execute_unprepared(&format!("DROP VIEW IF EXISTS {view}"))
                .await?;
        }

        Ok(())
    }
}
