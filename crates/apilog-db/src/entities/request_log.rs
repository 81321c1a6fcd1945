//! RequestLog entity: one row per proxied exchange

use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "request_logs")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i64,

    /// RFC 3339 receipt time of the request
    pub timestamp: String,

    pub method: String,

    /// Path and query as received
    pub path: String,

    /// Upstream URL the request was forwarded to
    pub target_url: String,

    /// Header name -> value, or array of values when repeated
    pub request_headers: Json,

    /// Parsed JSON body; null when absent or not JSON
    pub request_body: Option<Json>,

    /// Null when the upstream never produced a status line
    pub response_status: Option<i32>,

    pub response_headers: Option<Json>,

    /// Captured response text, or the failure description
    #[sea_orm(column_type = "Text", nullable)]
    pub response_body: Option<String>,

    pub duration_ms: Option<i64>,

    /// Assigned by the database at insert time
    pub created_at: ChronoDateTime,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
