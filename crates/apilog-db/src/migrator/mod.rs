//! Database migrations
//!
//! Applied in order and recorded in `seaql_migrations`: the base table
//! first, then its indexes, then the analytics views.

use sea_orm_migration::prelude::*;

mod m20250301_000001_create_request_logs;
mod m20250301_000002_add_request_log_indexes;
mod m20250301_000003_create_request_log_views;

pub use m20250301_000003_create_request_log_views::VIEW_NAMES;

pub struct Migrator;

#[async_trait::async_trait]
impl MigratorTrait for Migrator {
    fn migrations() -> Vec<Box<dyn MigrationTrait>> {
        vec![
            Box::new(m20250301_000001_create_request_logs::Migration),
            Box::new(m20250301_000002_add_request_log_indexes::Migration),
            Box::new(m20250301_000003_create_request_log_views::Migration),
        ]
    }
}
