//! Indexes for time-ordered browsing and status/path/method filtering

use sea_orm_migration::prelude::*;

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_index(
                Index::create()
                    .if_not_exists()
                    .name("idx_request_logs_timestamp")
                    .table(RequestLog::Table)
                    .col((RequestLog::Timestamp, IndexOrder::Desc))
                    .to_owned(),
            )
            .await?;

        for (name, column) in [
            ("idx_request_logs_status", RequestLog::ResponseStatus),
            ("idx_request_logs_path", RequestLog::Path),
            ("idx_request_logs_method", RequestLog::Method),
        ] {
            manager
                .create_index(
                    Index::create()
                        .if_not_exists()
                        .name(name)
                        .table(RequestLog::Table)
                        .col(column)
                        .to_owned(),
                )
                .await?;
        }

        // Composite pairs serve "filter, then newest first" queries
        for (name, column) in [
            ("idx_request_logs_status_timestamp", RequestLog::ResponseStatus),
            ("idx_request_logs_path_timestamp", RequestLog::Path),
        ] {
            manager
                .create_index(
                    Index::create()
                        .if_not_exists()
                        .name(name)
                        .table(RequestLog::Table)
                        .col(column)
                        .col((RequestLog::Timestamp, IndexOrder::Desc))
                        .to_owned(),
                )
                .await?;
        }

        Ok(())
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        for name in INDEX_NAMES {
            manager
                .drop_index(
                    Index::drop()
                        .name(name)
                        .table(RequestLog::Table)
                        .to_owned(),
                )
                .await?;
        }
        Ok(())
    }
}

const INDEX_NAMES: [&str; 6] = [
    "idx_request_logs_timestamp",
    "idx_request_logs_status",
    "idx_request_logs_path",
    "idx_request_logs_method",
    "idx_request_logs_status_timestamp",
    "idx_request_logs_path_timestamp",
];

#[derive(DeriveIden, Clone, Copy)]
enum RequestLog {
    #[sea_orm(iden = "request_logs")]
    Table,
    Timestamp,
    ResponseStatus,
    Path,
    Method,
}
