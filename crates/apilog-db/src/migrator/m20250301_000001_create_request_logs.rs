//! Base table holding one row per proxied exchange

use sea_orm_migration::{prelude::*, schema::*};

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(RequestLog::Table)
                    .if_not_exists()
                    .col(pk_auto(RequestLog::Id))
                    .col(text(RequestLog::Timestamp).not_null())
                    .col(text(RequestLog::Method).not_null())
                    .col(text(RequestLog::Path).not_null())
                    .col(text(RequestLog::TargetUrl).not_null())
                    .col(json(RequestLog::RequestHeaders).not_null())
                    .col(json_null(RequestLog::RequestBody))
                    .col(integer_null(RequestLog::ResponseStatus))
                    .col(json_null(RequestLog::ResponseHeaders))
                    .col(text_null(RequestLog::ResponseBody))
                    .col(big_integer_null(RequestLog::DurationMs))
                    .col(
                        date_time(RequestLog::CreatedAt)
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .to_owned(),
            )
            .await
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_table(Table::drop().table(RequestLog::Table).to_owned())
            .await
    }
}

#[derive(DeriveIden)]
enum RequestLog {
    #[sea_orm(iden = "request_logs")]
    Table,
    Id,
    Timestamp,
    Method,
    Path,
    TargetUrl,
    RequestHeaders,
    RequestBody,
    ResponseStatus,
    ResponseHeaders,
    ResponseBody,
    DurationMs,
    CreatedAt,
}
