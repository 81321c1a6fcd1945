//! Storage layer for the proxy's exchange log
//!
//! One SQLite file holds the `request_logs` table plus the read-only views
//! that analytics tooling queries directly. The schema is owned by the
//! ordered migrations in [`migrator`]; nothing else creates tables.

pub mod entities;
pub mod migrator;

use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use sea_orm::{DatabaseConnection, DbErr, SqlxSqliteConnector};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous};
use thiserror::Error;
use tracing::info;

/// SQLite durability level applied to every pooled connection.
///
/// `Normal` with WAL acknowledges a commit once it reaches the WAL file;
/// `Full` and `Extra` fsync before acknowledging.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Durability {
    Off,
    #[default]
    Normal,
    Full,
    Extra,
}

#[derive(Debug, Error)]
#[error("invalid durability level '{0}' (expected off, normal, full or extra)")]
pub struct ParseDurabilityError(String);

impl FromStr for Durability {
    type Err = ParseDurabilityError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "off" => Ok(Self::Off),
            "normal" => Ok(Self::Normal),
            "full" => Ok(Self::Full),
            "extra" => Ok(Self::Extra),
            other => Err(ParseDurabilityError(other.to_string())),
        }
    }
}

impl From<Durability> for SqliteSynchronous {
    fn from(level: Durability) -> Self {
        match level {
            Durability::Off => SqliteSynchronous::Off,
            Durability::Normal => SqliteSynchronous::Normal,
            Durability::Full => SqliteSynchronous::Full,
            Durability::Extra => SqliteSynchronous::Extra,
        }
    }
}

/// Options for opening the log database file
#[derive(Debug, Clone)]
pub struct StoreOptions {
    pub durability: Durability,
    /// Pool size. The log writer holds the only write path, so one
    /// connection is enough for the proxy; readers may ask for more.
    pub max_connections: u32,
    pub busy_timeout: Duration,
}

impl Default for StoreOptions {
    fn default() -> Self {
        Self {
            durability: Durability::Normal,
            max_connections: 1,
            busy_timeout: Duration::from_secs(5),
        }
    }
}

/// Open (creating if needed) the SQLite file at `db_path` in WAL mode.
///
/// Missing parent directories are created first.
pub async fn open(db_path: &Path, options: &StoreOptions) -> Result<DatabaseConnection, DbErr> {
    if let Some(parent) = db_path.parent().filter(|p| !p.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(parent).await.map_err(|e| {
            DbErr::Custom(format!(
                "Failed to create database directory {}: {}",
                parent.display(),
                e
            ))
        })?;
    }

    let connect_options = SqliteConnectOptions::new()
        .filename(db_path)
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal)
        .synchronous(options.durability.into())
        .busy_timeout(options.busy_timeout);

    let pool = SqlitePoolOptions::new()
        .max_connections(options.max_connections.max(1))
        .connect_with(connect_options)
        .await
        .map_err(|e| DbErr::Conn(sea_orm::RuntimeErr::SqlxError(e)))?;

    info!(
        "Opened log database at {} (synchronous={:?})",
        db_path.display(),
        options.durability
    );

    Ok(SqlxSqliteConnector::from_sqlx_sqlite_pool(pool))
}

/// Run migrations
///
/// Already-applied migrations are skipped, so calling this against a
/// migrated store changes nothing.
pub async fn migrate(db: &DatabaseConnection) -> Result<(), DbErr> {
    use sea_orm_migration::MigratorTrait;

    info!("Running database migrations...");
    migrator::Migrator::up(db, None).await?;
    info!("Database migrations completed");

    Ok(())
}
