// ABOUTME: Shared SQLite persistence for the sandbox fleet
// ABOUTME: Pool creation, embedded migrations, storage errors and timestamp encoding

pub mod scheduler;

pub use scheduler::{DueJob, ScheduledId, ScheduledJob, Scheduler, TokioScheduler};

use chrono::{DateTime, SecondsFormat, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::SqlitePool;
use std::str::FromStr;
use thiserror::Error;
use tracing::info;

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("Migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),
    #[error("Record not found: {0}")]
    NotFound(String),
    #[error("Invalid status: {0}")]
    InvalidStatus(String),
    #[error("Invalid timestamp '{value}': {reason}")]
    InvalidTimestamp { value: String, reason: String },
    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, StorageError>;

/// Open (creating if needed) the fleet database and apply migrations.
pub async fn connect(database_url: &str) -> Result<SqlitePool> {
    let options = SqliteConnectOptions::from_str(database_url)?
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal)
        .foreign_keys(true);

    let pool = SqlitePoolOptions::new()
        .max_connections(5)
        .connect_with(options)
        .await?;

    migrate(&pool).await?;
    info!(database_url, "Fleet database ready");
    Ok(pool)
}

pub async fn migrate(pool: &SqlitePool) -> Result<()> {
    sqlx::migrate!("./migrations").run(pool).await?;
    Ok(())
}

/// Single-connection in-memory database with the schema applied.
///
/// Every connection to `sqlite::memory:` is a separate database, so the pool is
/// pinned to one connection that never idles out.
#[cfg(any(test, feature = "test-utils"))]
pub async fn memory_pool() -> Result<SqlitePool> {
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .idle_timeout(None)
        .max_lifetime(None)
        .connect("sqlite::memory:")
        .await?;
    migrate(&pool).await?;
    Ok(pool)
}

/// Fixed-width RFC3339 in UTC so stored timestamps compare lexicographically.
pub fn to_db_timestamp(timestamp: &DateTime<Utc>) -> String {
    timestamp.to_rfc3339_opts(SecondsFormat::Millis, true)
}

pub fn from_db_timestamp(value: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| StorageError::InvalidTimestamp {
            value: value.to_string(),
            reason: e.to_string(),
        })
}

pub fn from_db_timestamp_opt(value: Option<String>) -> Result<Option<DateTime<Utc>>> {
    value.as_deref().map(from_db_timestamp).transpose()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    #[test]
    fn test_timestamps_sort_lexicographically() {
        let early = Utc.with_ymd_and_hms(2026, 1, 2, 3, 4, 5).unwrap();
        let late = early + Duration::milliseconds(1500);

        let a = to_db_timestamp(&early);
        let b = to_db_timestamp(&late);

        assert_eq!(a, "2026-01-02T03:04:05.000Z");
        assert_eq!(b.len(), a.len());
        assert!(a < b);
        assert_eq!(from_db_timestamp(&b).unwrap(), late);
    }

    #[test]
    fn test_invalid_timestamp() {
        let err = from_db_timestamp("yesterday").unwrap_err();
        assert!(matches!(err, StorageError::InvalidTimestamp { .. }));
    }

    #[tokio::test]
    async fn test_memory_pool_has_schema() {
        let pool = memory_pool().await.unwrap();
        let tables: Vec<(String,)> = sqlx::query_as(
            "SELECT name FROM sqlite_master WHERE type = 'table' AND name IN ('sandboxes', 'conversations', 'messages') ORDER BY name",
        )
        .fetch_all(&pool)
        .await
        .unwrap();

        let names: Vec<_> = tables.into_iter().map(|(n,)| n).collect();
        assert_eq!(names, vec!["conversations", "messages", "sandboxes"]);
    }
}
