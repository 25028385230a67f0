//! # Checkpoint Store Connection
//!
//! SQLite pool construction and schema application. The checkpoint database
//! is the durability boundary: everything needed to resume after a full
//! process restart must be recoverable from it alone, so the schema is
//! applied idempotently on every connect.
//!
//! SQLite serializes writers; under a concurrent worker pool a mutating
//! statement can surface transient `SQLITE_BUSY` / `SQLITE_LOCKED` errors
//! even with a busy timeout configured. `with_contention_retry` absorbs
//! those with bounded exponential backoff so callers never see a spurious
//! failure.

use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::SqlitePool;
use std::future::Future;
use std::str::FromStr;
use std::time::Duration;
use tracing::{debug, info};

use crate::config::DatabaseConfig;
use crate::error::{AnalystError, Result};

const MAX_CONTENTION_RETRIES: u32 = 5;
const CONTENTION_BASE_DELAY_MS: u64 = 25;
const CONTENTION_MAX_DELAY_MS: u64 = 400;

/// Idempotent schema, applied statement by statement at connect time.
const SCHEMA: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS jobs (
        job_id            INTEGER PRIMARY KEY AUTOINCREMENT,
        name              TEXT NOT NULL,
        status            TEXT NOT NULL DEFAULT 'pending',
        total_items       INTEGER NOT NULL DEFAULT 0,
        completed_items   INTEGER NOT NULL DEFAULT 0,
        failed_items      INTEGER NOT NULL DEFAULT 0,
        skipped_items     INTEGER NOT NULL DEFAULT 0,
        created_at        TEXT NOT NULL,
        started_at        TEXT,
        completed_at      TEXT,
        last_heartbeat_at TEXT
    )",
    "CREATE TABLE IF NOT EXISTS job_transitions (
        transition_id INTEGER PRIMARY KEY AUTOINCREMENT,
        job_id        INTEGER NOT NULL REFERENCES jobs (job_id),
        from_state    TEXT,
        to_state      TEXT NOT NULL,
        event         TEXT NOT NULL,
        created_at    TEXT NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS work_items (
        item_id         INTEGER PRIMARY KEY AUTOINCREMENT,
        job_id          INTEGER NOT NULL REFERENCES jobs (job_id),
        unit_key        TEXT NOT NULL,
        status          TEXT NOT NULL DEFAULT 'pending',
        attempts        INTEGER NOT NULL DEFAULT 0,
        run_id          INTEGER,
        completed_units INTEGER NOT NULL DEFAULT 0,
        total_units     INTEGER NOT NULL DEFAULT 1,
        claimed_by      TEXT,
        last_error      TEXT,
        created_at      TEXT NOT NULL,
        started_at      TEXT,
        finished_at     TEXT,
        updated_at      TEXT NOT NULL,
        UNIQUE (job_id, unit_key)
    )",
    "CREATE INDEX IF NOT EXISTS idx_work_items_job_status
         ON work_items (job_id, status)",
    "CREATE TABLE IF NOT EXISTS analysis_runs (
        run_id          INTEGER PRIMARY KEY AUTOINCREMENT,
        item_id         INTEGER NOT NULL REFERENCES work_items (item_id),
        requested_units TEXT NOT NULL,
        completed_units TEXT NOT NULL DEFAULT '[]',
        status          TEXT NOT NULL DEFAULT 'pending',
        created_at      TEXT NOT NULL,
        updated_at      TEXT NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS credential_usage (
        credential_suffix TEXT NOT NULL,
        usage_date        TEXT NOT NULL,
        requests_used     INTEGER NOT NULL DEFAULT 0,
        updated_at        TEXT NOT NULL,
        PRIMARY KEY (credential_suffix, usage_date)
    )",
];

/// Open the checkpoint database and apply the schema.
pub async fn connect(config: &DatabaseConfig) -> Result<SqlitePool> {
    let options = SqliteConnectOptions::from_str(&config.url)
        .map_err(|e| {
            AnalystError::ConfigurationError(format!("Invalid database url: {e}"))
        })?
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal)
        .busy_timeout(Duration::from_millis(config.busy_timeout_ms));

    let pool = SqlitePoolOptions::new()
        .max_connections(config.max_connections)
        .connect_with(options)
        .await?;

    apply_schema(&pool).await?;

    info!(
        url = %config.url,
        max_connections = config.max_connections,
        "Checkpoint store connected"
    );

    Ok(pool)
}

/// Apply the embedded schema, statement by statement.
pub async fn apply_schema(pool: &SqlitePool) -> Result<()> {
    for statement in SCHEMA {
        sqlx::query(statement).execute(pool).await?;
    }
    Ok(())
}

pub async fn health_check(pool: &SqlitePool) -> Result<bool> {
    let row: (i32,) = sqlx::query_as("SELECT 1").fetch_one(pool).await?;
    Ok(row.0 == 1)
}

/// Run a store operation, transparently retrying transient lock contention
/// with bounded exponential backoff.
pub(crate) async fn with_contention_retry<T, F, Fut>(op: &str, mut f: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = std::result::Result<T, sqlx::Error>>,
{
    let mut attempt: u32 = 0;
    loop {
        match f().await {
            Ok(value) => return Ok(value),
            Err(err) if is_lock_contention(&err) && attempt < MAX_CONTENTION_RETRIES => {
                attempt += 1;
                debug!(
                    op = op,
                    attempt = attempt,
                    "Checkpoint store lock contention, retrying"
                );
                tokio::time::sleep(contention_backoff(attempt)).await;
            }
            Err(err) => {
                return Err(AnalystError::DatabaseError(format!("{op} failed: {err}")));
            }
        }
    }
}

/// Whether an sqlx error is transient writer contention rather than a real
/// failure.
fn is_lock_contention(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::Database(db_err) => {
            let msg = db_err.message().to_lowercase();
            msg.contains("database is locked") || msg.contains("database table is locked")
        }
        _ => false,
    }
}

fn contention_backoff(attempt: u32) -> Duration {
    let exp = CONTENTION_BASE_DELAY_MS.saturating_mul(1 << attempt.min(8));
    Duration::from_millis(exp.min(CONTENTION_MAX_DELAY_MS))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_contention_backoff_is_bounded() {
        assert_eq!(contention_backoff(1), Duration::from_millis(50));
        assert_eq!(contention_backoff(2), Duration::from_millis(100));
        assert_eq!(contention_backoff(10), Duration::from_millis(400));
    }

    #[test]
    fn test_non_database_errors_are_not_contention() {
        assert!(!is_lock_contention(&sqlx::Error::RowNotFound));
    }
}
