//! # Job Model
//!
//! Persisted representation of a batch of work items. The aggregate counters
//! (`completed_items`, `failed_items`, `skipped_items`) are maintained in the
//! same transaction as the item status transition that produced them, so
//! counts and statuses never diverge. `JobCounts` is the derived,
//! authoritative view used for completion decisions.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, SqlitePool};

use crate::error::{AnalystError, Result};
use crate::state_machine::JobState;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct Job {
    pub job_id: i64,
    pub name: String,
    pub status: String,
    pub total_items: i64,
    pub completed_items: i64,
    pub failed_items: i64,
    pub skipped_items: i64,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub last_heartbeat_at: Option<DateTime<Utc>>,
}

impl Job {
    /// Parse the persisted status into the closed state enumeration
    pub fn state(&self) -> Result<JobState> {
        self.status.parse().map_err(|_| {
            AnalystError::StateTransitionError(format!(
                "Invalid state in database for job {}: {}",
                self.job_id, self.status
            ))
        })
    }

    pub async fn find_by_id(pool: &SqlitePool, job_id: i64) -> Result<Option<Job>> {
        let job = sqlx::query_as::<_, Job>("SELECT * FROM jobs WHERE job_id = ?1")
            .bind(job_id)
            .fetch_optional(pool)
            .await?;
        Ok(job)
    }

    pub async fn list_with_status(pool: &SqlitePool, state: JobState) -> Result<Vec<Job>> {
        let jobs = sqlx::query_as::<_, Job>(
            "SELECT * FROM jobs WHERE status = ?1 ORDER BY job_id",
        )
        .bind(state.to_string())
        .fetch_all(pool)
        .await?;
        Ok(jobs)
    }

    /// Jobs marked running whose heartbeat predates the staleness cutoff.
    /// These were abandoned by a crashed process, not actually running.
    pub async fn list_stale_running(
        pool: &SqlitePool,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<Job>> {
        let jobs = sqlx::query_as::<_, Job>(
            "SELECT * FROM jobs \
             WHERE status = 'running' \
               AND (last_heartbeat_at IS NULL OR last_heartbeat_at < ?1) \
             ORDER BY job_id",
        )
        .bind(cutoff)
        .fetch_all(pool)
        .await?;
        Ok(jobs)
    }
}

/// Derived per-status item counts for one job
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobCounts {
    pub total: i64,
    pub pending: i64,
    pub running: i64,
    pub completed: i64,
    pub failed: i64,
    pub skipped: i64,
}

impl JobCounts {
    /// True when no item can still make progress
    pub fn all_terminal(&self) -> bool {
        self.pending == 0 && self.running == 0
    }

    pub fn terminal(&self) -> i64 {
        self.completed + self.failed + self.skipped
    }

    pub async fn for_job(pool: &SqlitePool, job_id: i64) -> Result<JobCounts> {
        let rows: Vec<(String, i64)> = sqlx::query_as(
            "SELECT status, COUNT(*) FROM work_items WHERE job_id = ?1 GROUP BY status",
        )
        .bind(job_id)
        .fetch_all(pool)
        .await?;

        let mut counts = JobCounts::default();
        for (status, count) in rows {
            counts.total += count;
            match status.as_str() {
                "pending" => counts.pending = count,
                "running" => counts.running = count,
                "completed" => counts.completed = count,
                "failed" => counts.failed = count,
                "skipped" => counts.skipped = count,
                other => {
                    return Err(AnalystError::DatabaseError(format!(
                        "Unknown item status in job {job_id}: {other}"
                    )))
                }
            }
        }
        Ok(counts)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counts_terminal_check() {
        let counts = JobCounts {
            total: 5,
            pending: 0,
            running: 0,
            completed: 3,
            failed: 1,
            skipped: 1,
        };
        assert!(counts.all_terminal());
        assert_eq!(counts.terminal(), 5);

        let open = JobCounts {
            total: 2,
            pending: 1,
            completed: 1,
            ..Default::default()
        };
        assert!(!open.all_terminal());
    }

    #[test]
    fn test_state_parsing() {
        let job = Job {
            job_id: 1,
            name: "fy-backfill".to_string(),
            status: "interrupted".to_string(),
            total_items: 0,
            completed_items: 0,
            failed_items: 0,
            skipped_items: 0,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            last_heartbeat_at: None,
        };
        assert_eq!(job.state().unwrap(), JobState::Interrupted);
    }
}
