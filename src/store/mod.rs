//! # Checkpoint Store
//!
//! Persistent, transactionally-consistent ledger of jobs, work items,
//! analysis runs, and credential usage. The store is the single source of
//! truth: the scheduler holds only transient in-memory handles that are
//! reconstructible from here after a crash.
//!
//! ## Key operations
//!
//! - **Atomic claim**: claiming the next pending item is a single
//!   conditional `UPDATE ... RETURNING`, never read-then-write, so
//!   concurrent workers cannot claim the same item.
//! - **Transactional counters**: item terminal transitions increment the
//!   job's aggregate counter in the same transaction, so counts and
//!   statuses never diverge.
//! - **Contention absorption**: every mutating operation retries transient
//!   SQLite lock contention with bounded exponential backoff instead of
//!   surfacing a spurious failure.

pub mod connection;
pub mod items;
pub mod jobs;
pub mod runs;
pub mod usage;

pub use items::WorkItem;
pub use jobs::{Job, JobCounts};
pub use runs::AnalysisRun;
pub use usage::CredentialUsage;

use chrono::{Duration as ChronoDuration, NaiveDate, Utc};
use sqlx::SqlitePool;
use std::time::Duration;
use tracing::{debug, instrument, warn};

use crate::analysis::WorkUnit;
use crate::config::DatabaseConfig;
use crate::error::{AnalystError, Result};
use crate::state_machine::JobStateMachine;
use connection::with_contention_retry;

#[derive(Clone)]
pub struct CheckpointStore {
    pool: SqlitePool,
}

impl CheckpointStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Open the checkpoint database, apply the schema, and wrap the pool
    pub async fn connect(config: &DatabaseConfig) -> Result<Self> {
        let pool = connection::connect(config).await?;
        Ok(Self::new(pool))
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub fn state_machine(&self) -> JobStateMachine {
        JobStateMachine::new(self.pool.clone())
    }

    // ------------------------------------------------------------------
    // Job graph creation
    // ------------------------------------------------------------------

    /// Create a job with its work items and analysis runs in one
    /// transaction. Unit keys must be unique within the job and every unit
    /// must carry at least one sub-unit.
    #[instrument(skip(self, units), fields(unit_count = units.len()))]
    pub async fn create_job(&self, name: &str, units: &[WorkUnit]) -> Result<Job> {
        for (index, unit) in units.iter().enumerate() {
            if unit.sub_units.is_empty() {
                return Err(AnalystError::ValidationError(format!(
                    "Work unit '{}' has no sub-units",
                    unit.unit_key
                )));
            }
            if units[..index]
                .iter()
                .any(|other| other.unit_key == unit.unit_key)
            {
                return Err(AnalystError::ValidationError(format!(
                    "Duplicate unit key '{}'",
                    unit.unit_key
                )));
            }
        }

        let job_id =
            with_contention_retry("create_job", || self.create_job_once(name, units)).await?;

        let job = Job::find_by_id(&self.pool, job_id)
            .await?
            .ok_or_else(|| {
                AnalystError::DatabaseError(format!("Job {job_id} vanished after creation"))
            })?;

        debug!(job_id = job.job_id, name = name, "Job created");
        Ok(job)
    }

    async fn create_job_once(
        &self,
        name: &str,
        units: &[WorkUnit],
    ) -> std::result::Result<i64, sqlx::Error> {
        let now = Utc::now();
        let mut tx = self.pool.begin().await?;

        let (job_id,): (i64,) = sqlx::query_as(
            "INSERT INTO jobs (name, status, total_items, created_at) \
             VALUES (?1, 'pending', ?2, ?3) RETURNING job_id",
        )
        .bind(name)
        .bind(units.len() as i64)
        .bind(now)
        .fetch_one(&mut *tx)
        .await?;

        for unit in units {
            let (item_id,): (i64,) = sqlx::query_as(
                "INSERT INTO work_items \
                     (job_id, unit_key, status, total_units, created_at, updated_at) \
                 VALUES (?1, ?2, 'pending', ?3, ?4, ?4) RETURNING item_id",
            )
            .bind(job_id)
            .bind(&unit.unit_key)
            .bind(unit.sub_units.len() as i64)
            .bind(now)
            .fetch_one(&mut *tx)
            .await?;

            let requested = serde_json::to_string(&unit.sub_units)
                .map_err(|e| sqlx::Error::Protocol(format!("Invalid sub-units: {e}")))?;

            let (run_id,): (i64,) = sqlx::query_as(
                "INSERT INTO analysis_runs \
                     (item_id, requested_units, completed_units, status, created_at, updated_at) \
                 VALUES (?1, ?2, '[]', 'pending', ?3, ?3) RETURNING run_id",
            )
            .bind(item_id)
            .bind(requested)
            .bind(now)
            .fetch_one(&mut *tx)
            .await?;

            sqlx::query("UPDATE work_items SET run_id = ?1 WHERE item_id = ?2")
                .bind(run_id)
                .bind(item_id)
                .execute(&mut *tx)
                .await?;
        }

        tx.commit().await?;
        Ok(job_id)
    }

    // ------------------------------------------------------------------
    // Item claiming
    // ------------------------------------------------------------------

    /// Atomically claim the next pending item for a worker. The claim is a
    /// single conditional update with a status re-check, so racing workers
    /// each receive a distinct item or nothing.
    pub async fn claim_next_pending(
        &self,
        job_id: i64,
        worker_id: &str,
    ) -> Result<Option<WorkItem>> {
        with_contention_retry("claim_next_pending", || {
            self.claim_next_pending_once(job_id, worker_id)
        })
        .await
    }

    async fn claim_next_pending_once(
        &self,
        job_id: i64,
        worker_id: &str,
    ) -> std::result::Result<Option<WorkItem>, sqlx::Error> {
        let now = Utc::now();
        let mut tx = self.pool.begin().await?;

        let item = sqlx::query_as::<_, WorkItem>(
            "UPDATE work_items SET \
                 status = 'running', \
                 claimed_by = ?1, \
                 started_at = COALESCE(started_at, ?2), \
                 updated_at = ?2 \
             WHERE item_id = ( \
                 SELECT item_id FROM work_items \
                 WHERE job_id = ?3 AND status = 'pending' \
                 ORDER BY item_id LIMIT 1) \
               AND status = 'pending' \
             RETURNING *",
        )
        .bind(worker_id)
        .bind(now)
        .bind(job_id)
        .fetch_optional(&mut *tx)
        .await?;

        if let Some(ref claimed) = item {
            sqlx::query(
                "UPDATE analysis_runs SET status = 'running', updated_at = ?1 WHERE item_id = ?2",
            )
            .bind(now)
            .bind(claimed.item_id)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(item)
    }

    /// Return a claimed item to the pending pool without a terminal outcome.
    /// Sub-unit progress is preserved, so a later claim resumes where this
    /// one stopped.
    pub async fn release_claim(&self, item_id: i64) -> Result<()> {
        let released = with_contention_retry("release_claim", || {
            self.set_item_pending_once(item_id)
        })
        .await?;
        if !released {
            warn!(item_id = item_id, "Release of item that was not running");
        }
        Ok(())
    }

    async fn set_item_pending_once(
        &self,
        item_id: i64,
    ) -> std::result::Result<bool, sqlx::Error> {
        let now = Utc::now();
        let mut tx = self.pool.begin().await?;

        let result = sqlx::query(
            "UPDATE work_items SET status = 'pending', claimed_by = NULL, updated_at = ?1 \
             WHERE item_id = ?2 AND status = 'running'",
        )
        .bind(now)
        .bind(item_id)
        .execute(&mut *tx)
        .await?;

        if result.rows_affected() > 0 {
            sqlx::query(
                "UPDATE analysis_runs SET status = 'pending', updated_at = ?1 WHERE item_id = ?2",
            )
            .bind(now)
            .bind(item_id)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(result.rows_affected() > 0)
    }

    // ------------------------------------------------------------------
    // Item progress and terminal transitions
    // ------------------------------------------------------------------

    /// Record one completed sub-unit: append to the run's completed list and
    /// bump the item's counter in a single transaction. Returns the new
    /// completed-unit count. Idempotent per sub-unit label.
    pub async fn record_sub_unit_complete(&self, item_id: i64, sub_unit: &str) -> Result<i64> {
        with_contention_retry("record_sub_unit_complete", || {
            self.record_sub_unit_complete_once(item_id, sub_unit)
        })
        .await
    }

    async fn record_sub_unit_complete_once(
        &self,
        item_id: i64,
        sub_unit: &str,
    ) -> std::result::Result<i64, sqlx::Error> {
        let now = Utc::now();
        let mut tx = self.pool.begin().await?;

        let (run_id, completed_raw): (i64, String) = sqlx::query_as(
            "SELECT run_id, completed_units FROM analysis_runs WHERE item_id = ?1",
        )
        .bind(item_id)
        .fetch_one(&mut *tx)
        .await?;

        let mut completed: Vec<String> = serde_json::from_str(&completed_raw)
            .map_err(|e| sqlx::Error::Protocol(format!("Corrupt completed_units: {e}")))?;
        if !completed.iter().any(|unit| unit == sub_unit) {
            completed.push(sub_unit.to_string());
        }
        let count = completed.len() as i64;
        let encoded = serde_json::to_string(&completed)
            .map_err(|e| sqlx::Error::Protocol(format!("Invalid completed_units: {e}")))?;

        sqlx::query("UPDATE analysis_runs SET completed_units = ?1, updated_at = ?2 WHERE run_id = ?3")
            .bind(encoded)
            .bind(now)
            .bind(run_id)
            .execute(&mut *tx)
            .await?;

        sqlx::query("UPDATE work_items SET completed_units = ?1, updated_at = ?2 WHERE item_id = ?3")
            .bind(count)
            .bind(now)
            .bind(item_id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(count)
    }

    /// Transition a running item to completed and increment the job's
    /// completed counter in one transaction.
    pub async fn mark_item_completed(&self, item_id: i64) -> Result<()> {
        with_contention_retry("mark_item_completed", || {
            self.finish_item_once(item_id, "completed", None)
        })
        .await
    }

    /// Transition a running item to failed (bounded retries already
    /// exhausted), record the error, and increment attempts plus the job's
    /// failed counter in one transaction.
    pub async fn mark_item_failed(&self, item_id: i64, error: &str) -> Result<()> {
        with_contention_retry("mark_item_failed", || {
            self.finish_item_once(item_id, "failed", Some(error))
        })
        .await
    }

    async fn finish_item_once(
        &self,
        item_id: i64,
        target: &str,
        error: Option<&str>,
    ) -> std::result::Result<(), sqlx::Error> {
        let now = Utc::now();
        let mut tx = self.pool.begin().await?;

        let result = sqlx::query(
            "UPDATE work_items SET \
                 status = ?1, \
                 claimed_by = NULL, \
                 attempts = attempts + CASE WHEN ?1 = 'failed' THEN 1 ELSE 0 END, \
                 last_error = COALESCE(?2, last_error), \
                 finished_at = ?3, \
                 updated_at = ?3 \
             WHERE item_id = ?4 AND status = 'running'",
        )
        .bind(target)
        .bind(error)
        .bind(now)
        .bind(item_id)
        .execute(&mut *tx)
        .await?;

        if result.rows_affected() == 0 {
            return Err(sqlx::Error::Protocol(format!(
                "Item {item_id} is not running, cannot mark {target}"
            )));
        }

        let counter = match target {
            "completed" => "completed_items",
            "failed" => "failed_items",
            other => {
                return Err(sqlx::Error::Protocol(format!(
                    "Unsupported terminal item status: {other}"
                )))
            }
        };
        sqlx::query(&format!(
            "UPDATE jobs SET {counter} = {counter} + 1 \
             WHERE job_id = (SELECT job_id FROM work_items WHERE item_id = ?1)"
        ))
        .bind(item_id)
        .execute(&mut *tx)
        .await?;

        sqlx::query("UPDATE analysis_runs SET status = ?1, updated_at = ?2 WHERE item_id = ?3")
            .bind(target)
            .bind(now)
            .bind(item_id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(())
    }

    /// Mark every remaining pending item of a cancelled job as skipped and
    /// add them to the job's skipped counter in one transaction. Returns
    /// the number of items skipped.
    pub async fn skip_pending_items(&self, job_id: i64) -> Result<u64> {
        with_contention_retry("skip_pending_items", || self.skip_pending_once(job_id)).await
    }

    async fn skip_pending_once(&self, job_id: i64) -> std::result::Result<u64, sqlx::Error> {
        let now = Utc::now();
        let mut tx = self.pool.begin().await?;

        let result = sqlx::query(
            "UPDATE work_items SET status = 'skipped', finished_at = ?1, updated_at = ?1 \
             WHERE job_id = ?2 AND status = 'pending'",
        )
        .bind(now)
        .bind(job_id)
        .execute(&mut *tx)
        .await?;

        let skipped = result.rows_affected();
        if skipped > 0 {
            sqlx::query("UPDATE jobs SET skipped_items = skipped_items + ?1 WHERE job_id = ?2")
                .bind(skipped as i64)
                .bind(job_id)
                .execute(&mut *tx)
                .await?;

            sqlx::query(
                "UPDATE analysis_runs SET status = 'skipped', updated_at = ?1 \
                 WHERE item_id IN \
                     (SELECT item_id FROM work_items WHERE job_id = ?2 AND status = 'skipped')",
            )
            .bind(now)
            .bind(job_id)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(skipped)
    }

    /// Reset a job's orphaned running items back to pending. Used on
    /// resume-after-crash: the crash left them neither complete nor properly
    /// failed, so they must be re-evaluated, never assumed complete.
    pub async fn reset_running_items(&self, job_id: i64) -> Result<u64> {
        with_contention_retry("reset_running_items", || self.reset_running_once(job_id)).await
    }

    async fn reset_running_once(&self, job_id: i64) -> std::result::Result<u64, sqlx::Error> {
        let now = Utc::now();
        let mut tx = self.pool.begin().await?;

        let result = sqlx::query(
            "UPDATE work_items SET status = 'pending', claimed_by = NULL, updated_at = ?1 \
             WHERE job_id = ?2 AND status = 'running'",
        )
        .bind(now)
        .bind(job_id)
        .execute(&mut *tx)
        .await?;

        if result.rows_affected() > 0 {
            sqlx::query(
                "UPDATE analysis_runs SET status = 'pending', updated_at = ?1 \
                 WHERE item_id IN \
                     (SELECT item_id FROM work_items WHERE job_id = ?2 AND status = 'pending')",
            )
            .bind(now)
            .bind(job_id)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(result.rows_affected())
    }

    // ------------------------------------------------------------------
    // Heartbeats and recovery
    // ------------------------------------------------------------------

    /// Stamp the job heartbeat; only meaningful while the job is running
    pub async fn touch_job_heartbeat(&self, job_id: i64) -> Result<()> {
        with_contention_retry("touch_job_heartbeat", || async move {
            sqlx::query(
                "UPDATE jobs SET last_heartbeat_at = ?1 WHERE job_id = ?2 AND status = 'running'",
            )
            .bind(Utc::now())
            .bind(job_id)
            .execute(&self.pool)
            .await
            .map(|_| ())
        })
        .await
    }

    /// Jobs in `running` whose heartbeat predates `now - staleness`; these
    /// crashed rather than progressing.
    pub async fn list_stale_running_jobs(&self, staleness: Duration) -> Result<Vec<Job>> {
        let cutoff = Utc::now()
            - ChronoDuration::from_std(staleness).unwrap_or_else(|_| ChronoDuration::seconds(0));
        Job::list_stale_running(&self.pool, cutoff).await
    }

    // ------------------------------------------------------------------
    // Reads
    // ------------------------------------------------------------------

    pub async fn find_job(&self, job_id: i64) -> Result<Option<Job>> {
        Job::find_by_id(&self.pool, job_id).await
    }

    pub async fn job_counts(&self, job_id: i64) -> Result<JobCounts> {
        JobCounts::for_job(&self.pool, job_id).await
    }

    pub async fn find_item(&self, item_id: i64) -> Result<Option<WorkItem>> {
        WorkItem::find_by_id(&self.pool, item_id).await
    }

    pub async fn items_for_job(&self, job_id: i64) -> Result<Vec<WorkItem>> {
        WorkItem::list_for_job(&self.pool, job_id).await
    }

    pub async fn run_for_item(&self, item_id: i64) -> Result<Option<AnalysisRun>> {
        AnalysisRun::find_for_item(&self.pool, item_id).await
    }

    // ------------------------------------------------------------------
    // Usage ledger
    // ------------------------------------------------------------------

    /// Count one successful external call against a credential suffix for
    /// the given (reset-offset local) date.
    pub async fn record_usage(&self, suffix: &str, date: NaiveDate) -> Result<()> {
        with_contention_retry("record_usage", || async move {
            sqlx::query(
                "INSERT INTO credential_usage \
                     (credential_suffix, usage_date, requests_used, updated_at) \
                 VALUES (?1, ?2, 1, ?3) \
                 ON CONFLICT (credential_suffix, usage_date) \
                 DO UPDATE SET requests_used = requests_used + 1, updated_at = excluded.updated_at",
            )
            .bind(suffix)
            .bind(date)
            .bind(Utc::now())
            .execute(&self.pool)
            .await
            .map(|_| ())
        })
        .await
    }

    pub async fn usage_for(&self, suffix: &str, date: NaiveDate) -> Result<i64> {
        Ok(CredentialUsage::find(&self.pool, suffix, date)
            .await?
            .map(|row| row.requests_used)
            .unwrap_or(0))
    }

    pub async fn usage_ledger_for_date(&self, date: NaiveDate) -> Result<Vec<CredentialUsage>> {
        CredentialUsage::for_date(&self.pool, date).await
    }
}
