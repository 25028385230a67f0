//! # Job State Machine
//!
//! Drives job lifecycle transitions. Workers never call this directly: they
//! mutate work items through the checkpoint store, and the scheduler derives
//! job-level transitions from aggregate counts plus explicit pause / resume /
//! cancel operations.
//!
//! Every transition persists the new status and an audit row in a single
//! transaction, guarded by an optimistic status check so concurrent
//! transitions cannot silently overwrite each other.

use chrono::Utc;
use sqlx::SqlitePool;
use tracing::{debug, warn};

use super::events::JobEvent;
use super::states::JobState;
use crate::error::{AnalystError, Result};

/// State machine for job lifecycle management
pub struct JobStateMachine {
    pool: SqlitePool,
}

impl JobStateMachine {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Get the current state of the job
    pub async fn current_state(&self, job_id: i64) -> Result<JobState> {
        let status: Option<(String,)> =
            sqlx::query_as("SELECT status FROM jobs WHERE job_id = ?1")
                .bind(job_id)
                .fetch_optional(&self.pool)
                .await?;

        match status {
            Some((state_str,)) => state_str.parse().map_err(|_| {
                AnalystError::StateTransitionError(format!(
                    "Invalid state in database for job {job_id}: {state_str}"
                ))
            }),
            None => Err(AnalystError::ValidationError(format!(
                "Job {job_id} not found"
            ))),
        }
    }

    /// Attempt to transition the job state
    pub async fn transition(&self, job_id: i64, event: JobEvent) -> Result<JobState> {
        let current_state = self.current_state(job_id).await?;
        let target_state = determine_target_state(current_state, &event)?;

        self.check_guards(job_id, current_state, target_state, &event)
            .await?;

        self.persist_transition(job_id, current_state, target_state, &event)
            .await?;

        debug!(
            job_id = job_id,
            from = %current_state,
            to = %target_state,
            event = event.event_type(),
            "Job state transition"
        );

        Ok(target_state)
    }

    /// Check guard conditions for the transition
    async fn check_guards(
        &self,
        job_id: i64,
        current_state: JobState,
        target_state: JobState,
        event: &JobEvent,
    ) -> Result<()> {
        // Completion requires every item to be terminal
        if let (JobState::Running, JobState::Completed, JobEvent::Complete) =
            (current_state, target_state, event)
        {
            let (open_items,): (i64,) = sqlx::query_as(
                "SELECT COUNT(*) FROM work_items \
                 WHERE job_id = ?1 AND status IN ('pending', 'running')",
            )
            .bind(job_id)
            .fetch_one(&self.pool)
            .await?;

            if open_items > 0 {
                return Err(AnalystError::StateTransitionError(format!(
                    "Job {job_id} cannot complete with {open_items} non-terminal items"
                )));
            }
        }

        Ok(())
    }

    /// Persist the status update and the audit row in one transaction.
    ///
    /// The UPDATE carries an optimistic `status = current` check: if another
    /// caller transitioned the job concurrently, zero rows match and the
    /// transition is rejected rather than applied over stale state.
    async fn persist_transition(
        &self,
        job_id: i64,
        from_state: JobState,
        to_state: JobState,
        event: &JobEvent,
    ) -> Result<()> {
        let now = Utc::now();
        let mut tx = self.pool.begin().await?;

        let result = sqlx::query(
            "UPDATE jobs SET \
                 status = ?1, \
                 started_at = CASE WHEN ?1 = 'running' THEN COALESCE(started_at, ?2) ELSE started_at END, \
                 last_heartbeat_at = CASE WHEN ?1 = 'running' THEN ?2 ELSE last_heartbeat_at END, \
                 completed_at = CASE WHEN ?1 IN ('completed', 'failed', 'cancelled') THEN ?2 ELSE completed_at END \
             WHERE job_id = ?3 AND status = ?4",
        )
        .bind(to_state.to_string())
        .bind(now)
        .bind(job_id)
        .bind(from_state.to_string())
        .execute(&mut *tx)
        .await?;

        if result.rows_affected() == 0 {
            warn!(
                job_id = job_id,
                expected = %from_state,
                "Job status changed concurrently, transition rejected"
            );
            return Err(AnalystError::StateTransitionError(format!(
                "Job {job_id} is no longer in state {from_state}"
            )));
        }

        sqlx::query(
            "INSERT INTO job_transitions (job_id, from_state, to_state, event, created_at) \
             VALUES (?1, ?2, ?3, ?4, ?5)",
        )
        .bind(job_id)
        .bind(from_state.to_string())
        .bind(to_state.to_string())
        .bind(event.event_type())
        .bind(now)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }
}

/// Determine the target state based on current state and event
pub fn determine_target_state(current_state: JobState, event: &JobEvent) -> Result<JobState> {
    let target = match (current_state, event) {
        // Start and resume transitions
        (JobState::Pending, JobEvent::Start) => JobState::Running,
        (JobState::Paused, JobEvent::Resume) => JobState::Running,
        (JobState::Interrupted, JobEvent::Resume) => JobState::Running,

        // Pause transitions
        (JobState::Running, JobEvent::Pause(_)) => JobState::Paused,

        // Completion transitions
        (JobState::Running, JobEvent::Complete) => JobState::Completed,

        // Failure transitions
        (JobState::Running, JobEvent::Fail(_)) => JobState::Failed,
        (JobState::Pending, JobEvent::Fail(_)) => JobState::Failed,

        // Cancel transitions
        (JobState::Pending, JobEvent::Cancel) => JobState::Cancelled,
        (JobState::Running, JobEvent::Cancel) => JobState::Cancelled,
        (JobState::Paused, JobEvent::Cancel) => JobState::Cancelled,
        (JobState::Interrupted, JobEvent::Cancel) => JobState::Cancelled,

        // Crash detection
        (JobState::Running, JobEvent::MarkInterrupted) => JobState::Interrupted,

        // Invalid transitions
        (from_state, event) => {
            return Err(AnalystError::StateTransitionError(format!(
                "Invalid transition from {from_state} on {}",
                event.event_type()
            )))
        }
    };

    Ok(target)
}
