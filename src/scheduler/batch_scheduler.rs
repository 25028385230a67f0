//! # Batch Scheduler
//!
//! Owns the worker pool and the job lifecycle. Pulls pending work items
//! through the checkpoint store, reserves credentials, invokes the domain
//! analyzer through the request gateway, records outcomes, and drives
//! job-level completion, pause-on-exhaustion, cancellation, and
//! crash recovery.
//!
//! Job state transitions are driven only here, never by workers: workers
//! mutate item state through the store, and the scheduler derives job state
//! from aggregate item counts plus explicit pause / resume / cancel calls.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, instrument, warn};
use uuid::Uuid;

use super::worker::{Worker, WorkerSummary};
use super::JobControl;
use crate::analysis::{Analyzer, WorkUnit};
use crate::config::SchedulerConfig;
use crate::credentials::CredentialPool;
use crate::error::{AnalystError, Result};
use crate::logging::log_job_operation;
use crate::notify::{Notification, NotificationSink};
use crate::state_machine::{JobEvent, JobState};
use crate::store::{CheckpointStore, JobCounts};
use crate::throttle::RequestGateway;

/// Result of driving a job until its workers drained
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobRunSummary {
    pub job_id: i64,
    pub final_state: JobState,
    pub counts: JobCounts,
    pub items_completed: u64,
    pub items_failed: u64,
}

/// Point-in-time view of a job: status, true aggregate counts, heartbeat
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobStatusView {
    pub job_id: i64,
    pub name: String,
    pub status: JobState,
    pub counts: JobCounts,
    pub last_heartbeat_at: Option<chrono::DateTime<chrono::Utc>>,
}

pub struct BatchScheduler {
    store: CheckpointStore,
    credentials: Arc<CredentialPool>,
    gateway: Arc<RequestGateway>,
    sink: Arc<dyn NotificationSink>,
    config: SchedulerConfig,
    scheduler_id: Uuid,
    /// Control handles for jobs running inside this process
    active: Mutex<HashMap<i64, Arc<JobControl>>>,
}

impl BatchScheduler {
    pub fn new(
        store: CheckpointStore,
        credentials: Arc<CredentialPool>,
        gateway: Arc<RequestGateway>,
        sink: Arc<dyn NotificationSink>,
        config: SchedulerConfig,
    ) -> Self {
        Self {
            store,
            credentials,
            gateway,
            sink,
            config,
            scheduler_id: Uuid::new_v4(),
            active: Mutex::new(HashMap::new()),
        }
    }

    pub fn scheduler_id(&self) -> Uuid {
        self.scheduler_id
    }

    /// Create a job and enqueue its work items. The job stays pending until
    /// `run_job` is called.
    pub async fn create_job(&self, name: &str, units: &[WorkUnit]) -> Result<i64> {
        let job = self.store.create_job(name, units).await?;
        log_job_operation("create", Some(job.job_id), Some(name), "pending", None);
        Ok(job.job_id)
    }

    /// Run a pending job to completion, pause, or cancellation. Blocks until
    /// the worker pool drains; on credential exhaustion the job pauses and
    /// control returns to the caller, who re-invokes `resume_job` after the
    /// quota reset.
    #[instrument(skip(self, analyzer), fields(scheduler_id = %self.scheduler_id))]
    pub async fn run_job(&self, job_id: i64, analyzer: Arc<dyn Analyzer>) -> Result<JobRunSummary> {
        let state_machine = self.store.state_machine();
        let current = state_machine.current_state(job_id).await?;
        if current != JobState::Pending {
            return Err(AnalystError::SchedulingError(format!(
                "Job {job_id} is {current}, expected pending; paused or interrupted jobs go through resume_job"
            )));
        }
        state_machine.transition(job_id, JobEvent::Start).await?;
        self.execute_job(job_id, analyzer).await
    }

    /// Resume a paused or interrupted job. Orphaned running items are reset
    /// to pending first: a crash left them neither complete nor properly
    /// failed, so they must be re-evaluated.
    #[instrument(skip(self, analyzer), fields(scheduler_id = %self.scheduler_id))]
    pub async fn resume_job(
        &self,
        job_id: i64,
        analyzer: Arc<dyn Analyzer>,
    ) -> Result<JobRunSummary> {
        let state_machine = self.store.state_machine();
        let current = state_machine.current_state(job_id).await?;
        if !current.is_resumable() {
            return Err(AnalystError::SchedulingError(format!(
                "Job {job_id} is {current}, expected paused or interrupted"
            )));
        }

        let reset = self.store.reset_running_items(job_id).await?;
        if reset > 0 {
            info!(job_id = job_id, reset_items = reset, "Reset orphaned running items");
        }

        state_machine.transition(job_id, JobEvent::Resume).await?;
        log_job_operation("resume", Some(job_id), None, "running", None);
        self.execute_job(job_id, analyzer).await
    }

    /// Request a cooperative pause of a job running in this process.
    /// In-flight requests run to completion; the job transitions to paused
    /// once the workers drain.
    pub fn pause_job(&self, job_id: i64) -> Result<()> {
        let control = self.active.lock().get(&job_id).cloned().ok_or_else(|| {
            AnalystError::SchedulingError(format!(
                "Job {job_id} is not running in this scheduler"
            ))
        })?;
        control.request_pause();
        log_job_operation("pause_requested", Some(job_id), None, "running", None);
        Ok(())
    }

    /// Cancel a job. For a job running in this process the cancellation is
    /// cooperative: no new items or sub-unit calls start once the flag is
    /// observed. For a dormant job the cancellation is applied directly:
    /// remaining pending items are skipped and the job goes terminal.
    pub async fn cancel_job(&self, job_id: i64) -> Result<()> {
        if let Some(control) = self.active.lock().get(&job_id).cloned() {
            control.cancel();
            log_job_operation("cancel_requested", Some(job_id), None, "running", None);
            return Ok(());
        }

        let state_machine = self.store.state_machine();
        let current = state_machine.current_state(job_id).await?;
        match current {
            JobState::Pending | JobState::Paused | JobState::Interrupted => {
                self.store.reset_running_items(job_id).await?;
                let skipped = self.store.skip_pending_items(job_id).await?;
                state_machine.transition(job_id, JobEvent::Cancel).await?;
                self.notify_cancelled(job_id, skipped as i64).await;
                Ok(())
            }
            JobState::Running => Err(AnalystError::SchedulingError(format!(
                "Job {job_id} is running outside this scheduler; recover it first"
            ))),
            terminal => Err(AnalystError::SchedulingError(format!(
                "Job {job_id} is already {terminal}"
            ))),
        }
    }

    /// Status, true aggregate counts, and heartbeat for one job
    pub async fn get_job_status(&self, job_id: i64) -> Result<JobStatusView> {
        let job = self.store.find_job(job_id).await?.ok_or_else(|| {
            AnalystError::ValidationError(format!("Job {job_id} not found"))
        })?;
        let counts = self.store.job_counts(job_id).await?;
        Ok(JobStatusView {
            job_id: job.job_id,
            name: job.name.clone(),
            status: job.state()?,
            counts,
            last_heartbeat_at: job.last_heartbeat_at,
        })
    }

    /// Jobs that look interrupted: marked interrupted already, or running
    /// with a heartbeat older than the staleness threshold.
    pub async fn list_interrupted_jobs(&self, staleness: Duration) -> Result<Vec<i64>> {
        let mut job_ids: Vec<i64> = self
            .store
            .list_stale_running_jobs(staleness)
            .await?
            .into_iter()
            .map(|job| job.job_id)
            .collect();

        for job in crate::store::Job::list_with_status(self.store.pool(), JobState::Interrupted)
            .await?
        {
            job_ids.push(job.job_id);
        }
        job_ids.sort_unstable();
        job_ids.dedup();
        Ok(job_ids)
    }

    /// Recovery scan, run at process start or on demand: mark stale running
    /// jobs interrupted and reset their orphaned running items so nothing is
    /// silently lost or silently double-counted.
    pub async fn recover_interrupted(&self) -> Result<Vec<i64>> {
        let staleness = self.config.staleness_threshold();
        let state_machine = self.store.state_machine();
        let mut recovered = Vec::new();

        for job in self.store.list_stale_running_jobs(staleness).await? {
            state_machine
                .transition(job.job_id, JobEvent::MarkInterrupted)
                .await?;
            let reset = self.store.reset_running_items(job.job_id).await?;
            warn!(
                job_id = job.job_id,
                name = %job.name,
                reset_items = reset,
                "Stale heartbeat, job marked interrupted"
            );
            self.sink
                .notify(Notification::JobInterrupted {
                    job_id: job.job_id,
                    name: job.name.clone(),
                })
                .await;
            recovered.push(job.job_id);
        }

        Ok(recovered)
    }

    // ------------------------------------------------------------------
    // Internals
    // ------------------------------------------------------------------

    async fn execute_job(&self, job_id: i64, analyzer: Arc<dyn Analyzer>) -> Result<JobRunSummary> {
        let control = Arc::new(JobControl::new());
        self.active.lock().insert(job_id, Arc::clone(&control));

        let heartbeat = self.spawn_heartbeat(job_id, Arc::clone(&control));

        // A worker without a credential cannot make progress, so the pool is
        // bounded by the credential count as well as the configured limit.
        let worker_count = (self.config.worker_count as usize)
            .min(self.credentials.credential_count())
            .max(1);
        info!(
            job_id = job_id,
            worker_count = worker_count,
            credential_count = self.credentials.credential_count(),
            "Starting worker pool"
        );

        let mut handles = Vec::with_capacity(worker_count);
        for _ in 0..worker_count {
            let worker = Worker {
                worker_id: Uuid::new_v4(),
                job_id,
                store: self.store.clone(),
                credentials: Arc::clone(&self.credentials),
                gateway: Arc::clone(&self.gateway),
                analyzer: Arc::clone(&analyzer),
                control: Arc::clone(&control),
                config: self.config.clone(),
            };
            handles.push(tokio::spawn(worker.run()));
        }

        let mut totals = WorkerSummary::default();
        let mut worker_error: Option<AnalystError> = None;
        for handle in handles {
            match handle.await {
                Ok(Ok(summary)) => {
                    totals.items_completed += summary.items_completed;
                    totals.items_failed += summary.items_failed;
                }
                Ok(Err(err)) => {
                    error!(job_id = job_id, error = %err, "Worker returned error");
                    worker_error.get_or_insert(err);
                }
                Err(join_err) => {
                    error!(job_id = job_id, error = %join_err, "Worker task panicked");
                    worker_error.get_or_insert(AnalystError::SchedulingError(format!(
                        "Worker task panicked: {join_err}"
                    )));
                }
            }
        }

        control.mark_finished();
        let _ = heartbeat.await;
        self.active.lock().remove(&job_id);

        self.finalize_job(job_id, &control, worker_error, totals).await
    }

    fn spawn_heartbeat(
        &self,
        job_id: i64,
        control: Arc<JobControl>,
    ) -> tokio::task::JoinHandle<()> {
        let store = self.store.clone();
        let interval = self.config.heartbeat_interval();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = control.finished_notified() => break,
                    _ = tokio::time::sleep(interval) => {
                        if control.is_finished() {
                            break;
                        }
                        if let Err(err) = store.touch_job_heartbeat(job_id).await {
                            warn!(job_id = job_id, error = %err, "Heartbeat update failed");
                        }
                    }
                }
            }
        })
    }

    /// Derive the job's final state from what the workers left behind
    async fn finalize_job(
        &self,
        job_id: i64,
        control: &JobControl,
        worker_error: Option<AnalystError>,
        totals: WorkerSummary,
    ) -> Result<JobRunSummary> {
        let state_machine = self.store.state_machine();
        let job = self.store.find_job(job_id).await?.ok_or_else(|| {
            AnalystError::ValidationError(format!("Job {job_id} not found"))
        })?;

        let final_state = if let Some(err) = worker_error {
            self.store.reset_running_items(job_id).await?;
            state_machine
                .transition(job_id, JobEvent::Fail(err.to_string()))
                .await?;
            self.sink
                .notify(Notification::JobFailed {
                    job_id,
                    name: job.name.clone(),
                    error: err.to_string(),
                })
                .await;
            JobState::Failed
        } else if control.is_cancelled() {
            self.store.reset_running_items(job_id).await?;
            let skipped = self.store.skip_pending_items(job_id).await?;
            state_machine.transition(job_id, JobEvent::Cancel).await?;
            self.notify_cancelled(job_id, skipped as i64).await;
            JobState::Cancelled
        } else {
            let counts = self.store.job_counts(job_id).await?;
            if counts.all_terminal() {
                state_machine.transition(job_id, JobEvent::Complete).await?;
                self.sink
                    .notify(Notification::JobCompleted {
                        job_id,
                        name: job.name.clone(),
                        completed: counts.completed,
                        failed: counts.failed,
                        skipped: counts.skipped,
                        total: counts.total,
                    })
                    .await;
                JobState::Completed
            } else {
                let reason = if control.is_exhausted() {
                    "credential pool exhausted".to_string()
                } else {
                    "pause requested".to_string()
                };
                state_machine
                    .transition(job_id, JobEvent::Pause(reason.clone()))
                    .await?;
                if control.is_exhausted() {
                    self.sink
                        .notify(Notification::PoolExhausted {
                            job_id,
                            credential_count: self.credentials.credential_count(),
                            resumes_at: self.credentials.next_reset_at(),
                        })
                        .await;
                }
                self.sink
                    .notify(Notification::JobPaused {
                        job_id,
                        name: job.name.clone(),
                        reason,
                    })
                    .await;
                JobState::Paused
            }
        };

        let counts = self.store.job_counts(job_id).await?;
        log_job_operation(
            "finalize",
            Some(job_id),
            Some(&job.name),
            &final_state.to_string(),
            None,
        );

        Ok(JobRunSummary {
            job_id,
            final_state,
            counts,
            items_completed: totals.items_completed,
            items_failed: totals.items_failed,
        })
    }

    async fn notify_cancelled(&self, job_id: i64, skipped: i64) {
        let name = match self.store.find_job(job_id).await {
            Ok(Some(job)) => job.name,
            _ => String::new(),
        };
        self.sink
            .notify(Notification::JobCancelled {
                job_id,
                name,
                skipped,
            })
            .await;
    }
}
