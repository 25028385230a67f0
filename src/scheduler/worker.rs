//! # Worker
//!
//! One worker's claim loop: atomically claim the next pending item, then
//! drive its incomplete sub-units through the request gateway, reserving a
//! credential per call and releasing it afterwards. A credential is never
//! held across more than one external call, so quota consumption stays
//! balanced and a benched credential can be swapped for a fresh one
//! mid-item. Workers mutate item state only through the checkpoint store
//! and never touch job status; job-level transitions belong to the
//! scheduler.

use std::sync::Arc;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use super::JobControl;
use crate::analysis::Analyzer;
use crate::config::SchedulerConfig;
use crate::credentials::{CredentialPool, ReservedCredential};
use crate::error::{AnalystError, Result};
use crate::store::{CheckpointStore, WorkItem};
use crate::throttle::{CallResult, RequestGateway};

/// Per-worker tallies, aggregated by the scheduler at the end of a run
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct WorkerSummary {
    pub items_completed: u64,
    pub items_failed: u64,
}

/// Outcome of processing one claimed item
enum ItemOutcome {
    /// Every sub-unit completed
    Completed,
    /// At least one sub-unit failed after bounded retries
    Failed(String),
    /// No usable credential left mid-item; progress is preserved and the
    /// item goes back to pending
    CredentialStarved,
    /// A stop flag was observed between sub-unit calls; the item goes back
    /// to pending with its recorded progress
    Yielded,
}

pub(crate) struct Worker {
    pub worker_id: Uuid,
    pub job_id: i64,
    pub store: CheckpointStore,
    pub credentials: Arc<CredentialPool>,
    pub gateway: Arc<RequestGateway>,
    pub analyzer: Arc<dyn Analyzer>,
    pub control: Arc<JobControl>,
    pub config: SchedulerConfig,
}

impl Worker {
    #[instrument(skip(self), fields(worker_id = %self.worker_id, job_id = self.job_id))]
    pub async fn run(self) -> Result<WorkerSummary> {
        let worker_key = self.worker_id.to_string();
        let mut summary = WorkerSummary::default();

        loop {
            if self.control.should_stop_claiming() {
                break;
            }

            let Some(item) = self
                .store
                .claim_next_pending(self.job_id, &worker_key)
                .await?
            else {
                // No pending work left for this worker
                break;
            };

            match self.process_item(&item).await? {
                ItemOutcome::Completed => {
                    self.store.mark_item_completed(item.item_id).await?;
                    summary.items_completed += 1;
                    debug!(item_id = item.item_id, unit_key = %item.unit_key, "Item completed");
                }
                ItemOutcome::Failed(error) => {
                    self.store.mark_item_failed(item.item_id, &error).await?;
                    summary.items_failed += 1;
                    warn!(
                        item_id = item.item_id,
                        unit_key = %item.unit_key,
                        error = %error,
                        "Item failed"
                    );
                }
                ItemOutcome::CredentialStarved => {
                    // Not a failure: the item stays pending for another
                    // credential or a later resume.
                    self.store.release_claim(item.item_id).await?;
                    if self.credentials.all_exhausted() {
                        info!(
                            item_id = item.item_id,
                            "Credential pool exhausted, requesting job pause"
                        );
                        self.control.request_exhausted_pause();
                    } else {
                        warn!(
                            item_id = item.item_id,
                            "No credential freed up within the idle bound, worker exiting"
                        );
                    }
                    break;
                }
                ItemOutcome::Yielded => {
                    self.store.release_claim(item.item_id).await?;
                }
            }
        }

        Ok(summary)
    }

    /// Drive the item's incomplete sub-units, oldest first. Each sub-unit
    /// call reserves its own credential and each success is checkpointed
    /// immediately, so a crash or quota stop resumes at the next incomplete
    /// sub-unit, never from scratch. A sub-unit whose credential ran out of
    /// quota is re-attempted with a different credential rather than counted
    /// as a failure.
    async fn process_item(&self, item: &WorkItem) -> Result<ItemOutcome> {
        let run = self.store.run_for_item(item.item_id).await?.ok_or_else(|| {
            AnalystError::SchedulingError(format!(
                "Item {} has no analysis run record",
                item.item_id
            ))
        })?;

        let sub_units = run.incomplete_units()?;
        let mut failed_sub_units: u64 = 0;
        let mut last_error: Option<String> = None;

        let mut index = 0;
        while index < sub_units.len() {
            // Cancellation must be observable between sub-unit calls, not
            // only between items.
            if self.control.should_stop_claiming() {
                return Ok(ItemOutcome::Yielded);
            }

            let sub_unit = &sub_units[index];
            let Some(credential) = self.acquire_credential().await else {
                return Ok(ItemOutcome::CredentialStarved);
            };

            let result = self
                .gateway
                .execute(&credential, || {
                    self.analyzer
                        .analyze(&credential, &item.unit_key, sub_unit)
                })
                .await;
            self.credentials.release(credential);

            match result {
                CallResult::Success(report) => {
                    let completed = self
                        .store
                        .record_sub_unit_complete(item.item_id, sub_unit)
                        .await?;
                    debug!(
                        item_id = item.item_id,
                        unit_key = %item.unit_key,
                        sub_unit = %report.sub_unit,
                        completed_units = completed,
                        "Sub-unit completed"
                    );
                    index += 1;
                }
                CallResult::QuotaExhausted { message } => {
                    // The gateway benched the credential; retry the same
                    // sub-unit with whatever the pool offers next.
                    debug!(
                        item_id = item.item_id,
                        sub_unit = %sub_unit,
                        message = %message,
                        "Credential exhausted mid-item, switching credential"
                    );
                }
                CallResult::Failed { message, permanent } => {
                    failed_sub_units += 1;
                    warn!(
                        item_id = item.item_id,
                        sub_unit = %sub_unit,
                        permanent = permanent,
                        error = %message,
                        "Sub-unit failed"
                    );
                    last_error = Some(message);
                    index += 1;
                }
            }
        }

        if failed_sub_units == 0 {
            Ok(ItemOutcome::Completed)
        } else {
            Ok(ItemOutcome::Failed(last_error.unwrap_or_else(|| {
                format!("{failed_sub_units} sub-units failed")
            })))
        }
    }

    /// Reserve the least-used available credential, idling briefly while
    /// other workers hold theirs. Returns `None` once the pool is exhausted
    /// for the day or the bounded idle wait runs out.
    async fn acquire_credential(&self) -> Option<ReservedCredential> {
        let mut rounds: u32 = 0;
        loop {
            if let Some(credential) = self.credentials.reserve() {
                return Some(credential);
            }
            if self.credentials.all_exhausted() {
                return None;
            }
            rounds += 1;
            if rounds > self.config.credential_wait_attempts {
                return None;
            }
            tokio::time::sleep(self.config.credential_wait()).await;
        }
    }
}
