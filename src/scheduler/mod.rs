//! # Scheduler Module
//!
//! Worker-pool batch orchestration: atomic item claiming, credential
//! reservation, heartbeats, pause/resume/cancel, exhaustion backpressure,
//! and crash recovery.

pub mod batch_scheduler;
pub(crate) mod worker;

pub use batch_scheduler::{BatchScheduler, JobRunSummary, JobStatusView};

use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::Notify;

/// Cooperative control flags shared between the scheduler and a job's
/// workers. Workers observe these between items and between sub-unit
/// calls; in-flight requests always run to completion.
#[derive(Debug, Default)]
pub(crate) struct JobControl {
    cancelled: AtomicBool,
    pause_requested: AtomicBool,
    exhausted: AtomicBool,
    finished: AtomicBool,
    shutdown: Notify,
}

impl JobControl {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    pub fn request_pause(&self) {
        self.pause_requested.store(true, Ordering::Release);
    }

    pub fn is_pause_requested(&self) -> bool {
        self.pause_requested.load(Ordering::Acquire)
    }

    /// Pause triggered by total credential exhaustion; recorded separately
    /// so finalization can report the backpressure cause.
    pub fn request_exhausted_pause(&self) {
        self.exhausted.store(true, Ordering::Release);
        self.pause_requested.store(true, Ordering::Release);
    }

    pub fn is_exhausted(&self) -> bool {
        self.exhausted.load(Ordering::Acquire)
    }

    /// Workers stop claiming new items once any stop flag is raised
    pub fn should_stop_claiming(&self) -> bool {
        self.is_cancelled() || self.is_pause_requested()
    }

    pub fn mark_finished(&self) {
        self.finished.store(true, Ordering::Release);
        self.shutdown.notify_one();
    }

    pub fn is_finished(&self) -> bool {
        self.finished.load(Ordering::Acquire)
    }

    /// Resolves once `mark_finished` has been called; the permit is stored,
    /// so a late waiter still wakes immediately.
    pub async fn finished_notified(&self) {
        self.shutdown.notified().await;
    }
}
