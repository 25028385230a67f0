//! # Notification Module
//!
//! Fire-and-forget alerting for terminal job outcomes and pool exhaustion.
//! Sinks are best-effort and never raise: a lost notification must not
//! affect job processing.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{info, warn};

/// Terminal and backpressure events the scheduler reports
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Notification {
    JobCompleted {
        job_id: i64,
        name: String,
        completed: i64,
        failed: i64,
        skipped: i64,
        total: i64,
    },
    JobFailed {
        job_id: i64,
        name: String,
        error: String,
    },
    JobPaused {
        job_id: i64,
        name: String,
        reason: String,
    },
    JobCancelled {
        job_id: i64,
        name: String,
        skipped: i64,
    },
    JobInterrupted {
        job_id: i64,
        name: String,
    },
    PoolExhausted {
        job_id: i64,
        credential_count: usize,
        resumes_at: DateTime<Utc>,
    },
}

/// Best-effort notification sink. Implementations must be non-blocking and
/// must not fail; delivery problems are their own to swallow.
#[async_trait]
pub trait NotificationSink: Send + Sync {
    async fn notify(&self, notification: Notification);
}

/// Sink that reports through structured logging
#[derive(Debug, Default)]
pub struct LogNotificationSink;

impl LogNotificationSink {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl NotificationSink for LogNotificationSink {
    async fn notify(&self, notification: Notification) {
        match serde_json::to_string(&notification) {
            Ok(payload) => info!(payload = %payload, "📣 NOTIFICATION"),
            Err(err) => warn!(error = %err, "Failed to serialize notification"),
        }
    }
}

/// Sink that forwards events over an unbounded channel; used by embedders
/// that bridge notifications into an external transport, and by tests.
#[derive(Debug, Clone)]
pub struct ChannelNotificationSink {
    sender: mpsc::UnboundedSender<Notification>,
}

impl ChannelNotificationSink {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<Notification>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (Self { sender }, receiver)
    }
}

#[async_trait]
impl NotificationSink for ChannelNotificationSink {
    async fn notify(&self, notification: Notification) {
        // A closed receiver means nobody is listening anymore; that is not
        // a processing failure.
        if self.sender.send(notification).is_err() {
            warn!("Notification receiver dropped, event discarded");
        }
    }
}
