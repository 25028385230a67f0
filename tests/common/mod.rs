//! Shared helpers for integration tests: temp-file checkpoint databases,
//! a scripted analyzer, and a fully wired scheduler.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tempfile::TempDir;
use tokio::sync::mpsc::UnboundedReceiver;

use analyst_core::analysis::{AnalysisError, AnalysisReport, Analyzer};
use analyst_core::config::{DatabaseConfig, RetryConfig, SchedulerConfig};
use analyst_core::credentials::{CredentialPool, ReservedCredential};
use analyst_core::notify::{ChannelNotificationSink, Notification};
use analyst_core::scheduler::BatchScheduler;
use analyst_core::store::CheckpointStore;
use analyst_core::throttle::{RateLimiter, RequestGateway, StandardFailureClassifier};
use chrono::FixedOffset;

/// Everything a scenario needs, with the temp dir kept alive
pub struct TestHarness {
    pub scheduler: Arc<BatchScheduler>,
    pub store: CheckpointStore,
    pub credentials: Arc<CredentialPool>,
    pub notifications: UnboundedReceiver<Notification>,
    _tempdir: TempDir,
}

pub async fn harness(credential_count: usize, daily_quota: u32) -> TestHarness {
    harness_with_store(credential_count, daily_quota, None).await
}

/// Build a harness, optionally reusing an existing checkpoint database to
/// simulate a process restart.
pub async fn harness_with_store(
    credential_count: usize,
    daily_quota: u32,
    existing: Option<(CheckpointStore, TempDir)>,
) -> TestHarness {
    let (store, tempdir) = match existing {
        Some((store, tempdir)) => (store, tempdir),
        None => {
            let tempdir = TempDir::new().expect("tempdir");
            let db_path = tempdir.path().join("checkpoint.db");
            let store = CheckpointStore::connect(&DatabaseConfig {
                url: format!("sqlite://{}", db_path.display()),
                max_connections: 5,
                busy_timeout_ms: 5_000,
            })
            .await
            .expect("store connect");
            (store, tempdir)
        }
    };

    let secrets = (0..credential_count)
        .map(|i| format!("sk-test-{i:04}"))
        .collect();
    let credentials = Arc::new(
        CredentialPool::new(secrets, daily_quota, FixedOffset::east_opt(0).unwrap())
            .expect("credential pool"),
    );

    let gateway = Arc::new(RequestGateway::new(
        Arc::new(RateLimiter::new(Duration::ZERO)),
        Arc::clone(&credentials),
        store.clone(),
        Arc::new(StandardFailureClassifier::new()),
        RetryConfig {
            max_attempts: 2,
            base_delay_ms: 1,
            max_delay_ms: 4,
            backoff_multiplier: 2.0,
        },
    ));

    let (sink, notifications) = ChannelNotificationSink::new();
    let scheduler = Arc::new(BatchScheduler::new(
        store.clone(),
        Arc::clone(&credentials),
        gateway,
        Arc::new(sink),
        SchedulerConfig {
            worker_count: 4,
            heartbeat_interval_ms: 25,
            staleness_threshold_seconds: 0,
            credential_wait_ms: 5,
            credential_wait_attempts: 50,
        },
    ));

    TestHarness {
        scheduler,
        store,
        credentials,
        notifications,
        _tempdir: tempdir,
    }
}

impl TestHarness {
    /// Tear the harness apart so the checkpoint database can be handed to a
    /// fresh harness, simulating a restart.
    pub fn into_store(self) -> (CheckpointStore, TempDir) {
        (self.store, self._tempdir)
    }

    /// Drain whatever notifications have been delivered so far
    pub fn drain_notifications(&mut self) -> Vec<Notification> {
        let mut events = Vec::new();
        while let Ok(event) = self.notifications.try_recv() {
            events.push(event);
        }
        events
    }
}

/// Outcome script entry for one `(unit_key, sub_unit)` call
#[derive(Debug, Clone)]
pub enum MockOutcome {
    Success,
    Quota,
    Transient,
    Invalid,
}

/// Scripted analyzer: consumes per-key outcome queues and records every
/// call. Keys with no remaining script entries succeed.
#[derive(Default)]
pub struct MockAnalyzer {
    script: Mutex<HashMap<String, Vec<MockOutcome>>>,
    calls: Mutex<Vec<String>>,
}

impl MockAnalyzer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue outcomes for `unit_key:sub_unit`, consumed front to back
    pub fn script(&self, unit_key: &str, sub_unit: &str, outcomes: Vec<MockOutcome>) {
        self.script
            .lock()
            .insert(format!("{unit_key}:{sub_unit}"), outcomes);
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().clone()
    }

    pub fn calls_for(&self, unit_key: &str, sub_unit: &str) -> usize {
        let key = format!("{unit_key}:{sub_unit}");
        self.calls.lock().iter().filter(|call| **call == key).count()
    }
}

#[async_trait]
impl Analyzer for MockAnalyzer {
    async fn analyze(
        &self,
        _credential: &ReservedCredential,
        unit_key: &str,
        sub_unit: &str,
    ) -> Result<AnalysisReport, AnalysisError> {
        let key = format!("{unit_key}:{sub_unit}");
        self.calls.lock().push(key.clone());

        let outcome = {
            let mut script = self.script.lock();
            match script.get_mut(&key) {
                Some(queue) if !queue.is_empty() => queue.remove(0),
                _ => MockOutcome::Success,
            }
        };

        match outcome {
            MockOutcome::Success => Ok(AnalysisReport {
                unit_key: unit_key.to_string(),
                sub_unit: sub_unit.to_string(),
                content: serde_json::json!({ "verdict": "ok" }),
            }),
            MockOutcome::Quota => Err(AnalysisError::QuotaExceeded(
                "daily quota reached".to_string(),
            )),
            MockOutcome::Transient => {
                Err(AnalysisError::Transient("connection reset".to_string()))
            }
            MockOutcome::Invalid => {
                Err(AnalysisError::InvalidRequest("no filings found".to_string()))
            }
        }
    }
}
