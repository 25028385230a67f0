#![allow(clippy::doc_markdown)] // Allow technical terms like SQLite, SQLx in docs
#![allow(clippy::missing_errors_doc)] // Allow public functions without # Errors sections
#![allow(clippy::must_use_candidate)] // Allow methods without must_use when context is clear

//! # Analyst Core Rust
//!
//! Rust core for orchestrating large batches of long-running, rate-limited
//! calls to an external generative-AI service across a pool of credentials,
//! each with an independent daily quota.
//!
//! ## Overview
//!
//! The crate survives process crashes and resumes exactly where it left off,
//! never exceeds per-credential or per-minute request limits, and reports
//! terminal outcomes (success, exhaustion, failure) to a best-effort
//! notification sink. Domain concerns (prompt construction, response
//! parsing, document acquisition, presentation) live with collaborators
//! behind the [`analysis::Analyzer`] seam.
//!
//! ## Architecture
//!
//! A fixed-size pool of workers claims pending work items atomically from
//! the checkpoint store, reserves a credential per item, and performs every
//! external call through a single serialized gateway: one global rate-limit
//! gate, classification of failures into retryable / quota / permanent, and
//! bounded exponential-backoff retries. The checkpoint store is the single
//! source of truth; everything the scheduler holds in memory is
//! reconstructible from it after a crash.
//!
//! ## Module Organization
//!
//! - [`credentials`] - Credential pool with daily quotas and atomic reservation
//! - [`throttle`] - Global rate limiting, failure classification, request gateway
//! - [`store`] - Persistent checkpoint ledger (jobs, items, runs, usage)
//! - [`state_machine`] - Job and item states with persisted transitions
//! - [`scheduler`] - Worker pool, heartbeats, recovery, pause/resume/cancel
//! - [`notify`] - Fire-and-forget notification sinks
//! - [`analysis`] - The domain callback seam
//! - [`config`] - Validated YAML configuration
//! - [`error`] - Structured error handling
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use analyst_core::config::AnalystConfig;
//! use analyst_core::credentials::CredentialPool;
//! use analyst_core::notify::LogNotificationSink;
//! use analyst_core::scheduler::BatchScheduler;
//! use analyst_core::store::CheckpointStore;
//! use analyst_core::throttle::{RateLimiter, RequestGateway, StandardFailureClassifier};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let config = AnalystConfig::load()?;
//! let store = CheckpointStore::connect(&config.database).await?;
//!
//! let credentials = Arc::new(CredentialPool::from_config(&config.credentials)?);
//! credentials.hydrate(&store).await?;
//!
//! let gateway = Arc::new(RequestGateway::new(
//!     Arc::new(RateLimiter::new(config.throttle.min_interval())),
//!     Arc::clone(&credentials),
//!     store.clone(),
//!     Arc::new(StandardFailureClassifier::new()),
//!     config.throttle.retry.clone(),
//! ));
//!
//! let scheduler = BatchScheduler::new(
//!     store,
//!     credentials,
//!     gateway,
//!     Arc::new(LogNotificationSink::new()),
//!     config.scheduler.clone(),
//! );
//!
//! // Recover anything a previous process left behind
//! let recovered = scheduler.recover_interrupted().await?;
//! println!("Recovered {} interrupted jobs", recovered.len());
//! # Ok(())
//! # }
//! ```

pub mod analysis;
pub mod config;
pub mod credentials;
pub mod error;
pub mod logging;
pub mod notify;
pub mod scheduler;
pub mod state_machine;
pub mod store;
pub mod throttle;

pub use analysis::{AnalysisError, AnalysisReport, Analyzer, WorkUnit};
pub use config::AnalystConfig;
pub use credentials::{CredentialPool, ReservedCredential};
pub use error::{AnalystError, Result};
pub use notify::{Notification, NotificationSink};
pub use scheduler::{BatchScheduler, JobRunSummary, JobStatusView};
pub use state_machine::{ItemState, JobState};
pub use store::{CheckpointStore, Job, JobCounts, WorkItem};
pub use throttle::{CallResult, RateLimiter, RequestGateway};
