//! # Throttle Module
//!
//! Global request admission and the serialized call path to the external
//! provider: rate limiting, retry with backoff, and failure classification.

pub mod classifier;
pub mod gateway;
pub mod rate_limiter;

pub use classifier::{FailureClassifier, FailureKind, StandardFailureClassifier};
pub use gateway::{CallResult, RequestGateway};
pub use rate_limiter::RateLimiter;
