//! # Rate Limiter
//!
//! A single global admission gate. The upstream provider enforces a
//! per-minute ceiling independent of which credential is used, so the gate
//! serializes *all* outbound calls across every worker: at most one
//! admission per `min_interval` process-wide. Adding workers increases
//! readiness to claim items, not external call throughput.

use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;

pub struct RateLimiter {
    min_interval: Duration,
    last_admitted: Mutex<Option<Instant>>,
}

impl RateLimiter {
    pub fn new(min_interval: Duration) -> Self {
        Self {
            min_interval,
            last_admitted: Mutex::new(None),
        }
    }

    pub fn min_interval(&self) -> Duration {
        self.min_interval
    }

    /// Block the calling worker until at least `min_interval` has elapsed
    /// since the last admission, then record this admission. The lock is
    /// held across the wait so concurrent callers are admitted one at a
    /// time, each a full interval apart.
    pub async fn wait_if_needed(&self) {
        let mut last = self.last_admitted.lock().await;
        if let Some(previous) = *last {
            let target = previous + self.min_interval;
            if target > Instant::now() {
                tokio::time::sleep_until(target).await;
            }
        }
        *last = Some(Instant::now());
    }
}
