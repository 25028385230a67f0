//! # Request Gateway
//!
//! The only path through which the external service is invoked. Wraps a
//! single call with the global rate-limit gate, failure classification, and
//! bounded exponential-backoff retry, re-acquiring the gate on every
//! attempt. Quota exhaustion benches the credential in the pool and is
//! returned as a distinct variant so the caller can request a different
//! credential rather than burn a retry. Successful calls increment the
//! credential's used-count and mirror into the usage ledger.

use std::future::Future;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::config::RetryConfig;
use crate::credentials::{CredentialPool, ReservedCredential};
use crate::store::CheckpointStore;
use crate::throttle::classifier::{FailureClassifier, FailureKind};
use crate::throttle::rate_limiter::RateLimiter;

/// Outcome of one serialized external call, after retries
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallResult<T> {
    Success(T),
    /// The credential is out of quota; it has been benched in the pool.
    /// Not an item failure.
    QuotaExhausted { message: String },
    /// The call failed: permanently, or after exhausting bounded retries
    Failed { message: String, permanent: bool },
}

pub struct RequestGateway {
    limiter: Arc<RateLimiter>,
    credentials: Arc<CredentialPool>,
    store: CheckpointStore,
    classifier: Arc<dyn FailureClassifier>,
    retry: RetryConfig,
}

impl RequestGateway {
    pub fn new(
        limiter: Arc<RateLimiter>,
        credentials: Arc<CredentialPool>,
        store: CheckpointStore,
        classifier: Arc<dyn FailureClassifier>,
        retry: RetryConfig,
    ) -> Self {
        Self {
            limiter,
            credentials,
            store,
            classifier,
            retry,
        }
    }

    /// Execute one external call with the given reserved credential.
    ///
    /// Steps: wait at the global gate, invoke the callback, classify the
    /// outcome. Retryable failures are retried up to the configured bound
    /// with exponential backoff; quota exhaustion and permanent failures
    /// return immediately.
    pub async fn execute<T, F, Fut>(
        &self,
        credential: &ReservedCredential,
        mut call: F,
    ) -> CallResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = std::result::Result<T, crate::analysis::AnalysisError>>,
    {
        let mut attempt: u32 = 1;
        loop {
            self.limiter.wait_if_needed().await;

            match call().await {
                Ok(value) => {
                    let used_today = self.credentials.record_success(credential);
                    let today = self.credentials.local_today();
                    if let Err(err) = self.store.record_usage(credential.suffix(), today).await {
                        // The ledger is advisory; a mirror failure must not
                        // fail a call that already succeeded upstream.
                        warn!(
                            credential = credential.suffix(),
                            error = %err,
                            "Failed to mirror usage into ledger"
                        );
                    }
                    debug!(
                        credential = credential.suffix(),
                        used_today = used_today,
                        attempt = attempt,
                        "External call succeeded"
                    );
                    return CallResult::Success(value);
                }
                Err(error) => match self.classifier.classify(&error) {
                    FailureKind::QuotaExhausted => {
                        self.credentials.mark_exhausted(credential);
                        return CallResult::QuotaExhausted {
                            message: error.to_string(),
                        };
                    }
                    FailureKind::Permanent => {
                        warn!(
                            credential = credential.suffix(),
                            error = %error,
                            "Permanent failure, not retrying"
                        );
                        return CallResult::Failed {
                            message: error.to_string(),
                            permanent: true,
                        };
                    }
                    FailureKind::Retryable => {
                        if attempt >= self.retry.max_attempts {
                            warn!(
                                credential = credential.suffix(),
                                attempts = attempt,
                                error = %error,
                                "Retries exhausted"
                            );
                            return CallResult::Failed {
                                message: error.to_string(),
                                permanent: false,
                            };
                        }
                        let delay = self.retry.delay_for(attempt);
                        debug!(
                            credential = credential.suffix(),
                            attempt = attempt,
                            delay_ms = delay.as_millis() as u64,
                            error = %error,
                            "Retryable failure, backing off"
                        );
                        tokio::time::sleep(delay).await;
                        attempt += 1;
                    }
                },
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analysis::AnalysisError;
    use crate::config::DatabaseConfig;
    use crate::throttle::classifier::StandardFailureClassifier;
    use chrono::FixedOffset;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    async fn test_gateway() -> (RequestGateway, Arc<CredentialPool>, CheckpointStore) {
        let store = CheckpointStore::connect(&DatabaseConfig {
            url: "sqlite::memory:".to_string(),
            max_connections: 1,
            busy_timeout_ms: 1000,
        })
        .await
        .unwrap();

        let pool = Arc::new(
            CredentialPool::new(
                vec!["sk-test-0001".to_string()],
                10,
                FixedOffset::east_opt(0).unwrap(),
            )
            .unwrap(),
        );

        let gateway = RequestGateway::new(
            Arc::new(RateLimiter::new(Duration::ZERO)),
            Arc::clone(&pool),
            store.clone(),
            Arc::new(StandardFailureClassifier::new()),
            RetryConfig {
                max_attempts: 3,
                base_delay_ms: 1,
                max_delay_ms: 4,
                backoff_multiplier: 2.0,
            },
        );
        (gateway, pool, store)
    }

    #[tokio::test]
    async fn test_success_mirrors_usage() {
        let (gateway, pool, store) = test_gateway().await;
        let credential = pool.reserve().unwrap();

        let result = gateway
            .execute(&credential, || async { Ok::<_, AnalysisError>(42) })
            .await;

        assert_eq!(result, CallResult::Success(42));
        let today = pool.local_today();
        assert_eq!(store.usage_for(credential.suffix(), today).await.unwrap(), 1);
        assert_eq!(pool.status()[0].used_today, 1);
    }

    #[tokio::test]
    async fn test_retryable_failures_retry_until_success() {
        let (gateway, pool, _store) = test_gateway().await;
        let credential = pool.reserve().unwrap();
        let calls = AtomicU32::new(0);

        let result = gateway
            .execute(&credential, || {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n < 2 {
                        Err(AnalysisError::Transient("blip".into()))
                    } else {
                        Ok("done")
                    }
                }
            })
            .await;

        assert_eq!(result, CallResult::Success("done"));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_retries_are_bounded() {
        let (gateway, pool, _store) = test_gateway().await;
        let credential = pool.reserve().unwrap();
        let calls = AtomicU32::new(0);

        let result = gateway
            .execute(&credential, || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err::<(), _>(AnalysisError::Transient("still down".into())) }
            })
            .await;

        match result {
            CallResult::Failed { permanent, .. } => assert!(!permanent),
            other => panic!("expected bounded failure, got {other:?}"),
        }
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_permanent_failure_does_not_retry() {
        let (gateway, pool, _store) = test_gateway().await;
        let credential = pool.reserve().unwrap();
        let calls = AtomicU32::new(0);

        let result = gateway
            .execute(&credential, || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err::<(), _>(AnalysisError::InvalidRequest("empty".into())) }
            })
            .await;

        match result {
            CallResult::Failed { permanent, .. } => assert!(permanent),
            other => panic!("expected permanent failure, got {other:?}"),
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_quota_exhaustion_benches_credential() {
        let (gateway, pool, _store) = test_gateway().await;
        let credential = pool.reserve().unwrap();

        let result = gateway
            .execute(&credential, || async {
                Err::<(), _>(AnalysisError::QuotaExceeded("daily cap".into()))
            })
            .await;

        assert!(matches!(result, CallResult::QuotaExhausted { .. }));
        assert!(pool.status()[0].exhausted);
    }
}
