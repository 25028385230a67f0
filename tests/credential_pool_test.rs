//! Concurrency properties of the credential pool: racing workers never hold
//! the same credential simultaneously, and quotas hold under contention.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::FixedOffset;
use parking_lot::Mutex;

use analyst_core::credentials::CredentialPool;

fn pool(count: usize, quota: u32) -> Arc<CredentialPool> {
    let secrets = (0..count).map(|i| format!("sk-race-{i:04}")).collect();
    Arc::new(CredentialPool::new(secrets, quota, FixedOffset::east_opt(0).unwrap()).unwrap())
}

#[tokio::test]
async fn racing_workers_never_share_a_reservation() {
    let pool = pool(3, 1_000);
    let held: Arc<Mutex<HashSet<String>>> = Arc::new(Mutex::new(HashSet::new()));

    let mut handles = Vec::new();
    for _ in 0..8 {
        let pool = Arc::clone(&pool);
        let held = Arc::clone(&held);
        handles.push(tokio::spawn(async move {
            for _ in 0..50 {
                let Some(reserved) = pool.reserve() else {
                    tokio::time::sleep(Duration::from_millis(1)).await;
                    continue;
                };

                {
                    let mut guard = held.lock();
                    // Double-hold would mean reservation is not atomic
                    assert!(
                        guard.insert(reserved.suffix().to_string()),
                        "credential {} reserved twice concurrently",
                        reserved.suffix()
                    );
                }

                tokio::time::sleep(Duration::from_millis(1)).await;
                pool.record_success(&reserved);

                held.lock().remove(reserved.suffix());
                pool.release(reserved);
            }
        }));
    }

    for handle in handles {
        handle.await.unwrap();
    }

    assert!(held.lock().is_empty());
}

#[tokio::test]
async fn concurrent_successes_respect_the_daily_quota() {
    let pool = pool(2, 25);

    let mut handles = Vec::new();
    for _ in 0..6 {
        let pool = Arc::clone(&pool);
        handles.push(tokio::spawn(async move {
            let mut successes = 0u32;
            loop {
                let Some(reserved) = pool.reserve() else {
                    if pool.all_exhausted() {
                        break;
                    }
                    tokio::task::yield_now().await;
                    continue;
                };
                pool.record_success(&reserved);
                pool.release(reserved);
                successes += 1;
            }
            successes
        }));
    }

    let mut total = 0u32;
    for handle in handles {
        total += handle.await.unwrap();
    }

    // Two credentials with quota 25 admit exactly 50 successes
    assert_eq!(total, 50);
    for status in pool.status() {
        assert!(status.used_today <= status.daily_quota);
        assert!(status.exhausted);
    }
}
