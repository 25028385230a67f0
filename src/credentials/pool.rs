//! # Credential Pool
//!
//! Owns the set of provider credentials and their daily quotas. Reservation
//! is atomic across concurrent workers: no two callers can hold the same
//! credential at once. Selection is least-used to balance quota consumption
//! across the pool.
//!
//! Daily reset is lazy: on each access, any slot whose stored reset date is
//! behind the current date (in the configured reset offset) has its counters
//! zeroed before availability is evaluated. Durable used-counts live in the
//! checkpoint store's usage ledger; `hydrate` reloads them after a restart.
//!
//! Credential secrets never appear in logs or the database. Only the
//! fixed-length suffix does.

use chrono::{DateTime, Duration as ChronoDuration, FixedOffset, NaiveDate, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use std::fmt;
use tracing::{debug, info, warn};

use crate::config::CredentialConfig;
use crate::error::{AnalystError, Result};
use crate::store::CheckpointStore;

/// Length of the secret suffix used for logging and ledger keys
pub const SUFFIX_LEN: usize = 4;

/// A credential reserved by exactly one worker. Carries the secret for the
/// duration of the reservation; the pool slot stays unavailable until
/// `CredentialPool::release` is called with this handle.
#[derive(Clone)]
pub struct ReservedCredential {
    slot_index: usize,
    secret: String,
    suffix: String,
}

impl ReservedCredential {
    pub fn secret(&self) -> &str {
        &self.secret
    }

    pub fn suffix(&self) -> &str {
        &self.suffix
    }
}

impl fmt::Debug for ReservedCredential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReservedCredential")
            .field("suffix", &self.suffix)
            .finish()
    }
}

/// Observable state of one credential slot, secret redacted to its suffix
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CredentialStatus {
    pub suffix: String,
    pub used_today: u32,
    pub daily_quota: u32,
    pub reserved: bool,
    pub exhausted: bool,
}

struct CredentialSlot {
    secret: String,
    suffix: String,
    used_today: u32,
    daily_quota: u32,
    last_reset_date: NaiveDate,
    reserved: bool,
    exhausted: bool,
}

impl CredentialSlot {
    /// Zero the counters when the stored reset date has fallen behind
    fn roll_over(&mut self, today: NaiveDate) {
        if self.last_reset_date != today {
            if self.used_today > 0 || self.exhausted {
                debug!(
                    credential = %self.suffix,
                    previous_date = %self.last_reset_date,
                    "Daily quota reset"
                );
            }
            self.used_today = 0;
            self.exhausted = false;
            self.last_reset_date = today;
        }
    }

    fn available(&self) -> bool {
        !self.reserved && !self.exhausted && self.used_today < self.daily_quota
    }

    fn out_of_quota(&self) -> bool {
        self.exhausted || self.used_today >= self.daily_quota
    }

    fn status(&self) -> CredentialStatus {
        CredentialStatus {
            suffix: self.suffix.clone(),
            used_today: self.used_today,
            daily_quota: self.daily_quota,
            reserved: self.reserved,
            exhausted: self.exhausted,
        }
    }
}

/// Process-wide credential pool. Constructed once at startup and passed
/// explicitly to the scheduler and gateway.
pub struct CredentialPool {
    slots: Mutex<Vec<CredentialSlot>>,
    reset_offset: FixedOffset,
}

impl CredentialPool {
    pub fn new(
        secrets: Vec<String>,
        daily_quota: u32,
        reset_offset: FixedOffset,
    ) -> Result<Self> {
        if secrets.is_empty() {
            return Err(AnalystError::CredentialError(
                "Credential pool requires at least one credential".to_string(),
            ));
        }
        if daily_quota == 0 {
            return Err(AnalystError::CredentialError(
                "Daily quota must be positive".to_string(),
            ));
        }

        let today = Utc::now().with_timezone(&reset_offset).date_naive();
        let slots = secrets
            .into_iter()
            .map(|secret| CredentialSlot {
                suffix: suffix_of(&secret),
                secret,
                used_today: 0,
                daily_quota,
                last_reset_date: today,
                reserved: false,
                exhausted: false,
            })
            .collect::<Vec<_>>();

        info!(
            credential_count = slots.len(),
            daily_quota = daily_quota,
            "Credential pool initialized"
        );

        Ok(Self {
            slots: Mutex::new(slots),
            reset_offset,
        })
    }

    pub fn from_config(config: &CredentialConfig) -> Result<Self> {
        let offset = FixedOffset::east_opt(config.reset_utc_offset_minutes * 60).ok_or_else(
            || {
                AnalystError::ConfigurationError(format!(
                    "Invalid reset offset: {} minutes",
                    config.reset_utc_offset_minutes
                ))
            },
        )?;
        Self::new(config.secrets()?, config.daily_quota, offset)
    }

    pub fn credential_count(&self) -> usize {
        self.slots.lock().len()
    }

    /// Current date at the configured reset offset; the key used in the
    /// usage ledger.
    pub fn local_today(&self) -> NaiveDate {
        Utc::now().with_timezone(&self.reset_offset).date_naive()
    }

    /// Reserve the least-used available credential. Returns `None` rather
    /// than blocking when no credential is available; callers decide whether
    /// to wait, pause the job, or fail the item.
    pub fn reserve(&self) -> Option<ReservedCredential> {
        self.reserve_on(self.local_today())
    }

    pub(crate) fn reserve_on(&self, today: NaiveDate) -> Option<ReservedCredential> {
        let mut slots = self.slots.lock();
        for slot in slots.iter_mut() {
            slot.roll_over(today);
        }

        let slot_index = slots
            .iter()
            .enumerate()
            .filter(|(_, slot)| slot.available())
            .min_by_key(|(_, slot)| slot.used_today)
            .map(|(index, _)| index)?;

        let slot = &mut slots[slot_index];
        slot.reserved = true;
        debug!(
            credential = %slot.suffix,
            used_today = slot.used_today,
            "Credential reserved"
        );

        Some(ReservedCredential {
            slot_index,
            secret: slot.secret.clone(),
            suffix: slot.suffix.clone(),
        })
    }

    /// Release a reservation. Consumes the handle so a released credential
    /// cannot be used for further calls.
    pub fn release(&self, reserved: ReservedCredential) {
        let mut slots = self.slots.lock();
        let slot = &mut slots[reserved.slot_index];
        if !slot.reserved {
            warn!(credential = %reserved.suffix, "Release of unreserved credential slot");
        }
        slot.reserved = false;
    }

    /// Bench a credential the provider reported as over quota. It stays
    /// unavailable until the next daily reset even if our own counter is
    /// below the configured quota.
    pub fn mark_exhausted(&self, reserved: &ReservedCredential) {
        let mut slots = self.slots.lock();
        let slot = &mut slots[reserved.slot_index];
        slot.exhausted = true;
        warn!(
            credential = %reserved.suffix,
            used_today = slot.used_today,
            daily_quota = slot.daily_quota,
            "Credential exhausted for the day"
        );
    }

    /// Count one successful external call. Saturates at the daily quota and
    /// benches the slot when the quota is reached.
    pub fn record_success(&self, reserved: &ReservedCredential) -> u32 {
        let mut slots = self.slots.lock();
        let slot = &mut slots[reserved.slot_index];
        if slot.used_today < slot.daily_quota {
            slot.used_today += 1;
        }
        if slot.used_today >= slot.daily_quota {
            slot.exhausted = true;
        }
        slot.used_today
    }

    /// True when no credential has quota left for the current day
    pub fn all_exhausted(&self) -> bool {
        self.all_exhausted_on(self.local_today())
    }

    pub(crate) fn all_exhausted_on(&self, today: NaiveDate) -> bool {
        let mut slots = self.slots.lock();
        for slot in slots.iter_mut() {
            slot.roll_over(today);
        }
        slots.iter().all(|slot| slot.out_of_quota())
    }

    /// The least-used credential currently available, if any (observability;
    /// `reserve` applies the same selection atomically)
    pub fn least_used(&self) -> Option<CredentialStatus> {
        let today = self.local_today();
        let mut slots = self.slots.lock();
        for slot in slots.iter_mut() {
            slot.roll_over(today);
        }
        slots
            .iter()
            .filter(|slot| slot.available())
            .min_by_key(|slot| slot.used_today)
            .map(CredentialSlot::status)
    }

    /// Redacted view of every slot
    pub fn status(&self) -> Vec<CredentialStatus> {
        self.slots.lock().iter().map(CredentialSlot::status).collect()
    }

    /// The next daily reset instant (local midnight at the reset offset)
    pub fn next_reset_at(&self) -> DateTime<Utc> {
        let now_local = Utc::now().with_timezone(&self.reset_offset);
        let next_midnight = (now_local.date_naive() + ChronoDuration::days(1))
            .and_hms_opt(0, 0, 0)
            .unwrap_or_else(|| now_local.naive_local());
        match next_midnight.and_local_timezone(self.reset_offset) {
            chrono::LocalResult::Single(dt) => dt.with_timezone(&Utc),
            _ => Utc::now() + ChronoDuration::days(1),
        }
    }

    /// Reload today's used-counts from the usage ledger so daily quota
    /// enforcement survives process restarts.
    pub async fn hydrate(&self, store: &CheckpointStore) -> Result<()> {
        let today = self.local_today();
        let ledger = store.usage_ledger_for_date(today).await?;

        let mut slots = self.slots.lock();
        for slot in slots.iter_mut() {
            slot.roll_over(today);
            if let Some(row) = ledger
                .iter()
                .find(|usage| usage.credential_suffix == slot.suffix)
            {
                slot.used_today = u32::try_from(row.requests_used.max(0))
                    .unwrap_or(slot.daily_quota)
                    .min(slot.daily_quota);
                slot.exhausted = slot.used_today >= slot.daily_quota;
            }
        }

        info!(
            hydrated = ledger.len(),
            usage_date = %today,
            "Credential pool hydrated from usage ledger"
        );
        Ok(())
    }
}

impl fmt::Debug for CredentialPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CredentialPool")
            .field("slots", &self.status())
            .finish()
    }
}

/// Fixed-length suffix of a secret, safe for logs and the usage ledger
pub fn suffix_of(secret: &str) -> String {
    let chars: Vec<char> = secret.chars().collect();
    if chars.len() >= SUFFIX_LEN {
        chars[chars.len() - SUFFIX_LEN..].iter().collect()
    } else {
        let mut padded = String::from("*".repeat(SUFFIX_LEN - chars.len()));
        padded.extend(chars);
        padded
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn test_pool(count: usize, quota: u32) -> CredentialPool {
        let secrets = (0..count).map(|i| format!("sk-test-{i:04}")).collect();
        CredentialPool::new(secrets, quota, FixedOffset::east_opt(0).unwrap()).unwrap()
    }

    #[test]
    fn test_empty_pool_rejected() {
        let result = CredentialPool::new(vec![], 10, FixedOffset::east_opt(0).unwrap());
        assert!(result.is_err());
    }

    #[test]
    fn test_suffix_redaction() {
        assert_eq!(suffix_of("sk-test-0001"), "0001");
        assert_eq!(suffix_of("ab"), "**ab");
        let reserved = test_pool(1, 5).reserve().unwrap();
        let debugged = format!("{reserved:?}");
        assert!(!debugged.contains("sk-test"));
        assert!(debugged.contains("0001"));
    }

    #[test]
    fn test_reserve_is_exclusive() {
        let pool = test_pool(2, 10);
        let first = pool.reserve().unwrap();
        let second = pool.reserve().unwrap();
        assert_ne!(first.suffix(), second.suffix());
        assert!(pool.reserve().is_none());

        pool.release(first);
        assert!(pool.reserve().is_some());
    }

    #[test]
    fn test_least_used_selection() {
        let pool = test_pool(2, 10);

        // Burn two requests on whichever slot comes first
        let first = pool.reserve().unwrap();
        pool.record_success(&first);
        pool.record_success(&first);
        let first_suffix = first.suffix().to_string();
        pool.release(first);

        let next = pool.reserve().unwrap();
        assert_ne!(next.suffix(), first_suffix);
    }

    #[test]
    fn test_quota_saturation_benches_slot() {
        let pool = test_pool(1, 2);
        let reserved = pool.reserve().unwrap();
        assert_eq!(pool.record_success(&reserved), 1);
        assert_eq!(pool.record_success(&reserved), 2);
        // Counter never exceeds the quota
        assert_eq!(pool.record_success(&reserved), 2);
        pool.release(reserved);

        assert!(pool.reserve().is_none());
        assert!(pool.all_exhausted());
    }

    #[test]
    fn test_provider_reported_exhaustion() {
        let pool = test_pool(2, 10);
        let reserved = pool.reserve().unwrap();
        pool.mark_exhausted(&reserved);
        pool.release(reserved);

        assert!(!pool.all_exhausted());
        let remaining = pool.reserve().unwrap();
        pool.mark_exhausted(&remaining);
        pool.release(remaining);
        assert!(pool.all_exhausted());
    }

    #[test]
    fn test_lazy_daily_reset() {
        let pool = test_pool(1, 1);
        let today = pool.local_today();
        let reserved = pool.reserve_on(today).unwrap();
        pool.record_success(&reserved);
        pool.release(reserved);
        assert!(pool.reserve_on(today).is_none());

        // Next day: counters roll over lazily on access
        let tomorrow = today + ChronoDuration::days(1);
        assert!(!pool.all_exhausted_on(tomorrow));
        let fresh = pool.reserve_on(tomorrow).unwrap();
        pool.release(fresh);
    }

    #[test]
    fn test_next_reset_is_in_the_future() {
        let pool = test_pool(1, 1);
        assert!(pool.next_reset_at() > Utc::now());
    }

    proptest! {
        /// Any interleaving of successes never drives a counter past quota
        #[test]
        fn prop_used_never_exceeds_quota(quota in 1u32..20, calls in 1usize..100) {
            let pool = test_pool(1, quota);
            for _ in 0..calls {
                if let Some(reserved) = pool.reserve() {
                    let used = pool.record_success(&reserved);
                    prop_assert!(used <= quota);
                    pool.release(reserved);
                }
            }
            let status = &pool.status()[0];
            prop_assert!(status.used_today <= quota);
        }
    }
}
