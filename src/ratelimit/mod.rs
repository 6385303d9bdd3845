//! Per-identity daily send limits
//!
//! Three free messages per UTC day; submitting a Solana transaction
//! unlocks unlimited sends until midnight. Records persist through the
//! secure store so restarts cannot reset the counter.

use crate::clock::Clock;
use crate::store::{rate_limit_key, SecureStore, StoreError};
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Free messages per identity per UTC day
pub const DAILY_MESSAGE_LIMIT: u16 = 3;

/// Persisted per-identity record
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitRecord {
    pub identity: String,
    pub day: NaiveDate,
    pub messages_sent_today: u16,
    pub unlocked_today: bool,
    pub last_tx_at: Option<u64>,
}

impl RateLimitRecord {
    fn fresh(identity: &str, day: NaiveDate) -> Self {
        Self {
            identity: identity.to_string(),
            day,
            messages_sent_today: 0,
            unlocked_today: false,
            last_tx_at: None,
        }
    }
}

/// Snapshot reported to callers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitStatus {
    pub remaining: u16,
    pub unlocked: bool,
    /// Unix seconds of the next midnight-UTC reset
    pub resets_at: u64,
}

/// Daily send counter backed by the secure store
pub struct RateLimitStore {
    store: Arc<dyn SecureStore>,
    clock: Arc<dyn Clock>,
    daily_limit: u16,
}

impl RateLimitStore {
    pub fn new(store: Arc<dyn SecureStore>, clock: Arc<dyn Clock>) -> Self {
        Self {
            store,
            clock,
            daily_limit: DAILY_MESSAGE_LIMIT,
        }
    }

    pub fn with_limit(mut self, daily_limit: u16) -> Self {
        self.daily_limit = daily_limit;
        self
    }

    /// Whether the identity may send right now
    pub fn can_send(&self, identity: &str) -> Result<bool, StoreError> {
        let record = self.load(identity)?;
        Ok(record.unlocked_today || record.messages_sent_today < self.daily_limit)
    }

    /// Count one send; returns false (and counts nothing) when denied
    pub fn record_send(&self, identity: &str) -> Result<bool, StoreError> {
        let mut record = self.load(identity)?;
        if !record.unlocked_today && record.messages_sent_today >= self.daily_limit {
            tracing::debug!(
                "send denied for {}: {}/{} used, not unlocked",
                identity,
                record.messages_sent_today,
                self.daily_limit
            );
            return Ok(false);
        }
        record.messages_sent_today = record.messages_sent_today.saturating_add(1);
        self.save(&record)?;
        Ok(true)
    }

    /// A transaction was submitted today; lift the cap until midnight
    ///
    /// Idempotent within a day.
    pub fn unlock_today(&self, identity: &str) -> Result<(), StoreError> {
        let mut record = self.load(identity)?;
        record.last_tx_at = Some(self.clock.now_secs());
        if !record.unlocked_today {
            record.unlocked_today = true;
            tracing::info!("rate limit unlocked for {} until midnight UTC", identity);
        }
        self.save(&record)
    }

    pub fn status(&self, identity: &str) -> Result<RateLimitStatus, StoreError> {
        let record = self.load(identity)?;
        let remaining = self
            .daily_limit
            .saturating_sub(record.messages_sent_today);
        Ok(RateLimitStatus {
            remaining,
            unlocked: record.unlocked_today,
            resets_at: next_midnight_utc(record.day),
        })
    }

    /// Load the record, rolling counters over at the day boundary
    fn load(&self, identity: &str) -> Result<RateLimitRecord, StoreError> {
        let today = self.clock.today_utc();
        match self.store.get(&rate_limit_key(identity)) {
            Ok(bytes) => {
                let record: RateLimitRecord = serde_json::from_slice(&bytes)
                    .map_err(|e| StoreError::Corrupt(format!("rate limit record: {e}")))?;
                if record.day == today {
                    Ok(record)
                } else {
                    tracing::debug!("rate limit day rollover for {}", identity);
                    Ok(RateLimitRecord {
                        last_tx_at: record.last_tx_at,
                        ..RateLimitRecord::fresh(identity, today)
                    })
                }
            }
            Err(StoreError::NotFound) => Ok(RateLimitRecord::fresh(identity, today)),
            Err(e) => Err(e),
        }
    }

    fn save(&self, record: &RateLimitRecord) -> Result<(), StoreError> {
        let bytes = serde_json::to_vec(record)
            .map_err(|e| StoreError::Corrupt(format!("rate limit record: {e}")))?;
        self.store.set(&rate_limit_key(&record.identity), &bytes)
    }
}

fn next_midnight_utc(day: NaiveDate) -> u64 {
    day.succ_opt()
        .and_then(|next| next.and_hms_opt(0, 0, 0))
        .map(|dt| dt.and_utc().timestamp() as u64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::store::MemorySecureStore;

    // 2024-06-15T12:00:00Z
    const NOON: u64 = 1_718_452_800_000;

    fn setup() -> (RateLimitStore, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(NOON));
        let store = RateLimitStore::new(
            Arc::new(MemorySecureStore::new()),
            clock.clone() as Arc<dyn Clock>,
        );
        (store, clock)
    }

    #[test]
    fn test_daily_limit_enforced() {
        let (store, _clock) = setup();
        for _ in 0..DAILY_MESSAGE_LIMIT {
            assert!(store.record_send("alice").unwrap());
        }
        assert!(!store.can_send("alice").unwrap());
        assert!(!store.record_send("alice").unwrap());

        let status = store.status("alice").unwrap();
        assert_eq!(status.remaining, 0);
        assert!(!status.unlocked);
    }

    #[test]
    fn test_unlock_lifts_cap() {
        let (store, _clock) = setup();
        for _ in 0..DAILY_MESSAGE_LIMIT {
            store.record_send("alice").unwrap();
        }
        assert!(!store.can_send("alice").unwrap());

        store.unlock_today("alice").unwrap();
        assert!(store.can_send("alice").unwrap());
        assert!(store.record_send("alice").unwrap());

        // Idempotent
        store.unlock_today("alice").unwrap();
        assert!(store.status("alice").unwrap().unlocked);
    }

    #[test]
    fn test_midnight_rollover_resets() {
        let (store, clock) = setup();
        for _ in 0..DAILY_MESSAGE_LIMIT {
            store.record_send("alice").unwrap();
        }
        store.unlock_today("alice").unwrap();

        // Cross midnight UTC
        clock.advance(13 * 60 * 60 * 1000);
        let status = store.status("alice").unwrap();
        assert_eq!(status.remaining, DAILY_MESSAGE_LIMIT);
        assert!(!status.unlocked);
        assert!(store.record_send("alice").unwrap());
    }

    #[test]
    fn test_identities_independent() {
        let (store, _clock) = setup();
        for _ in 0..DAILY_MESSAGE_LIMIT {
            store.record_send("alice").unwrap();
        }
        assert!(!store.can_send("alice").unwrap());
        assert!(store.can_send("bob").unwrap());
    }

    #[test]
    fn test_resets_at_is_next_midnight() {
        let (store, _clock) = setup();
        let status = store.status("alice").unwrap();
        // 2024-06-16T00:00:00Z
        assert_eq!(status.resets_at, 1_718_496_000);
    }
}
