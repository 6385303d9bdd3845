//! Injectable time source
//!
//! Routing, receipts and rate limiting all reason about wall-clock time;
//! tests drive them through a manual clock instead of sleeping.

use chrono::{DateTime, NaiveDate, Utc};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

/// Wall-clock abstraction used by every time-dependent component
pub trait Clock: Send + Sync {
    /// Milliseconds since the Unix epoch
    fn now_millis(&self) -> u64;

    /// Seconds since the Unix epoch
    fn now_secs(&self) -> u64 {
        self.now_millis() / 1000
    }

    /// Current UTC calendar day
    fn today_utc(&self) -> NaiveDate {
        DateTime::<Utc>::from_timestamp(self.now_secs() as i64, 0)
            .map(|dt| dt.date_naive())
            .unwrap_or_else(|| Utc::now().date_naive())
    }
}

/// System time backed clock
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_millis(&self) -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0)
    }
}

/// Manually advanced clock for deterministic tests
#[derive(Debug, Default)]
pub struct ManualClock {
    millis: AtomicU64,
}

impl ManualClock {
    pub fn new(start_millis: u64) -> Self {
        Self {
            millis: AtomicU64::new(start_millis),
        }
    }

    /// Move time forward
    pub fn advance(&self, millis: u64) {
        self.millis.fetch_add(millis, Ordering::SeqCst);
    }

    /// Jump to an absolute timestamp
    pub fn set(&self, millis: u64) {
        self.millis.store(millis, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_millis(&self) -> u64 {
        self.millis.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_manual_clock_advance() {
        let clock = ManualClock::new(1_000);
        assert_eq!(clock.now_millis(), 1_000);
        clock.advance(500);
        assert_eq!(clock.now_millis(), 1_500);
        assert_eq!(clock.now_secs(), 1);
    }

    #[test]
    fn test_day_boundary() {
        // 2024-01-01T23:59:59Z
        let clock = ManualClock::new(1_704_153_599_000);
        let before = clock.today_utc();
        clock.advance(2_000);
        let after = clock.today_utc();
        assert_ne!(before, after);
    }
}
