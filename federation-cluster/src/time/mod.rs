//! # Federation Time
//!
//! Wall-clock access for the federation. Every staleness and freshness decision is made
//! against the *receiving* node's clock, so components take a [`Clock`] instead of calling
//! `Utc::now()` directly. Tests drive a [`ManualClock`].

use chrono::{DateTime, TimeZone, Utc};
use parking_lot::Mutex;
use std::{fmt, sync::Arc, time::Duration};

/// Source of wall-clock time
pub trait Clock: Send + Sync + fmt::Debug {
    /// Current UTC time
    fn now(&self) -> DateTime<Utc>;
}

/// Shared clock handle passed between components
pub type SharedClock = Arc<dyn Clock>;

/// The operating system clock
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Manually advanced clock for deterministic tests and simulations
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    /// Create a clock frozen at the given instant
    pub fn new(start: DateTime<Utc>) -> Self {
        Self { now: Mutex::new(start) }
    }

    /// Create a clock frozen at the given Unix second
    pub fn at_unix(seconds: i64) -> Self {
        let start = Utc.timestamp_opt(seconds, 0).single().unwrap_or_else(Utc::now);
        Self::new(start)
    }

    /// Move the clock forward
    pub fn advance(&self, by: Duration) {
        let mut now = self.now.lock();
        *now += chrono::Duration::from_std(by).unwrap_or(chrono::Duration::zero());
    }

}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock()
    }
}

/// Elapsed time from `then` to `now`, clamped at zero when `then` lies in the future
pub fn elapsed_since(now: DateTime<Utc>, then: DateTime<Utc>) -> Duration {
    (now - then).to_std().unwrap_or(Duration::ZERO)
}

/// Whole Unix seconds for an instant; instants before 1970 clamp to zero
pub fn unix_seconds(instant: DateTime<Utc>) -> u64 {
    u64::try_from(instant.timestamp()).unwrap_or(0)
}

/// Convert a chrono instant plus a std duration, saturating on overflow
pub fn add_duration(instant: DateTime<Utc>, by: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(by)
        .ok()
        .and_then(|d| instant.checked_add_signed(d))
        .unwrap_or(instant)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_manual_clock_advance() {
        let clock = ManualClock::at_unix(1_700_000_000);
        let start = clock.now();

        clock.advance(Duration::from_secs(42));

        assert_eq!(elapsed_since(clock.now(), start), Duration::from_secs(42));
        assert_eq!(unix_seconds(clock.now()), 1_700_000_042);
    }

    #[test]
    fn test_elapsed_since_clamps_future() {
        let clock = ManualClock::at_unix(1_700_000_000);
        let future = add_duration(clock.now(), Duration::from_secs(10));

        assert_eq!(elapsed_since(clock.now(), future), Duration::ZERO);
    }

    #[test]
    fn test_system_clock_is_monotonic_enough() {
        let clock = SystemClock;
        let a = clock.now();
        let b = clock.now();
        assert!(b >= a);
    }
}
