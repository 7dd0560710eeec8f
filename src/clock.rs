//! Clock Source
//!
//! Injectable wall clock. Every skew, expiry and TTL decision in the gateway reads
//! time through [`ClockSource`] so tests can pin and advance it deterministically.

use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;
use std::sync::Arc;

/// Source of "now" for the approval pipeline.
pub trait ClockSource: Send + Sync {
    fn now(&self) -> DateTime<Utc>;

    /// Current time in Unix milliseconds (the storage representation).
    #[inline]
    fn now_millis(&self) -> i64 {
        self.now().timestamp_millis()
    }
}

/// Shared handle used by every component.
pub type SharedClock = Arc<dyn ClockSource>;

/// Real system clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl ClockSource for SystemClock {
    #[inline]
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Manually driven clock for tests and replays.
///
/// Clones share the same underlying instant, so a test can hold one handle
/// and advance time seen by every component.
#[derive(Debug, Clone)]
pub struct ManualClock {
    current: Arc<Mutex<DateTime<Utc>>>,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            current: Arc::new(Mutex::new(start)),
        }
    }

    /// Clock pinned to a Unix timestamp in seconds.
    pub fn from_unix_secs(secs: i64) -> Self {
        Self::new(DateTime::from_timestamp(secs, 0).unwrap_or_default())
    }

    pub fn advance(&self, by: Duration) {
        let mut current = self.current.lock();
        *current += by;
    }

    pub fn set(&self, to: DateTime<Utc>) {
        *self.current.lock() = to;
    }
}

impl ClockSource for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.current.lock()
    }
}

/// Convert Unix milliseconds back into a UTC timestamp.
pub fn from_millis(ms: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(ms).unwrap_or_default()
}
