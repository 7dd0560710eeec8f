//! Producer rate limiting.
//!
//! In-memory fixed window per producer with a burst allowance on top of the
//! quota. Checks never block: a producer over its limit is told when to retry.
//! Limits are advisory per process; correctness never depends on them.

use crate::clock::SharedClock;
use crate::error::RateLimitError;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

/// Configuration for rate limiting.
#[derive(Debug, Clone)]
pub struct RateLimitConfig {
    /// Maximum requests per window.
    pub max_requests: u32,
    /// Window duration.
    pub window: Duration,
    /// Extra requests above `max_requests` before a hard reject.
    pub burst: u32,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            max_requests: 120,
            window: Duration::from_secs(60),
            burst: 30,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateLimitDecision {
    Allowed { remaining: u32 },
    BurstUsed { remaining: u32 },
    Exceeded { retry_after: Duration },
}

struct WindowEntry {
    count: u32,
    window_start_ms: i64,
}

/// Per-producer limiter shared by all handlers.
#[derive(Clone)]
pub struct RateLimiter {
    config: RateLimitConfig,
    overrides: Arc<HashMap<String, u32>>,
    clock: SharedClock,
    state: Arc<Mutex<HashMap<String, WindowEntry>>>,
}

impl RateLimiter {
    pub fn new(config: RateLimitConfig, clock: SharedClock) -> Self {
        Self {
            config,
            overrides: Arc::new(HashMap::new()),
            clock,
            state: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Per-producer quotas replacing `max_requests`.
    pub fn with_overrides(mut self, overrides: HashMap<String, u32>) -> Self {
        self.overrides = Arc::new(overrides);
        self
    }

    fn quota(&self, producer_id: &str) -> u32 {
        self.overrides
            .get(producer_id)
            .copied()
            .unwrap_or(self.config.max_requests)
    }

    /// Count one request against the producer's current window.
    pub fn evaluate(&self, producer_id: &str) -> RateLimitDecision {
        let now = self.clock.now_millis();
        let window_ms = self.config.window.as_millis() as i64;
        let quota = self.quota(producer_id);

        let mut state = self.state.lock();
        let entry = state
            .entry(producer_id.to_string())
            .or_insert(WindowEntry {
                count: 0,
                window_start_ms: now,
            });

        // Reset window if expired
        if now - entry.window_start_ms >= window_ms {
            entry.count = 0;
            entry.window_start_ms = now;
        }

        entry.count = entry.count.saturating_add(1);

        let limit = quota.saturating_add(self.config.burst);
        let remaining = limit.saturating_sub(entry.count);

        if entry.count > limit {
            let reset_in = (entry.window_start_ms + window_ms - now).max(0) as u64;
            RateLimitDecision::Exceeded {
                retry_after: Duration::from_millis(reset_in),
            }
        } else if entry.count > quota {
            RateLimitDecision::BurstUsed { remaining }
        } else {
            RateLimitDecision::Allowed { remaining }
        }
    }

    pub fn allow(&self, producer_id: &str) -> bool {
        !matches!(
            self.evaluate(producer_id),
            RateLimitDecision::Exceeded { .. }
        )
    }

    pub fn check(&self, producer_id: &str) -> Result<(), RateLimitError> {
        match self.evaluate(producer_id) {
            RateLimitDecision::Exceeded { retry_after } => {
                warn!(
                    producer_id,
                    retry_after_secs = retry_after.as_secs(),
                    "Rate limit exceeded"
                );
                let whole_secs = RateLimitError { retry_after }.retry_after_secs();
                Err(RateLimitError {
                    retry_after: Duration::from_secs(whole_secs),
                })
            }
            _ => Ok(()),
        }
    }

    /// Drop windows idle for two full windows. Returns the number removed.
    pub fn cleanup(&self) -> usize {
        let now = self.clock.now_millis();
        let idle_ms = 2 * self.config.window.as_millis() as i64;

        let mut state = self.state.lock();
        let before = state.len();
        state.retain(|_, entry| now - entry.window_start_ms < idle_ms);
        before - state.len()
    }

    pub fn tracked_producers(&self) -> usize {
        self.state.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;

    fn limiter(max_requests: u32, burst: u32) -> (RateLimiter, ManualClock) {
        let clock = ManualClock::from_unix_secs(1_700_000_000);
        let config = RateLimitConfig {
            max_requests,
            window: Duration::from_secs(60),
            burst,
        };
        (RateLimiter::new(config, Arc::new(clock.clone())), clock)
    }

    #[test]
    fn allows_quota_then_burst_then_rejects() {
        let (limiter, _clock) = limiter(5, 3);

        for _ in 0..5 {
            assert!(matches!(
                limiter.evaluate("alpha"),
                RateLimitDecision::Allowed { .. }
            ));
        }
        for _ in 0..3 {
            assert!(matches!(
                limiter.evaluate("alpha"),
                RateLimitDecision::BurstUsed { .. }
            ));
        }
        let err = limiter.check("alpha").unwrap_err();
        assert_eq!(err.retry_after, Duration::from_secs(60));
    }

    #[test]
    fn producers_are_isolated_and_windows_reset() {
        let (limiter, clock) = limiter(1, 0);
        assert!(limiter.allow("alpha"));
        assert!(!limiter.allow("alpha"));
        assert!(limiter.allow("beta"));

        clock.advance(chrono::Duration::seconds(60));
        assert!(limiter.allow("alpha"));
    }

    #[test]
    fn overrides_replace_default_quota() {
        let (limiter, _clock) = limiter(1, 0);
        let limiter = limiter.with_overrides(HashMap::from([("vip".to_string(), 3)]));

        assert!((0..3).all(|_| limiter.allow("vip")));
        assert!(!limiter.allow("vip"));
    }

    #[test]
    fn cleanup_drops_idle_windows() {
        let (limiter, clock) = limiter(10, 0);
        limiter.allow("alpha");
        clock.advance(chrono::Duration::seconds(90));
        limiter.allow("beta");
        clock.advance(chrono::Duration::seconds(40));

        assert_eq!(limiter.cleanup(), 1);
        assert_eq!(limiter.tracked_producers(), 1);
    }
}
