//! Reconnect backoff policy.

use std::time::Duration;

use crate::config::SessionConfig;

const NANOS_PER_SEC: u128 = 1_000_000_000;

/// Exponential backoff with an upper bound.
///
/// `delay(attempt) = min(base * 2^attempt, max)`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    base: Duration,
    max: Duration,
}

impl BackoffPolicy {
    /// Create a policy from a base delay and a cap
    pub fn new(base: Duration, max: Duration) -> Self {
        Self { base, max }
    }

    /// Build from session configuration
    pub fn from_config(config: &SessionConfig) -> Self {
        Self::new(
            Duration::from_millis(config.reconnect_base_delay_ms),
            Duration::from_millis(config.reconnect_max_delay_ms),
        )
    }

    /// Base delay (attempt 0)
    pub fn base(&self) -> Duration {
        self.base
    }

    /// Delay cap
    pub fn max(&self) -> Duration {
        self.max
    }

    /// Delay before reconnect attempt number `attempt`
    pub fn delay(&self, attempt: u32) -> Duration {
        let base = self.base.as_nanos();
        if base == 0 {
            return Duration::ZERO;
        }
        // Shifting past the leading zeros loses bits, and such a value exceeds any Duration
        if attempt >= base.leading_zeros() {
            return self.max;
        }

        let scaled = base << attempt;
        if scaled >= self.max.as_nanos() {
            return self.max;
        }
        // Below the cap, so the whole seconds fit in u64
        Duration::new((scaled / NANOS_PER_SEC) as u64, (scaled % NANOS_PER_SEC) as u32)
    }
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self::new(Duration::from_secs(1), Duration::from_secs(30))
    }
}
