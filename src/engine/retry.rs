//! Exponential backoff for failed send attempts.

use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};

use crate::config::DispatcherConfig;

/// Retry budget and backoff for queue entries.
///
/// After failed attempt `n` the entry waits `base * 2^(n-1)`: 5s, 10s, 20s
/// with the default base. Once `attempts >= max_attempts` the entry is
/// finalized as failed instead.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    base: Duration,
    max_attempts: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(Duration::from_secs(5), 3)
    }
}

impl RetryPolicy {
    /// Create a policy.
    pub fn new(base: Duration, max_attempts: u32) -> Self {
        Self { base, max_attempts }
    }

    /// Policy from dispatcher configuration.
    pub fn from_config(config: &DispatcherConfig) -> Self {
        Self::new(
            Duration::from_secs(config.backoff_base_secs),
            config.max_attempts,
        )
    }

    /// Attempts allowed per entry.
    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Whether an entry with `attempts` started attempts may not retry.
    pub fn is_exhausted(&self, attempts: u32) -> bool {
        attempts >= self.max_attempts
    }

    /// Delay after failed attempt number `attempts` (1-based).
    pub fn next_delay(&self, attempts: u32) -> Duration {
        let exponent = attempts.saturating_sub(1).min(31);
        let factor = 1_u32.checked_shl(exponent).unwrap_or(u32::MAX);
        self.base.saturating_mul(factor)
    }

    /// When the next attempt may start, measured from `now`.
    pub fn next_retry_at(&self, attempts: u32, now: DateTime<Utc>) -> DateTime<Utc> {
        TimeDelta::from_std(self.next_delay(attempts))
            .ok()
            .and_then(|delay| now.checked_add_signed(delay))
            .unwrap_or(DateTime::<Utc>::MAX_UTC)
    }
}
