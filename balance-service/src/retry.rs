//! Retry policy for optimistic cache mutations

use std::time::Duration;

use rand::Rng;

/// Default attempt ceiling for a single optimistic mutation
pub const DEFAULT_MAX_ATTEMPTS: u32 = 100;

/// Bounded exponential backoff with full jitter.
///
/// The delay before retry `n` is drawn uniformly from
/// `[0, min(max_delay, base_delay * 2^(n-1))]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts including the first one
    pub max_attempts: u32,
    /// Backoff ceiling for the first retry
    pub base_delay: Duration,
    /// Upper bound on any single backoff
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(50),
        }
    }
}

impl RetryPolicy {
    /// Retry without any delay between attempts
    pub fn immediate(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
        }
    }

    /// Attempt ceiling, never lower than one
    pub fn attempts(&self) -> u32 {
        self.max_attempts.max(1)
    }

    /// Upper bound of the jitter window after `failed_attempts` conflicts
    pub fn backoff_ceiling(&self, failed_attempts: u32) -> Duration {
        let exponent = failed_attempts.saturating_sub(1).min(31);
        self.base_delay
            .checked_mul(1u32 << exponent)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }

    /// Jittered delay to wait before the next attempt
    pub fn backoff(&self, failed_attempts: u32) -> Duration {
        let ceiling = self.backoff_ceiling(failed_attempts);
        if ceiling.is_zero() {
            return Duration::ZERO;
        }

        let micros = ceiling.as_micros().min(u64::MAX as u128) as u64;
        Duration::from_micros(rand::thread_rng().gen_range(0..=micros))
    }
}
