//! Bounded exponential backoff for sink delivery.

use std::time;

// ---

/// How often, and how far apart, a retryable delivery is attempted.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts per record, including the first.
    max_attempts: u32,
    /// Coefficient to multiply initial_interval with for every past attempt.
    backoff_coefficient: u32,
    /// The backoff interval before the first retry.
    initial_interval: time::Duration,
    /// Upper bound for any single backoff.
    maximum_interval: time::Duration,
}

impl RetryPolicy {
    // ---
    pub fn new(
        max_attempts: u32,
        backoff_coefficient: u32,
        initial_interval: time::Duration,
        maximum_interval: time::Duration,
    ) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            backoff_coefficient,
            initial_interval,
            maximum_interval,
        }
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Whether another attempt is allowed after `attempt` attempts have failed.
    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt < self.max_attempts
    }

    /// Backoff before the retry that follows failed attempt number `attempt` (1-based).
    pub fn time_until_next_retry(&self, attempt: u32) -> time::Duration {
        // ---
        let exponent = attempt.saturating_sub(1);
        let factor = self
            .backoff_coefficient
            .checked_pow(exponent)
            .unwrap_or(u32::MAX);

        self.initial_interval
            .checked_mul(factor)
            .map_or(self.maximum_interval, |candidate| {
                std::cmp::min(candidate, self.maximum_interval)
            })
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            backoff_coefficient: 2,
            initial_interval: time::Duration::from_millis(500),
            maximum_interval: time::Duration::from_secs(30),
        }
    }
}
