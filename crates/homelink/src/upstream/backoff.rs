//! Reconnect policy: capped exponential back-off plus one-shot penalties.

use std::time::Duration;

/// Delay before the first reconnect attempt.
pub const BASE_DELAY: Duration = Duration::from_secs(1);

/// Cap applied to the exponential part of the delay.
pub const MAX_DELAY: Duration = Duration::from_secs(15 * 60);

/// Extra delay after the server refused our credentials.
pub const UNAUTHORIZED_PENALTY: Duration = Duration::from_secs(2 * 60);

/// Extra delay after the server asked us to slow down.
pub const RATE_LIMIT_PENALTY: Duration = Duration::from_secs(10);

#[derive(Debug, Default)]
pub struct Backoff {
    attempts: u32,
    penalty: Duration,
}

impl Backoff {
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Add a penalty to the next delay. Penalties do not stack; the larger wins.
    pub fn penalize(&mut self, penalty: Duration) {
        self.penalty = self.penalty.max(penalty);
    }

    /// Delay for the next attempt. Consumes the penalty and counts the attempt.
    pub fn next_delay(&mut self) -> Duration {
        let delay = exponential_delay(self.attempts) + std::mem::take(&mut self.penalty);
        self.attempts = self.attempts.saturating_add(1);
        delay
    }

    /// Forget previous failures once a connection has proven stable.
    pub fn reset(&mut self) {
        self.attempts = 0;
        self.penalty = Duration::ZERO;
    }
}

/// `min(BASE_DELAY * 2^attempt, MAX_DELAY)`
fn exponential_delay(attempt: u32) -> Duration {
    2u32.checked_pow(attempt)
        .and_then(|factor| BASE_DELAY.checked_mul(factor))
        .map_or(MAX_DELAY, |delay| delay.min(MAX_DELAY))
}
