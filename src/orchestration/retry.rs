//! Retry policy for tool invocations.
//!
//! Only transient failures ([`ToolError::Transient`] and timeouts) are
//! retried. Permanent failures and unknown tools end the task on the first
//! attempt. The delay between attempts doubles from `base_delay` and never
//! exceeds `max_delay`; there is no jitter, so paused-clock tests see exact
//! delays.

use std::time::Duration;

use crate::error::ToolError;

/// Exponential backoff for transient tool failures.
///
/// `max_attempts` counts every call, including the first. The delay after
/// failed attempt `n` is `base_delay * 2^(n-1)`, capped at `max_delay`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(10),
        }
    }
}

impl RetryPolicy {
    /// One attempt, no retries.
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    /// Backoff before the attempt following failed attempt `attempt` (1-based).
    pub fn delay_after(&self, attempt: u32) -> Duration {
        let factor = 1u32
            .checked_shl(attempt.saturating_sub(1))
            .unwrap_or(u32::MAX);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }

    /// Whether `err` on attempt `attempt` earns another try.
    pub fn should_retry(&self, attempt: u32, err: &ToolError) -> bool {
        err.is_transient() && attempt < self.max_attempts
    }
}
