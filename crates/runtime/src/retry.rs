//! Retry policy keyed to the error taxonomy.
//!
//! Transient failures may resolve with time, resource failures with reduced
//! contention; code and auth failures are deterministic for the same input,
//! so retrying them only wastes the caller's time.

use crate::error::ErrorCategory;
use std::time::Duration;

/// Decision for one failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Wait this long, then try again.
    Retry(Duration),
    /// Surface the error to the caller.
    GiveUp,
}

/// Exponential-backoff retry policy with per-category attempt ceilings.
///
/// Delay for attempt `n` (1-based) is `base * 2^(n-1)`, capped at the
/// category's maximum delay.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_transient_attempts: u32,
    pub max_resource_attempts: u32,
    pub base_delay: Duration,
    pub max_transient_delay: Duration,
    pub max_resource_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_transient_attempts: 5,
            max_resource_attempts: 3,
            base_delay: Duration::from_secs(1),
            max_transient_delay: Duration::from_secs(60),
            max_resource_delay: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    /// Decide whether attempt `attempt` (1-based, counting the attempt that
    /// just failed) should be followed by another.
    pub fn decide(&self, category: ErrorCategory, attempt: u32) -> RetryDecision {
        let (ceiling, cap) = match category {
            ErrorCategory::Transient => (self.max_transient_attempts, self.max_transient_delay),
            ErrorCategory::Resource => (self.max_resource_attempts, self.max_resource_delay),
            _ => return RetryDecision::GiveUp,
        };

        if attempt >= ceiling {
            return RetryDecision::GiveUp;
        }

        RetryDecision::Retry(self.backoff(attempt).min(cap))
    }

    fn backoff(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(30);
        self.base_delay.saturating_mul(1u32 << exponent)
    }
}
