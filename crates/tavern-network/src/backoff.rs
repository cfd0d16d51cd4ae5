//! Reconnection delay policy

use std::time::Duration;

/// Exponential backoff with a ceiling and an attempt budget
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackoffConfig {
    /// Delay before the first retry
    pub base: Duration,
    /// Upper bound on any single delay
    pub cap: Duration,
    /// Retries allowed before giving up
    pub max_attempts: u32,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            base: Duration::from_secs(1),
            cap: Duration::from_secs(30),
            max_attempts: 10,
        }
    }
}

impl BackoffConfig {
    /// `min(base * 2^(attempt-1), cap)`; attempt numbering starts at 1
    pub fn delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1);
        let factor = 1u32.checked_shl(exponent).unwrap_or(u32::MAX);
        self.base.saturating_mul(factor).min(self.cap)
    }

    /// Whether `attempt` is still within budget
    pub fn allows(&self, attempt: u32) -> bool {
        attempt <= self.max_attempts
    }
}
