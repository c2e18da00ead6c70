//! Admission decisions.

use std::time::Duration;

/// The outcome of one admission check.
#[derive(Debug, Clone, PartialEq)]
pub struct Decision {
    /// Whether the request may proceed
    pub allowed: bool,
    /// Configured limit (requests per window, or bucket capacity)
    pub limit: u64,
    /// Requests still available after this one
    pub remaining: u64,
    /// When the quota replenishes, in Unix milliseconds
    pub reset_at_ms: u64,
    /// How long a rejected caller should wait before retrying
    pub retry_after: Option<Duration>,
}

impl Decision {
    /// An admitted request.
    pub fn allow(limit: u64, remaining: u64, reset_at_ms: u64) -> Self {
        Self {
            allowed: true,
            limit,
            remaining,
            reset_at_ms,
            retry_after: None,
        }
    }

    /// A rejected request.
    pub fn reject(limit: u64, reset_at_ms: u64, retry_after: Duration) -> Self {
        Self {
            allowed: false,
            limit,
            remaining: 0,
            reset_at_ms,
            retry_after: Some(retry_after),
        }
    }

    /// Admission granted because the limiter's state could not be consulted.
    pub fn fail_open(limit: u64, now_ms: u64) -> Self {
        Self::allow(limit, limit, now_ms)
    }

    /// Reset time as a Unix timestamp in whole seconds, rounded up.
    pub fn reset_at_secs(&self) -> u64 {
        self.reset_at_ms.div_ceil(1000)
    }

    /// Retry delay in whole seconds, rounded up.
    pub fn retry_after_secs(&self) -> Option<u64> {
        self.retry_after
            .map(|d| d.as_secs().saturating_add(u64::from(d.subsec_nanos() > 0)))
    }
}
