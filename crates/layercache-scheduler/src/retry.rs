use std::time::Duration;

use serde::{Deserialize, Serialize};

use layercache_core::config::RetrySettings;

/// How often a failed rebuild is re-attempted within one dispatch.
///
/// Only rebuild failures are retried. A layer that cannot be resolved will
/// not appear by retrying, so resolution failures are final. Each retry is
/// a fresh executor attempt under the same dispatch: the job stays `Running`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total attempts including the first. Never below 1.
    pub max_attempts: u32,
    pub backoff: Duration,
}

impl RetryPolicy {
    /// Single attempt, no retry.
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            backoff: Duration::ZERO,
        }
    }

    pub fn fixed(max_attempts: u32, backoff: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            backoff,
        }
    }

    /// Whether another attempt may follow attempt number `attempt` (1-based).
    pub fn allows_retry_after(&self, attempt: u32) -> bool {
        attempt < self.max_attempts
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::none()
    }
}

impl From<&RetrySettings> for RetryPolicy {
    fn from(s: &RetrySettings) -> Self {
        if s.max_attempts <= 1 {
            return Self::none();
        }
        Self::fixed(s.max_attempts, Duration::from_millis(s.backoff_ms))
    }
}
