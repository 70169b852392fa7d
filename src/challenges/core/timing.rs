//! Retry and backoff policy used by the request executor.
//!
//! Backoff is a fixed delay with no jitter or exponential growth; request volumes
//! per host are low and every retry budget is hard-bounded.

use std::time::Duration;

pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(5);
pub const DEFAULT_BACKOFF: Duration = Duration::from_millis(333);
pub const DEFAULT_MAX_RATE_LIMIT_WAIT: Duration = Duration::from_secs(10);
pub const DEFAULT_SERVER_ERROR_RETRIES: u32 = 3;
pub const DEFAULT_TIMEOUT_RETRIES: u32 = 1;

/// Bounds applied to a single logical fetch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Deadline for one transport attempt.
    pub request_timeout: Duration,
    /// Fixed pause between retries of 5xx and timed out attempts.
    pub backoff: Duration,
    /// Longest `Retry-After` (or stored rate-limit window) the executor sleeps through.
    pub max_rate_limit_wait: Duration,
    pub max_server_error_retries: u32,
    pub max_timeout_retries: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            backoff: DEFAULT_BACKOFF,
            max_rate_limit_wait: DEFAULT_MAX_RATE_LIMIT_WAIT,
            max_server_error_retries: DEFAULT_SERVER_ERROR_RETRIES,
            max_timeout_retries: DEFAULT_TIMEOUT_RETRIES,
        }
    }
}

impl RetryPolicy {
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn with_backoff(mut self, backoff: Duration) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn retries_server_error(&self, attempt: u32) -> bool {
        attempt < self.max_server_error_retries
    }

    pub fn retries_timeout(&self, attempt: u32) -> bool {
        attempt < self.max_timeout_retries
    }

    /// Rate-limit waits are only slept through on the first attempt.
    pub fn waits_for_rate_limit(&self, attempt: u32, wait: Duration) -> bool {
        attempt == 0 && wait <= self.max_rate_limit_wait
    }
}
