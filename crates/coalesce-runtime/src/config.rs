//! Queue configuration.

use std::time::Duration;

use crate::error::QueueError;

/// Requests that may wait in the backlog before producers are refused.
pub const DEFAULT_QUEUE_CAPACITY: usize = 64;

/// Time an unused resource stays open before its wake lock expires.
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(3);

/// Interval at which the worker checks for expired wake locks.
pub const DEFAULT_TICK_INTERVAL: Duration = Duration::from_millis(100);

/// Backend open attempts for transient failures, first attempt included.
pub const DEFAULT_OPEN_ATTEMPTS: u32 = 3;

/// Base delay between open attempts; grows linearly per attempt.
pub const DEFAULT_RETRY_BACKOFF: Duration = Duration::from_millis(50);

/// Retry behaviour for transient open failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, first one included
    pub max_attempts: u32,
    /// Base delay; attempt `n` waits `n * backoff` before retrying
    pub backoff: Duration,
}

impl RetryPolicy {
    /// Single attempt, no retries.
    pub fn none() -> Self {
        Self { max_attempts: 1, backoff: Duration::ZERO }
    }

    /// Delay after failed attempt number `attempt` (1-based).
    pub fn delay(&self, attempt: u32) -> Duration {
        self.backoff.saturating_mul(attempt)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self { max_attempts: DEFAULT_OPEN_ATTEMPTS, backoff: DEFAULT_RETRY_BACKOFF }
    }
}

/// Queue configuration
#[derive(Debug, Clone)]
pub struct QueueConfig {
    /// Bounded backlog size
    pub capacity: usize,
    /// Wake lock duration for idle resources
    pub idle_timeout: Duration,
    /// Wake lock check interval
    pub tick_interval: Duration,
    /// Open retry policy
    pub retry: RetryPolicy,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            capacity: DEFAULT_QUEUE_CAPACITY,
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
            tick_interval: DEFAULT_TICK_INTERVAL,
            retry: RetryPolicy::default(),
        }
    }
}

impl QueueConfig {
    /// Check the configuration before spawning a worker.
    pub fn validate(&self) -> Result<(), QueueError> {
        if self.capacity == 0 {
            return Err(QueueError::Config("capacity must be at least 1".to_string()));
        }
        if self.tick_interval.is_zero() {
            return Err(QueueError::Config("tick_interval must be non-zero".to_string()));
        }
        if self.retry.max_attempts == 0 {
            return Err(QueueError::Config("retry.max_attempts must be at least 1".to_string()));
        }
        Ok(())
    }
}
