//! Engine configuration.

use std::time::Duration;

/// Bounded exponential backoff for compare-and-set conflicts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, including the first
    pub max_attempts: u32,
    /// Delay before the second attempt
    pub initial_backoff: Duration,
    /// Upper bound on any single delay
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_backoff: Duration::from_millis(25),
            max_backoff: Duration::from_secs(1),
        }
    }
}

impl RetryPolicy {
    /// Create the default policy.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the attempt budget (at least one attempt is always made).
    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts.max(1);
        self
    }

    /// Set the initial delay.
    pub fn with_initial_backoff(mut self, delay: Duration) -> Self {
        self.initial_backoff = delay;
        self
    }

    /// Set the delay cap.
    pub fn with_max_backoff(mut self, delay: Duration) -> Self {
        self.max_backoff = delay;
        self
    }

    /// Delay to wait after `attempt` (1-based) failed.
    pub fn backoff_after(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.initial_backoff.saturating_mul(factor).min(self.max_backoff)
    }
}

/// Configuration shared by the merge engine, controller and poller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineConfig {
    /// Conflict retry policy
    pub retry: RetryPolicy,
    /// Executor target passed with every submission (e.g. cluster name)
    pub executor_target: String,
    /// Persist RUNNING/PENDING on the record while polling
    pub persist_transient_status: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            retry: RetryPolicy::default(),
            executor_target: "default".to_string(),
            persist_transient_status: false,
        }
    }
}

impl EngineConfig {
    /// Create the default configuration.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the retry policy.
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Set the executor target.
    pub fn with_executor_target(mut self, target: impl Into<String>) -> Self {
        self.executor_target = target.into();
        self
    }

    /// Persist transient executor statuses on the record.
    pub fn with_persist_transient_status(mut self, persist: bool) -> Self {
        self.persist_transient_status = persist;
        self
    }
}
