//! Backoff for commands that fail transiently.
//!
//! Attempts are numbered from 1. A command whose attempt `n` fails with a
//! retryable error runs again after `backoff(n)` while `n < max_attempts`.
//! The wait doubles from `first_backoff` and is capped at `max_backoff`.

use std::time::Duration;

use crate::config::SchedulerConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Attempts per command, the first one included
    pub max_attempts: u32,
    pub first_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            first_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    /// Policy from the `scheduler` config section; unset keys keep defaults
    pub fn from_config(config: &SchedulerConfig) -> Self {
        let defaults = Self::default();
        Self {
            max_attempts: config
                .max_attempts
                .map_or(defaults.max_attempts, |n| n.max(1)),
            first_backoff: config
                .initial_retry_delay_ms
                .map_or(defaults.first_backoff, Duration::from_millis),
            max_backoff: config
                .max_retry_delay_ms
                .map_or(defaults.max_backoff, Duration::from_millis),
        }
    }

    /// Whether a command that just failed `attempt` may run again
    pub fn allows_retry_after(&self, attempt: u32) -> bool {
        attempt < self.max_attempts
    }

    /// Wait before re-running a command that failed `attempt`
    pub fn backoff(&self, attempt: u32) -> Duration {
        let doublings = attempt.saturating_sub(1).min(31);
        self.first_backoff
            .saturating_mul(1u32 << doublings)
            .min(self.max_backoff)
    }
}
