//! Tunables injected into the scheduler core.

use std::time::Duration;

use super::retry::RetryPolicy;

/// Scheduler settings, resolved from config by the caller
#[derive(Debug, Clone, PartialEq)]
pub struct SchedulerSettings {
    /// Number of queue workers spawned by `spawn_workers`
    pub workers: usize,

    /// Longest wait for an entity lock before the attempt fails
    pub lock_timeout: Duration,

    /// Delay before a queued StartAction becomes runnable
    pub dispatch_delay: Duration,

    /// Upper bound on a single workflow engine call
    pub engine_timeout: Duration,

    /// Backoff for transient command failures
    pub retry: RetryPolicy,

    /// How often the materialization trigger scans for due jobs
    pub materialization_interval: Duration,

    /// How far past now each materialization window reaches
    pub materialization_lookahead: Duration,

    /// How often the readiness trigger scans for jobs with READY actions
    pub ready_check_interval: Duration,

    /// Action timeout (minutes) when the job sets none; -1 = never
    pub normal_timeout_minutes: i32,

    /// Action timeout (minutes) for catch-up actions; -1 = never
    pub catchup_timeout_minutes: i32,
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self {
            workers: 4,
            lock_timeout: Duration::from_secs(30),
            dispatch_delay: Duration::from_millis(100),
            engine_timeout: Duration::from_secs(30),
            retry: RetryPolicy::default(),
            materialization_interval: Duration::from_secs(300),
            materialization_lookahead: Duration::from_secs(3600),
            ready_check_interval: Duration::from_secs(60),
            normal_timeout_minutes: 120,
            catchup_timeout_minutes: -1,
        }
    }
}
