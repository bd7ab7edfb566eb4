//! Shared fixtures for the integration tests.

#![allow(dead_code)]

use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};

use cadence::adapters::{EngineError, MemorySlaLog, WorkflowEngine};
use cadence::core::RetryPolicy;
use cadence::domain::action_id;
use cadence::{
    ActionStatus, CoordinatorAction, CoordinatorJob, CoordinatorStore, Coordinator,
    ExecutionOrder, JobStatus, MemoryStore, SchedulerSettings, StoreError, TimeUnit,
};

/// 2009-02-01 at `hour:minute` UTC
pub fn at(hour: u32, minute: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2009, 2, 1, hour, minute, 0).unwrap()
}

/// Settings with no dispatch delay and millisecond retry backoff
pub fn test_settings() -> SchedulerSettings {
    SchedulerSettings {
        workers: 2,
        lock_timeout: Duration::from_secs(2),
        dispatch_delay: Duration::ZERO,
        engine_timeout: Duration::from_secs(2),
        retry: RetryPolicy {
            max_attempts: 3,
            first_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(5),
        },
        ..Default::default()
    }
}

/// Workflow engine double that records submissions.
///
/// Returns `wf-<action id>` so repeated submissions of one action yield the
/// same workflow id.
#[derive(Default)]
pub struct RecordingEngine {
    calls: Mutex<Vec<String>>,
    reject: Mutex<HashSet<String>>,
    delay: Duration,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl RecordingEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Engine whose calls take `delay` to complete
    pub fn slow(delay: Duration) -> Self {
        Self {
            delay,
            ..Self::default()
        }
    }

    pub fn reject(&self, action_id: &str) {
        self.reject.lock().unwrap().insert(action_id.to_string());
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    /// Highest number of calls observed running at once
    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }
}

pub fn workflow_id_for(action_id: &str) -> String {
    format!("wf-{}", action_id)
}

#[async_trait]
impl WorkflowEngine for RecordingEngine {
    fn name(&self) -> &str {
        "recording"
    }

    async fn submit_and_start(
        &self,
        _conf: &str,
        action_id: &str,
        _user: &str,
        _auth_token: &str,
    ) -> Result<String, EngineError> {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        self.calls.lock().unwrap().push(action_id.to_string());
        if self.reject.lock().unwrap().contains(action_id) {
            return Err(EngineError::Rejected(format!("bad conf for {}", action_id)));
        }
        Ok(workflow_id_for(action_id))
    }
}

/// Store whose `get_job` is unavailable for the first `failures` calls
pub struct FlakyStore {
    inner: MemoryStore,
    failures: AtomicUsize,
}

impl FlakyStore {
    pub fn new(failures: usize) -> Self {
        Self {
            inner: MemoryStore::new(),
            failures: AtomicUsize::new(failures),
        }
    }
}

#[async_trait]
impl CoordinatorStore for FlakyStore {
    async fn insert_job(&self, job: &CoordinatorJob) -> Result<(), StoreError> {
        self.inner.insert_job(job).await
    }

    async fn get_job(&self, job_id: &str) -> Result<CoordinatorJob, StoreError> {
        let remaining = self.failures.load(Ordering::SeqCst);
        if remaining > 0 {
            self.failures.store(remaining - 1, Ordering::SeqCst);
            return Err(StoreError::Unavailable("database restarting".to_string()));
        }
        self.inner.get_job(job_id).await
    }

    async fn update_job(&self, job: &CoordinatorJob) -> Result<(), StoreError> {
        self.inner.update_job(job).await
    }

    async fn get_action(&self, action_id: &str) -> Result<CoordinatorAction, StoreError> {
        self.inner.get_action(action_id).await
    }

    async fn get_action_for_external_id(
        &self,
        external_id: &str,
    ) -> Result<Option<CoordinatorAction>, StoreError> {
        self.inner.get_action_for_external_id(external_id).await
    }

    async fn get_ready_actions(
        &self,
        job_id: &str,
        limit: Option<usize>,
        order: ExecutionOrder,
    ) -> Result<Vec<CoordinatorAction>, StoreError> {
        self.inner.get_ready_actions(job_id, limit, order).await
    }

    async fn count_running_or_submitted(&self, job_id: &str) -> Result<usize, StoreError> {
        self.inner.count_running_or_submitted(job_id).await
    }

    async fn insert_actions(
        &self,
        job_id: &str,
        actions: &[CoordinatorAction],
    ) -> Result<(), StoreError> {
        self.inner.insert_actions(job_id, actions).await
    }

    async fn update_action(&self, action: &CoordinatorAction) -> Result<(), StoreError> {
        self.inner.update_action(action).await
    }

    async fn get_actions_subset(
        &self,
        job_id: &str,
        start: usize,
        len: usize,
    ) -> Result<Vec<CoordinatorAction>, StoreError> {
        self.inner.get_actions_subset(job_id, start, len).await
    }

    async fn list_jobs_to_materialize(
        &self,
        before: DateTime<Utc>,
    ) -> Result<Vec<String>, StoreError> {
        self.inner.list_jobs_to_materialize(before).await
    }

    async fn list_jobs_pending_completion(&self) -> Result<Vec<String>, StoreError> {
        self.inner.list_jobs_pending_completion().await
    }

    async fn list_jobs_with_ready_actions(&self) -> Result<Vec<String>, StoreError> {
        self.inner.list_jobs_with_ready_actions().await
    }

    async fn list_stalled_starts(
        &self,
        modified_before: DateTime<Utc>,
    ) -> Result<Vec<CoordinatorAction>, StoreError> {
        self.inner.list_stalled_starts(modified_before).await
    }
}

/// Coordinator over in-memory collaborators, with handles to each
pub struct Harness {
    pub coordinator: Coordinator,
    pub store: Arc<MemoryStore>,
    pub engine: Arc<RecordingEngine>,
    pub sla: Arc<MemorySlaLog>,
}

pub fn harness() -> Harness {
    harness_with(RecordingEngine::new(), test_settings())
}

pub fn harness_with(engine: RecordingEngine, settings: SchedulerSettings) -> Harness {
    let store = Arc::new(MemoryStore::new());
    let engine = Arc::new(engine);
    let sla = Arc::new(MemorySlaLog::new());
    let coordinator = Coordinator::new(store.clone(), engine.clone(), sla.clone(), settings);
    Harness {
        coordinator,
        store,
        engine,
        sla,
    }
}

/// Every-5-minutes job starting 10:00 on 2009-02-01, ending at `end`
pub fn five_minute_job(end: DateTime<Utc>) -> CoordinatorJob {
    let mut job = CoordinatorJob::new("test-app", "test-user", at(10, 0), end, 5, TimeUnit::Minute);
    job.time_zone = "America/Los_Angeles".to_string();
    job.auth_token = "notoken".to_string();
    job
}

/// Insert a RUNNING job with `ready` READY actions, one per tick
pub async fn job_with_ready_actions(
    store: &dyn CoordinatorStore,
    ready: u32,
    concurrency: i32,
    order: ExecutionOrder,
) -> CoordinatorJob {
    let mut job = five_minute_job(at(12, 0));
    job.concurrency = concurrency;
    job.execution_order = order;
    job.status = JobStatus::Running;
    job.last_action_number = ready;
    store.insert_job(&job).await.unwrap();

    let actions: Vec<CoordinatorAction> = (1..=ready)
        .map(|n| CoordinatorAction::new(&job.id, n, at(10, 5 * (n - 1)), ActionStatus::Ready))
        .collect();
    store.insert_actions(&job.id, &actions).await.unwrap();
    job
}

/// Put action `n` of `job_id` into `status`, optionally tracking a workflow
pub async fn set_action(
    store: &dyn CoordinatorStore,
    job_id: &str,
    n: u32,
    status: ActionStatus,
    external_id: Option<&str>,
) {
    let mut action = store.get_action(&action_id(job_id, n)).await.unwrap();
    action.status = status;
    action.external_id = external_id.map(str::to_string);
    store.update_action(&action).await.unwrap();
}

pub async fn statuses(store: &dyn CoordinatorStore, job_id: &str) -> Vec<ActionStatus> {
    store
        .get_actions(job_id)
        .await
        .unwrap()
        .into_iter()
        .map(|a| a.status)
        .collect()
}
