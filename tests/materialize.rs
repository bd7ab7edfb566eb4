//! Integration tests for action materialization.
//!
//! A job ticking every 5 minutes from 10:00 with an exclusive end at 10:14
//! has ticks at 10:00, 10:05 and 10:10.

mod common;

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio_test::assert_ok;

use cadence::adapters::{InputCheck, MemorySlaLog};
use cadence::domain::SlaAppType;
use cadence::{
    ActionStatus, CoordinatorJob, CoordinatorStore, Coordinator, JobStatus, MemoryStore, Outcome,
    SchedulerSettings, SlaStatus, TimeUnit,
};

use common::{at, five_minute_job, harness, harness_with, statuses, test_settings, RecordingEngine};

async fn materialize_with_pause(pause: Option<DateTime<Utc>>) -> (common::Harness, CoordinatorJob) {
    let h = harness();
    let mut job = five_minute_job(at(10, 14));
    job.pause_time = pause;
    let job_id = h.coordinator.submit_job(job).await.unwrap();

    let outcome = h.coordinator.materialize(&job_id, at(10, 0), at(10, 14)).await.unwrap();
    assert_eq!(outcome, Outcome::Executed);

    let job = h.store.get_job(&job_id).await.unwrap();
    (h, job)
}

#[tokio::test]
async fn test_materializes_contiguous_ticks() {
    let (h, job) = materialize_with_pause(None).await;

    let actions = h.store.get_actions(&job.id).await.unwrap();
    let numbers: Vec<u32> = actions.iter().map(|a| a.action_number).collect();
    let nominal: Vec<_> = actions.iter().map(|a| a.nominal_time).collect();
    assert_eq!(numbers, vec![1, 2, 3]);
    assert_eq!(nominal, vec![at(10, 0), at(10, 5), at(10, 10)]);
    assert!(actions.iter().all(|a| a.status == ActionStatus::Ready));
    assert_eq!(actions[1].id, format!("{}@2", job.id));

    assert_eq!(job.status, JobStatus::Running);
    assert_eq!(job.last_action_number, 3);
    assert_eq!(job.last_action_time, Some(at(10, 10)));
    assert_eq!(job.next_materialized_time, Some(at(10, 15)));
    assert!(job.done_materialization);
}

#[tokio::test]
async fn test_pause_after_first_tick_yields_one_action() {
    let (h, job) = materialize_with_pause(Some(at(10, 4))).await;

    assert_eq!(h.store.get_actions(&job.id).await.unwrap().len(), 1);
    assert_eq!(job.status, JobStatus::Paused);
    assert_eq!(job.next_materialized_time, Some(at(10, 5)));
    assert!(!job.done_materialization);
}

#[tokio::test]
async fn test_pause_after_second_tick_yields_two_actions() {
    let (h, job) = materialize_with_pause(Some(at(10, 8))).await;

    assert_eq!(h.store.get_actions(&job.id).await.unwrap().len(), 2);
    assert_eq!(job.status, JobStatus::Paused);
    assert_eq!(job.last_action_time, Some(at(10, 5)));
}

#[tokio::test]
async fn test_pause_before_window_yields_nothing_and_runs() {
    let (h, job) = materialize_with_pause(Some(at(9, 58))).await;

    assert!(h.store.get_actions(&job.id).await.unwrap().is_empty());
    assert_eq!(job.status, JobStatus::Running);
    assert_eq!(job.last_action_number, 0);
    assert_eq!(job.next_materialized_time, Some(at(10, 0)));
    assert!(h.sla.events().await.is_empty());
}

#[tokio::test]
async fn test_job_paused_before_first_tick_is_not_rescanned() {
    let (h, job) = materialize_with_pause(Some(at(9, 58))).await;
    assert!(h.store.list_jobs_to_materialize(at(11, 0)).await.unwrap().is_empty());

    h.coordinator.queue(
        cadence::Command::MaterializationScan { until: at(11, 0) },
        Duration::ZERO,
    );
    // Only the scan runs; no materialization is queued for the held job
    assert_eq!(h.coordinator.run_until_idle().await, 1);
    let after = h.store.get_job(&job.id).await.unwrap();
    assert_eq!(after.last_modified_time, job.last_modified_time);
}

#[tokio::test]
async fn test_late_window_skips_earlier_ticks() {
    let h = harness();
    let job_id = h.coordinator.submit_job(five_minute_job(at(10, 14))).await.unwrap();

    h.coordinator.materialize(&job_id, at(10, 10), at(10, 14)).await.unwrap();

    let actions = h.store.get_actions(&job_id).await.unwrap();
    let nominal: Vec<_> = actions.iter().map(|a| (a.action_number, a.nominal_time)).collect();
    assert_eq!(nominal, vec![(1, at(10, 10))]);
    let job = h.store.get_job(&job_id).await.unwrap();
    assert_eq!(job.next_materialized_time, Some(at(10, 15)));
    assert!(job.done_materialization);
}

#[tokio::test]
async fn test_pause_on_tick_excludes_that_tick() {
    let (h, job) = materialize_with_pause(Some(at(10, 5))).await;

    assert_eq!(h.store.get_actions(&job.id).await.unwrap().len(), 1);
    assert_eq!(job.status, JobStatus::Paused);
}

#[tokio::test]
async fn test_empty_window_is_a_no_op() {
    let h = harness();
    let job_id = h.coordinator.submit_job(five_minute_job(at(10, 14))).await.unwrap();

    let outcome = h.coordinator.materialize(&job_id, at(10, 0), at(10, 0)).await.unwrap();
    assert!(matches!(outcome, Outcome::Skipped(_)));

    let job = h.store.get_job(&job_id).await.unwrap();
    assert_eq!(job.status, JobStatus::Prep);
    assert!(h.store.get_actions(&job_id).await.unwrap().is_empty());
    assert!(h.coordinator.executor().queue().is_empty());
}

#[tokio::test]
async fn test_window_before_start_keeps_job_premater() {
    let h = harness();
    let job_id = h.coordinator.submit_job(five_minute_job(at(10, 14))).await.unwrap();

    assert_ok!(h.coordinator.materialize(&job_id, at(9, 0), at(9, 30)).await);

    let job = h.store.get_job(&job_id).await.unwrap();
    assert_eq!(job.status, JobStatus::Premater);
    assert!(h.store.get_actions(&job_id).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_consecutive_windows_continue_numbering() {
    let h = harness();
    let job_id = h.coordinator.submit_job(five_minute_job(at(10, 14))).await.unwrap();

    h.coordinator.materialize(&job_id, at(10, 0), at(10, 7)).await.unwrap();
    let job = h.store.get_job(&job_id).await.unwrap();
    assert_eq!(job.last_action_number, 2);
    assert!(!job.done_materialization);

    h.coordinator.materialize(&job_id, at(10, 7), at(10, 14)).await.unwrap();
    // Re-running an already materialized window adds nothing
    h.coordinator.materialize(&job_id, at(10, 0), at(10, 14)).await.unwrap();

    let actions = h.store.get_actions(&job_id).await.unwrap();
    let numbers: Vec<u32> = actions.iter().map(|a| a.action_number).collect();
    assert_eq!(numbers, vec![1, 2, 3]);
    assert!(actions.windows(2).all(|w| w[0].nominal_time < w[1].nominal_time));
}

#[tokio::test]
async fn test_created_sla_event_per_action() {
    let (h, job) = materialize_with_pause(None).await;

    let events = h.sla.events().await;
    assert_eq!(events.len(), 3);
    assert!(events.iter().all(|e| e.status == SlaStatus::Created));
    assert!(events.iter().all(|e| e.app_type == SlaAppType::CoordinatorAction));
    assert_eq!(events[0].sla_id, format!("{}@1", job.id));
}

#[tokio::test]
async fn test_materialization_queues_readiness() {
    let (h, job) = materialize_with_pause(None).await;

    let queue = h.coordinator.executor().queue();
    assert_eq!(queue.len(), 1);

    // Draining dispatches the first action (concurrency 1)
    h.coordinator.run_until_idle().await;
    assert_eq!(
        statuses(h.store.as_ref(), &job.id).await,
        vec![ActionStatus::Running, ActionStatus::Ready, ActionStatus::Ready]
    );
    assert_eq!(h.engine.calls(), vec![format!("{}@1", job.id)]);
}

#[tokio::test]
async fn test_catchup_actions_use_catchup_timeout() {
    let settings = SchedulerSettings {
        catchup_timeout_minutes: 30,
        normal_timeout_minutes: 120,
        ..test_settings()
    };
    let h = harness_with(RecordingEngine::new(), settings);
    let job_id = h.coordinator.submit_job(five_minute_job(at(10, 14))).await.unwrap();
    h.coordinator.materialize(&job_id, at(10, 0), at(10, 14)).await.unwrap();

    let actions = h.store.get_actions(&job_id).await.unwrap();
    assert!(actions.iter().all(|a| a.timeout_minutes == 30));
}

#[tokio::test]
async fn test_current_actions_use_job_or_default_timeout() {
    let h = harness();
    let start = Utc::now() + chrono::Duration::hours(1);
    let mut job = CoordinatorJob::new("app", "user", start, start + chrono::Duration::hours(1), 5, TimeUnit::Minute);
    job.timeout_minutes = Some(15);
    let with_timeout = h.coordinator.submit_job(job).await.unwrap();

    let job = CoordinatorJob::new("app", "user", start, start + chrono::Duration::hours(1), 5, TimeUnit::Minute);
    let without_timeout = h.coordinator.submit_job(job).await.unwrap();

    let end = start + chrono::Duration::minutes(12);
    h.coordinator.materialize(&with_timeout, start, end).await.unwrap();
    h.coordinator.materialize(&without_timeout, start, end).await.unwrap();

    let actions = h.store.get_actions(&with_timeout).await.unwrap();
    assert_eq!(actions.len(), 3);
    assert!(actions.iter().all(|a| a.timeout_minutes == 15));

    let actions = h.store.get_actions(&without_timeout).await.unwrap();
    assert!(actions.iter().all(|a| a.timeout_minutes == 120));
}

#[tokio::test]
async fn test_terminal_job_is_not_materialized() {
    let h = harness();
    let mut job = five_minute_job(at(10, 14));
    let job_id = h.coordinator.submit_job(job.clone()).await.unwrap();
    job.status = JobStatus::Killed;
    h.store.update_job(&job).await.unwrap();

    let outcome = h.coordinator.materialize(&job_id, at(10, 0), at(10, 14)).await.unwrap();
    assert!(matches!(outcome, Outcome::Skipped(_)));
    assert!(h.store.get_actions(&job_id).await.unwrap().is_empty());
}

/// Every tick waits on data until told otherwise
struct AlwaysWaiting;

impl InputCheck for AlwaysWaiting {
    fn has_unresolved_inputs(&self, _job: &CoordinatorJob, _nominal_time: DateTime<Utc>) -> bool {
        true
    }
}

#[tokio::test]
async fn test_waiting_actions_become_ready_when_inputs_resolve() {
    let store = Arc::new(MemoryStore::new());
    let engine = Arc::new(RecordingEngine::new());
    let coordinator = Coordinator::with_input_check(
        store.clone(),
        engine.clone(),
        Arc::new(MemorySlaLog::new()),
        Arc::new(AlwaysWaiting),
        test_settings(),
    );

    let job_id = coordinator.submit_job(five_minute_job(at(10, 14))).await.unwrap();
    coordinator.materialize(&job_id, at(10, 0), at(10, 14)).await.unwrap();
    assert_eq!(statuses(store.as_ref(), &job_id).await, vec![ActionStatus::Waiting; 3]);
    // Nothing is READY, so no readiness check was queued
    assert!(coordinator.executor().queue().is_empty());

    let first = format!("{}@1", job_id);
    assert_eq!(coordinator.resolve_inputs(&first).await.unwrap(), Outcome::Executed);
    assert!(matches!(coordinator.resolve_inputs(&first).await.unwrap(), Outcome::Skipped(_)));

    coordinator.run_until_idle().await;
    assert_eq!(
        statuses(store.as_ref(), &job_id).await,
        vec![ActionStatus::Running, ActionStatus::Waiting, ActionStatus::Waiting]
    );
    assert_eq!(engine.calls(), vec![first]);
}

#[tokio::test]
async fn test_scan_materializes_due_jobs() {
    let h = harness();
    let job_id = h.coordinator.submit_job(five_minute_job(at(10, 14))).await.unwrap();

    h.coordinator.queue(
        cadence::Command::MaterializationScan {
            until: at(11, 0),
        },
        Duration::ZERO,
    );
    h.coordinator.run_until_idle().await;

    let job = h.store.get_job(&job_id).await.unwrap();
    assert_eq!(job.last_action_number, 3);
    assert!(job.done_materialization);
    assert!(h.coordinator.dead_letters().is_empty());
}
