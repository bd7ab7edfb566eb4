//! Scheduler facade wiring the store, engine and SLA sink to the executor.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::task::JoinHandle;
use tracing::{info, instrument};

use crate::adapters::{InputCheck, NoInputDependencies, SlaError, SlaSink, WorkflowEngine};
use crate::domain::{CoordinatorAction, CoordinatorJob, JobStatus, SlaEvent, WorkflowStatus};
use crate::store::CoordinatorStore;

use super::command::{Command, Services};
use super::error::{CommandError, CommandFailure, Outcome};
use super::executor::CommandExecutor;
use super::query::{self, JobInfo};
use super::reconciler::terminal_mapping;
use super::settings::SchedulerSettings;

/// Coordinator job scheduler
pub struct Coordinator {
    executor: Arc<CommandExecutor>,
}

impl Coordinator {
    /// Create a scheduler whose ticks never wait on inputs
    pub fn new(
        store: Arc<dyn CoordinatorStore>,
        engine: Arc<dyn WorkflowEngine>,
        sla: Arc<dyn SlaSink>,
        settings: SchedulerSettings,
    ) -> Self {
        Self::with_input_check(store, engine, sla, Arc::new(NoInputDependencies), settings)
    }

    pub fn with_input_check(
        store: Arc<dyn CoordinatorStore>,
        engine: Arc<dyn WorkflowEngine>,
        sla: Arc<dyn SlaSink>,
        inputs: Arc<dyn InputCheck>,
        settings: SchedulerSettings,
    ) -> Self {
        let services = Services {
            store,
            engine,
            sla,
            inputs,
            settings,
        };
        Self {
            executor: Arc::new(CommandExecutor::new(services)),
        }
    }

    pub fn executor(&self) -> &Arc<CommandExecutor> {
        &self.executor
    }

    pub fn store(&self) -> &dyn CoordinatorStore {
        self.executor.services().store.as_ref()
    }

    pub fn settings(&self) -> &SchedulerSettings {
        &self.executor.services().settings
    }

    /// Persist a new job in PREP and return its id
    #[instrument(skip_all, fields(job_id = %job.id))]
    pub async fn submit_job(&self, mut job: CoordinatorJob) -> Result<String, CommandError> {
        if job.id.trim().is_empty() {
            return Err(CommandError::Validation("job id must not be empty".to_string()));
        }
        if job.frequency == 0 {
            return Err(CommandError::Validation("frequency must be positive".to_string()));
        }
        if job.end_time <= job.start_time {
            return Err(CommandError::Validation(format!(
                "end {} is not after start {}",
                job.end_time, job.start_time
            )));
        }
        job.tz().map_err(CommandError::Validation)?;

        job.status = JobStatus::Prep;
        job.touch();
        self.store().insert_job(&job).await?;
        info!(job_id = %job.id, app = %job.app_name, "Submitted coordinator job");
        Ok(job.id)
    }

    /// Materialize a job's ticks in `[window_start, window_end)`
    pub async fn materialize(
        &self,
        job_id: &str,
        window_start: DateTime<Utc>,
        window_end: DateTime<Utc>,
    ) -> Result<Outcome, CommandError> {
        self.executor
            .run_with_retry(&Command::Materialize {
                job_id: job_id.to_string(),
                window_start,
                window_end,
            })
            .await
    }

    /// Dispatch a job's READY actions within its concurrency limit
    pub async fn schedule_ready(&self, job_id: &str) -> Result<Outcome, CommandError> {
        self.executor
            .run_with_retry(&Command::ActionReady {
                job_id: job_id.to_string(),
            })
            .await
    }

    /// Reconcile a workflow status change reported by the engine
    #[instrument(skip(self))]
    pub async fn workflow_status_changed(
        &self,
        workflow_id: &str,
        status: WorkflowStatus,
    ) -> Result<Outcome, CommandError> {
        if workflow_id.trim().is_empty() {
            return Err(CommandError::Validation("workflow id must not be empty".to_string()));
        }

        let Some(action) = self.store().get_action_for_external_id(workflow_id).await? else {
            if terminal_mapping(&status).is_none() {
                info!(workflow_id, "No coordinator action for workflow, ignoring");
                return Ok(Outcome::Skipped(format!(
                    "no action tracks workflow {}",
                    workflow_id
                )));
            }
            // A start still holding its job lock has not saved the workflow id
            let delay = self.settings().retry.backoff(1);
            info!(
                workflow_id,
                delay_ms = delay.as_millis() as u64,
                "No coordinator action for terminal workflow yet, re-checking later"
            );
            self.queue(
                Command::ReconcileWorkflow {
                    workflow_id: workflow_id.to_string(),
                    status,
                },
                delay,
            );
            return Ok(Outcome::Skipped(format!(
                "no action tracks workflow {} yet, re-checking",
                workflow_id
            )));
        };

        self.executor
            .run_with_retry(&Command::UpdateAction {
                job_id: action.job_id,
                action_id: action.id,
                workflow_id: workflow_id.to_string(),
                status,
            })
            .await
    }

    /// Mark a WAITING action READY once its inputs are available
    pub async fn resolve_inputs(&self, action_id: &str) -> Result<Outcome, CommandError> {
        self.executor
            .run_with_retry(&Command::ResolveInputs {
                action_id: action_id.to_string(),
            })
            .await
    }

    pub async fn job_info(
        &self,
        job_id: &str,
        start: usize,
        len: usize,
    ) -> Result<JobInfo, CommandError> {
        query::get_job_info(self.store(), job_id, start, len).await
    }

    pub async fn action_info(&self, action_id: &str) -> Result<CoordinatorAction, CommandError> {
        query::get_action_info(self.store(), action_id).await
    }

    /// SLA events after `seq_id` (at most `limit`) and the last sequence id
    pub async fn sla_events_since(
        &self,
        seq_id: u64,
        limit: usize,
    ) -> Result<(Vec<SlaEvent>, u64), SlaError> {
        self.executor.services().sla.events_since(seq_id, limit).await
    }

    /// Queue a command for the workers
    pub fn queue(&self, command: Command, delay: Duration) {
        self.executor.queue().push(command, delay);
    }

    /// Drain the queue in the calling task
    pub async fn run_until_idle(&self) -> usize {
        self.executor.run_until_idle().await
    }

    pub fn dead_letters(&self) -> Vec<CommandFailure> {
        self.executor.dead_letters()
    }

    /// Spawn the configured number of queue workers
    pub fn spawn_workers(&self) -> Vec<JoinHandle<()>> {
        self.executor.spawn_workers(self.settings().workers)
    }

    /// Spawn the periodic materialization and readiness scans
    pub fn spawn_triggers(&self) -> Vec<JoinHandle<()>> {
        let settings = self.settings();
        let lookahead = chrono::Duration::from_std(settings.materialization_lookahead)
            .unwrap_or_else(|_| chrono::Duration::zero());
        let materialization_interval = settings.materialization_interval;
        let ready_interval = settings.ready_check_interval;

        let materialize = {
            let executor = Arc::clone(&self.executor);
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(materialization_interval);
                loop {
                    ticker.tick().await;
                    executor.queue().push(
                        Command::MaterializationScan {
                            until: Utc::now() + lookahead,
                        },
                        Duration::ZERO,
                    );
                }
            })
        };

        let ready = {
            let executor = Arc::clone(&self.executor);
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(ready_interval);
                loop {
                    ticker.tick().await;
                    executor.queue().push(Command::ReadyScan, Duration::ZERO);
                }
            })
        };

        vec![materialize, ready]
    }
}
