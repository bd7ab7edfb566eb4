//! Readiness scheduling and action start.
//!
//! `ActionReady` picks READY actions within the job's concurrency budget,
//! marks them SUBMITTED and queues a `StartAction` for each. `StartAction`
//! hands one SUBMITTED action to the workflow engine.

use std::time::Duration;

use async_trait::async_trait;
use tracing::{info, instrument, warn};

use crate::adapters::EngineError;
use crate::domain::{ActionStatus, CoordinatorAction, CoordinatorJob, JobStatus, SlaStatus};

use super::command::{Command, CommandContext, Handler, Skip};
use super::error::CommandError;

/// Dispatch a job's READY actions
pub(crate) struct ActionReady {
    pub job_id: String,
}

pub(crate) struct ReadyState {
    job: CoordinatorJob,
    /// `None` when concurrency is unlimited
    slots: Option<usize>,
}

/// Free dispatch slots for a job: `None` when `concurrency` is negative
pub fn available_slots(concurrency: i32, active: usize) -> Option<usize> {
    usize::try_from(concurrency)
        .ok()
        .map(|limit| limit.saturating_sub(active))
}

#[async_trait]
impl Handler for ActionReady {
    type State = ReadyState;

    async fn load_state(&self, ctx: &CommandContext) -> Result<ReadyState, CommandError> {
        let job = ctx.store().get_job(&self.job_id).await?;
        let active = ctx.store().count_running_or_submitted(&job.id).await?;
        let slots = available_slots(job.concurrency, active);
        Ok(ReadyState { job, slots })
    }

    fn verify_precondition(&self, state: &ReadyState) -> Result<(), Skip> {
        let job = &state.job;
        if job.status == JobStatus::Suspended || job.is_terminal() {
            return Err(Skip(format!("job {} is {}", job.id, job.status)));
        }
        if state.slots == Some(0) {
            warn!(
                job_id = %job.id,
                concurrency = job.concurrency,
                "No free concurrency slots, not dispatching"
            );
            return Err(Skip("concurrency limit reached".to_string()));
        }
        Ok(())
    }

    #[instrument(skip_all, fields(job_id = %state.job.id))]
    async fn execute(&self, ctx: &CommandContext, state: ReadyState) -> Result<(), CommandError> {
        let ReadyState { job, slots } = state;
        let ready = ctx
            .store()
            .get_ready_actions(&job.id, slots, job.execution_order)
            .await?;

        if ready.is_empty() {
            info!(job_id = %job.id, "No READY actions to dispatch");
            return Ok(());
        }

        let dispatch_delay = ctx.settings().dispatch_delay;
        let limit = slots.unwrap_or(usize::MAX);
        let mut dispatched = 0;
        for mut action in ready.into_iter().take(limit) {
            action.status = ActionStatus::Submitted;
            action.touch();
            // SUBMITTED is persisted before its start is queued
            ctx.store().update_action(&action).await?;
            ctx.queue(
                Command::StartAction {
                    action_id: action.id.clone(),
                    user: job.user.clone(),
                    auth_token: job.auth_token.clone(),
                },
                dispatch_delay,
            );
            dispatched += 1;
        }

        info!(
            job_id = %job.id,
            dispatched,
            order = %job.execution_order,
            "Dispatched READY actions"
        );
        Ok(())
    }
}

/// Submit one SUBMITTED action to the workflow engine
pub(crate) struct StartAction {
    pub action_id: String,
    pub user: String,
    pub auth_token: String,
}

pub(crate) struct StartState {
    job: CoordinatorJob,
    action: CoordinatorAction,
}

#[async_trait]
impl Handler for StartAction {
    type State = StartState;

    async fn load_state(&self, ctx: &CommandContext) -> Result<StartState, CommandError> {
        let action = ctx.store().get_action(&self.action_id).await?;
        let job = ctx.store().get_job(&action.job_id).await?;
        Ok(StartState { job, action })
    }

    fn verify_precondition(&self, state: &StartState) -> Result<(), Skip> {
        let action = &state.action;
        if action.status != ActionStatus::Submitted {
            return Err(Skip(format!("action {} is {}", action.id, action.status)));
        }
        if let Some(external_id) = &action.external_id {
            return Err(Skip(format!(
                "action {} already started as {}",
                action.id, external_id
            )));
        }
        if state.job.status == JobStatus::Suspended || state.job.is_terminal() {
            return Err(Skip(format!("job {} is {}", state.job.id, state.job.status)));
        }
        Ok(())
    }

    #[instrument(skip_all, fields(action_id = %self.action_id))]
    async fn execute(&self, ctx: &CommandContext, state: StartState) -> Result<(), CommandError> {
        let mut action = state.action;
        let timeout = ctx.settings().engine_timeout;

        let submitted = match tokio::time::timeout(
            timeout,
            ctx.engine().submit_and_start(
                &action.created_conf,
                &action.id,
                &self.user,
                &self.auth_token,
            ),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(EngineError::Timeout(timeout)),
        };

        match submitted {
            Ok(workflow_id) => {
                action.external_id = Some(workflow_id.clone());
                action.status = ActionStatus::Running;
                action.touch();
                ctx.store().update_action(&action).await?;
                info!(
                    action_id = %action.id,
                    workflow_id = %workflow_id,
                    engine = ctx.engine().name(),
                    "Action started"
                );
                ctx.record_sla(&action.id, SlaStatus::Started).await;
                Ok(())
            }
            // Left SUBMITTED without an external id so a retry passes the
            // precondition; the engine deduplicates on the action id
            Err(e) if e.is_transient() => Err(e.into()),
            Err(e) => {
                warn!(action_id = %action.id, error = %e, "Workflow engine rejected action");
                action.status = ActionStatus::Failed;
                action.touch();
                ctx.store().update_action(&action).await?;
                ctx.record_sla(&action.id, SlaStatus::Failed).await;
                ctx.queue(
                    Command::ActionReady {
                        job_id: action.job_id.clone(),
                    },
                    Duration::ZERO,
                );
                Ok(())
            }
        }
    }
}
