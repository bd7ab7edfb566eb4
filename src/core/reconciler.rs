//! Workflow status reconciliation.
//!
//! Maps the status of a dispatched workflow onto the coordinator action that
//! started it. Terminal statuses are copied onto the action, recorded in the
//! SLA log, and free a concurrency slot, so readiness is re-triggered.

use std::time::Duration;

use async_trait::async_trait;
use tracing::{info, instrument, warn};

use crate::domain::{ActionStatus, CoordinatorAction, SlaStatus, WorkflowStatus};

use super::command::{Command, CommandContext, Handler, Skip};
use super::error::CommandError;

/// Action status and SLA status for a terminal workflow status
pub fn terminal_mapping(status: &WorkflowStatus) -> Option<(ActionStatus, SlaStatus)> {
    match status {
        WorkflowStatus::Succeeded => Some((ActionStatus::Succeeded, SlaStatus::Succeeded)),
        WorkflowStatus::Failed => Some((ActionStatus::Failed, SlaStatus::Failed)),
        WorkflowStatus::Killed => Some((ActionStatus::Killed, SlaStatus::Killed)),
        _ => None,
    }
}

/// Apply a workflow status to its action
pub(crate) struct UpdateAction {
    pub action_id: String,
    pub workflow_id: String,
    pub status: WorkflowStatus,
}

#[async_trait]
impl Handler for UpdateAction {
    type State = CoordinatorAction;

    async fn load_state(&self, ctx: &CommandContext) -> Result<CoordinatorAction, CommandError> {
        Ok(ctx.store().get_action(&self.action_id).await?)
    }

    fn verify_precondition(&self, action: &CoordinatorAction) -> Result<(), Skip> {
        if action.external_id.as_deref() != Some(self.workflow_id.as_str()) {
            return Err(Skip(format!(
                "action {} is not tracking workflow {}",
                action.id, self.workflow_id
            )));
        }
        if action.is_terminal() {
            return Err(Skip(format!("action {} is already {}", action.id, action.status)));
        }
        Ok(())
    }

    #[instrument(skip_all, fields(action_id = %action.id, workflow_id = %self.workflow_id))]
    async fn execute(&self, ctx: &CommandContext, mut action: CoordinatorAction) -> Result<(), CommandError> {
        if let Some((action_status, sla_status)) = terminal_mapping(&self.status) {
            action.status = action_status;
            action.touch();
            ctx.store().update_action(&action).await?;
            info!(
                action_id = %action.id,
                workflow_id = %self.workflow_id,
                status = %action.status,
                "Action finished"
            );

            ctx.record_sla(&action.id, sla_status).await;
            ctx.queue(
                Command::ActionReady {
                    job_id: action.job_id.clone(),
                },
                Duration::ZERO,
            );
            return Ok(());
        }

        match &self.status {
            WorkflowStatus::Running | WorkflowStatus::Suspended => {}
            other => warn!(
                action_id = %action.id,
                workflow_id = %self.workflow_id,
                status = %other,
                "Unexpected workflow status, only refreshing action"
            ),
        }
        action.touch();
        ctx.store().update_action(&action).await?;
        Ok(())
    }
}

/// Resolve a workflow id to its action, then queue `UpdateAction` under
/// that action's job lock
pub(crate) struct ReconcileWorkflow {
    pub workflow_id: String,
    pub status: WorkflowStatus,
}

#[async_trait]
impl Handler for ReconcileWorkflow {
    type State = CoordinatorAction;

    async fn load_state(&self, ctx: &CommandContext) -> Result<CoordinatorAction, CommandError> {
        ctx.store()
            .get_action_for_external_id(&self.workflow_id)
            .await?
            .ok_or_else(|| CommandError::UntrackedWorkflow(self.workflow_id.clone()))
    }

    fn verify_precondition(&self, _action: &CoordinatorAction) -> Result<(), Skip> {
        Ok(())
    }

    async fn execute(&self, ctx: &CommandContext, action: CoordinatorAction) -> Result<(), CommandError> {
        info!(
            action_id = %action.id,
            workflow_id = %self.workflow_id,
            "Workflow now tracked, applying deferred status"
        );
        ctx.queue(
            Command::UpdateAction {
                job_id: action.job_id,
                action_id: action.id,
                workflow_id: self.workflow_id.clone(),
                status: self.status.clone(),
            },
            Duration::ZERO,
        );
        Ok(())
    }
}
