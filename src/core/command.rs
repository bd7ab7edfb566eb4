//! Scheduler commands and the phases every command goes through.
//!
//! A command is a unit of work against one coordinator job. It names the
//! entity it locks, validates its parameters before any lock is taken, and
//! is executed by a handler in three phases:
//! 1. `load_state`: read what the command needs, under the lock
//! 2. `verify_precondition`: decide whether the command still applies
//! 3. `execute`: mutate and persist, possibly queueing follow-up commands

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::adapters::{InputCheck, SlaSink, WorkflowEngine};
use crate::domain::{parse_action_id, SlaAppType, SlaStatus, WorkflowStatus};
use crate::store::CoordinatorStore;

use super::error::CommandError;
use super::queue::CommandQueue;
use super::settings::SchedulerSettings;

/// Work items understood by the executor
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "command", rename_all = "snake_case")]
pub enum Command {
    /// Create actions for ticks in `[window_start, window_end)`
    Materialize {
        job_id: String,
        window_start: DateTime<Utc>,
        window_end: DateTime<Utc>,
    },

    /// Dispatch READY actions up to the job's concurrency limit
    ActionReady { job_id: String },

    /// Submit one SUBMITTED action to the workflow engine
    StartAction {
        action_id: String,
        user: String,
        auth_token: String,
    },

    /// Apply a workflow status change to the action that dispatched it
    UpdateAction {
        job_id: String,
        action_id: String,
        workflow_id: String,
        status: WorkflowStatus,
    },

    /// Find the action that started `workflow_id` and queue its update;
    /// fails retryably while no action tracks the workflow
    ReconcileWorkflow {
        workflow_id: String,
        status: WorkflowStatus,
    },

    /// Move a WAITING action to READY once its inputs exist
    ResolveInputs { action_id: String },

    /// Queue materialization for every job due before `until`
    MaterializationScan { until: DateTime<Utc> },

    /// Queue readiness for every job holding READY actions and restart
    /// SUBMITTED actions whose start never ran
    ReadyScan,
}

impl Command {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Materialize { .. } => "materialize",
            Self::ActionReady { .. } => "action_ready",
            Self::StartAction { .. } => "start_action",
            Self::UpdateAction { .. } => "update_action",
            Self::ReconcileWorkflow { .. } => "reconcile_workflow",
            Self::ResolveInputs { .. } => "resolve_inputs",
            Self::MaterializationScan { .. } => "materialization_scan",
            Self::ReadyScan => "ready_scan",
        }
    }

    /// Id of the job this command locks; `None` for global scans and for
    /// workflow lookups, whose job is not known yet
    pub fn entity_key(&self) -> Option<String> {
        match self {
            Self::Materialize { job_id, .. }
            | Self::ActionReady { job_id }
            | Self::UpdateAction { job_id, .. } => Some(job_id.clone()),
            Self::StartAction { action_id, .. } | Self::ResolveInputs { action_id } => {
                parse_action_id(action_id).map(|(job_id, _)| job_id.to_string())
            }
            Self::ReconcileWorkflow { .. } | Self::MaterializationScan { .. } | Self::ReadyScan => {
                None
            }
        }
    }

    pub fn lock_required(&self) -> bool {
        self.entity_key().is_some()
    }

    /// Parameter checks performed before any lock is taken
    pub fn validate(&self) -> Result<(), CommandError> {
        match self {
            Self::Materialize {
                job_id,
                window_start,
                window_end,
            } => {
                require("job id", job_id)?;
                if window_start > window_end {
                    return Err(CommandError::Validation(format!(
                        "window start {} is after window end {}",
                        window_start, window_end
                    )));
                }
            }
            Self::ActionReady { job_id } => require("job id", job_id)?,
            Self::StartAction { action_id, user, .. } => {
                require_action_id(action_id)?;
                require("user", user)?;
            }
            Self::UpdateAction {
                job_id,
                action_id,
                workflow_id,
                ..
            } => {
                require("job id", job_id)?;
                require_action_id(action_id)?;
                require("workflow id", workflow_id)?;
            }
            Self::ReconcileWorkflow { workflow_id, .. } => require("workflow id", workflow_id)?,
            Self::ResolveInputs { action_id } => require_action_id(action_id)?,
            Self::MaterializationScan { .. } | Self::ReadyScan => {}
        }
        Ok(())
    }
}

fn require(what: &str, value: &str) -> Result<(), CommandError> {
    if value.trim().is_empty() {
        return Err(CommandError::Validation(format!("{} must not be empty", what)));
    }
    Ok(())
}

fn require_action_id(action_id: &str) -> Result<(), CommandError> {
    require("action id", action_id)?;
    if parse_action_id(action_id).is_none() {
        return Err(CommandError::Validation(format!(
            "malformed action id: {}",
            action_id
        )));
    }
    Ok(())
}

/// Lifecycle of one command attempt, reported in traces
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandPhase {
    Created,
    LockAcquired,
    PreconditionChecked,
    Skipped,
    Executed,
    Failed,
    LockReleased,
}

/// Collaborators shared by every handler
pub struct Services {
    pub store: Arc<dyn CoordinatorStore>,
    pub engine: Arc<dyn WorkflowEngine>,
    pub sla: Arc<dyn SlaSink>,
    pub inputs: Arc<dyn InputCheck>,
    pub settings: SchedulerSettings,
}

/// What a handler sees while it runs
pub struct CommandContext {
    services: Arc<Services>,
    queue: CommandQueue,
}

impl CommandContext {
    pub(crate) fn new(services: Arc<Services>, queue: CommandQueue) -> Self {
        Self { services, queue }
    }

    pub fn store(&self) -> &dyn CoordinatorStore {
        self.services.store.as_ref()
    }

    pub fn engine(&self) -> &dyn WorkflowEngine {
        self.services.engine.as_ref()
    }

    pub fn inputs(&self) -> &dyn InputCheck {
        self.services.inputs.as_ref()
    }

    pub fn settings(&self) -> &SchedulerSettings {
        &self.services.settings
    }

    /// Queue a follow-up command; it runs after this one releases its lock
    pub fn queue(&self, command: Command, delay: Duration) {
        self.queue.push(command, delay);
    }

    /// Append a coordinator-action SLA event.
    ///
    /// The state change it describes is already persisted, so a failing sink
    /// is logged rather than failing the command.
    pub async fn record_sla(&self, action_id: &str, status: SlaStatus) {
        if let Err(e) = self
            .services
            .sla
            .append(action_id, status, SlaAppType::CoordinatorAction)
            .await
        {
            tracing::error!(action_id, ?status, error = %e, "Failed to append SLA event");
        }
    }
}

/// Outcome of the precondition phase when the command no longer applies
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Skip(pub String);

/// Phased body of a command
#[async_trait]
pub trait Handler: Send + Sync {
    type State: Send;

    async fn load_state(&self, ctx: &CommandContext) -> Result<Self::State, CommandError>;

    fn verify_precondition(&self, state: &Self::State) -> Result<(), Skip>;

    async fn execute(&self, ctx: &CommandContext, state: Self::State) -> Result<(), CommandError>;
}
