//! Action materialization.
//!
//! Turns the recurrence ticks of a job that fall inside a time window into
//! persisted actions, honouring the job's end time and pause time, and
//! advances the job's materialization cursor in the same store write.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::{debug, info, instrument, warn};

use crate::domain::{ActionStatus, CoordinatorAction, CoordinatorJob, JobStatus, SlaStatus};

use super::command::{Command, CommandContext, Handler, Skip};
use super::error::CommandError;
use super::settings::SchedulerSettings;

/// Materialize the ticks of one job in `[window_start, window_end)`
pub(crate) struct MaterializeActions {
    pub job_id: String,
    pub window_start: DateTime<Utc>,
    pub window_end: DateTime<Utc>,
}

/// What one pass over the ticks produced
#[derive(Debug)]
struct Pass {
    actions: Vec<CoordinatorAction>,
    /// Stopped at a tick at or after the pause time
    truncated_by_pause: bool,
    /// First tick not materialized, if the recurrence has one
    next_tick: Option<DateTime<Utc>>,
}

#[async_trait]
impl Handler for MaterializeActions {
    type State = CoordinatorJob;

    async fn load_state(&self, ctx: &CommandContext) -> Result<CoordinatorJob, CommandError> {
        Ok(ctx.store().get_job(&self.job_id).await?)
    }

    fn verify_precondition(&self, job: &CoordinatorJob) -> Result<(), Skip> {
        if !job.status.can_materialize() {
            return Err(Skip(format!("job {} is {}", job.id, job.status)));
        }
        // A done job still gets a pass so it can be marked complete
        if !job.done_materialization && self.window_start >= self.window_end {
            return Err(Skip("empty materialization window".to_string()));
        }
        Ok(())
    }

    #[instrument(skip_all, fields(job_id = %job.id))]
    async fn execute(&self, ctx: &CommandContext, mut job: CoordinatorJob) -> Result<(), CommandError> {
        if job.done_materialization {
            return finalize_if_complete(ctx, job).await;
        }
        if job.frequency == 0 {
            return Err(CommandError::Fatal(format!("job {} has zero frequency", job.id)));
        }

        let now = Utc::now();
        let pass = self.enumerate(&job, ctx, now)?;
        let produced = pass.actions.len();

        if job.status == JobStatus::Prep {
            job.status = JobStatus::Premater;
        }
        if job.status == JobStatus::Premater && (produced > 0 || pass.truncated_by_pause) {
            job.status = JobStatus::Running;
        }
        if pass.truncated_by_pause && produced > 0 && job.pause_time.is_some_and(|p| now >= p) {
            job.status = JobStatus::Paused;
        }

        if let Some(last) = pass.actions.last() {
            job.last_action_number = last.action_number;
            job.last_action_time = Some(last.nominal_time);
        }
        job.next_materialized_time = pass.next_tick;
        job.done_materialization = pass.next_tick.map_or(true, |t| t >= job.end_time);
        job.touch();

        ctx.store().materialize_batch(&job, &pass.actions).await?;
        info!(
            job_id = %job.id,
            actions = produced,
            status = %job.status,
            paused = pass.truncated_by_pause,
            done = job.done_materialization,
            "Materialized actions"
        );

        for action in &pass.actions {
            ctx.record_sla(&action.id, SlaStatus::Created).await;
        }
        if pass.actions.iter().any(|a| a.status == ActionStatus::Ready) {
            ctx.queue(
                Command::ActionReady {
                    job_id: job.id.clone(),
                },
                Duration::ZERO,
            );
        }

        if job.done_materialization {
            finalize_if_complete(ctx, job).await?;
        }
        Ok(())
    }
}

impl MaterializeActions {
    /// Walk ticks from the job's cursor, building actions for those in the
    /// window and stopping at the window end or pause time
    fn enumerate(
        &self,
        job: &CoordinatorJob,
        ctx: &CommandContext,
        now: DateTime<Utc>,
    ) -> Result<Pass, CommandError> {
        let tz = job.tz().map_err(CommandError::Fatal)?;
        let settings = ctx.settings();
        let window_start = self.window_start.max(job.start_time);
        let window_end = self.window_end.min(job.end_time);
        let interval = chrono::Duration::minutes(
            job.time_unit.approx_minutes() * i64::from(job.frequency),
        );
        let catchup_before = now - interval;

        let mut pass = Pass {
            actions: Vec::new(),
            truncated_by_pause: false,
            next_tick: None,
        };
        let mut k = job.last_action_number;
        let mut before_window = 0u32;

        while let Some(tick) = job.tick(k, &tz) {
            k = match k.checked_add(1) {
                Some(next) => next,
                None => break,
            };
            if job.last_action_time.is_some_and(|last| tick <= last) {
                continue;
            }
            if tick >= window_end {
                pass.next_tick = Some(tick);
                break;
            }
            if job.pause_time.is_some_and(|pause| tick >= pause) {
                debug!(job_id = %job.id, %tick, "Tick at or after pause time");
                pass.truncated_by_pause = true;
                pass.next_tick = Some(tick);
                break;
            }
            if tick < window_start {
                before_window += 1;
                continue;
            }

            let number = job.last_action_number + pass.actions.len() as u32 + 1;
            let status = if ctx.inputs().has_unresolved_inputs(job, tick) {
                ActionStatus::Waiting
            } else {
                ActionStatus::Ready
            };
            let mut action = CoordinatorAction::new(&job.id, number, tick, status);
            action.created_conf = job.conf.clone();
            action.timeout_minutes = action_timeout(job, settings, tick < catchup_before);
            pass.actions.push(action);
        }

        if before_window > 0 {
            warn!(
                job_id = %job.id,
                skipped = before_window,
                %window_start,
                "Skipped ticks before materialization window"
            );
        }
        Ok(pass)
    }
}

/// Timeout for a new action. Catch-up actions (older than one interval)
/// use the catch-up default; others use the job's value or the normal default.
pub(crate) fn action_timeout(job: &CoordinatorJob, settings: &SchedulerSettings, catchup: bool) -> i32 {
    if catchup {
        settings.catchup_timeout_minutes
    } else {
        job.timeout_minutes.unwrap_or(settings.normal_timeout_minutes)
    }
}

/// Mark a job that is done materializing as complete once every action is
/// terminal
async fn finalize_if_complete(ctx: &CommandContext, mut job: CoordinatorJob) -> Result<(), CommandError> {
    let actions = ctx.store().get_actions(&job.id).await?;
    if actions.iter().any(|a| !a.is_terminal()) {
        return Ok(());
    }

    let failed = actions
        .iter()
        .any(|a| matches!(a.status, ActionStatus::Failed | ActionStatus::Killed));
    job.status = if failed {
        JobStatus::DoneWithError
    } else {
        JobStatus::Succeeded
    };
    job.touch();
    ctx.store().update_job(&job).await?;
    info!(job_id = %job.id, status = %job.status, "Coordinator job complete");
    Ok(())
}

/// Move a WAITING action to READY
pub(crate) struct ResolveInputs {
    pub action_id: String,
}

#[async_trait]
impl Handler for ResolveInputs {
    type State = CoordinatorAction;

    async fn load_state(&self, ctx: &CommandContext) -> Result<CoordinatorAction, CommandError> {
        Ok(ctx.store().get_action(&self.action_id).await?)
    }

    fn verify_precondition(&self, action: &CoordinatorAction) -> Result<(), Skip> {
        if action.status != ActionStatus::Waiting {
            return Err(Skip(format!("action {} is {}", action.id, action.status)));
        }
        Ok(())
    }

    async fn execute(&self, ctx: &CommandContext, mut action: CoordinatorAction) -> Result<(), CommandError> {
        action.status = ActionStatus::Ready;
        action.touch();
        ctx.store().update_action(&action).await?;
        info!(action_id = %action.id, "Inputs resolved, action READY");

        ctx.queue(
            Command::ActionReady {
                job_id: action.job_id.clone(),
            },
            Duration::ZERO,
        );
        Ok(())
    }
}
