//! Periodic scans that feed per-job commands into the queue.
//!
//! Both run without a lock: they only read the store and queue commands that
//! take their own job lock when they run.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use crate::domain::CoordinatorAction;
use crate::store::StoreError;

use super::command::{Command, CommandContext, Handler, Skip};
use super::error::CommandError;

/// Queue materialization for jobs due before `until`, and a completion pass
/// for jobs that are done materializing
pub(crate) struct MaterializationScan {
    pub until: DateTime<Utc>,
}

pub(crate) struct ScanState {
    due: Vec<String>,
    pending_completion: Vec<String>,
}

#[async_trait]
impl Handler for MaterializationScan {
    type State = ScanState;

    async fn load_state(&self, ctx: &CommandContext) -> Result<ScanState, CommandError> {
        Ok(ScanState {
            due: ctx.store().list_jobs_to_materialize(self.until).await?,
            pending_completion: ctx.store().list_jobs_pending_completion().await?,
        })
    }

    fn verify_precondition(&self, state: &ScanState) -> Result<(), Skip> {
        if state.due.is_empty() && state.pending_completion.is_empty() {
            return Err(Skip("no jobs to materialize".to_string()));
        }
        Ok(())
    }

    async fn execute(&self, ctx: &CommandContext, state: ScanState) -> Result<(), CommandError> {
        for job_id in state.due.into_iter().chain(state.pending_completion) {
            let job = match ctx.store().get_job(&job_id).await {
                Ok(job) => job,
                Err(StoreError::NotFound { .. }) => {
                    warn!(job_id = %job_id, "Job vanished during scan");
                    continue;
                }
                Err(e) => return Err(e.into()),
            };
            let window_start = job.next_tick_time();
            debug!(job_id = %job.id, %window_start, until = %self.until, "Queueing materialization");
            ctx.queue(
                Command::Materialize {
                    job_id: job.id,
                    window_start,
                    window_end: self.until.max(window_start),
                },
                Duration::ZERO,
            );
        }
        Ok(())
    }
}

/// Queue readiness for every job holding READY actions, and re-queue the
/// start of SUBMITTED actions whose queued start was lost
pub(crate) struct ReadyScan;

pub(crate) struct ReadyScanState {
    ready_jobs: Vec<String>,
    stalled: Vec<CoordinatorAction>,
}

#[async_trait]
impl Handler for ReadyScan {
    type State = ReadyScanState;

    async fn load_state(&self, ctx: &CommandContext) -> Result<ReadyScanState, CommandError> {
        // Starts queued by ActionReady become runnable after dispatch_delay
        let cutoff = Utc::now()
            - chrono::Duration::from_std(ctx.settings().dispatch_delay)
                .unwrap_or_else(|_| chrono::Duration::zero());
        Ok(ReadyScanState {
            ready_jobs: ctx.store().list_jobs_with_ready_actions().await?,
            stalled: ctx.store().list_stalled_starts(cutoff).await?,
        })
    }

    fn verify_precondition(&self, state: &ReadyScanState) -> Result<(), Skip> {
        if state.ready_jobs.is_empty() && state.stalled.is_empty() {
            return Err(Skip("no READY or stalled SUBMITTED actions".to_string()));
        }
        Ok(())
    }

    async fn execute(&self, ctx: &CommandContext, state: ReadyScanState) -> Result<(), CommandError> {
        debug!(jobs = state.ready_jobs.len(), "Queueing readiness checks");
        for job_id in state.ready_jobs {
            ctx.queue(Command::ActionReady { job_id }, Duration::ZERO);
        }

        for action in state.stalled {
            let job = match ctx.store().get_job(&action.job_id).await {
                Ok(job) => job,
                Err(StoreError::NotFound { .. }) => {
                    warn!(action_id = %action.id, "Job of stalled action vanished during scan");
                    continue;
                }
                Err(e) => return Err(e.into()),
            };
            info!(
                action_id = %action.id,
                submitted_at = %action.last_modified_time,
                "Re-queueing start of stalled SUBMITTED action"
            );
            ctx.queue(
                Command::StartAction {
                    action_id: action.id,
                    user: job.user,
                    auth_token: job.auth_token,
                },
                Duration::ZERO,
            );
        }
        Ok(())
    }
}
