//! Command executor: the envelope every scheduler command runs in.
//!
//! Each attempt validates parameters, takes the entity lock, then runs the
//! handler's load/precondition/execute phases. The lock is released on every
//! exit path. Queued commands that fail transiently are re-queued with
//! exponential backoff and the lock is not held while they wait; commands
//! that exhaust their attempts or fail fatally land in the dead-letter list.

use std::sync::{Arc, Mutex, PoisonError};

use chrono::Utc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn};

use super::command::{Command, CommandContext, CommandPhase, Handler, Services, Skip};
use super::error::{CommandError, CommandFailure, Outcome};
use super::lock::LockRegistry;
use super::materializer::{MaterializeActions, ResolveInputs};
use super::queue::{CommandQueue, Poll, QueuedCommand};
use super::readiness::{ActionReady, StartAction};
use super::reconciler::{ReconcileWorkflow, UpdateAction};
use super::triggers::{MaterializationScan, ReadyScan};

/// Runs commands against the injected services
pub struct CommandExecutor {
    services: Arc<Services>,
    locks: LockRegistry,
    queue: CommandQueue,
    dead_letters: Mutex<Vec<CommandFailure>>,
}

impl CommandExecutor {
    pub fn new(services: Services) -> Self {
        Self {
            services: Arc::new(services),
            locks: LockRegistry::new(),
            queue: CommandQueue::new(),
            dead_letters: Mutex::new(Vec::new()),
        }
    }

    pub fn services(&self) -> &Services {
        &self.services
    }

    pub fn queue(&self) -> &CommandQueue {
        &self.queue
    }

    /// Commands that exhausted their retries or failed fatally
    pub fn dead_letters(&self) -> Vec<CommandFailure> {
        self.dead_letters
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Run one attempt of `command` now
    #[instrument(skip_all, fields(command = command.name(), entity = ?command.entity_key()))]
    pub async fn run(&self, command: &Command) -> Result<Outcome, CommandError> {
        command.validate()?;

        match command.clone() {
            Command::Materialize {
                job_id,
                window_start,
                window_end,
            } => {
                self.envelope(
                    command,
                    MaterializeActions {
                        job_id,
                        window_start,
                        window_end,
                    },
                )
                .await
            }
            Command::ActionReady { job_id } => self.envelope(command, ActionReady { job_id }).await,
            Command::StartAction {
                action_id,
                user,
                auth_token,
            } => {
                self.envelope(
                    command,
                    StartAction {
                        action_id,
                        user,
                        auth_token,
                    },
                )
                .await
            }
            Command::UpdateAction {
                action_id,
                workflow_id,
                status,
                ..
            } => {
                self.envelope(
                    command,
                    UpdateAction {
                        action_id,
                        workflow_id,
                        status,
                    },
                )
                .await
            }
            Command::ReconcileWorkflow {
                workflow_id,
                status,
            } => {
                self.envelope(
                    command,
                    ReconcileWorkflow {
                        workflow_id,
                        status,
                    },
                )
                .await
            }
            Command::ResolveInputs { action_id } => {
                self.envelope(command, ResolveInputs { action_id }).await
            }
            Command::MaterializationScan { until } => {
                self.envelope(command, MaterializationScan { until }).await
            }
            Command::ReadyScan => self.envelope(command, ReadyScan).await,
        }
    }

    /// Run `command` now, retrying transient failures in place
    pub async fn run_with_retry(&self, command: &Command) -> Result<Outcome, CommandError> {
        let policy = &self.services.settings.retry;
        let mut attempt = 1;
        loop {
            match self.run(command).await {
                Err(e) if e.is_retryable() && policy.allows_retry_after(attempt) => {
                    let delay = policy.backoff(attempt);
                    warn!(
                        command = command.name(),
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Transient failure, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                other => return other,
            }
        }
    }

    async fn envelope<H: Handler>(
        &self,
        command: &Command,
        handler: H,
    ) -> Result<Outcome, CommandError> {
        let name = command.name();
        debug!(command = name, phase = ?CommandPhase::Created);

        let lock = match command.entity_key() {
            Some(key) if command.lock_required() => Some(
                self.locks
                    .acquire(&key, self.services.settings.lock_timeout)
                    .await?,
            ),
            _ => None,
        };
        if let Some(lock) = &lock {
            debug!(command = name, key = lock.key(), phase = ?CommandPhase::LockAcquired);
        }

        let ctx = CommandContext::new(Arc::clone(&self.services), self.queue.clone());
        let result = phases(&ctx, &handler).await;

        match &result {
            Ok(Outcome::Executed) => debug!(command = name, phase = ?CommandPhase::Executed),
            Ok(Outcome::Skipped(reason)) => {
                info!(command = name, %reason, phase = ?CommandPhase::Skipped, "Precondition not met, skipping")
            }
            Err(e) => debug!(command = name, error = %e, phase = ?CommandPhase::Failed),
        }

        if let Some(lock) = lock {
            debug!(command = name, key = lock.key(), phase = ?CommandPhase::LockReleased);
        }
        result
    }

    /// Run one queued entry, re-queueing or dead-lettering on failure
    async fn process(&self, entry: QueuedCommand) {
        let command = entry.command;
        let attempt = entry.attempt;
        let policy = &self.services.settings.retry;

        match self.run(&command).await {
            Ok(_) => {}
            Err(e) if e.is_retryable() && policy.allows_retry_after(attempt) => {
                let delay = policy.backoff(attempt);
                warn!(
                    command = command.name(),
                    entity = ?command.entity_key(),
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "Transient failure, re-queueing"
                );
                self.queue.push_attempt(command, delay, attempt + 1);
            }
            Err(e) => {
                error!(
                    command = command.name(),
                    entity = ?command.entity_key(),
                    attempt,
                    error = %e,
                    "Command failed permanently"
                );
                self.dead_letters
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .push(CommandFailure {
                        command: command.name().to_string(),
                        entity: command.entity_key(),
                        attempts: attempt,
                        error: e.to_string(),
                        failed_at: Utc::now(),
                    });
            }
        }
    }

    /// Process queued commands in this task until the queue is empty,
    /// waiting out delays. Returns the number of attempts run.
    pub async fn run_until_idle(&self) -> usize {
        let mut processed = 0;
        loop {
            match self.queue.poll() {
                Poll::Ready(entry) => {
                    self.process(entry).await;
                    processed += 1;
                }
                Poll::Pending(due) => tokio::time::sleep_until(due).await,
                Poll::Empty => return processed,
            }
        }
    }

    /// Spawn `count` workers draining the queue until aborted
    pub fn spawn_workers(self: &Arc<Self>, count: usize) -> Vec<JoinHandle<()>> {
        (0..count.max(1))
            .map(|worker| {
                let executor = Arc::clone(self);
                tokio::spawn(async move {
                    debug!(worker, "Command worker started");
                    loop {
                        let entry = executor.queue.next().await;
                        executor.process(entry).await;
                    }
                })
            })
            .collect()
    }
}

async fn phases<H: Handler>(ctx: &CommandContext, handler: &H) -> Result<Outcome, CommandError> {
    let state = handler.load_state(ctx).await?;
    if let Err(Skip(reason)) = handler.verify_precondition(&state) {
        return Ok(Outcome::Skipped(reason));
    }
    debug!(phase = ?CommandPhase::PreconditionChecked);
    handler.execute(ctx, state).await?;
    Ok(Outcome::Executed)
}
