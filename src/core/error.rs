//! Command outcomes and the error taxonomy shared by every command.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;

use crate::adapters::EngineError;
use crate::store::StoreError;

/// Result of a command that did not fail
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// The command body ran
    Executed,
    /// The precondition was not met; nothing changed
    Skipped(String),
}

impl Outcome {
    pub fn is_executed(&self) -> bool {
        matches!(self, Self::Executed)
    }
}

/// Errors surfaced by the command executor
#[derive(Debug, Error)]
pub enum CommandError {
    /// Bad or missing parameters; rejected before any lock is taken
    #[error("Invalid request: {0}")]
    Validation(String),

    #[error("Timed out after {waited:?} waiting for lock on {key}")]
    LockTimeout { key: String, waited: Duration },

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Engine(#[from] EngineError),

    /// No action records this workflow id, possibly because its start has
    /// not been saved yet
    #[error("No coordinator action tracks workflow {0}")]
    UntrackedWorkflow(String),

    /// Retrying cannot help
    #[error("Fatal: {0}")]
    Fatal(String),
}

impl CommandError {
    /// Transient failures are retried with backoff; the rest fail immediately
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::LockTimeout { .. } | Self::UntrackedWorkflow(_) => true,
            Self::Store(e) => e.is_transient(),
            Self::Engine(e) => e.is_transient(),
            Self::Validation(_) | Self::Fatal(_) => false,
        }
    }
}

/// A queued command that exhausted its retries or failed fatally
#[derive(Debug, Clone, Serialize)]
pub struct CommandFailure {
    pub command: String,
    pub entity: Option<String>,
    pub attempts: u32,
    pub error: String,
    pub failed_at: DateTime<Utc>,
}
