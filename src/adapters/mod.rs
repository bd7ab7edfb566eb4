//! Adapter interfaces for external collaborators.
//!
//! The scheduler core talks to three systems it does not own:
//! - the workflow engine that runs dispatched actions
//! - the SLA log that records status transitions
//! - the input-dependency checker consulted at materialization

pub mod engine;
pub mod sla_log;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::domain::CoordinatorJob;

pub use engine::HttpWorkflowEngine;
pub use sla_log::{JsonlSlaLog, MemorySlaLog, SlaError, SlaSink};

/// Errors returned by a workflow engine
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("Workflow engine call timed out after {0:?}")]
    Timeout(std::time::Duration),

    #[error("Workflow engine unavailable: {0}")]
    Unavailable(String),

    #[error("Workflow engine rejected submission: {0}")]
    Rejected(String),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
}

impl EngineError {
    /// Whether the same submission may succeed if retried
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Timeout(_) | Self::Unavailable(_) => true,
            Self::Rejected(_) => false,
            Self::Http(e) => e.is_timeout() || e.is_connect() || e.is_request(),
        }
    }
}

/// Submit/start contract of the external workflow engine
#[async_trait]
pub trait WorkflowEngine: Send + Sync {
    /// Human-readable engine name
    fn name(&self) -> &str;

    /// Submit and start a workflow for `action_id`, returning its external id.
    ///
    /// Implementations must treat `action_id` as an idempotency key: a second
    /// call for the same action returns the workflow created by the first.
    async fn submit_and_start(
        &self,
        conf: &str,
        action_id: &str,
        user: &str,
        auth_token: &str,
    ) -> Result<String, EngineError>;
}

/// Decides whether a tick still waits on input data
pub trait InputCheck: Send + Sync {
    fn has_unresolved_inputs(&self, job: &CoordinatorJob, nominal_time: DateTime<Utc>) -> bool;
}

/// Every tick is immediately runnable
#[derive(Debug, Default, Clone, Copy)]
pub struct NoInputDependencies;

impl InputCheck for NoInputDependencies {
    fn has_unresolved_inputs(&self, _job: &CoordinatorJob, _nominal_time: DateTime<Utc>) -> bool {
        false
    }
}
