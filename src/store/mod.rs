//! Storage capability consumed by the scheduler core.
//!
//! The core only needs the narrow set of operations below; any backend that
//! satisfies them is substitutable. Two are provided:
//! - `MemoryStore`: process-local maps (tests, one-shot CLI runs)
//! - `SqliteStore`: durable single-file store

pub mod memory;
pub mod sqlite;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::domain::{CoordinatorAction, CoordinatorJob, ExecutionOrder};

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

/// Errors returned by store backends
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: String },

    #[error("{entity} already exists: {id}")]
    Conflict { entity: &'static str, id: String },

    #[error("Store unavailable: {0}")]
    Unavailable(String),

    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl StoreError {
    pub fn job_not_found(id: &str) -> Self {
        Self::NotFound {
            entity: "coordinator job",
            id: id.to_string(),
        }
    }

    pub fn action_not_found(id: &str) -> Self {
        Self::NotFound {
            entity: "coordinator action",
            id: id.to_string(),
        }
    }

    /// Whether retrying the same call later can succeed
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Unavailable(_) => true,
            Self::Sqlite(rusqlite::Error::SqliteFailure(e, _)) => matches!(
                e.code,
                rusqlite::ErrorCode::DatabaseBusy | rusqlite::ErrorCode::DatabaseLocked
            ),
            _ => false,
        }
    }
}

/// Persistence operations required by the scheduler core
#[async_trait]
pub trait CoordinatorStore: Send + Sync {
    async fn insert_job(&self, job: &CoordinatorJob) -> Result<(), StoreError>;

    async fn get_job(&self, job_id: &str) -> Result<CoordinatorJob, StoreError>;

    async fn update_job(&self, job: &CoordinatorJob) -> Result<(), StoreError>;

    async fn get_action(&self, action_id: &str) -> Result<CoordinatorAction, StoreError>;

    /// The action whose dispatched workflow has this external id, if any
    async fn get_action_for_external_id(
        &self,
        external_id: &str,
    ) -> Result<Option<CoordinatorAction>, StoreError>;

    /// READY actions for a job, ordered per `order` and capped to `limit`
    /// (`None` = no cap). `LastOnly` yields at most the highest-numbered one.
    async fn get_ready_actions(
        &self,
        job_id: &str,
        limit: Option<usize>,
        order: ExecutionOrder,
    ) -> Result<Vec<CoordinatorAction>, StoreError>;

    /// Number of actions in SUBMITTED or RUNNING
    async fn count_running_or_submitted(&self, job_id: &str) -> Result<usize, StoreError>;

    async fn insert_actions(
        &self,
        job_id: &str,
        actions: &[CoordinatorAction],
    ) -> Result<(), StoreError>;

    async fn update_action(&self, action: &CoordinatorAction) -> Result<(), StoreError>;

    /// Actions ordered by action number, starting at the 1-based `start`
    async fn get_actions_subset(
        &self,
        job_id: &str,
        start: usize,
        len: usize,
    ) -> Result<Vec<CoordinatorAction>, StoreError>;

    /// Ids of materializable jobs whose next tick is before `before` and not
    /// at or after the job's pause time
    async fn list_jobs_to_materialize(
        &self,
        before: DateTime<Utc>,
    ) -> Result<Vec<String>, StoreError>;

    /// Ids of materializable jobs that are done materializing but not yet
    /// marked complete
    async fn list_jobs_pending_completion(&self) -> Result<Vec<String>, StoreError>;

    /// Ids of jobs that currently have READY actions
    async fn list_jobs_with_ready_actions(&self) -> Result<Vec<String>, StoreError>;

    /// SUBMITTED actions with no external id, last modified before
    /// `modified_before`, ordered by job and action number
    async fn list_stalled_starts(
        &self,
        modified_before: DateTime<Utc>,
    ) -> Result<Vec<CoordinatorAction>, StoreError>;

    /// Insert a materialized batch and persist the updated job as one unit
    async fn materialize_batch(
        &self,
        job: &CoordinatorJob,
        actions: &[CoordinatorAction],
    ) -> Result<(), StoreError> {
        self.insert_actions(&job.id, actions).await?;
        self.update_job(job).await
    }

    /// All actions of a job, ordered by action number
    async fn get_actions(&self, job_id: &str) -> Result<Vec<CoordinatorAction>, StoreError> {
        self.get_actions_subset(job_id, 1, usize::MAX).await
    }
}

/// Order READY actions per policy and apply the cap.
///
/// `actions` must already be filtered to READY and sorted by action number.
pub(crate) fn select_ready(
    mut actions: Vec<CoordinatorAction>,
    limit: Option<usize>,
    order: ExecutionOrder,
) -> Vec<CoordinatorAction> {
    let cap = match order {
        ExecutionOrder::Fifo => limit,
        ExecutionOrder::Lifo => {
            actions.reverse();
            limit
        }
        ExecutionOrder::LastOnly => {
            actions.reverse();
            Some(limit.unwrap_or(1).min(1))
        }
    };
    if let Some(cap) = cap {
        actions.truncate(cap);
    }
    actions
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::ActionStatus;
    use chrono::TimeZone;

    fn ready(n: u32) -> Vec<CoordinatorAction> {
        (1..=n)
            .map(|i| {
                CoordinatorAction::new(
                    "job",
                    i,
                    Utc.with_ymd_and_hms(2009, 1, 1, 0, i, 0).unwrap(),
                    ActionStatus::Ready,
                )
            })
            .collect()
    }

    fn numbers(actions: &[CoordinatorAction]) -> Vec<u32> {
        actions.iter().map(|a| a.action_number).collect()
    }

    #[test]
    fn test_select_fifo_lifo() {
        assert_eq!(numbers(&select_ready(ready(5), Some(2), ExecutionOrder::Fifo)), vec![1, 2]);
        assert_eq!(numbers(&select_ready(ready(5), Some(2), ExecutionOrder::Lifo)), vec![5, 4]);
        assert_eq!(numbers(&select_ready(ready(3), None, ExecutionOrder::Lifo)), vec![3, 2, 1]);
    }

    #[test]
    fn test_select_last_only() {
        assert_eq!(numbers(&select_ready(ready(5), None, ExecutionOrder::LastOnly)), vec![5]);
        assert_eq!(numbers(&select_ready(ready(5), Some(3), ExecutionOrder::LastOnly)), vec![5]);
        assert!(select_ready(ready(5), Some(0), ExecutionOrder::LastOnly).is_empty());
    }

    #[test]
    fn test_transient_classification() {
        assert!(StoreError::Unavailable("down".into()).is_transient());
        assert!(!StoreError::job_not_found("x").is_transient());
    }
}
