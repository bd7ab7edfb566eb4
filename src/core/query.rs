//! Read-only lookups. These take no lock and never mutate state.

use serde::Serialize;

use crate::domain::{parse_action_id, CoordinatorAction, CoordinatorJob};
use crate::store::CoordinatorStore;

use super::error::CommandError;

/// A job together with a page of its actions
#[derive(Debug, Clone, Serialize)]
pub struct JobInfo {
    pub job: CoordinatorJob,
    /// Actions ordered by action number
    pub actions: Vec<CoordinatorAction>,
}

/// Fetch a job and up to `len` of its actions starting at the 1-based `start`
pub async fn get_job_info(
    store: &dyn CoordinatorStore,
    job_id: &str,
    start: usize,
    len: usize,
) -> Result<JobInfo, CommandError> {
    if job_id.trim().is_empty() {
        return Err(CommandError::Validation("job id must not be empty".to_string()));
    }
    let job = store.get_job(job_id).await?;
    let actions = store.get_actions_subset(job_id, start.max(1), len).await?;
    Ok(JobInfo { job, actions })
}

pub async fn get_action_info(
    store: &dyn CoordinatorStore,
    action_id: &str,
) -> Result<CoordinatorAction, CommandError> {
    if parse_action_id(action_id).is_none() {
        return Err(CommandError::Validation(format!(
            "malformed action id: '{}'",
            action_id
        )));
    }
    Ok(store.get_action(action_id).await?)
}
