//! In-memory store backend.

use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;

use crate::domain::{ActionStatus, CoordinatorAction, CoordinatorJob, ExecutionOrder};

use super::{select_ready, CoordinatorStore, StoreError};

/// Process-local store backed by ordered maps
#[derive(Default)]
pub struct MemoryStore {
    jobs: RwLock<HashMap<String, CoordinatorJob>>,
    /// job id -> action number -> action
    actions: RwLock<HashMap<String, BTreeMap<u32, CoordinatorAction>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CoordinatorStore for MemoryStore {
    async fn insert_job(&self, job: &CoordinatorJob) -> Result<(), StoreError> {
        let mut jobs = self.jobs.write().await;
        if jobs.contains_key(&job.id) {
            return Err(StoreError::Conflict {
                entity: "coordinator job",
                id: job.id.clone(),
            });
        }
        jobs.insert(job.id.clone(), job.clone());
        Ok(())
    }

    async fn get_job(&self, job_id: &str) -> Result<CoordinatorJob, StoreError> {
        self.jobs
            .read()
            .await
            .get(job_id)
            .cloned()
            .ok_or_else(|| StoreError::job_not_found(job_id))
    }

    async fn update_job(&self, job: &CoordinatorJob) -> Result<(), StoreError> {
        let mut jobs = self.jobs.write().await;
        let slot = jobs
            .get_mut(&job.id)
            .ok_or_else(|| StoreError::job_not_found(&job.id))?;
        *slot = job.clone();
        Ok(())
    }

    async fn get_action(&self, action_id: &str) -> Result<CoordinatorAction, StoreError> {
        let (job_id, number) = crate::domain::parse_action_id(action_id)
            .ok_or_else(|| StoreError::action_not_found(action_id))?;
        self.actions
            .read()
            .await
            .get(job_id)
            .and_then(|actions| actions.get(&number))
            .cloned()
            .ok_or_else(|| StoreError::action_not_found(action_id))
    }

    async fn get_action_for_external_id(
        &self,
        external_id: &str,
    ) -> Result<Option<CoordinatorAction>, StoreError> {
        let actions = self.actions.read().await;
        Ok(actions
            .values()
            .flat_map(|by_number| by_number.values())
            .find(|a| a.external_id.as_deref() == Some(external_id))
            .cloned())
    }

    async fn get_ready_actions(
        &self,
        job_id: &str,
        limit: Option<usize>,
        order: ExecutionOrder,
    ) -> Result<Vec<CoordinatorAction>, StoreError> {
        let actions = self.actions.read().await;
        let ready: Vec<CoordinatorAction> = actions
            .get(job_id)
            .map(|by_number| {
                by_number
                    .values()
                    .filter(|a| a.status == ActionStatus::Ready)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();
        Ok(select_ready(ready, limit, order))
    }

    async fn count_running_or_submitted(&self, job_id: &str) -> Result<usize, StoreError> {
        let actions = self.actions.read().await;
        Ok(actions
            .get(job_id)
            .map(|by_number| by_number.values().filter(|a| a.status.is_active()).count())
            .unwrap_or(0))
    }

    async fn insert_actions(
        &self,
        job_id: &str,
        actions: &[CoordinatorAction],
    ) -> Result<(), StoreError> {
        let mut all = self.actions.write().await;
        let by_number = all.entry(job_id.to_string()).or_default();

        // Validate the whole batch before touching the map
        for action in actions {
            if action.job_id != job_id || by_number.contains_key(&action.action_number) {
                return Err(StoreError::Conflict {
                    entity: "coordinator action",
                    id: action.id.clone(),
                });
            }
        }
        for action in actions {
            by_number.insert(action.action_number, action.clone());
        }
        Ok(())
    }

    async fn update_action(&self, action: &CoordinatorAction) -> Result<(), StoreError> {
        let mut all = self.actions.write().await;
        let slot = all
            .get_mut(&action.job_id)
            .and_then(|by_number| by_number.get_mut(&action.action_number))
            .ok_or_else(|| StoreError::action_not_found(&action.id))?;
        *slot = action.clone();
        Ok(())
    }

    async fn get_actions_subset(
        &self,
        job_id: &str,
        start: usize,
        len: usize,
    ) -> Result<Vec<CoordinatorAction>, StoreError> {
        let actions = self.actions.read().await;
        Ok(actions
            .get(job_id)
            .map(|by_number| {
                by_number
                    .values()
                    .skip(start.saturating_sub(1))
                    .take(len)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn list_jobs_to_materialize(
        &self,
        before: DateTime<Utc>,
    ) -> Result<Vec<String>, StoreError> {
        let jobs = self.jobs.read().await;
        let mut ids: Vec<String> = jobs
            .values()
            .filter(|j| j.status.can_materialize() && !j.done_materialization)
            .filter(|j| j.next_tick_time() < before && !j.is_paused_at_next_tick())
            .map(|j| j.id.clone())
            .collect();
        ids.sort();
        Ok(ids)
    }

    async fn list_jobs_pending_completion(&self) -> Result<Vec<String>, StoreError> {
        let jobs = self.jobs.read().await;
        let mut ids: Vec<String> = jobs
            .values()
            .filter(|j| j.status.can_materialize() && j.done_materialization)
            .map(|j| j.id.clone())
            .collect();
        ids.sort();
        Ok(ids)
    }

    async fn list_jobs_with_ready_actions(&self) -> Result<Vec<String>, StoreError> {
        let actions = self.actions.read().await;
        let mut ids: Vec<String> = actions
            .iter()
            .filter(|(_, by_number)| by_number.values().any(|a| a.status == ActionStatus::Ready))
            .map(|(job_id, _)| job_id.clone())
            .collect();
        ids.sort();
        Ok(ids)
    }

    async fn list_stalled_starts(
        &self,
        modified_before: DateTime<Utc>,
    ) -> Result<Vec<CoordinatorAction>, StoreError> {
        let actions = self.actions.read().await;
        let mut stalled: Vec<CoordinatorAction> = actions
            .values()
            .flat_map(|by_number| by_number.values())
            .filter(|a| a.status == ActionStatus::Submitted && a.external_id.is_none())
            .filter(|a| a.last_modified_time < modified_before)
            .cloned()
            .collect();
        stalled.sort_by(|a, b| (&a.job_id, a.action_number).cmp(&(&b.job_id, b.action_number)));
        Ok(stalled)
    }

    async fn materialize_batch(
        &self,
        job: &CoordinatorJob,
        actions: &[CoordinatorAction],
    ) -> Result<(), StoreError> {
        // Hold both write locks so readers never see the batch without the job update
        let mut jobs = self.jobs.write().await;
        let mut all = self.actions.write().await;

        let slot = jobs
            .get_mut(&job.id)
            .ok_or_else(|| StoreError::job_not_found(&job.id))?;
        let by_number = all.entry(job.id.clone()).or_default();
        for action in actions {
            if action.job_id != job.id || by_number.contains_key(&action.action_number) {
                return Err(StoreError::Conflict {
                    entity: "coordinator action",
                    id: action.id.clone(),
                });
            }
        }
        for action in actions {
            by_number.insert(action.action_number, action.clone());
        }
        *slot = job.clone();
        Ok(())
    }
}
