//! SQLite store backend.
//!
//! Each entity is stored as a JSON document next to the handful of columns
//! the scheduler filters and orders on. Calls run on the blocking pool.

use std::path::Path;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Transaction};

use crate::domain::{ActionStatus, CoordinatorAction, CoordinatorJob, ExecutionOrder, JobStatus};

use super::{CoordinatorStore, StoreError};

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS coord_jobs (
    id               TEXT PRIMARY KEY,
    status           TEXT NOT NULL,
    next_matd_millis INTEGER NOT NULL,
    done_matd        INTEGER NOT NULL,
    pause_millis     INTEGER,
    body             TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS coord_actions (
    id            TEXT PRIMARY KEY,
    job_id        TEXT NOT NULL,
    action_number INTEGER NOT NULL,
    status        TEXT NOT NULL,
    external_id   TEXT,
    body          TEXT NOT NULL,
    UNIQUE (job_id, action_number)
);

CREATE INDEX IF NOT EXISTS idx_actions_job_status ON coord_actions (job_id, status);
CREATE INDEX IF NOT EXISTS idx_actions_external ON coord_actions (external_id);
"#;

/// Durable store in a single SQLite file
#[derive(Clone)]
pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteStore {
    /// Open (creating if needed) a store at `path`
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        let conn = Connection::open(path)?;
        Self::init(conn)
    }

    /// Open a private in-memory database
    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self, StoreError> {
        conn.busy_timeout(std::time::Duration::from_secs(5))?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Run `f` with the connection on the blocking pool
    async fn call<T, F>(&self, f: F) -> Result<T, StoreError>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> Result<T, StoreError> + Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let mut guard = conn
                .lock()
                .map_err(|_| StoreError::Unavailable("connection mutex poisoned".to_string()))?;
            f(&mut guard)
        })
        .await
        .map_err(|e| StoreError::Unavailable(format!("store task failed: {}", e)))?
    }
}

fn next_matd_millis(job: &CoordinatorJob) -> i64 {
    job.next_tick_time().timestamp_millis()
}

fn pause_millis(job: &CoordinatorJob) -> Option<i64> {
    job.pause_time.map(|p| p.timestamp_millis())
}

fn write_job(conn: &Connection, job: &CoordinatorJob) -> Result<usize, StoreError> {
    let body = serde_json::to_string(job)?;
    let changed = conn.execute(
        "UPDATE coord_jobs
         SET status = ?2, next_matd_millis = ?3, done_matd = ?4, pause_millis = ?5, body = ?6
         WHERE id = ?1",
        params![
            job.id,
            job.status.as_str(),
            next_matd_millis(job),
            job.done_materialization,
            pause_millis(job),
            body
        ],
    )?;
    Ok(changed)
}

fn insert_action_rows(tx: &Transaction<'_>, job_id: &str, actions: &[CoordinatorAction]) -> Result<(), StoreError> {
    for action in actions {
        if action.job_id != job_id {
            return Err(StoreError::Conflict {
                entity: "coordinator action",
                id: action.id.clone(),
            });
        }
        let body = serde_json::to_string(action)?;
        let result = tx.execute(
            "INSERT INTO coord_actions (id, job_id, action_number, status, external_id, body)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                action.id,
                action.job_id,
                action.action_number,
                action.status.as_str(),
                action.external_id,
                body
            ],
        );
        match result {
            Ok(_) => {}
            Err(rusqlite::Error::SqliteFailure(e, _))
                if e.code == rusqlite::ErrorCode::ConstraintViolation =>
            {
                return Err(StoreError::Conflict {
                    entity: "coordinator action",
                    id: action.id.clone(),
                });
            }
            Err(e) => return Err(e.into()),
        }
    }
    Ok(())
}

fn parse_actions(bodies: Vec<String>) -> Result<Vec<CoordinatorAction>, StoreError> {
    bodies
        .iter()
        .map(|b| serde_json::from_str(b).map_err(StoreError::from))
        .collect()
}

fn query_strings(
    conn: &Connection,
    sql: &str,
    params: impl rusqlite::Params,
) -> Result<Vec<String>, StoreError> {
    let mut stmt = conn.prepare(sql)?;
    let rows = stmt.query_map(params, |row| row.get::<_, String>(0))?;
    let values = rows.collect::<Result<Vec<_>, _>>()?;
    Ok(values)
}

/// SQLite uses i64 for LIMIT; -1 means no limit
fn sql_limit(limit: Option<usize>) -> i64 {
    limit.map(|l| l.min(i64::MAX as usize) as i64).unwrap_or(-1)
}

#[async_trait]
impl CoordinatorStore for SqliteStore {
    async fn insert_job(&self, job: &CoordinatorJob) -> Result<(), StoreError> {
        let job = job.clone();
        self.call(move |conn| {
            let body = serde_json::to_string(&job)?;
            let result = conn.execute(
                "INSERT INTO coord_jobs (id, status, next_matd_millis, done_matd, pause_millis, body)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    job.id,
                    job.status.as_str(),
                    next_matd_millis(&job),
                    job.done_materialization,
                    pause_millis(&job),
                    body
                ],
            );
            match result {
                Ok(_) => Ok(()),
                Err(rusqlite::Error::SqliteFailure(e, _))
                    if e.code == rusqlite::ErrorCode::ConstraintViolation =>
                {
                    Err(StoreError::Conflict {
                        entity: "coordinator job",
                        id: job.id.clone(),
                    })
                }
                Err(e) => Err(e.into()),
            }
        })
        .await
    }

    async fn get_job(&self, job_id: &str) -> Result<CoordinatorJob, StoreError> {
        let job_id = job_id.to_string();
        self.call(move |conn| {
            let body: Option<String> = conn
                .query_row(
                    "SELECT body FROM coord_jobs WHERE id = ?1",
                    params![job_id],
                    |row| row.get(0),
                )
                .optional()?;
            match body {
                Some(body) => Ok(serde_json::from_str(&body)?),
                None => Err(StoreError::job_not_found(&job_id)),
            }
        })
        .await
    }

    async fn update_job(&self, job: &CoordinatorJob) -> Result<(), StoreError> {
        let job = job.clone();
        self.call(move |conn| {
            if write_job(conn, &job)? == 0 {
                return Err(StoreError::job_not_found(&job.id));
            }
            Ok(())
        })
        .await
    }

    async fn get_action(&self, action_id: &str) -> Result<CoordinatorAction, StoreError> {
        let action_id = action_id.to_string();
        self.call(move |conn| {
            let body: Option<String> = conn
                .query_row(
                    "SELECT body FROM coord_actions WHERE id = ?1",
                    params![action_id],
                    |row| row.get(0),
                )
                .optional()?;
            match body {
                Some(body) => Ok(serde_json::from_str(&body)?),
                None => Err(StoreError::action_not_found(&action_id)),
            }
        })
        .await
    }

    async fn get_action_for_external_id(
        &self,
        external_id: &str,
    ) -> Result<Option<CoordinatorAction>, StoreError> {
        let external_id = external_id.to_string();
        self.call(move |conn| {
            let body: Option<String> = conn
                .query_row(
                    "SELECT body FROM coord_actions WHERE external_id = ?1",
                    params![external_id],
                    |row| row.get(0),
                )
                .optional()?;
            body.map(|b| serde_json::from_str(&b).map_err(StoreError::from))
                .transpose()
        })
        .await
    }

    async fn get_ready_actions(
        &self,
        job_id: &str,
        limit: Option<usize>,
        order: ExecutionOrder,
    ) -> Result<Vec<CoordinatorAction>, StoreError> {
        let job_id = job_id.to_string();
        let (direction, limit) = match order {
            ExecutionOrder::Fifo => ("ASC", sql_limit(limit)),
            ExecutionOrder::Lifo => ("DESC", sql_limit(limit)),
            ExecutionOrder::LastOnly => ("DESC", if limit == Some(0) { 0 } else { 1 }),
        };
        self.call(move |conn| {
            let sql = format!(
                "SELECT body FROM coord_actions WHERE job_id = ?1 AND status = ?2
                 ORDER BY action_number {} LIMIT ?3",
                direction
            );
            let bodies = query_strings(
                conn,
                &sql,
                params![job_id, ActionStatus::Ready.as_str(), limit],
            )?;
            parse_actions(bodies)
        })
        .await
    }

    async fn count_running_or_submitted(&self, job_id: &str) -> Result<usize, StoreError> {
        let job_id = job_id.to_string();
        self.call(move |conn| {
            let count: i64 = conn.query_row(
                "SELECT COUNT(*) FROM coord_actions WHERE job_id = ?1 AND status IN (?2, ?3)",
                params![
                    job_id,
                    ActionStatus::Submitted.as_str(),
                    ActionStatus::Running.as_str()
                ],
                |row| row.get(0),
            )?;
            Ok(count as usize)
        })
        .await
    }

    async fn insert_actions(
        &self,
        job_id: &str,
        actions: &[CoordinatorAction],
    ) -> Result<(), StoreError> {
        let job_id = job_id.to_string();
        let actions = actions.to_vec();
        self.call(move |conn| {
            let tx = conn.transaction()?;
            insert_action_rows(&tx, &job_id, &actions)?;
            tx.commit()?;
            Ok(())
        })
        .await
    }

    async fn update_action(&self, action: &CoordinatorAction) -> Result<(), StoreError> {
        let action = action.clone();
        self.call(move |conn| {
            let body = serde_json::to_string(&action)?;
            let changed = conn.execute(
                "UPDATE coord_actions SET status = ?2, external_id = ?3, body = ?4 WHERE id = ?1",
                params![action.id, action.status.as_str(), action.external_id, body],
            )?;
            if changed == 0 {
                return Err(StoreError::action_not_found(&action.id));
            }
            Ok(())
        })
        .await
    }

    async fn get_actions_subset(
        &self,
        job_id: &str,
        start: usize,
        len: usize,
    ) -> Result<Vec<CoordinatorAction>, StoreError> {
        let job_id = job_id.to_string();
        let offset = start.saturating_sub(1).min(i64::MAX as usize) as i64;
        let len = sql_limit(Some(len));
        self.call(move |conn| {
            let bodies = query_strings(
                conn,
                "SELECT body FROM coord_actions WHERE job_id = ?1
                 ORDER BY action_number ASC LIMIT ?2 OFFSET ?3",
                params![job_id, len, offset],
            )?;
            parse_actions(bodies)
        })
        .await
    }

    async fn list_jobs_to_materialize(
        &self,
        before: DateTime<Utc>,
    ) -> Result<Vec<String>, StoreError> {
        let before = before.timestamp_millis();
        self.call(move |conn| {
            query_strings(
                conn,
                "SELECT id FROM coord_jobs
                 WHERE status IN (?1, ?2, ?3) AND done_matd = 0 AND next_matd_millis < ?4
                   AND (pause_millis IS NULL OR next_matd_millis < pause_millis)
                 ORDER BY id",
                params![
                    JobStatus::Prep.as_str(),
                    JobStatus::Premater.as_str(),
                    JobStatus::Running.as_str(),
                    before
                ],
            )
        })
        .await
    }

    async fn list_jobs_pending_completion(&self) -> Result<Vec<String>, StoreError> {
        self.call(|conn| {
            query_strings(
                conn,
                "SELECT id FROM coord_jobs
                 WHERE status IN (?1, ?2, ?3) AND done_matd = 1
                 ORDER BY id",
                params![
                    JobStatus::Prep.as_str(),
                    JobStatus::Premater.as_str(),
                    JobStatus::Running.as_str()
                ],
            )
        })
        .await
    }

    async fn list_jobs_with_ready_actions(&self) -> Result<Vec<String>, StoreError> {
        self.call(|conn| {
            query_strings(
                conn,
                "SELECT DISTINCT job_id FROM coord_actions WHERE status = ?1 ORDER BY job_id",
                params![ActionStatus::Ready.as_str()],
            )
        })
        .await
    }

    async fn list_stalled_starts(
        &self,
        modified_before: DateTime<Utc>,
    ) -> Result<Vec<CoordinatorAction>, StoreError> {
        let bodies = self
            .call(|conn| {
                query_strings(
                    conn,
                    "SELECT body FROM coord_actions WHERE status = ?1 AND external_id IS NULL
                     ORDER BY job_id, action_number",
                    params![ActionStatus::Submitted.as_str()],
                )
            })
            .await?;
        let mut actions = parse_actions(bodies)?;
        actions.retain(|a| a.last_modified_time < modified_before);
        Ok(actions)
    }

    async fn materialize_batch(
        &self,
        job: &CoordinatorJob,
        actions: &[CoordinatorAction],
    ) -> Result<(), StoreError> {
        let job = job.clone();
        let actions = actions.to_vec();
        self.call(move |conn| {
            let tx = conn.transaction()?;
            insert_action_rows(&tx, &job.id, &actions)?;
            if write_job(&tx, &job)? == 0 {
                return Err(StoreError::job_not_found(&job.id));
            }
            tx.commit()?;
            Ok(())
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::TimeUnit;
    use chrono::TimeZone;
    use tempfile::TempDir;

    fn job() -> CoordinatorJob {
        CoordinatorJob::new(
            "app",
            "user",
            Utc.with_ymd_and_hms(2009, 3, 6, 10, 0, 0).unwrap(),
            Utc.with_ymd_and_hms(2009, 3, 6, 11, 0, 0).unwrap(),
            5,
            TimeUnit::Minute,
        )
    }

    #[tokio::test]
    async fn test_job_roundtrip_survives_reopen() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("coord.db");
        let job = job();

        {
            let store = SqliteStore::open(&path).unwrap();
            store.insert_job(&job).await.unwrap();
        }

        let store = SqliteStore::open(&path).unwrap();
        assert_eq!(store.get_job(&job.id).await.unwrap(), job);
    }

    #[tokio::test]
    async fn test_ready_ordering_and_limits() {
        let store = SqliteStore::open_in_memory().unwrap();
        let job = job();
        store.insert_job(&job).await.unwrap();
        let actions: Vec<_> = (1..=5)
            .map(|i| CoordinatorAction::new(&job.id, i, job.start_time, ActionStatus::Ready))
            .collect();
        store.insert_actions(&job.id, &actions).await.unwrap();

        let numbers = |v: Vec<CoordinatorAction>| v.iter().map(|a| a.action_number).collect::<Vec<_>>();

        let fifo = store.get_ready_actions(&job.id, Some(2), ExecutionOrder::Fifo).await.unwrap();
        assert_eq!(numbers(fifo), vec![1, 2]);
        let lifo = store.get_ready_actions(&job.id, None, ExecutionOrder::Lifo).await.unwrap();
        assert_eq!(numbers(lifo), vec![5, 4, 3, 2, 1]);
        let last = store.get_ready_actions(&job.id, None, ExecutionOrder::LastOnly).await.unwrap();
        assert_eq!(numbers(last), vec![5]);
        let last_capped = store
            .get_ready_actions(&job.id, Some(4), ExecutionOrder::LastOnly)
            .await
            .unwrap();
        assert_eq!(numbers(last_capped), vec![5]);
    }

    #[tokio::test]
    async fn test_materialize_batch_rolls_back_on_conflict() {
        let store = SqliteStore::open_in_memory().unwrap();
        let mut job = job();
        store.insert_job(&job).await.unwrap();

        let first = CoordinatorAction::new(&job.id, 1, job.start_time, ActionStatus::Ready);
        store.insert_actions(&job.id, &[first.clone()]).await.unwrap();

        job.last_action_number = 2;
        let second = CoordinatorAction::new(&job.id, 2, job.start_time, ActionStatus::Ready);
        let result = store.materialize_batch(&job, &[second, first]).await;
        assert!(matches!(result, Err(StoreError::Conflict { .. })));

        assert_eq!(store.get_actions(&job.id).await.unwrap().len(), 1);
        assert_eq!(store.get_job(&job.id).await.unwrap().last_action_number, 0);
    }

    #[tokio::test]
    async fn test_external_id_and_jobs_to_materialize() {
        let store = SqliteStore::open_in_memory().unwrap();
        let job = job();
        store.insert_job(&job).await.unwrap();

        let mut action = CoordinatorAction::new(&job.id, 1, job.start_time, ActionStatus::Submitted);
        store.insert_actions(&job.id, &[action.clone()]).await.unwrap();
        action.status = ActionStatus::Running;
        action.external_id = Some("wf-42".to_string());
        store.update_action(&action).await.unwrap();

        let found = store.get_action_for_external_id("wf-42").await.unwrap().unwrap();
        assert_eq!(found.status, ActionStatus::Running);
        assert_eq!(store.count_running_or_submitted(&job.id).await.unwrap(), 1);

        let due = store
            .list_jobs_to_materialize(job.start_time + chrono::Duration::minutes(1))
            .await
            .unwrap();
        assert_eq!(due, vec![job.id.clone()]);
        assert!(store.list_jobs_to_materialize(job.start_time).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_stalled_starts_exclude_started_and_recent() {
        let store = SqliteStore::open_in_memory().unwrap();
        let job = job();
        store.insert_job(&job).await.unwrap();

        let mut stalled = CoordinatorAction::new(&job.id, 1, job.start_time, ActionStatus::Submitted);
        stalled.last_modified_time = job.start_time;
        let mut started = CoordinatorAction::new(&job.id, 2, job.start_time, ActionStatus::Submitted);
        started.external_id = Some("wf-2".to_string());
        started.last_modified_time = job.start_time;
        let recent = CoordinatorAction::new(&job.id, 3, job.start_time, ActionStatus::Submitted);
        let mut running = CoordinatorAction::new(&job.id, 4, job.start_time, ActionStatus::Running);
        running.last_modified_time = job.start_time;
        store
            .insert_actions(&job.id, &[stalled, started, recent, running])
            .await
            .unwrap();

        let cutoff = Utc::now() - chrono::Duration::minutes(1);
        let found = store.list_stalled_starts(cutoff).await.unwrap();
        let numbers: Vec<u32> = found.iter().map(|a| a.action_number).collect();
        assert_eq!(numbers, vec![1]);
    }

    #[tokio::test]
    async fn test_job_held_by_pause_is_not_due() {
        let store = SqliteStore::open_in_memory().unwrap();
        let mut job = job();
        store.insert_job(&job).await.unwrap();
        assert_eq!(
            store.list_jobs_to_materialize(job.end_time).await.unwrap(),
            vec![job.id.clone()]
        );

        // Next tick 10:00 is at the pause time
        job.pause_time = Some(job.start_time);
        store.update_job(&job).await.unwrap();
        assert!(store.list_jobs_to_materialize(job.end_time).await.unwrap().is_empty());

        job.pause_time = Some(job.start_time + chrono::Duration::minutes(10));
        store.update_job(&job).await.unwrap();
        assert_eq!(
            store.list_jobs_to_materialize(job.end_time).await.unwrap(),
            vec![job.id.clone()]
        );
    }
}
