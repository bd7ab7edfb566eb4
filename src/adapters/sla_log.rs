//! Append-only SLA event log.
//!
//! The file-backed log stores one JSON event per line; the next sequence id
//! is recovered by replaying the file on open.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::Utc;
use thiserror::Error;
use tokio::fs::{self, File, OpenOptions};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::Mutex;

use crate::domain::{SlaAppType, SlaEvent, SlaStatus};

/// Errors that can occur writing or reading SLA events
#[derive(Debug, Error)]
pub enum SlaError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Sink for SLA status events
#[async_trait]
pub trait SlaSink: Send + Sync {
    /// Append an event and return its sequence id
    async fn append(
        &self,
        sla_id: &str,
        status: SlaStatus,
        app_type: SlaAppType,
    ) -> Result<u64, SlaError>;

    /// Up to `limit` events with a sequence id greater than `seq_id`, plus the
    /// highest sequence id seen (or `seq_id` when nothing is newer)
    async fn events_since(
        &self,
        seq_id: u64,
        limit: usize,
    ) -> Result<(Vec<SlaEvent>, u64), SlaError>;
}

fn newer_than(events: &[SlaEvent], seq_id: u64, limit: usize) -> (Vec<SlaEvent>, u64) {
    let selected: Vec<SlaEvent> = events
        .iter()
        .filter(|e| e.seq_id > seq_id)
        .take(limit)
        .cloned()
        .collect();
    let last = selected.iter().map(|e| e.seq_id).max().unwrap_or(seq_id);
    (selected, last)
}

/// In-memory SLA log
#[derive(Default)]
pub struct MemorySlaLog {
    events: Mutex<Vec<SlaEvent>>,
}

impl MemorySlaLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of every recorded event
    pub async fn events(&self) -> Vec<SlaEvent> {
        self.events.lock().await.clone()
    }
}

#[async_trait]
impl SlaSink for MemorySlaLog {
    async fn append(
        &self,
        sla_id: &str,
        status: SlaStatus,
        app_type: SlaAppType,
    ) -> Result<u64, SlaError> {
        let mut events = self.events.lock().await;
        let seq_id = events.len() as u64 + 1;
        events.push(SlaEvent {
            seq_id,
            sla_id: sla_id.to_string(),
            status,
            app_type,
            timestamp: Utc::now(),
        });
        Ok(seq_id)
    }

    async fn events_since(
        &self,
        seq_id: u64,
        limit: usize,
    ) -> Result<(Vec<SlaEvent>, u64), SlaError> {
        let events = self.events.lock().await;
        Ok(newer_than(&events, seq_id, limit))
    }
}

/// JSONL-backed SLA log
pub struct JsonlSlaLog {
    path: PathBuf,
    /// Last assigned sequence id; also serializes appends
    last_seq: Mutex<u64>,
}

impl JsonlSlaLog {
    /// Open (creating parent directories) the log at `path`
    pub async fn open(path: impl Into<PathBuf>) -> Result<Self, SlaError> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }
        let last_seq = replay(&path)
            .await?
            .last()
            .map(|e| e.seq_id)
            .unwrap_or(0);
        Ok(Self {
            path,
            last_seq: Mutex::new(last_seq),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Read every event in file order
async fn replay(path: &Path) -> Result<Vec<SlaEvent>, SlaError> {
    if !path.exists() {
        return Ok(Vec::new());
    }

    let file = File::open(path).await?;
    let mut lines = BufReader::new(file).lines();
    let mut events = Vec::new();

    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }
        events.push(serde_json::from_str(&line)?);
    }

    Ok(events)
}

#[async_trait]
impl SlaSink for JsonlSlaLog {
    async fn append(
        &self,
        sla_id: &str,
        status: SlaStatus,
        app_type: SlaAppType,
    ) -> Result<u64, SlaError> {
        let mut last_seq = self.last_seq.lock().await;
        let event = SlaEvent {
            seq_id: *last_seq + 1,
            sla_id: sla_id.to_string(),
            status,
            app_type,
            timestamp: Utc::now(),
        };

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;
        let json = serde_json::to_string(&event)?;
        file.write_all(format!("{}\n", json).as_bytes()).await?;
        file.flush().await?;

        *last_seq = event.seq_id;
        Ok(event.seq_id)
    }

    async fn events_since(
        &self,
        seq_id: u64,
        limit: usize,
    ) -> Result<(Vec<SlaEvent>, u64), SlaError> {
        let events = replay(&self.path).await?;
        Ok(newer_than(&events, seq_id, limit))
    }
}
