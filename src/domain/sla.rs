//! SLA events: append-only audit records of status transitions.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A single SLA status event
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SlaEvent {
    /// Monotonically increasing sequence id (starts at 1)
    pub seq_id: u64,

    /// Job or action id the event refers to
    pub sla_id: String,

    pub status: SlaStatus,

    pub app_type: SlaAppType,

    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SlaStatus {
    Created,
    Started,
    Succeeded,
    Failed,
    Killed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SlaAppType {
    WorkflowJob,
    CoordinatorAction,
}
