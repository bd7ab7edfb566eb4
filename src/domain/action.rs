//! Coordinator actions: one materialized unit of work per recurrence tick.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A materialized, schedulable action
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CoordinatorAction {
    /// `jobId@actionNumber`
    pub id: String,

    pub job_id: String,

    /// 1-based, contiguous per job
    pub action_number: u32,

    /// Scheduled time of the tick this action represents
    pub nominal_time: DateTime<Utc>,

    pub created_time: DateTime<Utc>,
    pub last_modified_time: DateTime<Utc>,

    pub status: ActionStatus,

    /// Workflow-engine job id, set once the action has been started
    pub external_id: Option<String>,

    /// Configuration the action was created with
    #[serde(default)]
    pub created_conf: String,

    /// Minutes to wait for inputs; negative means no timeout
    pub timeout_minutes: i32,

    /// Opaque SLA metadata forwarded to the SLA log
    pub sla: Option<String>,
}

impl CoordinatorAction {
    /// Create a new action for `job_id` at tick `action_number`
    pub fn new(
        job_id: &str,
        action_number: u32,
        nominal_time: DateTime<Utc>,
        status: ActionStatus,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: action_id(job_id, action_number),
            job_id: job_id.to_string(),
            action_number,
            nominal_time,
            created_time: now,
            last_modified_time: now,
            status,
            external_id: None,
            created_conf: String::new(),
            timeout_minutes: -1,
            sla: None,
        }
    }

    pub fn touch(&mut self) {
        self.last_modified_time = Utc::now();
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }
}

/// Render an action id: `jobId@actionNumber`
pub fn action_id(job_id: &str, action_number: u32) -> String {
    format!("{}@{}", job_id, action_number)
}

/// Split an action id into its job id and action number
pub fn parse_action_id(id: &str) -> Option<(&str, u32)> {
    let (job_id, number) = id.rsplit_once('@')?;
    if job_id.is_empty() {
        return None;
    }
    let number = number.parse().ok()?;
    Some((job_id, number))
}

/// Coordinator action lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ActionStatus {
    /// Materialized, inputs not yet available
    Waiting,
    /// Eligible to run
    Ready,
    /// Chosen by the readiness pass, start queued
    Submitted,
    /// Running in the workflow engine
    Running,
    Succeeded,
    Failed,
    Killed,
}

impl ActionStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::Killed)
    }

    /// Statuses that occupy a concurrency slot
    pub fn is_active(self) -> bool {
        matches!(self, Self::Submitted | Self::Running)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Waiting => "WAITING",
            Self::Ready => "READY",
            Self::Submitted => "SUBMITTED",
            Self::Running => "RUNNING",
            Self::Succeeded => "SUCCEEDED",
            Self::Failed => "FAILED",
            Self::Killed => "KILLED",
        }
    }
}

impl fmt::Display for ActionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ActionStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "WAITING" => Ok(Self::Waiting),
            "READY" => Ok(Self::Ready),
            "SUBMITTED" => Ok(Self::Submitted),
            "RUNNING" => Ok(Self::Running),
            "SUCCEEDED" => Ok(Self::Succeeded),
            "FAILED" => Ok(Self::Failed),
            "KILLED" => Ok(Self::Killed),
            other => Err(format!("unknown action status '{}'", other)),
        }
    }
}

/// Status reported by the workflow engine for a dispatched workflow.
///
/// Unrecognized values are kept verbatim so they can be logged.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum WorkflowStatus {
    Prep,
    Running,
    Suspended,
    Succeeded,
    Failed,
    Killed,
    Other(String),
}

impl From<String> for WorkflowStatus {
    fn from(s: String) -> Self {
        match s.to_ascii_uppercase().as_str() {
            "PREP" => Self::Prep,
            "RUNNING" => Self::Running,
            "SUSPENDED" => Self::Suspended,
            "SUCCEEDED" => Self::Succeeded,
            "FAILED" => Self::Failed,
            "KILLED" => Self::Killed,
            _ => Self::Other(s),
        }
    }
}

impl From<&str> for WorkflowStatus {
    fn from(s: &str) -> Self {
        Self::from(s.to_string())
    }
}

impl From<WorkflowStatus> for String {
    fn from(status: WorkflowStatus) -> Self {
        status.to_string()
    }
}

impl fmt::Display for WorkflowStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Prep => f.write_str("PREP"),
            Self::Running => f.write_str("RUNNING"),
            Self::Suspended => f.write_str("SUSPENDED"),
            Self::Succeeded => f.write_str("SUCCEEDED"),
            Self::Failed => f.write_str("FAILED"),
            Self::Killed => f.write_str("KILLED"),
            Self::Other(s) => f.write_str(s),
        }
    }
}
