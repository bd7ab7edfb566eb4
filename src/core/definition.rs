//! Coordinator job definitions.
//!
//! Jobs are submitted as YAML documents describing the recurrence (start,
//! end, frequency, time zone) and the dispatch policy (concurrency and
//! execution order).

use std::path::Path;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::{CoordinatorJob, ExecutionOrder, TimeUnit};

/// A job definition as written by users
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobDefinition {
    /// Application name
    pub name: String,

    /// Submitting user
    pub user: String,

    /// Token forwarded to the workflow engine
    #[serde(default)]
    pub auth_token: String,

    pub start: DateTime<Utc>,

    /// Exclusive end of the recurrence
    pub end: DateTime<Utc>,

    pub frequency: u32,

    pub time_unit: TimeUnit,

    #[serde(default = "default_time_zone")]
    pub time_zone: String,

    /// Max concurrently active actions; negative = unlimited
    #[serde(default = "default_concurrency")]
    pub concurrency: i32,

    #[serde(default)]
    pub execution: ExecutionOrder,

    #[serde(default)]
    pub pause_time: Option<DateTime<Utc>>,

    /// Action timeout in minutes
    #[serde(default)]
    pub timeout_minutes: Option<i32>,

    /// Workflow configuration handed to each action
    #[serde(default)]
    pub conf: String,
}

fn default_time_zone() -> String {
    "UTC".to_string()
}

fn default_concurrency() -> i32 {
    1
}

impl JobDefinition {
    /// Load a definition from a YAML file
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read job definition: {}", path.display()))?;

        Self::from_yaml(&content)
    }

    /// Parse a definition from YAML content
    pub fn from_yaml(content: &str) -> Result<Self> {
        serde_yaml::from_str(content).context("Failed to parse job definition YAML")
    }

    /// Validate the definition
    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            anyhow::bail!("Job name cannot be empty");
        }
        if self.user.trim().is_empty() {
            anyhow::bail!("Job user cannot be empty");
        }
        if self.frequency == 0 {
            anyhow::bail!("Job frequency must be positive");
        }
        if self.end <= self.start {
            anyhow::bail!("Job end {} must be after start {}", self.end, self.start);
        }
        self.time_zone
            .parse::<chrono_tz::Tz>()
            .map_err(|_| anyhow::anyhow!("Unknown time zone '{}'", self.time_zone))?;
        Ok(())
    }

    /// Build a new PREP job from this definition
    pub fn into_job(self) -> Result<CoordinatorJob> {
        self.validate()?;

        let mut job = CoordinatorJob::new(
            self.name,
            self.user,
            self.start,
            self.end,
            self.frequency,
            self.time_unit,
        );
        job.auth_token = self.auth_token;
        job.time_zone = self.time_zone;
        job.concurrency = self.concurrency;
        job.execution_order = self.execution;
        job.pause_time = self.pause_time;
        job.timeout_minutes = self.timeout_minutes;
        job.conf = self.conf;
        Ok(job)
    }
}
