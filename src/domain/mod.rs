//! Domain types for the coordinator scheduler.
//!
//! This module contains the core data structures:
//! - Job: recurrence definition and scheduling policy
//! - Action: one materialized tick of a job
//! - Sla: status-change audit events

pub mod action;
pub mod job;
pub mod sla;

// Re-export commonly used types
pub use action::{action_id, parse_action_id, ActionStatus, CoordinatorAction, WorkflowStatus};
pub use job::{generate_job_id, CoordinatorJob, ExecutionOrder, JobStatus, TimeUnit};
pub use sla::{SlaAppType, SlaEvent, SlaStatus};
