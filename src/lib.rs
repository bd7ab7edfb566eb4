//! cadence - Coordinator job scheduler
//!
//! Materializes the recurrence ticks of coordinator jobs into actions,
//! dispatches READY actions to a workflow engine within per-job concurrency
//! limits, and reconciles workflow status back onto the actions.
//!
//! # Architecture
//!
//! All state changes run as commands:
//! - Each command locks the job it touches and checks a precondition
//!   against freshly loaded state before mutating anything
//! - Follow-up work is queued, never run inline
//! - Transient failures are retried with exponential backoff
//!
//! # Modules
//!
//! - `adapters`: External collaborators (workflow engine, SLA log, inputs)
//! - `core`: Commands, executor, materializer, readiness, reconciler
//! - `domain`: Data structures (CoordinatorJob, CoordinatorAction, SlaEvent)
//! - `store`: Persistence (in-memory and SQLite)
//! - `cli`: Command-line interface
//!
//! # Usage
//!
//! ```bash
//! # Submit a job and materialize its first window
//! cadence submit hourly.yaml
//! cadence materialize <job-id> --drain
//!
//! # Report a workflow result
//! cadence callback <workflow-id> SUCCEEDED --drain
//!
//! # Run the scheduler
//! cadence serve
//! ```

pub mod adapters;
pub mod cli;
pub mod config;
pub mod core;
pub mod domain;
pub mod store;

// Re-export main types at crate root for convenience
pub use self::core::{Command, CommandError, Coordinator, JobDefinition, Outcome, SchedulerSettings};
pub use domain::{
    ActionStatus, CoordinatorAction, CoordinatorJob, ExecutionOrder, JobStatus, SlaEvent,
    SlaStatus, TimeUnit, WorkflowStatus,
};
pub use store::{CoordinatorStore, MemoryStore, SqliteStore, StoreError};
