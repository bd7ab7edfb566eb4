//! Core scheduling logic.
//!
//! This module contains:
//! - Command / CommandExecutor: locked, phased command execution with retry
//! - Materializer: ticks in a window become persisted actions
//! - Readiness: concurrency-limited dispatch of READY actions
//! - Reconciler: workflow status mapped back onto actions
//! - Coordinator: facade wiring store, engine and SLA sink together

pub mod command;
pub mod coordinator;
pub mod definition;
pub mod error;
pub mod executor;
pub mod lock;
pub mod materializer;
pub mod query;
pub mod queue;
pub mod readiness;
pub mod reconciler;
pub mod retry;
pub mod settings;
pub mod triggers;

// Re-export commonly used types
pub use command::{Command, CommandContext, CommandPhase};
pub use coordinator::Coordinator;
pub use definition::JobDefinition;
pub use error::{CommandError, CommandFailure, Outcome};
pub use executor::CommandExecutor;
pub use lock::LockRegistry;
pub use query::JobInfo;
pub use queue::CommandQueue;
pub use readiness::available_slots;
pub use reconciler::terminal_mapping;
pub use retry::RetryPolicy;
pub use settings::SchedulerSettings;
