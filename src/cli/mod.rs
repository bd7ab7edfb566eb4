//! Command-line interface for cadence.
//!
//! Provides commands for submitting coordinator jobs, materializing and
//! dispatching their actions, feeding workflow callbacks, inspecting jobs
//! and SLA events, and running the scheduler as a long-lived service.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use serde::Serialize;
use tracing::info;

use crate::adapters::{HttpWorkflowEngine, JsonlSlaLog};
use crate::config::{self, ResolvedConfig};
use crate::core::{Coordinator, JobDefinition, Outcome};
use crate::domain::WorkflowStatus;
use crate::store::SqliteStore;

/// cadence - Coordinator job scheduler
#[derive(Parser, Debug)]
#[command(name = "cadence")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Submit a coordinator job from a YAML definition
    Submit {
        /// Job definition file
        file: PathBuf,
    },

    /// Materialize actions for a job
    Materialize {
        /// Coordinator job ID
        job_id: String,

        /// Window start (defaults to the job's next tick)
        #[arg(long)]
        start: Option<DateTime<Utc>>,

        /// Window end (defaults to now plus the configured lookahead)
        #[arg(long)]
        end: Option<DateTime<Utc>>,

        /// Keep running follow-up commands until none remain
        #[arg(long)]
        drain: bool,
    },

    /// Dispatch a job's READY actions
    Ready {
        /// Coordinator job ID
        job_id: String,

        /// Keep running follow-up commands until none remain
        #[arg(long)]
        drain: bool,
    },

    /// Report a workflow status change
    Callback {
        /// Workflow (external) ID
        workflow_id: String,

        /// Workflow status, e.g. SUCCEEDED
        status: String,

        /// Keep running follow-up commands until none remain
        #[arg(long)]
        drain: bool,
    },

    /// Mark a WAITING action's inputs as available
    Resolve {
        /// Action ID (jobId@number)
        action_id: String,
    },

    /// Show a job and a page of its actions
    Info {
        /// Coordinator job ID
        job_id: String,

        /// First action number to show (1-based)
        #[arg(long, default_value = "1")]
        start: usize,

        /// Number of actions to show
        #[arg(long, default_value = "50")]
        len: usize,

        /// Print JSON instead of a table
        #[arg(long)]
        json: bool,
    },

    /// Show one action
    Action {
        /// Action ID (jobId@number)
        action_id: String,
    },

    /// List SLA events after a sequence id
    Sla {
        /// Only events with a greater sequence id
        #[arg(long, default_value = "0")]
        since: u64,

        /// Maximum number of events
        #[arg(short, long, default_value = "100")]
        limit: usize,
    },

    /// Run workers and periodic triggers until interrupted
    Serve,

    /// Show resolved configuration (debug)
    Config,
}

impl Cli {
    /// Execute the CLI command
    pub async fn execute(self) -> Result<()> {
        match self.command {
            Commands::Submit { file } => submit(&file).await,
            Commands::Materialize {
                job_id,
                start,
                end,
                drain,
            } => materialize(&job_id, start, end, drain).await,
            Commands::Ready { job_id, drain } => {
                let coordinator = open_coordinator().await?;
                let outcome = coordinator.schedule_ready(&job_id).await?;
                finish(&coordinator, outcome, drain).await
            }
            Commands::Callback {
                workflow_id,
                status,
                drain,
            } => {
                let coordinator = open_coordinator().await?;
                let status = WorkflowStatus::from(status.to_ascii_uppercase());
                let outcome = coordinator
                    .workflow_status_changed(&workflow_id, status)
                    .await?;
                finish(&coordinator, outcome, drain).await
            }
            Commands::Resolve { action_id } => {
                let coordinator = open_coordinator().await?;
                let outcome = coordinator.resolve_inputs(&action_id).await?;
                finish(&coordinator, outcome, false).await
            }
            Commands::Info {
                job_id,
                start,
                len,
                json,
            } => show_job(&job_id, start, len, json).await,
            Commands::Action { action_id } => {
                let coordinator = open_coordinator().await?;
                let action = coordinator.action_info(&action_id).await?;
                print_json(&action)
            }
            Commands::Sla { since, limit } => {
                let coordinator = open_coordinator().await?;
                let (events, last_seq_id) = coordinator.sla_events_since(since, limit).await?;
                print_json(&serde_json::json!({
                    "events": events,
                    "last_seq_id": last_seq_id,
                }))
            }
            Commands::Serve => serve().await,
            Commands::Config => show_config(),
        }
    }
}

/// Build a coordinator over the configured SQLite store, SLA log and engine
async fn open_coordinator() -> Result<Coordinator> {
    let cfg = config::config()?;
    coordinator_from(cfg).await
}

async fn coordinator_from(cfg: &ResolvedConfig) -> Result<Coordinator> {
    if let Some(parent) = cfg.store_path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create {}", parent.display()))?;
    }
    let store = SqliteStore::open(&cfg.store_path)
        .with_context(|| format!("Failed to open store: {}", cfg.store_path.display()))?;
    let sla = JsonlSlaLog::open(&cfg.sla_log_path)
        .await
        .with_context(|| format!("Failed to open SLA log: {}", cfg.sla_log_path.display()))?;
    let engine = HttpWorkflowEngine::new(&cfg.engine_url, cfg.scheduler.engine_timeout);

    Ok(Coordinator::new(
        Arc::new(store),
        Arc::new(engine),
        Arc::new(sla),
        cfg.scheduler.clone(),
    ))
}

/// Report a command outcome, optionally draining follow-up commands.
///
/// Without `--drain` queued follow-ups are dropped; `serve` picks the work
/// up again from the store on its next scan.
async fn finish(coordinator: &Coordinator, outcome: Outcome, drain: bool) -> Result<()> {
    match outcome {
        Outcome::Executed => eprintln!("Done"),
        Outcome::Skipped(reason) => eprintln!("Skipped: {}", reason),
    }

    if drain {
        let processed = coordinator.run_until_idle().await;
        eprintln!("Ran {} follow-up command(s)", processed);
        let failures = coordinator.dead_letters();
        if !failures.is_empty() {
            for failure in &failures {
                eprintln!(
                    "  failed: {} {} after {} attempt(s): {}",
                    failure.command,
                    failure.entity.as_deref().unwrap_or("-"),
                    failure.attempts,
                    failure.error
                );
            }
            anyhow::bail!("{} follow-up command(s) failed", failures.len());
        }
    }
    Ok(())
}

async fn submit(file: &std::path::Path) -> Result<()> {
    let job = JobDefinition::from_file(file)?.into_job()?;
    let coordinator = open_coordinator().await?;
    let job_id = coordinator.submit_job(job).await?;
    println!("{}", job_id);
    Ok(())
}

async fn materialize(
    job_id: &str,
    start: Option<DateTime<Utc>>,
    end: Option<DateTime<Utc>>,
    drain: bool,
) -> Result<()> {
    let coordinator = open_coordinator().await?;
    let job = coordinator.store().get_job(job_id).await?;

    let window_start = start
        .or(job.next_materialized_time)
        .unwrap_or(job.start_time);
    let window_end = match end {
        Some(end) => end,
        None => {
            let lookahead = chrono::Duration::from_std(coordinator.settings().materialization_lookahead)
                .context("Lookahead out of range")?;
            Utc::now() + lookahead
        }
    };

    info!(job_id, %window_start, %window_end, "Materializing");
    let outcome = coordinator
        .materialize(job_id, window_start, window_end.max(window_start))
        .await?;
    finish(&coordinator, outcome, drain).await
}

async fn show_job(job_id: &str, start: usize, len: usize, json: bool) -> Result<()> {
    let coordinator = open_coordinator().await?;
    let info = coordinator.job_info(job_id, start, len).await?;

    if json {
        return print_json(&info);
    }

    let job = &info.job;
    println!("Job ID: {}", job.id);
    println!("App: {}", job.app_name);
    println!("Status: {}", job.status);
    println!("Frequency: {} {}", job.frequency, job.time_unit);
    println!("Window: {} .. {} ({})", job.start_time, job.end_time, job.time_zone);
    println!("Concurrency: {} ({})", job.concurrency, job.execution_order);
    if let Some(pause) = job.pause_time {
        println!("Pause: {}", pause);
    }
    if let Some(next) = job.next_materialized_time {
        println!("Next tick: {}", next);
    }
    println!("Actions materialized: {}", job.last_action_number);

    if info.actions.is_empty() {
        return Ok(());
    }

    println!();
    println!("{:<6} {:<27} {:<10} {:<30}", "#", "NOMINAL", "STATUS", "WORKFLOW");
    println!("{}", "-".repeat(75));
    for action in &info.actions {
        println!(
            "{:<6} {:<27} {:<10} {:<30}",
            action.action_number,
            action.nominal_time.to_rfc3339(),
            action.status,
            action.external_id.as_deref().unwrap_or("-")
        );
    }

    Ok(())
}

/// Run workers and triggers until Ctrl-C
async fn serve() -> Result<()> {
    let coordinator = open_coordinator().await?;
    let settings = coordinator.settings();
    info!(
        workers = settings.workers,
        materialization_interval_secs = settings.materialization_interval.as_secs(),
        ready_check_interval_secs = settings.ready_check_interval.as_secs(),
        "Starting scheduler"
    );

    let mut handles = coordinator.spawn_workers();
    handles.extend(coordinator.spawn_triggers());

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;
    info!("Shutting down");

    for handle in handles {
        handle.abort();
    }
    Ok(())
}

/// Show the resolved configuration (for debugging)
fn show_config() -> Result<()> {
    let cfg = config::config()?;
    let s = &cfg.scheduler;

    println!(
        "Config file: {}",
        cfg.config_file
            .as_ref()
            .map(|p| p.display().to_string())
            .unwrap_or_else(|| "(none - using defaults)".to_string())
    );
    println!();
    println!("Paths:");
    println!("  Home:    {}", cfg.home.display());
    println!("  Store:   {}", cfg.store_path.display());
    println!("  SLA log: {}", cfg.sla_log_path.display());
    println!();
    println!("Engine: {} (timeout {}s)", cfg.engine_url, s.engine_timeout.as_secs());
    println!();
    println!("Scheduler:");
    println!("  Workers:                {}", s.workers);
    println!("  Lock timeout:           {}s", s.lock_timeout.as_secs());
    println!("  Dispatch delay:         {}ms", s.dispatch_delay.as_millis());
    println!("  Max attempts:           {}", s.retry.max_attempts);
    println!(
        "  Retry backoff:          {}ms .. {}ms",
        s.retry.first_backoff.as_millis(),
        s.retry.max_backoff.as_millis()
    );
    println!("  Materialize every:      {}s", s.materialization_interval.as_secs());
    println!("  Materialize lookahead:  {}s", s.materialization_lookahead.as_secs());
    println!("  Ready check every:      {}s", s.ready_check_interval.as_secs());
    println!();
    println!("Action timeouts:");
    println!("  Normal default:  {} min", s.normal_timeout_minutes);
    println!("  Catch-up default: {} min", s.catchup_timeout_minutes);

    Ok(())
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
