//! Configuration for cadence.
//!
//! Configuration sources (highest priority first):
//! 1. Environment variables (CADENCE_HOME, CADENCE_ENGINE_URL)
//! 2. Config file (.cadence/config.yaml)
//! 3. Defaults (~/.cadence)
//!
//! Config file discovery:
//! - Searches current directory and parents for .cadence/config.yaml
//! - `paths.home` is relative to the .cadence/ directory
//! - `paths.store` and `paths.sla_log` are relative to home

use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;

use crate::core::{RetryPolicy, SchedulerSettings};

/// Global cached configuration (stores Result to handle init errors)
static CONFIG: OnceLock<Result<ResolvedConfig, String>> = OnceLock::new();

const DEFAULT_ENGINE_URL: &str = "http://localhost:11000/v1";

/// Raw config file schema (matches YAML structure)
#[derive(Debug, Clone, Deserialize)]
pub struct ConfigFile {
    pub version: String,
    #[serde(default)]
    pub paths: PathsConfig,
    #[serde(default)]
    pub engine: Option<EngineConfig>,
    #[serde(default)]
    pub scheduler: Option<SchedulerConfig>,
    #[serde(default)]
    pub timeouts: Option<TimeoutsConfig>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct PathsConfig {
    /// State directory (relative to .cadence/)
    pub home: Option<String>,
    /// SQLite database (relative to home)
    pub store: Option<String>,
    /// SLA event log (relative to home)
    pub sla_log: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct EngineConfig {
    pub url: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct SchedulerConfig {
    pub workers: Option<usize>,
    pub lock_timeout_seconds: Option<u64>,
    pub dispatch_delay_ms: Option<u64>,
    pub max_attempts: Option<u32>,
    pub initial_retry_delay_ms: Option<u64>,
    pub max_retry_delay_ms: Option<u64>,
    pub engine_timeout_seconds: Option<u64>,
    pub materialization_interval_seconds: Option<u64>,
    pub materialization_lookahead_seconds: Option<u64>,
    pub ready_check_interval_seconds: Option<u64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct TimeoutsConfig {
    pub normal_default_minutes: Option<i32>,
    pub catchup_default_minutes: Option<i32>,
}

/// Resolved configuration with absolute paths
#[derive(Debug, Clone)]
pub struct ResolvedConfig {
    /// Absolute path to cadence home
    pub home: PathBuf,
    /// SQLite store path
    pub store_path: PathBuf,
    /// SLA log path
    pub sla_log_path: PathBuf,
    /// Workflow engine base URL
    pub engine_url: String,
    /// Path to config file (if found)
    pub config_file: Option<PathBuf>,
    /// Settings injected into the scheduler
    pub scheduler: SchedulerSettings,
}

/// Find config file by searching current directory and parents
fn find_config_file() -> Option<PathBuf> {
    let mut current = std::env::current_dir().ok()?;

    loop {
        let config_path = current.join(".cadence").join("config.yaml");
        if config_path.exists() {
            return Some(config_path);
        }

        if !current.pop() {
            break;
        }
    }

    None
}

/// Load and parse config file
fn load_config_file(path: &Path) -> Result<ConfigFile> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    serde_yaml::from_str(&content)
        .with_context(|| format!("Failed to parse config file: {}", path.display()))
}

/// Resolve a path that may be relative to `base`
fn resolve_path(base: &Path, path_str: &str) -> PathBuf {
    let path = PathBuf::from(path_str);
    if path.is_absolute() {
        path
    } else {
        base.join(path)
            .canonicalize()
            .unwrap_or_else(|_| base.join(path_str))
    }
}

/// Overlay file settings on the defaults
fn scheduler_settings(
    scheduler: Option<&SchedulerConfig>,
    timeouts: Option<&TimeoutsConfig>,
) -> SchedulerSettings {
    let mut settings = SchedulerSettings::default();

    if let Some(s) = scheduler {
        if let Some(workers) = s.workers {
            settings.workers = workers.max(1);
        }
        if let Some(secs) = s.lock_timeout_seconds {
            settings.lock_timeout = Duration::from_secs(secs);
        }
        if let Some(ms) = s.dispatch_delay_ms {
            settings.dispatch_delay = Duration::from_millis(ms);
        }
        settings.retry = RetryPolicy::from_config(s);
        if let Some(secs) = s.engine_timeout_seconds {
            settings.engine_timeout = Duration::from_secs(secs);
        }
        if let Some(secs) = s.materialization_interval_seconds {
            settings.materialization_interval = Duration::from_secs(secs.max(1));
        }
        if let Some(secs) = s.materialization_lookahead_seconds {
            settings.materialization_lookahead = Duration::from_secs(secs);
        }
        if let Some(secs) = s.ready_check_interval_seconds {
            settings.ready_check_interval = Duration::from_secs(secs.max(1));
        }
    }

    if let Some(t) = timeouts {
        if let Some(minutes) = t.normal_default_minutes {
            settings.normal_timeout_minutes = minutes;
        }
        if let Some(minutes) = t.catchup_default_minutes {
            settings.catchup_timeout_minutes = minutes;
        }
    }

    settings
}

/// Load configuration from all sources
fn load_config() -> Result<ResolvedConfig> {
    // Default home directory
    let default_home = dirs::home_dir()
        .context("Failed to determine home directory")?
        .join(".cadence");

    // Check for config file
    let config_file = find_config_file();
    let config = config_file
        .as_deref()
        .map(load_config_file)
        .transpose()?;

    let home = if let Ok(env_home) = std::env::var("CADENCE_HOME") {
        PathBuf::from(env_home)
    } else if let (Some(home_path), Some(config_path)) = (
        config.as_ref().and_then(|c| c.paths.home.as_deref()),
        config_file.as_deref(),
    ) {
        // home is relative to .cadence/ directory
        let cadence_dir = config_path.parent().unwrap_or(Path::new("."));
        resolve_path(cadence_dir, home_path)
    } else {
        default_home
    };

    let paths = config.as_ref().map(|c| c.paths.clone()).unwrap_or_default();
    let store_path = resolve_path(&home, paths.store.as_deref().unwrap_or("coordinator.db"));
    let sla_log_path = resolve_path(&home, paths.sla_log.as_deref().unwrap_or("sla_events.jsonl"));

    let engine_url = std::env::var("CADENCE_ENGINE_URL")
        .ok()
        .or_else(|| {
            config
                .as_ref()
                .and_then(|c| c.engine.as_ref())
                .and_then(|e| e.url.clone())
        })
        .unwrap_or_else(|| DEFAULT_ENGINE_URL.to_string());

    let scheduler = scheduler_settings(
        config.as_ref().and_then(|c| c.scheduler.as_ref()),
        config.as_ref().and_then(|c| c.timeouts.as_ref()),
    );

    Ok(ResolvedConfig {
        home,
        store_path,
        sla_log_path,
        engine_url,
        config_file,
        scheduler,
    })
}

/// Get the global configuration (loads once, then cached)
pub fn config() -> Result<&'static ResolvedConfig> {
    let result = CONFIG.get_or_init(|| load_config().map_err(|e| e.to_string()));

    match result {
        Ok(config) => Ok(config),
        Err(e) => anyhow::bail!("{}", e),
    }
}

/// Force reload configuration (useful for testing)
pub fn reload_config() -> Result<ResolvedConfig> {
    load_config()
}

/// Get the cadence home directory
pub fn cadence_home() -> Result<PathBuf> {
    Ok(config()?.home.clone())
}
