//! Coordinator job: a recurrence definition plus its scheduling policy.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Duration, LocalResult, Months, NaiveDateTime, TimeZone, Utc};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A recurring job definition owned by the scheduler core
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CoordinatorJob {
    /// Unique job identifier
    pub id: String,

    /// Application name (display only)
    pub app_name: String,

    /// Submitting user, forwarded to the workflow engine
    pub user: String,

    /// Auth token forwarded to the workflow engine
    #[serde(default)]
    pub auth_token: String,

    /// First nominal time
    pub start_time: DateTime<Utc>,

    /// Exclusive end of the recurrence
    pub end_time: DateTime<Utc>,

    /// Number of `time_unit`s between ticks
    pub frequency: u32,

    pub time_unit: TimeUnit,

    /// IANA time zone used for calendar arithmetic (e.g. "America/Los_Angeles")
    pub time_zone: String,

    /// Max actions RUNNING or SUBMITTED at once; negative means unlimited
    pub concurrency: i32,

    pub execution_order: ExecutionOrder,

    /// Ticks at or after this instant are not materialized
    pub pause_time: Option<DateTime<Utc>>,

    /// Action timeout in minutes (None falls back to the configured default)
    pub timeout_minutes: Option<i32>,

    /// Proto-configuration copied into each action's created conf
    #[serde(default)]
    pub conf: String,

    pub status: JobStatus,

    /// Count of actions ever materialized for this job
    pub last_action_number: u32,

    /// Nominal time of the last materialized action
    pub last_action_time: Option<DateTime<Utc>>,

    /// Nominal time of the next tick to materialize
    pub next_materialized_time: Option<DateTime<Utc>>,

    /// Set once the next tick reaches `end_time`
    #[serde(default)]
    pub done_materialization: bool,

    pub created_time: DateTime<Utc>,
    pub last_modified_time: DateTime<Utc>,
}

impl CoordinatorJob {
    /// Create a job in `PREP` with nothing materialized yet
    pub fn new(
        app_name: impl Into<String>,
        user: impl Into<String>,
        start_time: DateTime<Utc>,
        end_time: DateTime<Utc>,
        frequency: u32,
        time_unit: TimeUnit,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: generate_job_id(),
            app_name: app_name.into(),
            user: user.into(),
            auth_token: String::new(),
            start_time,
            end_time,
            frequency,
            time_unit,
            time_zone: "UTC".to_string(),
            concurrency: 1,
            execution_order: ExecutionOrder::Fifo,
            pause_time: None,
            timeout_minutes: None,
            conf: String::new(),
            status: JobStatus::Prep,
            last_action_number: 0,
            last_action_time: None,
            next_materialized_time: None,
            done_materialization: false,
            created_time: now,
            last_modified_time: now,
        }
    }

    /// Parse the job's time zone
    pub fn tz(&self) -> Result<Tz, String> {
        self.time_zone
            .parse::<Tz>()
            .map_err(|_| format!("unknown time zone '{}'", self.time_zone))
    }

    /// Nominal time of tick `k` (0-based): `start + k * frequency`.
    ///
    /// Always computed from `start_time` so that month/DST boundaries never
    /// accumulate drift.
    pub fn tick(&self, k: u32, tz: &Tz) -> Option<DateTime<Utc>> {
        let steps = k.checked_mul(self.frequency)?;
        self.time_unit.advance(self.start_time, steps, tz)
    }

    /// Nominal time of the next tick to materialize
    pub fn next_tick_time(&self) -> DateTime<Utc> {
        self.next_materialized_time.unwrap_or(self.start_time)
    }

    /// Whether the pause time holds back every remaining tick
    pub fn is_paused_at_next_tick(&self) -> bool {
        self.pause_time
            .is_some_and(|pause| self.next_tick_time() >= pause)
    }

    /// Whether the job is in a terminal state
    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    pub fn touch(&mut self) {
        self.last_modified_time = Utc::now();
    }
}

/// Generate a coordinator job id (`<uuid>-C`)
pub fn generate_job_id() -> String {
    format!("{}-C", Uuid::new_v4().simple())
}

/// Unit of a job's frequency
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TimeUnit {
    Minute,
    Hour,
    Day,
    Week,
    Month,
    Year,
}

impl TimeUnit {
    /// Advance `from` by `n` units.
    ///
    /// Minutes and hours are absolute durations. Days and larger move the
    /// local wall-clock time in `tz`, so a daily 02:00 job stays at 02:00
    /// across DST changes and a monthly job keeps its day of month (clamped
    /// to the month's last day).
    pub fn advance(self, from: DateTime<Utc>, n: u32, tz: &Tz) -> Option<DateTime<Utc>> {
        match self {
            Self::Minute => from.checked_add_signed(Duration::minutes(n as i64)),
            Self::Hour => from.checked_add_signed(Duration::hours(n as i64)),
            Self::Day => shift_local(from, tz, |local| {
                local.checked_add_signed(Duration::days(n as i64))
            }),
            Self::Week => shift_local(from, tz, |local| {
                local.checked_add_signed(Duration::weeks(n as i64))
            }),
            Self::Month => shift_local(from, tz, |local| local.checked_add_months(Months::new(n))),
            Self::Year => shift_local(from, tz, |local| {
                local.checked_add_months(Months::new(n.checked_mul(12)?))
            }),
        }
    }

    /// Approximate length of one unit in minutes (only used for freshness checks)
    pub fn approx_minutes(self) -> i64 {
        match self {
            Self::Minute => 1,
            Self::Hour => 60,
            Self::Day => 60 * 24,
            Self::Week => 60 * 24 * 7,
            Self::Month => 60 * 24 * 30,
            Self::Year => 60 * 24 * 365,
        }
    }
}

fn shift_local<F>(from: DateTime<Utc>, tz: &Tz, f: F) -> Option<DateTime<Utc>>
where
    F: FnOnce(NaiveDateTime) -> Option<NaiveDateTime>,
{
    let local = from.with_timezone(tz).naive_local();
    let shifted = f(local)?;
    resolve_local(tz, shifted)
}

/// Map a local wall-clock time back to UTC.
///
/// Ambiguous times (DST fall-back) take the earlier instant; times inside a
/// spring-forward gap move forward by the gap.
fn resolve_local(tz: &Tz, local: NaiveDateTime) -> Option<DateTime<Utc>> {
    match tz.from_local_datetime(&local) {
        LocalResult::Single(dt) => Some(dt.with_timezone(&Utc)),
        LocalResult::Ambiguous(earliest, _) => Some(earliest.with_timezone(&Utc)),
        LocalResult::None => {
            let later = local.checked_add_signed(Duration::hours(1))?;
            tz.from_local_datetime(&later)
                .earliest()
                .map(|dt| dt.with_timezone(&Utc))
        }
    }
}

impl fmt::Display for TimeUnit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Minute => "MINUTE",
            Self::Hour => "HOUR",
            Self::Day => "DAY",
            Self::Week => "WEEK",
            Self::Month => "MONTH",
            Self::Year => "YEAR",
        };
        f.write_str(s)
    }
}

impl FromStr for TimeUnit {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "MINUTE" => Ok(Self::Minute),
            "HOUR" => Ok(Self::Hour),
            "DAY" => Ok(Self::Day),
            "WEEK" => Ok(Self::Week),
            "MONTH" => Ok(Self::Month),
            "YEAR" => Ok(Self::Year),
            other => Err(format!("unknown time unit '{}'", other)),
        }
    }
}

/// Policy for choosing READY actions when concurrency is constrained
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExecutionOrder {
    /// Oldest action first
    #[default]
    Fifo,
    /// Newest action first
    Lifo,
    /// Only the newest READY action
    LastOnly,
}

impl fmt::Display for ExecutionOrder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Fifo => "FIFO",
            Self::Lifo => "LIFO",
            Self::LastOnly => "LAST_ONLY",
        };
        f.write_str(s)
    }
}

impl FromStr for ExecutionOrder {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "FIFO" => Ok(Self::Fifo),
            "LIFO" => Ok(Self::Lifo),
            "LAST_ONLY" => Ok(Self::LastOnly),
            other => Err(format!("unknown execution order '{}'", other)),
        }
    }
}

/// Coordinator job lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    Prep,
    Premater,
    Running,
    Paused,
    Suspended,
    Succeeded,
    Failed,
    Killed,
    #[serde(rename = "DONEWITHERROR")]
    DoneWithError,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Succeeded | Self::Failed | Self::Killed | Self::DoneWithError
        )
    }

    /// Statuses in which new actions may be materialized
    pub fn can_materialize(self) -> bool {
        matches!(self, Self::Prep | Self::Premater | Self::Running)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Prep => "PREP",
            Self::Premater => "PREMATER",
            Self::Running => "RUNNING",
            Self::Paused => "PAUSED",
            Self::Suspended => "SUSPENDED",
            Self::Succeeded => "SUCCEEDED",
            Self::Failed => "FAILED",
            Self::Killed => "KILLED",
            Self::DoneWithError => "DONEWITHERROR",
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "PREP" => Ok(Self::Prep),
            "PREMATER" => Ok(Self::Premater),
            "RUNNING" => Ok(Self::Running),
            "PAUSED" => Ok(Self::Paused),
            "SUSPENDED" => Ok(Self::Suspended),
            "SUCCEEDED" => Ok(Self::Succeeded),
            "FAILED" => Ok(Self::Failed),
            "KILLED" => Ok(Self::Killed),
            "DONEWITHERROR" | "DONE_WITH_ERROR" => Ok(Self::DoneWithError),
            other => Err(format!("unknown job status '{}'", other)),
        }
    }
}
