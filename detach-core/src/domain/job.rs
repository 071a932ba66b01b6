//! Job domain types

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::{Error, Result};

const MAX_JOB_ID_LEN: usize = 128;

/// Stable identifier of a job
///
/// Job ids are used verbatim as file names in the PID Registry and the
/// State Store, so only `[A-Za-z0-9._-]` is accepted and a leading dot
/// (reserved for temporary files) is rejected.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct JobId(String);

impl JobId {
    /// Validates and wraps a job identifier
    pub fn new(id: impl Into<String>) -> Result<Self> {
        let id = id.into();
        let valid_chars = id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'));

        if id.is_empty() || id.len() > MAX_JOB_ID_LEN || id.starts_with('.') || !valid_chars {
            return Err(Error::InvalidJobId(id));
        }

        Ok(Self(id))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for JobId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::new(s)
    }
}

impl TryFrom<String> for JobId {
    type Error = Error;

    fn try_from(value: String) -> Result<Self> {
        Self::new(value)
    }
}

impl From<JobId> for String {
    fn from(id: JobId) -> Self {
        id.0
    }
}

/// Execution status of a job
///
/// `initializing -> running -> {completed | failed | stopped}`. The three
/// terminal states are never left again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Initializing,
    Running,
    Completed,
    Failed,
    Stopped,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Stopped)
    }

    /// Whether a record in `self` may move to `next`
    pub fn can_transition_to(self, next: JobStatus) -> bool {
        match self {
            Self::Initializing => matches!(next, Self::Running | Self::Failed | Self::Stopped),
            Self::Running => next != Self::Initializing,
            Self::Completed | Self::Failed | Self::Stopped => false,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Initializing => "initializing",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Stopped => "stopped",
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "initializing" => Ok(Self::Initializing),
            "running" => Ok(Self::Running),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "stopped" => Ok(Self::Stopped),
            other => Err(Error::Invalid(format!("unknown job status {other:?}"))),
        }
    }
}

/// Durable execution record of a job, as kept in the State Store
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobState {
    pub job_id: JobId,
    pub status: JobStatus,
    /// Process executing the job; unknown while initializing
    #[serde(default)]
    pub pid: Option<u32>,
    #[serde(with = "timestamp")]
    pub started_at: DateTime<Utc>,
    #[serde(with = "timestamp")]
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub current_step: Option<String>,
    #[serde(default)]
    pub error_message: Option<String>,
}

impl JobState {
    /// Fresh record written by the launcher before the process exists
    pub fn initializing(job_id: JobId, now: DateTime<Utc>) -> Self {
        Self {
            job_id,
            status: JobStatus::Initializing,
            pid: None,
            started_at: now,
            updated_at: now,
            current_step: None,
            error_message: None,
        }
    }

    /// Structural validation performed before every write
    pub fn validate(&self) -> Result<()> {
        if self.pid == Some(0) {
            return Err(Error::Invalid(format!("job {}: pid must be positive", self.job_id)));
        }

        if self.updated_at < self.started_at {
            return Err(Error::Invalid(format!(
                "job {}: updated_at precedes started_at",
                self.job_id
            )));
        }

        if matches!(self.current_step.as_deref(), Some(step) if step.trim().is_empty()) {
            return Err(Error::Invalid(format!(
                "job {}: current_step must not be blank",
                self.job_id
            )));
        }

        Ok(())
    }

    /// Applies a partial update, returning `None` when the transition is not allowed
    ///
    /// `updated_at` never moves backwards, even if `now` is earlier than the
    /// stored value (clock adjustments, writers on other hosts).
    pub fn apply(&self, update: &StateUpdate, now: DateTime<Utc>) -> Option<JobState> {
        if self.status.is_terminal() {
            return None;
        }

        let mut next = self.clone();

        if let Some(status) = update.status {
            if !self.status.can_transition_to(status) {
                return None;
            }
            next.status = status;
        }
        if let Some(pid) = update.pid {
            next.pid = Some(pid);
        }
        if let Some(step) = &update.current_step {
            next.current_step = step.clone();
        }
        if let Some(message) = &update.error_message {
            next.error_message = Some(message.clone());
        }

        next.updated_at = now.max(self.updated_at);
        Some(next)
    }
}

/// Partial update of a [`JobState`]
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StateUpdate {
    pub status: Option<JobStatus>,
    pub pid: Option<u32>,
    /// `Some(None)` clears the step
    pub current_step: Option<Option<String>>,
    pub error_message: Option<String>,
}

impl StateUpdate {
    pub fn status(status: JobStatus) -> Self {
        Self {
            status: Some(status),
            ..Self::default()
        }
    }

    /// Terminal failure with a message for remote observers
    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            status: Some(JobStatus::Failed),
            error_message: Some(message.into()),
            ..Self::default()
        }
    }

    pub fn with_pid(mut self, pid: u32) -> Self {
        self.pid = Some(pid);
        self
    }

    pub fn with_step(mut self, step: impl Into<String>) -> Self {
        self.current_step = Some(Some(step.into()));
        self
    }

    pub fn clear_step(mut self) -> Self {
        self.current_step = Some(None);
        self
    }
}

/// Timestamps are stored as RFC 3339 in UTC with microsecond precision,
/// e.g. `2026-10-19T08:15:02.123456Z`.
pub mod timestamp {
    use chrono::{DateTime, SecondsFormat, Utc};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn format(ts: &DateTime<Utc>) -> String {
        ts.to_rfc3339_opts(SecondsFormat::Micros, true)
    }

    pub fn serialize<S: Serializer>(ts: &DateTime<Utc>, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&format(ts))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<DateTime<Utc>, D::Error> {
        let raw = String::deserialize(deserializer)?;
        DateTime::parse_from_rfc3339(&raw)
            .map(|ts| ts.with_timezone(&Utc))
            .map_err(serde::de::Error::custom)
    }
}
