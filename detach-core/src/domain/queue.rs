//! Queue domain types
//!
//! Rows of the shared backing-store queue. The store is the single source
//! of truth for queue membership; local PID and state files are only
//! execution detail.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use super::job::JobId;
use crate::error::{Error, Result};

/// Lifecycle of a queue row
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QueueStatus {
    Pending,
    Claimed,
    Done,
}

impl QueueStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Claimed => "claimed",
            Self::Done => "done",
        }
    }
}

impl fmt::Display for QueueStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for QueueStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "pending" => Ok(Self::Pending),
            "claimed" => Ok(Self::Claimed),
            "done" => Ok(Self::Done),
            other => Err(Error::Invalid(format!("unknown queue status {other:?}"))),
        }
    }
}

/// A job queue entry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueRow {
    pub id: i64,
    pub payload: serde_json::Value,
    pub status: QueueStatus,
    pub claimed_by: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl QueueRow {
    /// Decodes the payload into the job it describes
    pub fn job_spec(&self) -> Result<JobSpec> {
        let spec: JobSpec = serde_json::from_value(self.payload.clone())
            .map_err(|e| Error::Invalid(format!("queue row {}: {e}", self.id)))?;

        if spec.command.is_empty() {
            return Err(Error::Invalid(format!("queue row {}: empty command", self.id)));
        }

        Ok(spec)
    }

    /// Job id used for local execution of this row
    pub fn job_id(&self, spec: &JobSpec) -> Result<JobId> {
        match &spec.job_id {
            Some(id) => Ok(id.clone()),
            None => JobId::new(format!("q-{}", self.id)),
        }
    }
}

/// Payload of a queue row: what to run, and optionally under which id
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobSpec {
    #[serde(default)]
    pub job_id: Option<JobId>,
    /// Workflow command line, program first
    pub command: Vec<String>,
}
