//! PID Registry record

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::job::{JobId, timestamp};

/// Maps a launched job to the OS process executing it
///
/// Besides the pid, the record keeps enough identity to notice when the
/// pid has been recycled by an unrelated process.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobRecord {
    pub job_id: JobId,
    pub pid: u32,
    /// Process start time in clock ticks since boot, where the OS exposes it
    #[serde(default)]
    pub start_ticks: Option<u64>,
    /// Command line the launcher spawned
    #[serde(default)]
    pub command: Vec<String>,
    #[serde(with = "timestamp")]
    pub launched_at: DateTime<Utc>,
}

impl JobRecord {
    pub fn new(job_id: JobId, pid: u32, launched_at: DateTime<Utc>) -> Self {
        Self {
            job_id,
            pid,
            start_ticks: None,
            command: Vec::new(),
            launched_at,
        }
    }

    pub fn with_start_ticks(mut self, ticks: Option<u64>) -> Self {
        self.start_ticks = ticks;
        self
    }

    pub fn with_command(mut self, command: Vec<String>) -> Self {
        self.command = command;
        self
    }

    /// Parses the on-disk form of a record
    ///
    /// Accepts the JSON document written by the registry as well as a bare
    /// decimal pid, which carries no identity metadata. `modified` stands in
    /// for `launched_at` in the latter case.
    pub fn parse(job_id: &JobId, text: &str, modified: DateTime<Utc>) -> Result<Self, String> {
        let trimmed = text.trim();
        if trimmed.is_empty() {
            return Err("empty record".to_string());
        }

        let record = if trimmed.starts_with('{') {
            serde_json::from_str::<JobRecord>(trimmed).map_err(|e| e.to_string())?
        } else {
            let pid = trimmed
                .parse::<u32>()
                .map_err(|e| format!("invalid pid {trimmed:?}: {e}"))?;
            JobRecord::new(job_id.clone(), pid, modified)
        };

        if record.pid == 0 {
            return Err("pid must be positive".to_string());
        }
        if &record.job_id != job_id {
            return Err(format!(
                "record names job {} but is filed under {}",
                record.job_id, job_id
            ));
        }

        Ok(record)
    }
}
