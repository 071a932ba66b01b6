//! PID Registry
//!
//! One `<job_id>.pid` file per launched job, mapping it to the process that
//! executes it. Files are replaced atomically so concurrent readers never
//! observe a half-written record.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use detach_core::domain::{JobId, JobRecord};
use detach_core::paths::ensure_private_dir;
use detach_core::{Error, Result};
use tracing::{debug, info, warn};

use crate::atomic;
use crate::process;

const EXTENSION: &str = "pid";

/// Durable job -> pid mapping backed by a directory
#[derive(Debug, Clone)]
pub struct PidRegistry {
    dir: PathBuf,
}

impl PidRegistry {
    /// Opens the registry, creating its directory if needed
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        ensure_private_dir(&dir)?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path(&self, job_id: &JobId) -> PathBuf {
        self.dir.join(format!("{job_id}.{EXTENSION}"))
    }

    /// Records `pid` as the process executing `job_id`
    ///
    /// The process start time is captured alongside the pid so a later
    /// reader can tell the original process from one that reused its pid.
    pub fn write(&self, job_id: &JobId, pid: u32) -> Result<JobRecord> {
        let record =
            JobRecord::new(job_id.clone(), pid, Utc::now()).with_start_ticks(process::start_ticks(pid));
        self.write_record(&record)?;
        Ok(record)
    }

    /// Atomically writes a fully populated record
    pub fn write_record(&self, record: &JobRecord) -> Result<()> {
        if record.pid == 0 {
            return Err(Error::Invalid(format!(
                "job {}: pid must be positive",
                record.job_id
            )));
        }

        let json = serde_json::to_vec_pretty(record)
            .map_err(|e| Error::Invalid(format!("job {}: {e}", record.job_id)))?;
        atomic::write_atomic(&self.path(&record.job_id), &json)?;

        debug!("Registered pid {} for job {}", record.pid, record.job_id);
        Ok(())
    }

    /// Reads the record of `job_id`
    pub fn read(&self, job_id: &JobId) -> Result<JobRecord> {
        let path = self.path(job_id);
        let text = match fs::read_to_string(&path) {
            Ok(text) => text,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(Error::NotFound(job_id.clone()));
            }
            Err(e) => return Err(e.into()),
        };

        let modified = fs::metadata(&path)
            .and_then(|m| m.modified())
            .map(DateTime::<Utc>::from)
            .unwrap_or_else(|_| Utc::now());

        JobRecord::parse(job_id, &text, modified).map_err(|reason| Error::corrupt(&path, reason))
    }

    /// Removes the record of `job_id`; a missing record is not an error
    pub fn delete(&self, job_id: &JobId) -> Result<bool> {
        let removed = atomic::remove_if_exists(&self.path(job_id))?;
        if removed {
            debug!("Removed pid record for job {}", job_id);
        }
        Ok(removed)
    }

    /// Record of `job_id` if its process is still alive and is the one recorded
    pub fn live_record(&self, job_id: &JobId) -> Result<Option<JobRecord>> {
        match self.read(job_id) {
            Ok(record) if process::matches_record(&record) => Ok(Some(record)),
            Ok(_) => Ok(None),
            Err(Error::NotFound(_)) => Ok(None),
            Err(e @ Error::Corrupt { .. }) => {
                warn!("{}", e);
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    /// Every parseable record in the registry
    ///
    /// Corrupt files are logged and skipped; `cleanup_stale` removes them.
    pub fn list_all(&self) -> Result<Vec<JobRecord>> {
        let mut records = Vec::new();

        for (job_id, _) in atomic::list_records(&self.dir, EXTENSION)? {
            match self.read(&job_id) {
                Ok(record) => records.push(record),
                // deleted between listing and reading
                Err(Error::NotFound(_)) => {}
                Err(e @ Error::Corrupt { .. }) => warn!("Skipping {}", e),
                Err(e) => return Err(e),
            }
        }

        Ok(records)
    }

    /// Records whose process is alive and identity-matched
    pub fn list_active(&self) -> Result<Vec<JobRecord>> {
        Ok(self
            .list_all()?
            .into_iter()
            .filter(process::matches_record)
            .collect())
    }

    /// Removes records whose process is gone, reused, or whose file is corrupt
    ///
    /// Returns the jobs whose records were removed.
    pub fn cleanup_stale(&self) -> Result<Vec<JobId>> {
        let mut removed = Vec::new();

        for (job_id, path) in atomic::list_records(&self.dir, EXTENSION)? {
            let stale = match self.read(&job_id) {
                Ok(record) => !process::matches_record(&record),
                Err(Error::NotFound(_)) => continue,
                Err(e @ Error::Corrupt { .. }) => {
                    warn!("Removing unreadable pid record: {}", e);
                    true
                }
                Err(e) => return Err(e),
            };

            if stale {
                match atomic::remove_if_exists(&path) {
                    Ok(_) => {
                        info!("Removed stale pid record for job {}", job_id);
                        removed.push(job_id);
                    }
                    Err(e) => warn!("Failed to remove {}: {}", path.display(), e),
                }
            }
        }

        Ok(removed)
    }
}
