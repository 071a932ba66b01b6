//! Recovery
//!
//! Housekeeping that restores consistency after crashes:
//! - Removing PID records of dead or reused processes
//! - Discarding corrupt state files
//! - Failing non-terminal jobs whose process is gone (orphans)
//! - Pruning terminal jobs past their retention
//! - Sweeping temporary files left by writers killed mid-write

use std::time::Duration;

use chrono::{DateTime, Utc};
use detach_core::config::RuntimeConfig;
use detach_core::domain::{JobId, StateUpdate};
use detach_core::paths::RuntimePaths;
use detach_core::{Error, Result};
use tracing::{info, warn};

use crate::atomic;
use crate::pid_registry::PidRegistry;
use crate::state_store::{StateStore, UpdateOutcome};

pub const ORPHAN_MESSAGE: &str = "process terminated unexpectedly (orphaned state)";

/// Temporary files younger than this may still belong to an active writer
const TEMP_FILE_MAX_AGE: Duration = Duration::from_secs(60);

/// What a cleanup pass changed
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CleanupReport {
    pub stale_records: Vec<JobId>,
    pub corrupt_states: Vec<JobId>,
    pub orphans: Vec<JobId>,
    pub pruned: Vec<JobId>,
    pub temp_files: usize,
}

impl CleanupReport {
    pub fn is_empty(&self) -> bool {
        self.stale_records.is_empty()
            && self.corrupt_states.is_empty()
            && self.orphans.is_empty()
            && self.pruned.is_empty()
            && self.temp_files == 0
    }
}

fn age(since: DateTime<Utc>, now: DateTime<Utc>) -> Duration {
    // timestamps from the future count as brand new
    now.signed_duration_since(since).to_std().unwrap_or_default()
}

#[derive(Debug, Clone)]
pub struct Recovery {
    registry: PidRegistry,
    store: StateStore,
}

impl Recovery {
    pub fn new(registry: PidRegistry, store: StateStore) -> Self {
        Self { registry, store }
    }

    pub fn open(paths: &RuntimePaths) -> Result<Self> {
        Ok(Self::new(
            PidRegistry::open(&paths.pid_dir)?,
            StateStore::open(&paths.state_dir)?,
        ))
    }

    /// Removes PID records whose process is gone; see [`PidRegistry::cleanup_stale`]
    pub fn cleanup_stale(&self) -> Result<Vec<JobId>> {
        self.registry.cleanup_stale()
    }

    /// Deletes state files that cannot be parsed
    pub fn remove_corrupt_states(&self) -> Result<Vec<JobId>> {
        let mut removed = Vec::new();

        for job_id in self.store.job_ids()? {
            match self.store.read(&job_id) {
                Err(e @ Error::Corrupt { .. }) => {
                    warn!("Removing {}", e);
                    self.store.delete(&job_id)?;
                    removed.push(job_id);
                }
                Ok(_) | Err(Error::NotFound(_)) => {}
                Err(e) => return Err(e),
            }
        }

        Ok(removed)
    }

    /// Fails non-terminal jobs that have no live process
    ///
    /// States updated less than `grace` ago are left alone: the launcher
    /// writes the PID record after the spawn, and the executor may already
    /// have moved the job to `running` by then.
    pub fn recover_orphans(&self, grace: Duration) -> Result<Vec<JobId>> {
        let now = Utc::now();
        let mut recovered = Vec::new();

        for state in self.store.list_all()? {
            if state.status.is_terminal() {
                continue;
            }
            if age(state.updated_at, now) < grace {
                continue;
            }
            if self.registry.live_record(&state.job_id)?.is_some() {
                continue;
            }

            self.registry.delete(&state.job_id)?;
            match self.store.update(&state.job_id, &StateUpdate::failed(ORPHAN_MESSAGE)) {
                Ok(UpdateOutcome::Applied(_)) => {
                    warn!("Job {} was orphaned while {}", state.job_id, state.status);
                    recovered.push(state.job_id);
                }
                // finished or deleted since it was listed
                Ok(UpdateOutcome::Rejected(_)) | Err(Error::NotFound(_)) => {}
                Err(e) => return Err(e),
            }
        }

        Ok(recovered)
    }

    /// Deletes terminal jobs last updated more than `max_age` ago
    pub fn prune_finished(&self, max_age: Duration) -> Result<Vec<JobId>> {
        let now = Utc::now();
        let mut pruned = Vec::new();

        for state in self.store.list_all()? {
            if !state.status.is_terminal() || age(state.updated_at, now) <= max_age {
                continue;
            }
            if self.registry.live_record(&state.job_id)?.is_some() {
                continue;
            }

            self.registry.delete(&state.job_id)?;
            self.store.delete(&state.job_id)?;
            info!("Pruned {} job {}", state.status, state.job_id);
            pruned.push(state.job_id);
        }

        Ok(pruned)
    }

    /// Removes abandoned temporary files from both directories
    pub fn sweep_temp_files(&self) -> Result<usize> {
        let mut removed = atomic::sweep_temp_files(self.registry.dir(), TEMP_FILE_MAX_AGE)?;
        removed += atomic::sweep_temp_files(self.store.dir(), TEMP_FILE_MAX_AGE)?;
        Ok(removed)
    }

    /// Runs every recovery routine in dependency order
    pub fn run_cleanup(&self, config: &RuntimeConfig) -> Result<CleanupReport> {
        let report = CleanupReport {
            stale_records: self.cleanup_stale()?,
            corrupt_states: self.remove_corrupt_states()?,
            orphans: self.recover_orphans(config.orphan_grace)?,
            pruned: self.prune_finished(config.retention)?,
            temp_files: self.sweep_temp_files()?,
        };

        if !report.is_empty() {
            info!(
                "Cleanup removed {} stale records, {} corrupt states, recovered {} orphans, pruned {} jobs",
                report.stale_records.len(),
                report.corrupt_states.len(),
                report.orphans.len(),
                report.pruned.len()
            );
        }

        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::launcher::{LaunchCommand, Launcher};
    use crate::process;
    use detach_core::domain::{JobState, JobStatus};
    use nix::sys::signal::Signal;

    fn id(s: &str) -> JobId {
        JobId::new(s).unwrap()
    }

    struct Fixture {
        _tmp: tempfile::TempDir,
        config: RuntimeConfig,
        launcher: Launcher,
        recovery: Recovery,
    }

    fn fixture() -> Fixture {
        let tmp = tempfile::tempdir().unwrap();
        let mut config = RuntimeConfig::new(RuntimePaths::under(tmp.path()));
        config.orphan_grace = Duration::ZERO;
        let launcher = Launcher::open(&config.paths).unwrap();
        let recovery = Recovery::open(&config.paths).unwrap();
        Fixture {
            _tmp: tmp,
            config,
            launcher,
            recovery,
        }
    }

    fn state_aged(job: &str, status: JobStatus, age: chrono::Duration) -> JobState {
        let at = Utc::now() - age;
        let mut state = JobState::initializing(id(job), at);
        state.status = status;
        state
    }

    #[tokio::test]
    async fn test_crashed_job_is_recovered() {
        let f = fixture();
        let job = id("crashy");
        let record = f
            .launcher
            .launch(&job, &LaunchCommand::new("sleep").arg("30"))
            .unwrap();
        f.launcher
            .store()
            .update(&job, &StateUpdate::status(JobStatus::Running).with_pid(record.pid))
            .unwrap();

        // killed without any chance to clean up
        process::signal(record.pid, Signal::SIGKILL).unwrap();
        std::thread::sleep(Duration::from_millis(200));

        let report = f.recovery.run_cleanup(&f.config).unwrap();

        assert_eq!(report.stale_records, vec![job.clone()]);
        assert_eq!(report.orphans, vec![job.clone()]);
        assert!(f.launcher.registry().list_all().unwrap().is_empty());

        let state = f.launcher.store().read(&job).unwrap();
        assert_eq!(state.status, JobStatus::Failed);
        assert_eq!(state.error_message.as_deref(), Some(ORPHAN_MESSAGE));
    }

    #[tokio::test]
    async fn test_live_job_is_untouched() {
        let f = fixture();
        let job = id("alive");
        f.launcher
            .launch(&job, &LaunchCommand::new("sleep").arg("30"))
            .unwrap();

        let report = f.recovery.run_cleanup(&f.config).unwrap();
        assert!(report.is_empty());
        assert_eq!(
            f.launcher.store().read(&job).unwrap().status,
            JobStatus::Initializing
        );

        f.launcher.stop(&job, Duration::from_secs(5)).await.unwrap();
    }

    #[test]
    fn test_young_initializing_state_gets_grace() {
        let f = fixture();
        let store = f.launcher.store();
        store
            .write(&state_aged("fresh", JobStatus::Initializing, chrono::Duration::zero()))
            .unwrap();
        store
            .write(&state_aged("old", JobStatus::Initializing, chrono::Duration::minutes(5)))
            .unwrap();

        let recovered = f.recovery.recover_orphans(Duration::from_secs(10)).unwrap();
        assert_eq!(recovered, vec![id("old")]);
        assert_eq!(store.read(&id("fresh")).unwrap().status, JobStatus::Initializing);

        let recovered = f.recovery.recover_orphans(Duration::ZERO).unwrap();
        assert_eq!(recovered, vec![id("fresh")]);
    }

    #[test]
    fn test_running_state_without_record_gets_grace() {
        let f = fixture();
        let store = f.launcher.store();
        store
            .write(&state_aged("fresh", JobStatus::Initializing, chrono::Duration::zero()))
            .unwrap();
        store
            .update(&id("fresh"), &StateUpdate::status(JobStatus::Running).with_pid(4242))
            .unwrap();
        store
            .write(&state_aged("stale", JobStatus::Running, chrono::Duration::minutes(5)))
            .unwrap();

        let recovered = f.recovery.recover_orphans(Duration::from_secs(10)).unwrap();
        assert_eq!(recovered, vec![id("stale")]);
        assert_eq!(store.read(&id("fresh")).unwrap().status, JobStatus::Running);

        // the job still finishes normally
        store
            .update(&id("fresh"), &StateUpdate::status(JobStatus::Completed))
            .unwrap();
        assert_eq!(store.read(&id("fresh")).unwrap().status, JobStatus::Completed);
    }

    #[test]
    fn test_prune_finished_respects_retention() {
        let f = fixture();
        let store = f.launcher.store();
        let day = chrono::Duration::hours(25);
        store.write(&state_aged("old-done", JobStatus::Completed, day)).unwrap();
        store.write(&state_aged("old-failed", JobStatus::Failed, day)).unwrap();
        store
            .write(&state_aged("new-done", JobStatus::Completed, chrono::Duration::hours(1)))
            .unwrap();
        store.write(&state_aged("old-running", JobStatus::Running, day)).unwrap();

        let pruned = f.recovery.prune_finished(f.config.retention).unwrap();

        assert_eq!(pruned, vec![id("old-done"), id("old-failed")]);
        assert!(store.read(&id("new-done")).is_ok());
        assert!(store.read(&id("old-running")).is_ok());
    }

    #[test]
    fn test_corrupt_state_is_removed() {
        let f = fixture();
        let store = f.launcher.store();
        store
            .write(&state_aged("ok", JobStatus::Completed, chrono::Duration::zero()))
            .unwrap();
        std::fs::write(store.path(&id("torn")), "{\"job_id\": \"torn\", \"sta").unwrap();

        assert!(store.read(&id("torn")).unwrap_err().is_corrupt());

        let report = f.recovery.run_cleanup(&f.config).unwrap();
        assert_eq!(report.corrupt_states, vec![id("torn")]);
        assert!(store.read(&id("torn")).unwrap_err().is_not_found());
        assert!(store.read(&id("ok")).is_ok());
    }

    #[test]
    fn test_sweep_leaves_fresh_temp_files() {
        let f = fixture();
        std::fs::write(f.launcher.store().dir().join(".a.json.1.1.tmp"), "{").unwrap();

        assert_eq!(f.recovery.sweep_temp_files().unwrap(), 0);
    }
}
