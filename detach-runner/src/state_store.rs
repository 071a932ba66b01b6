//! State Store
//!
//! One `<job_id>.json` file per job holding its [`JobState`]. This is the
//! primary channel for reporting progress and errors across process
//! boundaries: the executor writes it, monitors read it.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use chrono::Utc;
use detach_core::domain::{JobId, JobState, StateUpdate};
use detach_core::paths::ensure_private_dir;
use detach_core::{Error, Result};
use tracing::{debug, warn};

use crate::atomic;

pub(crate) const EXTENSION: &str = "json";

/// Result of a read-modify-write on a state file
#[derive(Debug, Clone, PartialEq)]
pub enum UpdateOutcome {
    /// The update was written; contains the new state
    Applied(JobState),
    /// The transition was not allowed; contains the untouched state
    Rejected(JobState),
}

impl UpdateOutcome {
    pub fn state(&self) -> &JobState {
        match self {
            Self::Applied(state) | Self::Rejected(state) => state,
        }
    }

    pub fn is_applied(&self) -> bool {
        matches!(self, Self::Applied(_))
    }
}

/// Durable job state records backed by a directory
#[derive(Debug, Clone)]
pub struct StateStore {
    dir: PathBuf,
}

impl StateStore {
    /// Opens the store, creating its directory if needed
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        ensure_private_dir(&dir)?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// File holding the state of `job_id`
    pub fn path(&self, job_id: &JobId) -> PathBuf {
        self.dir.join(format!("{job_id}.{EXTENSION}"))
    }

    /// Validates and atomically writes `state`
    pub fn write(&self, state: &JobState) -> Result<()> {
        state.validate()?;

        let json = serde_json::to_vec_pretty(state)
            .map_err(|e| Error::Invalid(format!("job {}: {e}", state.job_id)))?;
        atomic::write_atomic(&self.path(&state.job_id), &json)?;

        debug!("Job {} state -> {}", state.job_id, state.status);
        Ok(())
    }

    /// Reads the state of `job_id`
    ///
    /// Unparseable or structurally invalid files are reported as
    /// [`Error::Corrupt`], distinct from a missing file.
    pub fn read(&self, job_id: &JobId) -> Result<JobState> {
        let path = self.path(job_id);
        let text = match fs::read_to_string(&path) {
            Ok(text) => text,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(Error::NotFound(job_id.clone()));
            }
            Err(e) => return Err(e.into()),
        };

        let state: JobState =
            serde_json::from_str(&text).map_err(|e| Error::corrupt(&path, e))?;
        state.validate().map_err(|e| Error::corrupt(&path, e))?;

        if &state.job_id != job_id {
            return Err(Error::corrupt(
                &path,
                format!("record names job {}", state.job_id),
            ));
        }

        Ok(state)
    }

    /// Applies a partial update under the atomic-write discipline
    ///
    /// `updated_at` is refreshed on every applied update. Transitions out
    /// of a terminal status are refused without error: callers are
    /// best-effort reporters and the refusal is only logged.
    pub fn update(&self, job_id: &JobId, update: &StateUpdate) -> Result<UpdateOutcome> {
        let current = self.read(job_id)?;

        match current.apply(update, Utc::now()) {
            Some(next) => {
                self.write(&next)?;
                Ok(UpdateOutcome::Applied(next))
            }
            None => {
                warn!(
                    "Ignoring update of job {}: {} -> {} is not allowed",
                    job_id,
                    current.status,
                    update
                        .status
                        .map(|s| s.to_string())
                        .unwrap_or_else(|| "(fields only)".to_string())
                );
                Ok(UpdateOutcome::Rejected(current))
            }
        }
    }

    /// Removes the state of `job_id`; a missing file is not an error
    pub fn delete(&self, job_id: &JobId) -> Result<bool> {
        Ok(atomic::remove_if_exists(&self.path(job_id))?)
    }

    /// Job ids with a state file, including corrupt ones
    pub fn job_ids(&self) -> Result<Vec<JobId>> {
        Ok(atomic::list_records(&self.dir, EXTENSION)?
            .into_iter()
            .map(|(job_id, _)| job_id)
            .collect())
    }

    /// Every readable state; corrupt files are logged and skipped
    pub fn list_all(&self) -> Result<Vec<JobState>> {
        let mut states = Vec::new();

        for job_id in self.job_ids()? {
            match self.read(&job_id) {
                Ok(state) => states.push(state),
                Err(Error::NotFound(_)) => {}
                Err(e @ Error::Corrupt { .. }) => warn!("Skipping {}", e),
                Err(e) => return Err(e),
            }
        }

        Ok(states)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use detach_core::domain::JobStatus;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, Ordering};

    fn id(s: &str) -> JobId {
        JobId::new(s).unwrap()
    }

    fn store() -> (tempfile::TempDir, StateStore) {
        let tmp = tempfile::tempdir().unwrap();
        let store = StateStore::open(tmp.path().join("state")).unwrap();
        (tmp, store)
    }

    #[test]
    fn test_write_and_read() {
        let (_tmp, store) = store();
        let state = JobState::initializing(id("j1"), Utc::now());

        store.write(&state).unwrap();
        let read = store.read(&id("j1")).unwrap();

        // timestamps are persisted with microsecond precision
        assert_eq!(read.job_id, state.job_id);
        assert_eq!(read.status, JobStatus::Initializing);
        assert_eq!(
            read.started_at.timestamp_micros(),
            state.started_at.timestamp_micros()
        );
    }

    #[test]
    fn test_write_rejects_invalid_state() {
        let (_tmp, store) = store();
        let mut state = JobState::initializing(id("j1"), Utc::now());
        state.pid = Some(0);

        assert!(matches!(store.write(&state), Err(Error::Invalid(_))));
        assert!(store.read(&id("j1")).unwrap_err().is_not_found());
    }

    #[test]
    fn test_read_truncated_file_is_corrupt() {
        let (_tmp, store) = store();
        store
            .write(&JobState::initializing(id("j1"), Utc::now()))
            .unwrap();

        let path = store.path(&id("j1"));
        let text = fs::read_to_string(&path).unwrap();
        fs::write(&path, &text[..text.len() / 2]).unwrap();

        assert!(store.read(&id("j1")).unwrap_err().is_corrupt());
    }

    #[test]
    fn test_read_unknown_status_is_corrupt() {
        let (_tmp, store) = store();
        fs::write(
            store.path(&id("j1")),
            r#"{"job_id":"j1","status":"paused","started_at":"2026-01-01T00:00:00Z","updated_at":"2026-01-01T00:00:00Z"}"#,
        )
        .unwrap();

        assert!(store.read(&id("j1")).unwrap_err().is_corrupt());
    }

    #[test]
    fn test_update_sets_fields_and_timestamp() {
        let (_tmp, store) = store();
        let state = JobState::initializing(id("j1"), Utc::now());
        store.write(&state).unwrap();

        let outcome = store
            .update(
                &id("j1"),
                &StateUpdate::status(JobStatus::Running).with_pid(123).with_step("plan"),
            )
            .unwrap();

        assert!(outcome.is_applied());
        let read = store.read(&id("j1")).unwrap();
        assert_eq!(read.status, JobStatus::Running);
        assert_eq!(read.pid, Some(123));
        assert_eq!(read.current_step.as_deref(), Some("plan"));
        assert!(read.updated_at >= read.started_at);
    }

    #[test]
    fn test_update_never_leaves_terminal_status() {
        let (_tmp, store) = store();
        store
            .write(&JobState::initializing(id("j1"), Utc::now()))
            .unwrap();
        store
            .update(&id("j1"), &StateUpdate::status(JobStatus::Running))
            .unwrap();
        store
            .update(&id("j1"), &StateUpdate::status(JobStatus::Completed))
            .unwrap();

        let outcome = store
            .update(&id("j1"), &StateUpdate::status(JobStatus::Running))
            .unwrap();
        assert!(!outcome.is_applied());
        assert_eq!(
            store.read(&id("j1")).unwrap().status,
            JobStatus::Completed
        );
    }

    #[test]
    fn test_initializing_job_cannot_complete_without_running() {
        let (_tmp, store) = store();
        store
            .write(&JobState::initializing(id("j1"), Utc::now()))
            .unwrap();

        let outcome = store
            .update(&id("j1"), &StateUpdate::status(JobStatus::Completed))
            .unwrap();
        assert!(!outcome.is_applied());
        assert_eq!(store.read(&id("j1")).unwrap().status, JobStatus::Initializing);

        let outcome = store
            .update(&id("j1"), &StateUpdate::failed("launch failed"))
            .unwrap();
        assert!(outcome.is_applied());
    }

    #[test]
    fn test_update_missing_job() {
        let (_tmp, store) = store();
        let err = store
            .update(&id("ghost"), &StateUpdate::status(JobStatus::Running))
            .unwrap_err();
        assert!(err.is_not_found());
    }

    #[test]
    fn test_updated_at_is_monotonic() {
        let (_tmp, store) = store();
        store
            .write(&JobState::initializing(id("j1"), Utc::now()))
            .unwrap();

        let mut last = store.read(&id("j1")).unwrap().updated_at;
        for step in 0..20 {
            store
                .update(&id("j1"), &StateUpdate::default().with_step(format!("s{step}")))
                .unwrap();
            let now = store.read(&id("j1")).unwrap().updated_at;
            assert!(now >= last);
            last = now;
        }
    }

    #[test]
    fn test_delete_and_list() {
        let (_tmp, store) = store();
        store.write(&JobState::initializing(id("a"), Utc::now())).unwrap();
        store.write(&JobState::initializing(id("b"), Utc::now())).unwrap();
        fs::write(store.path(&id("c")), "{").unwrap();

        assert_eq!(store.job_ids().unwrap().len(), 3);
        assert_eq!(store.list_all().unwrap().len(), 2);

        assert!(store.delete(&id("a")).unwrap());
        assert!(!store.delete(&id("a")).unwrap());
        assert_eq!(store.list_all().unwrap().len(), 1);
    }

    #[test]
    fn test_concurrent_updates_are_never_torn() {
        let (_tmp, store) = store();
        let job = id("busy");
        store.write(&JobState::initializing(job.clone(), Utc::now())).unwrap();

        let done = Arc::new(AtomicBool::new(false));
        let writer = {
            let store = store.clone();
            let job = job.clone();
            let done = Arc::clone(&done);
            std::thread::spawn(move || {
                for step in 0..300 {
                    store
                        .update(&job, &StateUpdate::default().with_step("x".repeat(step % 97 + 1)))
                        .unwrap();
                }
                done.store(true, Ordering::SeqCst);
            })
        };

        let readers: Vec<_> = (0..4)
            .map(|_| {
                let store = store.clone();
                let job = job.clone();
                let done = Arc::clone(&done);
                std::thread::spawn(move || {
                    while !done.load(Ordering::SeqCst) {
                        store.read(&job).expect("torn read");
                    }
                })
            })
            .collect();

        writer.join().unwrap();
        for reader in readers {
            reader.join().unwrap();
        }
    }
}
