//! Launcher
//!
//! Starts jobs as detached processes and stops them again. A launched
//! process runs in its own session with stdin on `/dev/null` and
//! stdout/stderr appended to `<log_dir>/<job_id>.log`, so the caller may
//! exit at any time without affecting it.

use std::ffi::OsString;
use std::fs::{File, OpenOptions};
use std::io;
use std::os::unix::process::CommandExt;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::time::Duration;

use chrono::Utc;
use detach_core::domain::{JobId, JobRecord, JobState, JobStatus, StateUpdate};
use detach_core::paths::{RuntimePaths, ensure_private_dir};
use detach_core::{Error, Result};
use nix::sys::signal::Signal;
use tracing::{debug, info, warn};

use crate::pid_registry::PidRegistry;
use crate::process::{self, Termination};
use crate::state_store::StateStore;

/// Program and arguments to run for a job
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchCommand {
    program: OsString,
    args: Vec<OsString>,
    env: Vec<(OsString, OsString)>,
    current_dir: Option<PathBuf>,
}

impl LaunchCommand {
    pub fn new(program: impl Into<OsString>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            env: Vec::new(),
            current_dir: None,
        }
    }

    pub fn arg(mut self, arg: impl Into<OsString>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<OsString>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn env(mut self, key: impl Into<OsString>, value: impl Into<OsString>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    pub fn current_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.current_dir = Some(dir.into());
        self
    }

    /// Command line as recorded in the PID Registry
    pub fn argv(&self) -> Vec<String> {
        std::iter::once(&self.program)
            .chain(&self.args)
            .map(|part| part.to_string_lossy().into_owned())
            .collect()
    }
}

/// Combined view of a job for monitors
#[derive(Debug, Clone, PartialEq)]
pub struct JobView {
    pub job_id: JobId,
    pub state: Option<JobState>,
    pub record: Option<JobRecord>,
    /// Whether the recorded process is alive and identity-matched
    pub alive: bool,
}

impl JobView {
    pub fn status(&self) -> Option<JobStatus> {
        self.state.as_ref().map(|s| s.status)
    }

    /// Non-terminal state without a live process behind it
    pub fn is_orphaned(&self) -> bool {
        !self.alive && self.status().is_some_and(|s| !s.is_terminal())
    }
}

/// Starts, stops and inspects detached jobs
#[derive(Debug, Clone)]
pub struct Launcher {
    registry: PidRegistry,
    store: StateStore,
    paths: RuntimePaths,
}

impl Launcher {
    pub fn new(registry: PidRegistry, store: StateStore, paths: RuntimePaths) -> Self {
        Self {
            registry,
            store,
            paths,
        }
    }

    /// Opens the registry and store at `paths`, creating directories as needed
    pub fn open(paths: &RuntimePaths) -> Result<Self> {
        paths.ensure()?;
        Ok(Self::new(
            PidRegistry::open(&paths.pid_dir)?,
            StateStore::open(&paths.state_dir)?,
            paths.clone(),
        ))
    }

    pub fn registry(&self) -> &PidRegistry {
        &self.registry
    }

    pub fn store(&self) -> &StateStore {
        &self.store
    }

    pub fn paths(&self) -> &RuntimePaths {
        &self.paths
    }

    /// Starts `command` as the detached process executing `job_id`
    ///
    /// Returns once the PID record is on disk; never waits for the job.
    /// A previous terminal state of the same job is replaced.
    pub fn launch(&self, job_id: &JobId, command: &LaunchCommand) -> Result<JobRecord> {
        if let Some(record) = self.registry.live_record(job_id)? {
            return Err(Error::AlreadyRunning {
                job_id: job_id.clone(),
                pid: record.pid,
            });
        }
        if self.registry.delete(job_id)? {
            debug!("Discarded stale pid record of job {}", job_id);
        }

        self.store
            .write(&JobState::initializing(job_id.clone(), Utc::now()))?;

        let child = match self.spawn(job_id, command) {
            Ok(child) => child,
            Err(e) => {
                let message = format!("failed to spawn {}: {e}", command.argv().join(" "));
                self.mark_failed(job_id, &message);
                return Err(Error::Spawn(message));
            }
        };

        let pid = child.id();
        let record = JobRecord::new(job_id.clone(), pid, Utc::now())
            .with_start_ticks(process::start_ticks(pid))
            .with_command(command.argv());

        if let Err(e) = self.registry.write_record(&record) {
            // an untracked process could never be stopped
            let _ = process::signal(pid, Signal::SIGKILL);
            self.mark_failed(job_id, &format!("failed to record pid {pid}: {e}"));
            return Err(e);
        }

        // The process may have exited before its record existed, in which
        // case nobody else will remove the record.
        if !process::is_alive(pid) {
            self.registry.delete(job_id)?;
            if self.store.read(job_id).is_ok_and(|s| !s.status.is_terminal()) {
                self.mark_failed(job_id, "process exited before reporting progress");
            }
        }

        info!("Launched job {} as pid {}", job_id, pid);
        Ok(record)
    }

    fn spawn(&self, job_id: &JobId, command: &LaunchCommand) -> io::Result<std::process::Child> {
        let log = self.open_log(job_id)?;

        let mut cmd = Command::new(&command.program);
        cmd.args(&command.args)
            .envs(self.paths.env_vars())
            .envs(command.env.iter().map(|(k, v)| (k, v)))
            .stdin(Stdio::null())
            .stdout(Stdio::from(log.try_clone()?))
            .stderr(Stdio::from(log));

        if let Some(dir) = &command.current_dir {
            cmd.current_dir(dir);
        }

        // New session: no controlling terminal, and the caller's process
        // group signals never reach the job.
        unsafe {
            cmd.pre_exec(|| {
                nix::unistd::setsid().map(|_| ()).map_err(io::Error::from)
            });
        }

        cmd.spawn()
    }

    fn open_log(&self, job_id: &JobId) -> io::Result<File> {
        ensure_private_dir(&self.paths.log_dir)?;
        OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.paths.log_file(job_id))
    }

    fn mark_failed(&self, job_id: &JobId, message: &str) {
        warn!("Job {} failed to launch: {}", job_id, message);
        if let Err(e) = self.store.update(job_id, &StateUpdate::failed(message)) {
            warn!("Could not record launch failure of job {}: {}", job_id, e);
        }
    }

    /// Stops the process executing `job_id`
    ///
    /// Sends SIGTERM, escalates to SIGKILL after `timeout`, removes the PID
    /// record and marks the job stopped. Fails with `NotRunning` when there
    /// is no PID record, including for jobs that already finished.
    pub async fn stop(&self, job_id: &JobId, timeout: Duration) -> Result<Termination> {
        let record = match self.registry.read(job_id) {
            Ok(record) => record,
            Err(Error::NotFound(_)) => return Err(Error::NotRunning(job_id.clone())),
            Err(e @ Error::Corrupt { .. }) => {
                warn!("Discarding {}", e);
                self.registry.delete(job_id)?;
                return Err(Error::NotRunning(job_id.clone()));
            }
            Err(e) => return Err(e),
        };

        let termination = if process::matches_record(&record) {
            info!("Stopping job {} (pid {})", job_id, record.pid);
            process::terminate(record.pid, timeout).await?
        } else {
            Termination::AlreadyExited
        };

        self.registry.delete(job_id)?;

        match self.store.update(job_id, &StateUpdate::status(JobStatus::Stopped)) {
            Ok(_) => {}
            Err(Error::NotFound(_)) => warn!("Job {} has no state to mark stopped", job_id),
            Err(e) => return Err(e),
        }

        info!("Job {} stopped ({:?})", job_id, termination);
        Ok(termination)
    }

    /// Current view of one job
    pub fn status(&self, job_id: &JobId) -> Result<JobView> {
        let state = match self.store.read(job_id) {
            Ok(state) => Some(state),
            Err(Error::NotFound(_)) => None,
            Err(e) => return Err(e),
        };
        let record = match self.registry.read(job_id) {
            Ok(record) => Some(record),
            Err(Error::NotFound(_)) | Err(Error::Corrupt { .. }) => None,
            Err(e) => return Err(e),
        };

        if state.is_none() && record.is_none() {
            return Err(Error::NotFound(job_id.clone()));
        }

        let alive = record.as_ref().is_some_and(process::matches_record);
        Ok(JobView {
            job_id: job_id.clone(),
            state,
            record,
            alive,
        })
    }

    /// Every job known to either the State Store or the PID Registry
    pub fn list(&self) -> Result<Vec<JobView>> {
        let mut job_ids = self.store.job_ids()?;
        job_ids.extend(self.registry.list_all()?.into_iter().map(|r| r.job_id));
        job_ids.sort();
        job_ids.dedup();

        let mut views = Vec::with_capacity(job_ids.len());
        for job_id in job_ids {
            match self.status(&job_id) {
                Ok(view) => views.push(view),
                Err(Error::NotFound(_)) => {}
                Err(e @ Error::Corrupt { .. }) => warn!("Skipping {}", e),
                Err(e) => return Err(e),
            }
        }

        Ok(views)
    }

    pub fn log_file(&self, job_id: &JobId) -> PathBuf {
        self.paths.log_file(job_id)
    }

    pub fn data_dir(&self) -> &Path {
        &self.paths.data_dir
    }
}
