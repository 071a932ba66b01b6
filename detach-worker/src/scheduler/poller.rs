//! Queue poller
//!
//! Claims pending rows from the shared queue and launches each one as a
//! detached job on this host. Launched jobs outlive the poller: on every
//! tick it looks at the local State Store and reports finished jobs back
//! to the queue, and on startup it re-adopts rows it had claimed before a
//! restart.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use anyhow::{Context, Result};
use detach_core::domain::{JobId, JobStatus, QueueRow, StateUpdate};
use detach_core::Error;
use detach_runner::recovery::ORPHAN_MESSAGE;
use detach_runner::{JobView, LaunchCommand, Launcher, process};
use tokio::time;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::repository::JobQueue;

/// What to do with the queue row of a launched job
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Settlement {
    /// The job is still going
    Running,
    /// Mark the row done
    Complete,
    /// Put the row back to pending for another attempt
    Release,
}

/// Maps a job's local status onto its queue row
///
/// Completed and stopped jobs are done; a stopped job was stopped on
/// purpose and must not run again. Failed jobs, jobs whose process died
/// without a final state, and jobs with no state at all are released.
fn settlement(status: Option<JobStatus>, alive: bool) -> Settlement {
    match status {
        Some(JobStatus::Completed | JobStatus::Stopped) => Settlement::Complete,
        Some(JobStatus::Failed) | None => Settlement::Release,
        Some(JobStatus::Initializing | JobStatus::Running) if alive => Settlement::Running,
        Some(JobStatus::Initializing | JobStatus::Running) => Settlement::Release,
    }
}

/// What became of a claimed row
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Dispatch {
    Launched,
    /// Row marked done without launching
    Dropped,
    /// Row put back to pending
    Released,
}

/// Worker loop feeding the Launcher from the queue
pub struct QueuePoller {
    config: Config,
    queue: Arc<dyn JobQueue>,
    launcher: Launcher,
    executor: LaunchCommand,
    in_flight: Mutex<HashMap<i64, JobId>>,
}

impl QueuePoller {
    /// Creates a poller launching jobs through `detach exec`
    pub fn new(config: Config, queue: Arc<dyn JobQueue>) -> Result<Self> {
        let launcher = Launcher::open(&config.runtime.paths)
            .context("Failed to open the local job directories")?;
        let executor = LaunchCommand::new(&config.executor_bin).arg("exec");

        Ok(Self {
            config,
            queue,
            launcher,
            executor,
            in_flight: Mutex::new(HashMap::new()),
        })
    }

    /// Replaces the command prefix used to launch jobs
    ///
    /// The job id, `--` and the job's command line are appended to it.
    pub fn with_executor(mut self, executor: LaunchCommand) -> Self {
        self.executor = executor;
        self
    }

    pub fn launcher(&self) -> &Launcher {
        &self.launcher
    }

    /// Number of launched jobs whose row is still claimed
    pub fn in_flight(&self) -> usize {
        self.jobs().len()
    }

    fn jobs(&self) -> MutexGuard<'_, HashMap<i64, JobId>> {
        self.in_flight.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Runs until `shutdown` is cancelled
    ///
    /// Jobs still running at shutdown keep running; their rows stay
    /// claimed and are picked up again by [`QueuePoller::reconcile`].
    pub async fn run(&self, shutdown: CancellationToken) -> Result<()> {
        info!(
            "Starting queue poller {} (interval: {:?}, max parallel jobs: {})",
            self.config.worker_id, self.config.poll_interval, self.config.max_parallel_jobs
        );

        if let Err(e) = self.reconcile().await {
            error!("Failed to reconcile claimed rows: {:#}", e);
        }

        let mut interval = time::interval(self.config.poll_interval);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("Queue poller stopping with {} job(s) in flight", self.in_flight());
                    return Ok(());
                }
                _ = interval.tick() => {}
            }

            debug!("Polling job queue");

            if let Err(e) = self.settle_finished().await {
                error!("Error while settling finished jobs: {:#}", e);
            }

            match self.poll_once().await {
                Ok(launched) => {
                    if launched > 0 {
                        info!("Launched {} job(s) this cycle", launched);
                    }
                }
                Err(e) => {
                    error!("Error during poll cycle: {:#}", e);
                }
            }
        }
    }

    /// Claims rows while there is free capacity and launches them
    ///
    /// Returns how many jobs were launched.
    pub async fn poll_once(&self) -> Result<usize> {
        let free = self
            .config
            .max_parallel_jobs
            .saturating_sub(self.in_flight());
        if free == 0 {
            debug!("Max parallel jobs reached, not claiming");
            return Ok(0);
        }

        let mut launched = 0;
        for _ in 0..free {
            let Some(row) = self
                .queue
                .claim_next(&self.config.worker_id)
                .await
                .context("Failed to claim from the job queue")?
            else {
                break;
            };

            match self.dispatch(row).await? {
                Dispatch::Launched => launched += 1,
                Dispatch::Dropped => {}
                // a released row is the oldest pending one again
                Dispatch::Released => break,
            }
        }

        Ok(launched)
    }

    /// Launches a claimed row
    ///
    /// A row whose job id is already running on this host is a duplicate
    /// and is marked done; the running job settles its own row.
    async fn dispatch(&self, row: QueueRow) -> Result<Dispatch> {
        let (spec, job_id) = match row.job_spec().and_then(|spec| {
            let job_id = row.job_id(&spec)?;
            Ok((spec, job_id))
        }) {
            Ok(decoded) => decoded,
            Err(e) => {
                // retrying cannot fix the payload
                error!("Dropping queue row {}: {}", row.id, e);
                self.queue.complete(row.id).await?;
                return Ok(Dispatch::Dropped);
            }
        };

        let command = self
            .executor
            .clone()
            .arg(job_id.as_str())
            .arg("--")
            .args(&spec.command);

        match self.launcher.launch(&job_id, &command) {
            Ok(record) => {
                info!(
                    "Queue row {} running as job {} (pid {})",
                    row.id, job_id, record.pid
                );
                self.jobs().insert(row.id, job_id);
                Ok(Dispatch::Launched)
            }
            Err(Error::AlreadyRunning { pid, .. }) => {
                warn!(
                    "Dropping queue row {}: job {} is already running (pid {})",
                    row.id, job_id, pid
                );
                self.queue.complete(row.id).await?;
                Ok(Dispatch::Dropped)
            }
            Err(e) => {
                warn!("Failed to launch queue row {} as job {}: {}", row.id, job_id, e);
                self.queue.release(row.id).await?;
                Ok(Dispatch::Released)
            }
        }
    }

    /// Reports finished jobs back to the queue
    ///
    /// Returns how many rows were settled.
    pub async fn settle_finished(&self) -> Result<usize> {
        let jobs: Vec<(i64, JobId)> = self
            .jobs()
            .iter()
            .map(|(row_id, job_id)| (*row_id, job_id.clone()))
            .collect();

        let mut settled = 0;
        for (row_id, job_id) in jobs {
            let view = match self.launcher.status(&job_id) {
                Ok(view) => Some(view),
                Err(e) if e.is_not_found() || e.is_corrupt() => {
                    warn!("Job {} of queue row {} has no usable state: {}", job_id, row_id, e);
                    None
                }
                Err(e) => return Err(e.into()),
            };

            let decision = settlement(
                view.as_ref().and_then(JobView::status),
                view.as_ref().is_some_and(|v| v.alive),
            );

            match decision {
                Settlement::Running => continue,
                Settlement::Complete => {
                    self.queue.complete(row_id).await?;
                    info!("Queue row {} done (job {})", row_id, job_id);
                }
                Settlement::Release => {
                    if view.as_ref().is_some_and(JobView::is_orphaned) {
                        self.launcher
                            .store()
                            .update(&job_id, &StateUpdate::failed(ORPHAN_MESSAGE))?;
                    }
                    self.queue.release(row_id).await?;
                    warn!("Queue row {} released after job {} did not complete", row_id, job_id);
                }
            }

            // jobs launched by this poller are its children
            let pid = view.as_ref().and_then(|v| {
                v.record.as_ref().map(|r| r.pid).or(v.state.as_ref().and_then(|s| s.pid))
            });
            if let Some(pid) = pid {
                process::reap(pid);
            }

            self.jobs().remove(&row_id);
            settled += 1;
        }

        Ok(settled)
    }

    /// Re-adopts rows this worker claimed before it last stopped
    ///
    /// Rows whose job finished meanwhile are settled right away; rows
    /// whose payload cannot be decoded are dropped.
    pub async fn reconcile(&self) -> Result<usize> {
        let claimed = self
            .queue
            .list_claimed(&self.config.worker_id)
            .await
            .context("Failed to list claimed rows")?;

        let mut adopted = 0;
        for row in claimed {
            match row.job_spec().and_then(|spec| row.job_id(&spec)) {
                Ok(job_id) => {
                    debug!("Adopting queue row {} as job {}", row.id, job_id);
                    self.jobs().insert(row.id, job_id);
                    adopted += 1;
                }
                Err(e) => {
                    error!("Dropping queue row {}: {}", row.id, e);
                    self.queue.complete(row.id).await?;
                }
            }
        }

        if adopted > 0 {
            info!("Re-adopted {} claimed queue row(s)", adopted);
        }

        self.settle_finished().await?;
        Ok(adopted)
    }
}
