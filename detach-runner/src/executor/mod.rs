//! Job Executor
//!
//! Code that runs inside the detached process. It reports progress
//! through the State Store and removes its own PID record on every exit
//! path, including panics in the workflow.

mod shutdown;
mod workflow;

pub use shutdown::install_shutdown_handler;
pub use workflow::{CommandWorkflow, StepContext, Workflow, WorkflowOutcome};

use std::sync::Arc;

use chrono::Utc;
use detach_core::domain::{JobId, JobState, JobStatus, StateUpdate};
use detach_core::paths::RuntimePaths;
use detach_core::{Error, Result};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::pid_registry::PidRegistry;
use crate::state_store::{StateStore, UpdateOutcome};

/// Process exit code of a job that completed
pub const EXIT_SUCCESS: i32 = 0;
/// Process exit code of a job that failed
pub const EXIT_FAILURE: i32 = 1;
/// Process exit code of a job stopped by SIGTERM/SIGINT
pub const EXIT_STOPPED: i32 = 130;

/// Final status of an executor run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionResult {
    Completed,
    Failed,
    Stopped,
}

impl ExecutionResult {
    pub fn exit_code(self) -> i32 {
        match self {
            Self::Completed => EXIT_SUCCESS,
            Self::Failed => EXIT_FAILURE,
            Self::Stopped => EXIT_STOPPED,
        }
    }

    fn from_status(status: JobStatus) -> Self {
        match status {
            JobStatus::Completed => Self::Completed,
            JobStatus::Stopped => Self::Stopped,
            _ => Self::Failed,
        }
    }
}

/// Removes the PID record of the current process when dropped
struct PidRecordGuard {
    registry: PidRegistry,
    job_id: JobId,
}

impl Drop for PidRecordGuard {
    fn drop(&mut self) {
        let me = std::process::id();

        // a record naming another process belongs to a newer launch
        match self.registry.read(&self.job_id) {
            Ok(record) if record.pid != me => return,
            Ok(_) | Err(Error::Corrupt { .. }) => {}
            Err(_) => return,
        }

        if let Err(e) = self.registry.delete(&self.job_id) {
            error!("Failed to remove pid record of job {}: {}", self.job_id, e);
        }
    }
}

/// Drives one job inside the detached process
#[derive(Debug, Clone)]
pub struct JobExecutor {
    job_id: JobId,
    registry: PidRegistry,
    store: StateStore,
}

impl JobExecutor {
    pub fn new(job_id: JobId, registry: PidRegistry, store: StateStore) -> Self {
        Self {
            job_id,
            registry,
            store,
        }
    }

    pub fn open(job_id: JobId, paths: &RuntimePaths) -> Result<Self> {
        Ok(Self::new(
            job_id,
            PidRegistry::open(&paths.pid_dir)?,
            StateStore::open(&paths.state_dir)?,
        ))
    }

    pub fn job_id(&self) -> &JobId {
        &self.job_id
    }

    /// Runs `workflow` and records its outcome
    ///
    /// `token` is the cooperative stop flag, normally the one returned by
    /// [`install_shutdown_handler`]. The PID record is removed after the
    /// final state write, whatever happened.
    pub async fn run(
        &self,
        workflow: Arc<dyn Workflow>,
        token: CancellationToken,
    ) -> Result<ExecutionResult> {
        let _guard = PidRecordGuard {
            registry: self.registry.clone(),
            job_id: self.job_id.clone(),
        };

        if let Some(result) = self.start(&token)? {
            return Ok(result);
        }
        info!("Job {} running workflow {}", self.job_id, workflow.name());

        let ctx = StepContext::new(self.job_id.clone(), self.store.clone(), token.clone());
        let handle = tokio::spawn(async move { workflow.run(&ctx).await });

        match handle.await {
            Ok(Ok(WorkflowOutcome::Completed)) => {
                self.finish(StateUpdate::status(JobStatus::Completed))
            }
            Ok(Ok(WorkflowOutcome::Failed(message))) => self.finish(StateUpdate::failed(message)),
            Ok(Ok(WorkflowOutcome::Cancelled)) => {
                self.finish(StateUpdate::status(JobStatus::Stopped))
            }
            Ok(Err(_)) if token.is_cancelled() => {
                self.finish(StateUpdate::status(JobStatus::Stopped))
            }
            Ok(Err(e)) => {
                error!("Workflow of job {} failed: {:#}", self.job_id, e);
                self.finish(StateUpdate::failed(format!("{e:#}")))
            }
            Err(e) => {
                error!("Workflow of job {} crashed: {}", self.job_id, e);
                self.finish(StateUpdate::failed(format!("workflow crashed: {e}")))
            }
        }
    }

    /// Moves the job to `running`, or returns early when it must not run
    fn start(&self, token: &CancellationToken) -> Result<Option<ExecutionResult>> {
        let state = match self.store.read(&self.job_id) {
            Ok(state) => state,
            // started without a launcher
            Err(Error::NotFound(_)) | Err(Error::Corrupt { .. }) => {
                let state = JobState::initializing(self.job_id.clone(), Utc::now());
                self.store.write(&state)?;
                state
            }
            Err(e) => return Err(e),
        };

        if state.status.is_terminal() {
            warn!("Job {} is already {}, not running it", self.job_id, state.status);
            return Ok(Some(ExecutionResult::from_status(state.status)));
        }

        if token.is_cancelled() {
            info!("Job {} stopped before it started", self.job_id);
            return self
                .finish(StateUpdate::status(JobStatus::Stopped))
                .map(Some);
        }

        let running = StateUpdate::status(JobStatus::Running).with_pid(std::process::id());
        match self.store.update(&self.job_id, &running)? {
            UpdateOutcome::Applied(_) => Ok(None),
            UpdateOutcome::Rejected(state) => Ok(Some(ExecutionResult::from_status(state.status))),
        }
    }

    fn finish(&self, update: StateUpdate) -> Result<ExecutionResult> {
        let outcome = self.store.update(&self.job_id, &update)?;
        let status = outcome.state().status;
        info!("Job {} finished: {}", self.job_id, status);
        Ok(ExecutionResult::from_status(status))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::anyhow;
    use async_trait::async_trait;
    use std::time::Duration;

    struct Scripted(fn(&StepContext) -> anyhow::Result<WorkflowOutcome>);

    #[async_trait]
    impl Workflow for Scripted {
        fn name(&self) -> &str {
            "scripted"
        }

        async fn run(&self, ctx: &StepContext) -> anyhow::Result<WorkflowOutcome> {
            (self.0)(ctx)
        }
    }

    fn executor() -> (tempfile::TempDir, JobExecutor) {
        let tmp = tempfile::tempdir().unwrap();
        let paths = RuntimePaths::under(tmp.path());
        let executor = JobExecutor::open(JobId::new("job").unwrap(), &paths).unwrap();

        executor
            .store
            .write(&JobState::initializing(executor.job_id.clone(), Utc::now()))
            .unwrap();
        executor
            .registry
            .write(&executor.job_id, std::process::id())
            .unwrap();
        (tmp, executor)
    }

    fn assert_record_removed(executor: &JobExecutor) {
        assert!(executor.registry.read(&executor.job_id).unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_completed_workflow() {
        let (_tmp, executor) = executor();
        let workflow = Arc::new(Scripted(|ctx| {
            ctx.enter_step("plan")?;
            let state = ctx.store().read(ctx.job_id()).unwrap();
            assert_eq!(state.status, JobStatus::Running);
            assert_eq!(state.pid, Some(std::process::id()));
            Ok(WorkflowOutcome::Completed)
        }));

        let result = executor.run(workflow, CancellationToken::new()).await.unwrap();

        assert_eq!(result, ExecutionResult::Completed);
        assert_eq!(result.exit_code(), 0);
        let state = executor.store.read(&executor.job_id).unwrap();
        assert_eq!(state.status, JobStatus::Completed);
        assert_eq!(state.current_step.as_deref(), Some("plan"));
        assert_record_removed(&executor);
    }

    #[tokio::test]
    async fn test_failed_workflow_reports_message() {
        let (_tmp, executor) = executor();
        let workflow = Arc::new(Scripted(|_| Ok(WorkflowOutcome::Failed("tests failed".into()))));

        let result = executor.run(workflow, CancellationToken::new()).await.unwrap();

        assert_eq!(result.exit_code(), 1);
        let state = executor.store.read(&executor.job_id).unwrap();
        assert_eq!(state.status, JobStatus::Failed);
        assert_eq!(state.error_message.as_deref(), Some("tests failed"));
        assert_record_removed(&executor);
    }

    #[tokio::test]
    async fn test_workflow_error_becomes_failed_state() {
        let (_tmp, executor) = executor();
        let workflow = Arc::new(Scripted(|_| Err(anyhow!("agent unavailable"))));

        let result = executor.run(workflow, CancellationToken::new()).await.unwrap();

        assert_eq!(result, ExecutionResult::Failed);
        let state = executor.store.read(&executor.job_id).unwrap();
        assert!(state.error_message.unwrap().contains("agent unavailable"));
    }

    #[tokio::test]
    async fn test_panicking_workflow_still_cleans_up() {
        let (_tmp, executor) = executor();
        let workflow = Arc::new(Scripted(|_| panic!("boom")));

        let result = executor.run(workflow, CancellationToken::new()).await.unwrap();

        assert_eq!(result, ExecutionResult::Failed);
        assert_eq!(
            executor.store.read(&executor.job_id).unwrap().status,
            JobStatus::Failed
        );
        assert_record_removed(&executor);
    }

    #[tokio::test]
    async fn test_cancelled_before_start() {
        let (_tmp, executor) = executor();
        let token = CancellationToken::new();
        token.cancel();
        let workflow = Arc::new(Scripted(|_| panic!("must not run")));

        let result = executor.run(workflow, token).await.unwrap();

        assert_eq!(result.exit_code(), 130);
        assert_eq!(
            executor.store.read(&executor.job_id).unwrap().status,
            JobStatus::Stopped
        );
        assert_record_removed(&executor);
    }

    #[tokio::test]
    async fn test_cancelled_while_running() {
        let (_tmp, executor) = executor();
        let workflow = Arc::new(CommandWorkflow::new("slow").shell_step("wait", "sleep 30"));
        let token = CancellationToken::new();
        {
            let token = token.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(200)).await;
                token.cancel();
            });
        }

        let result = executor.run(workflow, token).await.unwrap();

        assert_eq!(result, ExecutionResult::Stopped);
        assert_eq!(
            executor.store.read(&executor.job_id).unwrap().status,
            JobStatus::Stopped
        );
        assert_record_removed(&executor);
    }

    #[tokio::test]
    async fn test_already_stopped_job_does_not_run() {
        let (_tmp, executor) = executor();
        executor
            .store
            .update(&executor.job_id, &StateUpdate::status(JobStatus::Stopped))
            .unwrap();
        let workflow = Arc::new(Scripted(|_| panic!("must not run")));

        let result = executor.run(workflow, CancellationToken::new()).await.unwrap();
        assert_eq!(result, ExecutionResult::Stopped);
        assert_record_removed(&executor);
    }

    #[tokio::test]
    async fn test_foreign_record_is_left_alone() {
        let (_tmp, executor) = executor();
        executor.registry.write(&executor.job_id, 1).unwrap();
        let workflow = Arc::new(Scripted(|_| Ok(WorkflowOutcome::Completed)));

        executor.run(workflow, CancellationToken::new()).await.unwrap();
        assert_eq!(executor.registry.read(&executor.job_id).unwrap().pid, 1);
    }
}
