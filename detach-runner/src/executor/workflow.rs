//! Workflow contract
//!
//! The business logic a job executes is opaque to the executor. It only
//! needs a result, progress milestones reported through [`StepContext`],
//! and cooperation with cancellation.

use std::process::Stdio;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use detach_core::domain::{JobId, StateUpdate};
use nix::sys::signal::Signal;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::process;
use crate::state_store::StateStore;

/// How a workflow run ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkflowOutcome {
    Completed,
    Failed(String),
    /// The run noticed the cancellation token and stopped early
    Cancelled,
}

/// Handle given to a running workflow
#[derive(Debug, Clone)]
pub struct StepContext {
    job_id: JobId,
    store: StateStore,
    token: CancellationToken,
}

impl StepContext {
    pub fn new(job_id: JobId, store: StateStore, token: CancellationToken) -> Self {
        Self {
            job_id,
            store,
            token,
        }
    }

    pub fn job_id(&self) -> &JobId {
        &self.job_id
    }

    pub fn store(&self) -> &StateStore {
        &self.store
    }

    pub fn cancellation(&self) -> &CancellationToken {
        &self.token
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Records `step` as the job's current milestone
    pub fn enter_step(&self, step: &str) -> Result<()> {
        info!("Job {} entering step {}", self.job_id, step);
        self.store
            .update(&self.job_id, &StateUpdate::default().with_step(step))
            .with_context(|| format!("Failed to record step {step}"))?;
        Ok(())
    }
}

/// Business logic executed inside the detached process
#[async_trait]
pub trait Workflow: Send + Sync {
    fn name(&self) -> &str;

    /// Runs the workflow to completion
    ///
    /// Implementations should check [`StepContext::is_cancelled`] between
    /// steps and return [`WorkflowOutcome::Cancelled`] when it is set.
    async fn run(&self, ctx: &StepContext) -> Result<WorkflowOutcome>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum StepCommand {
    Shell(String),
    Argv(Vec<String>),
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Step {
    name: String,
    command: StepCommand,
}

/// Runs named commands one after another
///
/// Each step's name becomes the job's `current_step`. The first failing
/// step fails the workflow. Child output goes wherever the executor's own
/// output goes, which for a launched job is its log file.
#[derive(Debug, Clone)]
pub struct CommandWorkflow {
    name: String,
    steps: Vec<Step>,
    kill_timeout: Duration,
}

impl CommandWorkflow {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            steps: Vec::new(),
            kill_timeout: Duration::from_secs(10),
        }
    }

    /// Single-step workflow running `argv` directly
    pub fn from_argv(argv: Vec<String>) -> Self {
        let name = argv.first().cloned().unwrap_or_else(|| "command".to_string());
        Self::new(name.clone()).argv_step(name, argv)
    }

    /// Adds a step executed with `sh -c`
    pub fn shell_step(mut self, name: impl Into<String>, script: impl Into<String>) -> Self {
        self.steps.push(Step {
            name: name.into(),
            command: StepCommand::Shell(script.into()),
        });
        self
    }

    /// Adds a step executed without a shell
    pub fn argv_step(mut self, name: impl Into<String>, argv: Vec<String>) -> Self {
        self.steps.push(Step {
            name: name.into(),
            command: StepCommand::Argv(argv),
        });
        self
    }

    /// Time a step gets to exit after SIGTERM before it is killed
    pub fn with_kill_timeout(mut self, timeout: Duration) -> Self {
        self.kill_timeout = timeout;
        self
    }

    pub fn step_names(&self) -> Vec<&str> {
        self.steps.iter().map(|s| s.name.as_str()).collect()
    }

    fn command(step: &Step) -> Result<Command> {
        let mut cmd = match &step.command {
            StepCommand::Shell(script) => {
                let mut cmd = Command::new("sh");
                cmd.arg("-c").arg(script);
                cmd
            }
            StepCommand::Argv(argv) => {
                let (program, args) = argv
                    .split_first()
                    .with_context(|| format!("Step {} has an empty command", step.name))?;
                let mut cmd = Command::new(program);
                cmd.args(args);
                cmd
            }
        };
        cmd.stdin(Stdio::null()).kill_on_drop(true);
        Ok(cmd)
    }

    async fn run_step(&self, step: &Step, token: &CancellationToken) -> Result<WorkflowOutcome> {
        let mut child = Self::command(step)?
            .spawn()
            .with_context(|| format!("Failed to start step {}", step.name))?;

        tokio::select! {
            status = child.wait() => {
                let status = status.with_context(|| format!("Failed to wait for step {}", step.name))?;
                if status.success() {
                    Ok(WorkflowOutcome::Completed)
                } else {
                    Ok(WorkflowOutcome::Failed(format!("step {} exited with {}", step.name, status)))
                }
            }
            _ = token.cancelled() => {
                if let Some(pid) = child.id() {
                    let _ = process::signal(pid, Signal::SIGTERM);
                }
                if tokio::time::timeout(self.kill_timeout, child.wait()).await.is_err() {
                    warn!("Step {} ignored SIGTERM, killing it", step.name);
                    child.kill().await.with_context(|| format!("Failed to kill step {}", step.name))?;
                }
                Ok(WorkflowOutcome::Cancelled)
            }
        }
    }
}

#[async_trait]
impl Workflow for CommandWorkflow {
    fn name(&self) -> &str {
        &self.name
    }

    async fn run(&self, ctx: &StepContext) -> Result<WorkflowOutcome> {
        for step in &self.steps {
            if ctx.is_cancelled() {
                return Ok(WorkflowOutcome::Cancelled);
            }

            ctx.enter_step(&step.name)?;

            match self.run_step(step, ctx.cancellation()).await? {
                WorkflowOutcome::Completed => {}
                other => return Ok(other),
            }
        }

        Ok(WorkflowOutcome::Completed)
    }
}
