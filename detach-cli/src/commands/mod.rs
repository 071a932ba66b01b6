//! Commands module
//!
//! Defines all CLI commands and their handlers.

mod exec;
mod job;
mod maintenance;
mod watch;

use std::process::ExitCode;

use anyhow::{Result, bail};
use clap::{Args, Subcommand};
use detach_core::config::RuntimeConfig;
use detach_core::domain::JobId;
use detach_runner::CommandWorkflow;

/// Top-level CLI commands
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Start a job as a detached process
    Start {
        /// Job id (default: generated)
        #[arg(long)]
        job_id: Option<String>,

        #[command(flatten)]
        workflow: WorkflowArgs,
    },
    /// Stop a running job
    Stop {
        job_id: String,

        /// Seconds to wait after SIGTERM before SIGKILL (default: DETACH_STOP_TIMEOUT)
        #[arg(long)]
        timeout: Option<u64>,
    },
    /// Show one job
    Status { job_id: String },
    /// List known jobs
    List {
        /// Only jobs with a live process
        #[arg(long)]
        active: bool,
    },
    /// Remove stale records, recover orphans and prune old jobs
    Cleanup,
    /// Print state changes of jobs until they finish
    Watch {
        #[arg(required = true)]
        job_ids: Vec<String>,
    },
    /// Run a job inside the detached process
    #[command(hide = true)]
    Exec {
        job_id: String,

        #[command(flatten)]
        workflow: WorkflowArgs,
    },
}

/// What a job runs: named shell steps, a plain command, or both
#[derive(Args, Debug, Clone, Default, PartialEq, Eq)]
pub struct WorkflowArgs {
    /// Shell step as NAME=SCRIPT; repeat for several steps
    #[arg(long = "step", value_name = "NAME=SCRIPT", value_parser = parse_step)]
    steps: Vec<(String, String)>,

    /// Command to run after the steps
    #[arg(last = true)]
    command: Vec<String>,
}

impl WorkflowArgs {
    /// Builds the workflow the executor runs
    pub fn workflow(&self) -> Result<CommandWorkflow> {
        if self.steps.is_empty() {
            if self.command.is_empty() {
                bail!("Nothing to run: pass --step NAME=SCRIPT or a command after --");
            }
            return Ok(CommandWorkflow::from_argv(self.command.clone()));
        }

        let mut workflow = CommandWorkflow::new("steps");
        for (name, script) in &self.steps {
            workflow = workflow.shell_step(name, script);
        }
        if let Some(program) = self.command.first() {
            workflow = workflow.argv_step(program, self.command.clone());
        }
        Ok(workflow)
    }

    /// The same arguments, as passed on to `detach exec`
    pub fn to_args(&self) -> Vec<String> {
        let mut args = Vec::new();
        for (name, script) in &self.steps {
            args.push("--step".to_string());
            args.push(format!("{name}={script}"));
        }
        if !self.command.is_empty() {
            args.push("--".to_string());
            args.extend(self.command.iter().cloned());
        }
        args
    }
}

fn parse_step(raw: &str) -> Result<(String, String), String> {
    let (name, script) = raw
        .split_once('=')
        .ok_or_else(|| format!("expected NAME=SCRIPT, got {raw:?}"))?;
    let name = name.trim();

    if name.is_empty() {
        return Err("step name cannot be empty".to_string());
    }
    if script.trim().is_empty() {
        return Err(format!("step {name} has an empty script"));
    }

    Ok((name.to_string(), script.to_string()))
}

fn parse_job_id(raw: &str) -> Result<JobId> {
    Ok(JobId::new(raw)?)
}

/// Handle a CLI command
///
/// Routes the command to the appropriate handler module and returns the
/// process exit code.
pub async fn handle_command(command: Commands, config: &RuntimeConfig) -> Result<ExitCode> {
    match command {
        Commands::Start { job_id, workflow } => job::start(config, job_id, &workflow),
        Commands::Stop { job_id, timeout } => job::stop(config, &job_id, timeout).await,
        Commands::Status { job_id } => job::status(config, &job_id),
        Commands::List { active } => job::list(config, active),
        Commands::Cleanup => maintenance::cleanup(config),
        Commands::Watch { job_ids } => watch::watch(config, &job_ids).await,
        Commands::Exec { job_id, workflow } => exec::exec(config, &job_id, &workflow).await,
    }
}
