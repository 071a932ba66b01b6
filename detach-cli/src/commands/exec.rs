//! Executor entry point
//!
//! `detach exec` is what the Launcher spawns. It runs inside the detached
//! process, so everything it prints ends up in the job's log file.

use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use detach_core::config::RuntimeConfig;
use detach_runner::JobExecutor;
use detach_runner::executor::install_shutdown_handler;
use tracing::info;

use super::{WorkflowArgs, parse_job_id};

pub async fn exec(config: &RuntimeConfig, job_id: &str, workflow: &WorkflowArgs) -> Result<ExitCode> {
    // before anything else, so an early SIGTERM still ends as `stopped`
    let token = install_shutdown_handler().context("Failed to install signal handlers")?;

    let job_id = parse_job_id(job_id)?;
    let workflow = Arc::new(workflow.workflow()?);
    let executor = JobExecutor::open(job_id, &config.paths)?;

    info!("Executor for job {} started as pid {}", executor.job_id(), std::process::id());
    let result = executor.run(workflow, token).await?;

    Ok(ExitCode::from(result.exit_code() as u8))
}
