//! Job command handlers
//!
//! Starting, stopping and inspecting detached jobs on this host.

use std::process::ExitCode;
use std::time::Duration;

use anyhow::{Context, Result};
use colored::*;
use detach_core::config::RuntimeConfig;
use detach_core::domain::{JobId, JobStatus};
use detach_core::Error;
use detach_runner::{JobView, LaunchCommand, Launcher, Termination};

use super::{WorkflowArgs, parse_job_id};

fn generated_job_id() -> Result<JobId> {
    let uuid = uuid::Uuid::new_v4().simple().to_string();
    Ok(JobId::new(format!("job-{}", &uuid[..8]))?)
}

/// Start a job
pub fn start(
    config: &RuntimeConfig,
    job_id: Option<String>,
    workflow: &WorkflowArgs,
) -> Result<ExitCode> {
    // fail here rather than inside the detached process
    workflow.workflow()?;

    let job_id = match job_id {
        Some(raw) => parse_job_id(&raw)?,
        None => generated_job_id()?,
    };

    let exe = std::env::current_exe().context("Failed to locate the detach binary")?;
    let command = LaunchCommand::new(exe)
        .arg("exec")
        .arg(job_id.as_str())
        .args(workflow.to_args());

    let launcher = Launcher::open(&config.paths)?;
    match launcher.launch(&job_id, &command) {
        Ok(record) => {
            println!(
                "{} Started job {} (pid {})",
                "✓".green(),
                job_id.to_string().cyan(),
                record.pid
            );
            println!("  Log: {}", launcher.log_file(&job_id).display().to_string().dimmed());
            Ok(ExitCode::SUCCESS)
        }
        Err(Error::AlreadyRunning { job_id, pid }) => {
            println!(
                "{}",
                format!("Job {job_id} is already running (pid {pid})").yellow()
            );
            Ok(ExitCode::FAILURE)
        }
        Err(e) => Err(e).context(format!("Failed to start job {job_id}")),
    }
}

/// Stop a job
pub async fn stop(config: &RuntimeConfig, job_id: &str, timeout: Option<u64>) -> Result<ExitCode> {
    let job_id = parse_job_id(job_id)?;
    let timeout = timeout.map(Duration::from_secs).unwrap_or(config.stop_timeout);
    let launcher = Launcher::open(&config.paths)?;

    match launcher.stop(&job_id, timeout).await {
        Ok(termination) => {
            let how = match termination {
                Termination::Graceful => "stopped",
                Termination::Forced => "killed after ignoring SIGTERM",
                Termination::AlreadyExited => "had already exited",
            };
            println!("{} Job {} {}", "✓".green(), job_id.to_string().cyan(), how);
            Ok(ExitCode::SUCCESS)
        }
        Err(Error::NotRunning(_)) => match launcher.store().read(&job_id) {
            // stopping twice is not an error
            Ok(state) if state.status == JobStatus::Stopped => {
                println!("{} Job {} is already stopped", "✓".green(), job_id.to_string().cyan());
                Ok(ExitCode::SUCCESS)
            }
            Ok(state) if state.status.is_terminal() => {
                println!(
                    "{}",
                    format!("Job {job_id} is not running (already {})", state.status).yellow()
                );
                Ok(ExitCode::FAILURE)
            }
            _ => {
                println!("{}", format!("Job {job_id} is not running").yellow());
                Ok(ExitCode::FAILURE)
            }
        },
        Err(e) => Err(e).context(format!("Failed to stop job {job_id}")),
    }
}

/// Show one job
pub fn status(config: &RuntimeConfig, job_id: &str) -> Result<ExitCode> {
    let job_id = parse_job_id(job_id)?;
    let launcher = Launcher::open(&config.paths)?;

    match launcher.status(&job_id) {
        Ok(view) => {
            print_job_details(&launcher, &view);
            Ok(ExitCode::SUCCESS)
        }
        Err(Error::NotFound(_)) => {
            println!("{}", format!("Job {job_id} not found").yellow());
            Ok(ExitCode::FAILURE)
        }
        Err(e) => Err(e).context(format!("Failed to read job {job_id}")),
    }
}

/// List jobs
pub fn list(config: &RuntimeConfig, active: bool) -> Result<ExitCode> {
    let launcher = Launcher::open(&config.paths)?;
    let views: Vec<JobView> = launcher
        .list()?
        .into_iter()
        .filter(|v| !active || v.alive)
        .collect();

    if views.is_empty() {
        println!("{}", "No jobs found.".yellow());
    } else {
        println!("{}", format!("Found {} job(s):", views.len()).bold());
        println!();
        for view in &views {
            print_job_summary(view);
        }
    }

    Ok(ExitCode::SUCCESS)
}

fn status_label(view: &JobView) -> ColoredString {
    match view.status() {
        Some(status) => colorize_status(status),
        None => "unknown".dimmed(),
    }
}

fn print_job_summary(view: &JobView) {
    println!("  {} Job {}", "▸".cyan(), view.job_id.to_string().bold());
    println!("    Status:   {}", status_label(view));

    if let Some(record) = &view.record {
        let liveness = if view.alive { "alive".green() } else { "gone".red() };
        println!("    PID:      {} ({})", record.pid, liveness);
    }
    if let Some(step) = view.state.as_ref().and_then(|s| s.current_step.as_deref()) {
        println!("    Step:     {}", step);
    }
    if view.is_orphaned() {
        println!("    {}", "orphaned: run `detach cleanup`".red());
    }
    println!();
}

fn print_job_details(launcher: &Launcher, view: &JobView) {
    println!("{}", "Job Details:".bold());
    println!("  ID:        {}", view.job_id.to_string().cyan());
    println!("  Status:    {}", status_label(view));

    match &view.record {
        Some(record) => {
            let liveness = if view.alive { "alive".green() } else { "gone".red() };
            println!("  PID:       {} ({})", record.pid, liveness);
            if !record.command.is_empty() {
                println!("  Command:   {}", record.command.join(" ").dimmed());
            }
        }
        None => {
            if let Some(pid) = view.state.as_ref().and_then(|s| s.pid) {
                println!("  PID:       {} (exited)", pid);
            }
        }
    }

    println!("  Log:       {}", launcher.log_file(&view.job_id).display());

    if let Some(state) = &view.state {
        if let Some(step) = &state.current_step {
            println!("  Step:      {}", step);
        }
        println!("  Started:   {}", state.started_at.format("%Y-%m-%d %H:%M:%S"));
        println!("  Updated:   {}", state.updated_at.format("%Y-%m-%d %H:%M:%S"));

        if state.status.is_terminal() {
            let duration = state.updated_at.signed_duration_since(state.started_at);
            println!("  Duration:  {}s", duration.num_seconds());
        }

        if let Some(error) = &state.error_message {
            println!("\n{}", "Error:".bold());
            println!("{}", error.red());
        }
    }

    if view.is_orphaned() {
        println!();
        println!(
            "{}",
            "⚠ The job's process is gone without a final state. Run `detach cleanup` to mark it failed."
                .yellow()
        );
    }
}

/// Colorize job status for display
pub(crate) fn colorize_status(status: JobStatus) -> ColoredString {
    let label = status.as_str();
    match status {
        JobStatus::Initializing => label.yellow(),
        JobStatus::Running => label.cyan(),
        JobStatus::Completed => label.green(),
        JobStatus::Failed => label.red(),
        JobStatus::Stopped => label.dimmed(),
    }
}
