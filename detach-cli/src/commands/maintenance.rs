//! Maintenance command handlers

use std::process::ExitCode;

use anyhow::{Context, Result};
use colored::*;
use detach_core::config::RuntimeConfig;
use detach_core::domain::JobId;
use detach_runner::{CleanupReport, Recovery};

/// Run every recovery routine once
pub fn cleanup(config: &RuntimeConfig) -> Result<ExitCode> {
    config.paths.ensure().context("Failed to create data directories")?;
    let recovery = Recovery::open(&config.paths)?;
    let report = recovery.run_cleanup(config).context("Cleanup failed")?;

    print_report(&report);
    Ok(ExitCode::SUCCESS)
}

fn print_report(report: &CleanupReport) {
    if report.is_empty() {
        println!("{}", "Nothing to clean up.".green());
        return;
    }

    print_jobs("Removed stale PID records", &report.stale_records);
    print_jobs("Removed corrupt states", &report.corrupt_states);
    print_jobs("Marked orphaned jobs failed", &report.orphans);
    print_jobs("Pruned finished jobs", &report.pruned);

    if report.temp_files > 0 {
        println!(
            "{} {}",
            "Removed temporary files:".bold(),
            report.temp_files
        );
    }
}

fn print_jobs(title: &str, jobs: &[JobId]) {
    if jobs.is_empty() {
        return;
    }

    println!("{} {}", format!("{title}:").bold(), jobs.len());
    for job in jobs {
        println!("  {} {}", "▸".cyan(), job);
    }
}
