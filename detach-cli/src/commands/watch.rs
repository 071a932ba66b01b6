//! Watch command handler
//!
//! Follows jobs through the Change Watcher and prints every state change
//! until all of them are finished or the user interrupts.

use std::collections::{BTreeMap, HashSet};
use std::process::ExitCode;

use anyhow::{Context, Result};
use colored::*;
use detach_core::config::RuntimeConfig;
use detach_core::domain::{JobId, JobState};
use detach_core::Error;
use detach_runner::executor::install_shutdown_handler;
use detach_runner::{StateStore, StateWatcher};
use tokio::sync::mpsc;

use super::job::colorize_status;
use super::parse_job_id;

pub async fn watch(config: &RuntimeConfig, raw_ids: &[String]) -> Result<ExitCode> {
    let mut job_ids = raw_ids
        .iter()
        .map(|raw| parse_job_id(raw))
        .collect::<Result<Vec<_>>>()?;
    job_ids.sort();
    job_ids.dedup();

    config.paths.ensure().context("Failed to create data directories")?;
    let store = StateStore::open(&config.paths.state_dir)?;

    let (tx, mut rx) = mpsc::unbounded_channel::<(JobId, Option<JobState>)>();
    let mut watcher = StateWatcher::from_config(store.clone(), config);
    for job_id in &job_ids {
        let tx = tx.clone();
        watcher.register_callback(job_id.clone(), move |job_id, state| {
            let _ = tx.send((job_id.clone(), state.cloned()));
        });
    }
    drop(tx);

    // current state first; later changes come from the watcher
    let mut finished = HashSet::new();
    let mut last_seen = BTreeMap::new();
    for job_id in &job_ids {
        let state = match store.read(job_id) {
            Ok(state) => Some(state),
            Err(Error::NotFound(_)) => None,
            Err(e) => return Err(e).context(format!("Failed to read job {job_id}")),
        };
        print_change(job_id, state.as_ref());
        if state.as_ref().is_some_and(|s| s.status.is_terminal()) {
            finished.insert(job_id.clone());
        }
        last_seen.insert(job_id.clone(), state);
    }

    if finished.len() == job_ids.len() {
        return Ok(ExitCode::SUCCESS);
    }

    watcher.start()?;
    if watcher.is_polling() {
        println!("{}", "(polling for changes)".dimmed());
    }
    let interrupted = install_shutdown_handler().context("Failed to install signal handlers")?;

    loop {
        tokio::select! {
            _ = interrupted.cancelled() => break,
            change = rx.recv() => {
                let Some((job_id, state)) = change else { break };

                // debounced deliveries may repeat the last state
                if last_seen.get(&job_id) == Some(&state) {
                    continue;
                }
                print_change(&job_id, state.as_ref());

                if state.as_ref().is_some_and(|s| s.status.is_terminal()) {
                    finished.insert(job_id.clone());
                }
                last_seen.insert(job_id, state);

                if finished.len() == job_ids.len() {
                    break;
                }
            }
        }
    }

    watcher.stop();
    Ok(ExitCode::SUCCESS)
}

fn print_change(job_id: &JobId, state: Option<&JobState>) {
    let time = chrono::Local::now().format("%H:%M:%S").to_string();

    let Some(state) = state else {
        println!("{} {} {}", time.dimmed(), job_id.to_string().bold(), "not found".dimmed());
        return;
    };

    let mut line = format!(
        "{} {} {}",
        time.dimmed(),
        job_id.to_string().bold(),
        colorize_status(state.status)
    );
    if let Some(step) = &state.current_step {
        line.push_str(&format!(" [{step}]"));
    }
    if let Some(error) = &state.error_message {
        line.push_str(&format!(" {}", error.red()));
    }
    println!("{line}");
}
