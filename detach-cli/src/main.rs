//! Detach CLI
//!
//! Starts workflow jobs as detached processes and monitors them through
//! the PID Registry and State Store on this host.

mod commands;

use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use colored::*;
use commands::{Commands, handle_command};
use detach_core::config::RuntimeConfig;
use detach_core::paths::RuntimePaths;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(name = "detach")]
#[command(about = "Run long-lived jobs as detached processes", long_about = None)]
struct Cli {
    /// Base directory for PID records, job states and logs
    #[arg(long, global = true, env = "DETACH_DATA_DIR")]
    data_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

impl Cli {
    fn runtime_config(&self) -> anyhow::Result<RuntimeConfig> {
        let mut config = RuntimeConfig::from_env()?;
        if let Some(dir) = &self.data_dir {
            config.paths = RuntimePaths::under(dir);
        }
        Ok(config)
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    // The executor's output is the job log; everything else keeps the
    // terminal for command output.
    let executing = matches!(cli.command, Commands::Exec { .. });
    let default_filter = if executing {
        "detach=info,detach_runner=info"
    } else {
        "detach=warn,detach_runner=warn"
    };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| default_filter.into());
    if executing {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
            .init();
    }

    let result = match cli.runtime_config() {
        Ok(config) => handle_command(cli.command, &config).await,
        Err(e) => Err(e),
    };

    match result {
        Ok(code) => code,
        Err(e) => {
            eprintln!("{} {:#}", "Error:".red().bold(), e);
            ExitCode::FAILURE
        }
    }
}
