//! Detach Worker
//!
//! Claims jobs from the shared queue and runs them as detached processes
//! on this host. Several workers may poll the same queue; each row is
//! launched by exactly one of them.

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use detach_runner::executor::install_shutdown_handler;
use detach_worker::config::Config;
use detach_worker::repository::{JobQueue, PgJobQueue};
use detach_worker::scheduler::QueuePoller;
use detach_worker::db;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "detach-worker")]
#[command(about = "Runs jobs claimed from the shared queue", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Option<WorkerCommands>,
}

#[derive(Subcommand)]
enum WorkerCommands {
    /// Poll the queue and launch claimed jobs (default)
    Run,
    /// Add a pending job to the queue
    Enqueue {
        /// Local job id to run the row under
        #[arg(long)]
        job_id: Option<String>,

        /// Command line of the job
        #[arg(last = true, required = true)]
        command: Vec<String>,
    },
    /// Create the queue table if it does not exist
    Migrate,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "detach_worker=info,detach_runner=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();

    let config = Config::from_env().context("Invalid worker configuration")?;
    config.validate()?;

    info!("Connecting to database...");
    let pool = db::create_pool(&config.database_url)
        .await
        .context("Failed to create database pool")?;

    match cli.command.unwrap_or(WorkerCommands::Run) {
        WorkerCommands::Run => run(config, pool).await,
        WorkerCommands::Enqueue { job_id, command } => enqueue(pool, job_id, command).await,
        WorkerCommands::Migrate => {
            db::run_migrations(&pool)
                .await
                .context("Failed to run database migrations")?;
            info!("Queue schema is up to date");
            Ok(())
        }
    }
}

async fn run(config: Config, pool: sqlx::PgPool) -> Result<()> {
    info!(
        "Starting Detach Worker: worker_id={}, executor={}",
        config.worker_id,
        config.executor_bin.display()
    );

    let shutdown = install_shutdown_handler().context("Failed to install signal handlers")?;
    let queue: Arc<dyn JobQueue> = Arc::new(PgJobQueue::new(pool));
    let poller = QueuePoller::new(config, queue)?;

    poller.run(shutdown).await
}

async fn enqueue(pool: sqlx::PgPool, job_id: Option<String>, command: Vec<String>) -> Result<()> {
    let job_id = job_id
        .map(detach_core::domain::JobId::new)
        .transpose()
        .context("Invalid job id")?;

    let payload = serde_json::to_value(detach_core::domain::JobSpec { job_id, command })?;
    let row = PgJobQueue::new(pool).enqueue(payload).await?;

    println!("{}", row.id);
    Ok(())
}
