//! Detach Runner
//!
//! Runs workflow jobs as fully detached OS processes and keeps track of
//! them through the filesystem only.
//!
//! Architecture:
//! - Process: liveness probes and signal escalation by pid
//! - PID Registry / State Store: one atomically replaced file per job
//! - Watcher: change notifications for the State Store, with polling fallback
//! - Launcher: spawns detached executors and stops them
//! - Executor: the code running inside the detached process
//! - Recovery: stale record cleanup, orphan recovery and retention pruning
//!
//! No component shares memory with another; monitors, launchers and
//! executors may be unrelated processes.

pub mod atomic;
pub mod executor;
pub mod launcher;
pub mod pid_registry;
pub mod process;
pub mod recovery;
pub mod state_store;
pub mod watcher;

pub use executor::{
    CommandWorkflow, ExecutionResult, JobExecutor, StepContext, Workflow, WorkflowOutcome,
};
pub use launcher::{JobView, LaunchCommand, Launcher};
pub use pid_registry::PidRegistry;
pub use process::Termination;
pub use recovery::{CleanupReport, Recovery};
pub use state_store::{StateStore, UpdateOutcome};
pub use watcher::StateWatcher;
