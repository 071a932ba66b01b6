//! Detach Worker
//!
//! Pulls pending jobs from a shared PostgreSQL queue and runs each one as
//! a detached process on this host.
//!
//! Architecture:
//! - Configuration: worker identity, store URL and local concurrency
//! - Repository: the queue claimer (`FOR UPDATE SKIP LOCKED`)
//! - Scheduler: the poll loop that claims rows, launches them and settles
//!   finished jobs back into the queue

pub mod config;
pub mod db;
pub mod error;
pub mod repository;
pub mod scheduler;

pub use config::Config;
pub use error::QueueError;
pub use repository::{JobQueue, PgJobQueue};
pub use scheduler::QueuePoller;
