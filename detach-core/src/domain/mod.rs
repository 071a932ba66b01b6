//! Core domain types
//!
//! These types are written to disk by one process and read back by others,
//! so every one of them has a stable serde representation.

pub mod job;
pub mod queue;
pub mod record;

pub use job::{JobId, JobState, JobStatus, StateUpdate};
pub use queue::{JobSpec, QueueRow, QueueStatus};
pub use record::JobRecord;
