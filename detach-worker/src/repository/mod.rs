//! Repository Module
//!
//! Data access layer for the worker. The queue table in the backing store
//! is the only shared resource that needs transactional locking.

pub mod queue;

pub use queue::{JobQueue, PgJobQueue};
