//! Error types for the job queue

use thiserror::Error;

/// Errors returned by [`crate::repository::JobQueue`] implementations
#[derive(Debug, Error)]
pub enum QueueError {
    /// The backing store rejected or failed a query
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    /// A row could not be mapped onto the queue contract
    #[error("malformed queue row {id}: {reason}")]
    Malformed {
        /// Row that failed to decode
        id: i64,
        /// What was wrong with it
        reason: String,
    },
}
