//! Error types for Detach

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::domain::JobId;

/// Result type alias for Detach operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while launching, observing or stopping jobs
#[derive(Debug, Error)]
pub enum Error {
    /// No record exists for the job
    #[error("job not found: {0}")]
    NotFound(JobId),

    /// A live process already owns the job
    #[error("job {job_id} is already running (pid {pid})")]
    AlreadyRunning {
        /// The job that was requested
        job_id: JobId,
        /// The process currently executing it
        pid: u32,
    },

    /// Stop was requested for a job without a PID record
    #[error("job {0} is not running")]
    NotRunning(JobId),

    /// A PID or state file could not be parsed
    #[error("corrupt record at {}: {reason}", path.display())]
    Corrupt {
        /// File that failed to parse
        path: PathBuf,
        /// Parser or validation message
        reason: String,
    },

    /// No process with this pid exists
    #[error("no such process: {0}")]
    ProcessNotFound(u32),

    /// Signal delivery or file access was refused by the OS
    #[error("permission denied: {0}")]
    PermissionDenied(String),

    /// The process survived both termination signals
    #[error("process {pid} still alive after {waited:?}")]
    Timeout {
        /// Process that refused to exit
        pid: u32,
        /// Total time spent waiting
        waited: Duration,
    },

    /// Job identifiers double as file names and must be safe ones
    #[error("invalid job id {0:?}")]
    InvalidJobId(String),

    /// A record failed structural validation before being written
    #[error("invalid record: {0}")]
    Invalid(String),

    /// The detached process could not be started
    #[error("failed to spawn process: {0}")]
    Spawn(String),

    /// Underlying filesystem error
    #[error(transparent)]
    Io(std::io::Error),
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        match e.kind() {
            std::io::ErrorKind::PermissionDenied => Self::PermissionDenied(e.to_string()),
            _ => Self::Io(e),
        }
    }
}

impl Error {
    /// Create a corrupt-record error from any displayable reason
    pub fn corrupt(path: impl Into<PathBuf>, reason: impl std::fmt::Display) -> Self {
        Self::Corrupt {
            path: path.into(),
            reason: reason.to_string(),
        }
    }

    /// Check if this error means "no such record"
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }

    /// Check if this error is a self-healing corruption error
    pub fn is_corrupt(&self) -> bool {
        matches!(self, Self::Corrupt { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_predicates() {
        let id = JobId::new("j1").unwrap();
        assert!(Error::NotFound(id.clone()).is_not_found());
        assert!(!Error::NotRunning(id).is_not_found());
        assert!(Error::corrupt("/tmp/x.json", "eof").is_corrupt());
    }

    #[test]
    fn test_denied_file_access_is_permission_denied() {
        let denied = std::io::Error::from(std::io::ErrorKind::PermissionDenied);
        assert!(matches!(Error::from(denied), Error::PermissionDenied(_)));

        let other = std::io::Error::from(std::io::ErrorKind::UnexpectedEof);
        assert!(matches!(Error::from(other), Error::Io(_)));
    }

    #[test]
    fn test_messages() {
        let id = JobId::new("j1").unwrap();
        let err = Error::AlreadyRunning { job_id: id, pid: 42 };
        assert_eq!(err.to_string(), "job j1 is already running (pid 42)");

        let err = Error::corrupt("/tmp/x.json", "unexpected end of input");
        assert!(err.to_string().contains("/tmp/x.json"));
    }
}
