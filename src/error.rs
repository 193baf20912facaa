//! Error types for pullq.
//!
//! Backend failures are reported as [`StorageError`](crate::storage::StorageError)
//! and folded into [`PullqError`] at the queue/worker boundary. The three
//! protocol errors (lock conflict, untracked job, hydration) keep their own
//! variants so callers can match on them without string inspection.

use thiserror::Error;

/// The main error type for pullq operations.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum PullqError {
    /// A state commit was rejected because the stored version moved on.
    ///
    /// This means the single-owner reservation invariant was violated; it must
    /// not be retried blindly.
    #[error("Lock conflict on job {job_id} (expected version {version})")]
    LockConflict { job_id: String, version: i64 },

    /// A job was persisted or detached without being tracked by the backend.
    #[error("Untracked job: {job_id}")]
    UntrackedJob { job_id: String },

    /// A stored record could not be turned back into a runnable job.
    #[error("Cannot hydrate job of type [{job_type}]: {message}")]
    Hydration { job_type: String, message: String },

    /// Job not found error
    #[error("Job not found: {job_id}")]
    JobNotFound { job_id: String },

    /// An API was used in a state that does not allow it.
    #[error("Invalid state: {message}")]
    InvalidState { message: String },

    /// Error raised by job code during set-up, execution or tear-down.
    #[error("Job logic error: {message}")]
    JobLogic { message: String },

    /// Serialization/deserialization errors
    #[error("Serialization failed: {message}")]
    SerializationError { message: String },

    /// Storage-related errors
    #[error("Storage error: {message}")]
    StorageError { message: String },

    /// Configuration errors
    #[error("Configuration error: {message}")]
    ConfigurationError { message: String },
}

impl PullqError {
    /// Shorthand used by job code to report a failure.
    pub fn job_logic(message: impl Into<String>) -> Self {
        Self::JobLogic {
            message: message.into(),
        }
    }

    pub fn invalid_state(message: impl Into<String>) -> Self {
        Self::InvalidState {
            message: message.into(),
        }
    }
}

impl From<serde_json::Error> for PullqError {
    fn from(err: serde_json::Error) -> Self {
        PullqError::SerializationError {
            message: err.to_string(),
        }
    }
}

/// A specialized Result type for pullq operations.
pub type Result<T> = std::result::Result<T, PullqError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_messages() {
        let err = PullqError::LockConflict {
            job_id: "7".to_string(),
            version: 3,
        };
        assert_eq!(
            err.to_string(),
            "Lock conflict on job 7 (expected version 3)"
        );

        let err = PullqError::job_logic("boom");
        assert_eq!(err.to_string(), "Job logic error: boom");
    }

    #[test]
    fn test_from_serde_json_error() {
        let err = serde_json::from_str::<serde_json::Value>("{not json").unwrap_err();
        let err: PullqError = err.into();
        assert!(matches!(err, PullqError::SerializationError { .. }));
    }
}
