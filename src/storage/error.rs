use crate::error::PullqError;
use thiserror::Error;

/// Storage-specific errors that can occur during job persistence operations
#[derive(Error, Debug)]
pub enum StorageError {
    /// Connection-related errors (network, authentication, etc.)
    #[error("Storage connection error: {message}")]
    Connection {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// Serialization/deserialization errors when converting jobs to/from storage format
    #[error("Serialization error: {message}")]
    Serialization {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// Job not found in storage
    #[error("Job not found: {job_id}")]
    JobNotFound { job_id: String },

    /// Configuration errors
    #[error("Storage configuration error: {message}")]
    Configuration { message: String },

    /// General storage operation errors
    #[error("Storage operation failed: {operation} - {message}")]
    OperationFailed {
        operation: String,
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// Storage capacity exceeded
    #[error("Storage capacity exceeded: {message}")]
    CapacityExceeded { message: String },

    /// The stored version no longer matches the version the caller read.
    #[error("Lock conflict on job {job_id} (expected version {version})")]
    LockConflict { job_id: String, version: i64 },

    /// The job was not reserved through this backend, or was already detached.
    #[error("Job {job_id} is not tracked by this storage")]
    UntrackedJob { job_id: String },

    /// A stored record names a job type the registry cannot build.
    #[error("Cannot hydrate job of type [{job_type}]: {message}")]
    Hydration { job_type: String, message: String },

    /// Storage operation timed out
    #[error("Storage operation timed out after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    /// Schema setup errors
    #[error("Migration error: {message}")]
    MigrationError { message: String },

    /// Invalid job data format
    #[error("Invalid job data: {message}")]
    InvalidJobData { message: String },
}

impl StorageError {
    /// Create a connection error with a message
    pub fn connection<S: Into<String>>(message: S) -> Self {
        Self::Connection {
            message: message.into(),
            source: None,
        }
    }

    /// Create a connection error with a message and source error
    pub fn connection_with_source<S: Into<String>>(
        message: S,
        source: Box<dyn std::error::Error + Send + Sync>,
    ) -> Self {
        Self::Connection {
            message: message.into(),
            source: Some(source),
        }
    }

    /// Create a serialization error with a message
    pub fn serialization<S: Into<String>>(message: S) -> Self {
        Self::Serialization {
            message: message.into(),
            source: None,
        }
    }

    /// Create a serialization error with a message and source error
    pub fn serialization_with_source<S: Into<String>>(
        message: S,
        source: Box<dyn std::error::Error + Send + Sync>,
    ) -> Self {
        Self::Serialization {
            message: message.into(),
            source: Some(source),
        }
    }

    pub fn job_not_found<S: ToString>(job_id: S) -> Self {
        Self::JobNotFound {
            job_id: job_id.to_string(),
        }
    }

    pub fn configuration<S: Into<String>>(message: S) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    pub fn operation_failed<S: Into<String>, T: Into<String>>(operation: S, message: T) -> Self {
        Self::OperationFailed {
            operation: operation.into(),
            message: message.into(),
            source: None,
        }
    }

    /// Create an operation failed error with source
    pub fn operation_failed_with_source<S: Into<String>, T: Into<String>>(
        operation: S,
        message: T,
        source: Box<dyn std::error::Error + Send + Sync>,
    ) -> Self {
        Self::OperationFailed {
            operation: operation.into(),
            message: message.into(),
            source: Some(source),
        }
    }

    pub fn timeout(timeout_ms: u64) -> Self {
        Self::Timeout { timeout_ms }
    }

    pub fn capacity_exceeded<S: Into<String>>(message: S) -> Self {
        Self::CapacityExceeded {
            message: message.into(),
        }
    }

    pub fn lock_conflict<S: ToString>(job_id: S, version: i64) -> Self {
        Self::LockConflict {
            job_id: job_id.to_string(),
            version,
        }
    }

    pub fn untracked<S: ToString>(job_id: S) -> Self {
        Self::UntrackedJob {
            job_id: job_id.to_string(),
        }
    }

    pub fn hydration<S: Into<String>, T: Into<String>>(job_type: S, message: T) -> Self {
        Self::Hydration {
            job_type: job_type.into(),
            message: message.into(),
        }
    }

    pub fn invalid_job_data<S: Into<String>>(message: S) -> Self {
        Self::InvalidJobData {
            message: message.into(),
        }
    }
}

impl From<serde_json::Error> for StorageError {
    fn from(err: serde_json::Error) -> Self {
        Self::serialization_with_source("JSON encoding failed", Box::new(err))
    }
}

// Convert StorageError to PullqError for unified error handling
impl From<StorageError> for PullqError {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::JobNotFound { job_id } => PullqError::JobNotFound { job_id },
            StorageError::LockConflict { job_id, version } => {
                PullqError::LockConflict { job_id, version }
            }
            StorageError::UntrackedJob { job_id } => PullqError::UntrackedJob { job_id },
            StorageError::Hydration { job_type, message } => {
                PullqError::Hydration { job_type, message }
            }
            StorageError::Serialization { message, .. } => {
                PullqError::SerializationError { message }
            }
            StorageError::Configuration { message } => PullqError::ConfigurationError { message },
            _ => PullqError::StorageError {
                message: err.to_string(),
            },
        }
    }
}
