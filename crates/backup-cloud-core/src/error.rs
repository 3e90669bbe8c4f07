use thiserror::Error;

/// Errors raised by storage backends, caches and the sync/cycle engines.
#[derive(Debug, Error)]
pub enum StorageError {
    /// Cached credential unusable or interactive authorization not completed.
    #[error("Authorization failed: {0}")]
    Authorization(String),

    /// Backend API answered with a non-success status.
    #[error("{backend} API error (status {status}): {message}")]
    Api {
        backend: &'static str,
        status: u16,
        message: String,
    },

    #[error("I/O error: {0}")]
    Io(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Not found: {0}")]
    NotFound(String),

    /// An operation failed on every attempt allowed by the retry policy.
    #[error("{operation} failed after {attempts} attempt(s): {last_error}")]
    RetriesExhausted {
        operation: String,
        attempts: u32,
        last_error: String,
    },

    /// A recorded backup generation has no objects left on the remote.
    #[error("Expected backup package not found under '{0}'")]
    PackageNotFound(String),

    #[error("Sync incomplete, {} upload(s) failed: {}", .0.len(), .0.join(", "))]
    SyncIncomplete(Vec<String>),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl StorageError {
    /// Whether the retry policy should attempt the operation again.
    pub fn is_retryable(&self) -> bool {
        match self {
            StorageError::Authorization(_)
            | StorageError::Config(_)
            | StorageError::NotFound(_)
            | StorageError::PackageNotFound(_)
            | StorageError::SyncIncomplete(_)
            | StorageError::RetriesExhausted { .. } => false,
            StorageError::Api { status, .. } => {
                *status == 408 || *status == 429 || *status >= 500
            }
            StorageError::Io(_) | StorageError::Serialization(_) => true,
        }
    }
}

impl From<reqwest::Error> for StorageError {
    fn from(e: reqwest::Error) -> Self {
        StorageError::Io(format!("HTTP request failed: {}", e))
    }
}

impl From<std::io::Error> for StorageError {
    fn from(e: std::io::Error) -> Self {
        StorageError::Io(e.to_string())
    }
}

impl From<serde_json::Error> for StorageError {
    fn from(e: serde_json::Error) -> Self {
        StorageError::Serialization(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, StorageError>;
