// Central Error Type for the Orchestrator

use thiserror::Error;

/// Application-level error type
#[derive(Error, Debug)]
pub enum AppError {
    #[error("Domain error: {0}")]
    Domain(#[from] crate::domain::DomainError),

    /// Malformed or empty job, rejected synchronously at submission
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Conversion error: {0}")]
    Conversion(#[from] crate::port::ConversionError),

    #[error("Lock contention timeout on {lock_key} after {attempts} attempts")]
    LockContentionTimeout { lock_key: String, attempts: u32 },

    /// State, output or lock store unavailable
    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Partitioning error: {0}")]
    Partitioning(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl AppError {
    /// Whether a failed invocation may be redelivered.
    ///
    /// Conversion failures, lock contention and storage outages are retried up
    /// to the unit's budget; malformed input never becomes valid on retry.
    pub fn is_retryable(&self) -> bool {
        !matches!(
            self,
            AppError::InvalidRequest(_)
                | AppError::Partitioning(_)
                | AppError::Validation(_)
                | AppError::Domain(_)
                | AppError::Config(_)
        )
    }

    /// Transient infrastructure failures, retried locally with backoff.
    pub fn is_transient(&self) -> bool {
        matches!(self, AppError::Storage(_) | AppError::Io(_))
    }
}

/// Result type alias using AppError
pub type Result<T> = std::result::Result<T, AppError>;

// From implementations for infra crates (to avoid circular dependency)
impl From<String> for AppError {
    fn from(err: String) -> Self {
        AppError::Storage(err)
    }
}
