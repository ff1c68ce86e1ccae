//! Error types for the idempotent consumer library

use thiserror::Error;

/// Result type for ledger operations
pub type IdempotencyResult<T> = Result<T, IdempotencyError>;

/// Errors that can occur while reading or writing the dedup ledger
#[derive(Error, Debug)]
pub enum IdempotencyError {
    /// Database operation failed (connection, query execution, etc.)
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Worker kind validation failed (empty or too long)
    #[error("Invalid worker kind: {0}")]
    InvalidWorkerKind(String),

    /// Generic error with context
    #[error("{0}")]
    Other(#[from] anyhow::Error),
}

impl IdempotencyError {
    /// Check if the error is transient (worth retrying)
    pub fn is_transient(&self) -> bool {
        match self {
            IdempotencyError::Database(sqlx_err) => {
                matches!(sqlx_err, sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed)
            }
            _ => false,
        }
    }
}
