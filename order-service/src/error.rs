//! Service-level error taxonomy.
//!
//! Transient errors (`Storage`, `Broker`, payment `Transient`) surface to
//! the retry/loop level of whichever component hit them; business outcomes
//! and state conflicts are not errors and never appear here.

use thiserror::Error;

use crate::services::payment::PaymentError;

pub type Result<T> = std::result::Result<T, ServiceError>;

#[derive(Error, Debug)]
pub enum ServiceError {
    /// Malformed input rejected at the ingress (HTTP 400)
    #[error("validation failed: {0}")]
    Validation(String),

    /// Database failure; caller retries or reports 500
    #[error("storage error: {0}")]
    Storage(#[from] sqlx::Error),

    /// Broker failure; caller retries or reports 500
    #[error("broker error: {0}")]
    Broker(String),

    /// Outbox layer failure
    #[error("outbox error: {0}")]
    Outbox(#[from] transactional_outbox::OutboxError),

    /// Dedup ledger failure
    #[error("ledger error: {0}")]
    Ledger(#[from] idempotent_consumer::IdempotencyError),

    /// Transient payment failure escalating into the worker retry loop
    #[error("payment error: {0}")]
    Payment(#[from] PaymentError),

    /// Payload (de)serialization failure
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}
