//! # Idempotent Consumer Ledger
//!
//! Persistent dedup ledger for at-least-once broker consumers, backed by
//! the PostgreSQL `processed_events` table keyed on
//! `(event_id, worker_kind)`.
//!
//! ## Problem
//!
//! The broker redelivers: consumer restarts, rebalances, and crashes
//! between processing and offset commit all hand the same event to the
//! handler again. Side-effects that are not invariant under duplicates
//! (payments, state transitions) need a durable record of what has already
//! been applied.
//!
//! ## Design
//!
//! - The ledger row is inserted **inside the caller's transaction**, in the
//!   same commit as the state change it records. Either both become
//!   durable or neither does, so partial progress can never poison the
//!   ledger.
//! - The pre-flight [`IdempotencyLedger::is_processed`] check is advisory
//!   only (a fast-path skip); the unique key is the binding serialization
//!   point.
//! - The key is scoped by `worker_kind`, so independent consumer pipelines
//!   each process the same event exactly once without seeing each other's
//!   rows.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use idempotent_consumer::IdempotencyLedger;
//! use sqlx::PgPool;
//! use uuid::Uuid;
//!
//! async fn handle(pool: PgPool, event_id: Uuid) -> Result<(), Box<dyn std::error::Error>> {
//!     let ledger = IdempotencyLedger::new(pool.clone(), "payment-worker")?;
//!
//!     // Fast path: already committed for this worker kind.
//!     if ledger.is_processed(event_id).await? {
//!         return Ok(());
//!     }
//!
//!     let mut tx = pool.begin().await?;
//!     // ... apply the state change on the same transaction ...
//!     ledger.mark_processed(&mut tx, event_id).await?;
//!     tx.commit().await?;
//!     Ok(())
//! }
//! ```
//!
//! ## Schema
//!
//! ```sql
//! CREATE TABLE processed_events (
//!     event_id     UUID NOT NULL,
//!     worker_kind  TEXT NOT NULL,
//!     processed_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
//!     PRIMARY KEY (event_id, worker_kind)
//! );
//! ```

use anyhow::Context;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{PgPool, Postgres, Row, Transaction};
use tracing::{debug, info};
use uuid::Uuid;

mod error;

pub use error::{IdempotencyError, IdempotencyResult};

/// A committed ledger row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessedEvent {
    /// Event identity, from the broker envelope
    pub event_id: Uuid,

    /// Consumer pipeline that reached its commit point for this event
    pub worker_kind: String,

    /// Timestamp of the commit
    pub processed_at: DateTime<Utc>,
}

/// Dedup ledger bound to one consumer kind.
///
/// Clone-cheap; share across tasks freely.
#[derive(Clone)]
pub struct IdempotencyLedger {
    pool: PgPool,
    worker_kind: String,
}

impl IdempotencyLedger {
    /// Create a ledger scoped to `worker_kind`.
    ///
    /// The kind must be non-empty and at most 100 bytes; it names the
    /// consumer pipeline, not the instance (all replicas of one worker
    /// share a kind).
    pub fn new(pool: PgPool, worker_kind: impl Into<String>) -> IdempotencyResult<Self> {
        let worker_kind = worker_kind.into();
        Self::validate_worker_kind(&worker_kind)?;
        Ok(Self { pool, worker_kind })
    }

    /// The worker kind this ledger is scoped to.
    pub fn worker_kind(&self) -> &str {
        &self.worker_kind
    }

    /// Advisory check: has this worker kind already committed the event?
    ///
    /// Runs against the pool (autocommit). A `false` here can be stale by
    /// the time the caller commits; the unique key on the insert is what
    /// actually serializes concurrent handlers.
    pub async fn is_processed(&self, event_id: Uuid) -> IdempotencyResult<bool> {
        let result = sqlx::query(
            r#"
            SELECT EXISTS(
                SELECT 1 FROM processed_events
                WHERE event_id = $1 AND worker_kind = $2
            ) AS exists
            "#,
        )
        .bind(event_id)
        .bind(&self.worker_kind)
        .fetch_one(&self.pool)
        .await
        .context("Failed to check processed_events")?;

        let exists: bool = result.try_get("exists")?;

        if exists {
            debug!(event_id = %event_id, worker_kind = %self.worker_kind, "Event already processed");
        }

        Ok(exists)
    }

    /// Record the commit point for `event_id` inside the caller's
    /// transaction.
    ///
    /// Uses `INSERT … ON CONFLICT DO NOTHING` so replays are a no-op.
    /// Returns whether the row was actually inserted (false = some other
    /// commit got there first).
    pub async fn mark_processed(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        event_id: Uuid,
    ) -> IdempotencyResult<bool> {
        let result = sqlx::query(
            r#"
            INSERT INTO processed_events (event_id, worker_kind, processed_at)
            VALUES ($1, $2, NOW())
            ON CONFLICT (event_id, worker_kind) DO NOTHING
            "#,
        )
        .bind(event_id)
        .bind(&self.worker_kind)
        .execute(&mut **tx)
        .await
        .context("Failed to insert into processed_events")?;

        let was_inserted = result.rows_affected() > 0;

        if was_inserted {
            debug!(event_id = %event_id, worker_kind = %self.worker_kind, "Event marked as processed");
        } else {
            debug!(
                event_id = %event_id,
                worker_kind = %self.worker_kind,
                "Event already marked as processed (duplicate)"
            );
        }

        Ok(was_inserted)
    }

    /// Delete ledger rows older than `cutoff` for this worker kind.
    ///
    /// Operator-invoked retention sweep. Rows inside the broker's
    /// redelivery horizon must be kept or dedup breaks.
    pub async fn cleanup_before(&self, cutoff: DateTime<Utc>) -> IdempotencyResult<u64> {
        let result = sqlx::query(
            r#"
            DELETE FROM processed_events
            WHERE worker_kind = $1 AND processed_at < $2
            "#,
        )
        .bind(&self.worker_kind)
        .bind(cutoff)
        .execute(&self.pool)
        .await
        .context("Failed to cleanup processed_events")?;

        let deleted_count = result.rows_affected();

        if deleted_count > 0 {
            info!(
                deleted_count,
                worker_kind = %self.worker_kind,
                cutoff = %cutoff,
                "Cleaned up old ledger rows"
            );
        }

        Ok(deleted_count)
    }

    fn validate_worker_kind(worker_kind: &str) -> IdempotencyResult<()> {
        if worker_kind.is_empty() {
            return Err(IdempotencyError::InvalidWorkerKind(
                "Worker kind cannot be empty".to_string(),
            ));
        }

        if worker_kind.len() > 100 {
            return Err(IdempotencyError::InvalidWorkerKind(format!(
                "Worker kind too long: {} bytes (max 100)",
                worker_kind.len()
            )));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_worker_kind() {
        assert!(IdempotencyLedger::validate_worker_kind("payment-worker").is_ok());
        assert!(IdempotencyLedger::validate_worker_kind("a").is_ok());
        assert!(IdempotencyLedger::validate_worker_kind(&"x".repeat(100)).is_ok());

        let err = IdempotencyLedger::validate_worker_kind("").unwrap_err();
        assert!(matches!(err, IdempotencyError::InvalidWorkerKind(_)));

        let err = IdempotencyLedger::validate_worker_kind(&"x".repeat(101)).unwrap_err();
        assert!(matches!(err, IdempotencyError::InvalidWorkerKind(_)));
    }
}
