//! # Transactional Outbox
//!
//! Implements the transactional outbox pattern for the order pipeline:
//! domain writes and the events they produce are committed in one database
//! transaction, and a background relay drains the `outbox` table to Kafka
//! with at-least-once delivery.
//!
//! ## How it works
//!
//! 1. Business logic inserts its rows and an outbox row in the same
//!    transaction ([`OutboxRepository::insert`] takes the caller's
//!    transaction handle)
//! 2. The [`OutboxRelay`] polls for rows where `published = FALSE`, in
//!    creation order
//! 3. Each row is published to the broker keyed by `aggregate_id`, then
//!    marked `published = TRUE` with `published_at` set
//! 4. A crash between broker ack and the mark re-publishes the row on the
//!    next tick; consumers are expected to deduplicate
//!
//! The event becomes durable before it ever touches the broker, so a
//! committed order can never lose its event and a rolled-back order can
//! never leak one.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use transactional_outbox::{NewOutboxEvent, OutboxRepository, SqlxOutboxRepository};
//! use sqlx::PgPool;
//! use uuid::Uuid;
//!
//! async fn create_order(
//!     pool: &PgPool,
//!     outbox: &SqlxOutboxRepository,
//!     user_id: Uuid,
//! ) -> Result<(), Box<dyn std::error::Error>> {
//!     let mut tx = pool.begin().await?;
//!
//!     let order_id = Uuid::new_v4();
//!     sqlx::query("INSERT INTO orders (id, user_id, amount, state) VALUES ($1, $2, 10.00, 'CREATED')")
//!         .bind(order_id)
//!         .bind(user_id)
//!         .execute(&mut *tx)
//!         .await?;
//!
//!     let event = NewOutboxEvent::new(
//!         "order",
//!         order_id,
//!         "OrderCreated",
//!         serde_json::json!({ "orderId": order_id, "userId": user_id }),
//!     );
//!     outbox.insert(&mut tx, &event).await?;
//!
//!     tx.commit().await?;
//!     Ok(())
//! }
//! ```
//!
//! The relay side is a single logical producer:
//!
//! ```rust,no_run
//! use transactional_outbox::{KafkaOutboxPublisher, OutboxRelay, SqlxOutboxRepository};
//! use rdkafka::producer::FutureProducer;
//! use rdkafka::ClientConfig;
//! use sqlx::PgPool;
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let pool = PgPool::connect("postgresql://localhost/orders").await?;
//!
//!     let producer: FutureProducer = ClientConfig::new()
//!         .set("bootstrap.servers", "localhost:9092")
//!         .set("enable.idempotence", "true")
//!         .set("acks", "all")
//!         .create()?;
//!
//!     let repository = Arc::new(SqlxOutboxRepository::new(pool));
//!     let publisher = Arc::new(KafkaOutboxPublisher::new(producer, "order-events".to_string()));
//!
//!     let relay = OutboxRelay::new(
//!         repository,
//!         publisher,
//!         10,                          // batch_size
//!         Duration::from_secs(1),      // poll_interval
//!         Duration::from_secs(1),      // error_backoff
//!     );
//!     relay.start().await
//! }
//! ```
//!
//! ## Schema
//!
//! The library expects an `outbox` table shaped like:
//!
//! ```sql
//! CREATE TABLE outbox (
//!     id             BIGSERIAL PRIMARY KEY,
//!     event_id       UUID NOT NULL UNIQUE,
//!     aggregate_type TEXT NOT NULL,
//!     aggregate_id   UUID NOT NULL,
//!     event_type     TEXT NOT NULL,
//!     payload        JSONB NOT NULL,
//!     published      BOOLEAN NOT NULL DEFAULT FALSE,
//!     published_at   TIMESTAMPTZ,
//!     created_at     TIMESTAMPTZ NOT NULL DEFAULT NOW()
//! );
//! CREATE INDEX idx_outbox_unpublished ON outbox (published, created_at);
//! ```

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rdkafka::producer::{FutureProducer, FutureRecord};
use serde::{Deserialize, Serialize};
use sqlx::{PgPool, Postgres, Row, Transaction};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

mod error;
pub mod metrics;

pub use error::{OutboxError, OutboxResult};
pub use metrics::RelayMetrics;

/// An event about to be inserted into the outbox.
///
/// The sequence id is assigned by the database; everything else is fixed at
/// construction. `event_id` is minted fresh here, which is what makes outbox
/// inserts globally unique.
#[derive(Debug, Clone)]
pub struct NewOutboxEvent {
    /// Globally unique event identity, used downstream for deduplication
    pub event_id: Uuid,

    /// Type of aggregate this event relates to (e.g., "order")
    pub aggregate_type: String,

    /// Identity of the aggregate this event relates to
    pub aggregate_id: Uuid,

    /// Event type tag (e.g., "OrderCreated")
    pub event_type: String,

    /// Opaque JSON payload; the outbox does not interpret it
    pub payload: serde_json::Value,

    /// Creation timestamp, also the publication ordering key
    pub created_at: DateTime<Utc>,
}

impl NewOutboxEvent {
    pub fn new(
        aggregate_type: impl Into<String>,
        aggregate_id: Uuid,
        event_type: impl Into<String>,
        payload: serde_json::Value,
    ) -> Self {
        Self {
            event_id: Uuid::new_v4(),
            aggregate_type: aggregate_type.into(),
            aggregate_id,
            event_type: event_type.into(),
            payload,
            created_at: Utc::now(),
        }
    }
}

/// A row read back from the outbox table.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutboxEvent {
    /// Monotonic sequence id assigned by the database
    pub id: i64,

    /// Globally unique event identity
    pub event_id: Uuid,

    pub aggregate_type: String,

    pub aggregate_id: Uuid,

    pub event_type: String,

    pub payload: serde_json::Value,

    /// Set exactly once by the relay; a published row is never re-selected
    pub published: bool,

    /// Timestamp of the successful broker publish (None while unpublished)
    pub published_at: Option<DateTime<Utc>>,

    pub created_at: DateTime<Utc>,
}

impl OutboxEvent {
    /// Build the canonical wire envelope for this row.
    pub fn envelope(&self) -> EventEnvelope {
        EventEnvelope {
            event_id: self.event_id,
            event_type: self.event_type.clone(),
            aggregate_type: self.aggregate_type.clone(),
            aggregate_id: self.aggregate_id,
            payload: self.payload.clone(),
            created_at: self.created_at,
        }
    }
}

/// Canonical JSON envelope published to the broker.
///
/// This is the authoritative wire format for the `order-events` topic:
///
/// ```json
/// {
///   "eventId": "...", "eventType": "OrderCreated", "aggregateType": "order",
///   "aggregateId": "...", "payload": { }, "createdAt": "2024-01-01T00:00:00Z"
/// }
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventEnvelope {
    pub event_id: Uuid,
    pub event_type: String,
    pub aggregate_type: String,
    pub aggregate_id: Uuid,
    pub payload: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

impl EventEnvelope {
    /// Broker partition key. Same aggregate, same partition, so downstream
    /// consumers observe per-aggregate creation order.
    pub fn partition_key(&self) -> String {
        self.aggregate_id.to_string()
    }
}

/// Repository trait for managing outbox rows.
#[async_trait]
pub trait OutboxRepository: Send + Sync {
    /// Insert a new event into the outbox within an existing transaction.
    ///
    /// Must be called on the same transaction that mutates the aggregate, or
    /// the atomicity guarantee of the pattern is lost.
    async fn insert(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        event: &NewOutboxEvent,
    ) -> OutboxResult<()>;

    /// Fetch up to `limit` unpublished rows in publication order
    /// (`created_at` ascending, sequence id as tie-break).
    async fn fetch_unpublished(&self, limit: i64) -> OutboxResult<Vec<OutboxEvent>>;

    /// Mark a row as published, setting `published = TRUE` and
    /// `published_at` in one update. Returns [`OutboxError::RowNotFound`]
    /// if the row is missing or was already marked.
    async fn mark_published(&self, id: i64) -> OutboxResult<()>;

    /// Pending count and oldest pending age in seconds (age 0 if none).
    async fn pending_stats(&self) -> OutboxResult<(i64, i64)>;
}

/// SQLx-based implementation of [`OutboxRepository`] for PostgreSQL.
pub struct SqlxOutboxRepository {
    pool: PgPool,
}

impl SqlxOutboxRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Reset `published`/`published_at` for rows created since `ts` so the
    /// relay re-emits them. Operational backfill; downstream dedup absorbs
    /// the duplicates.
    pub async fn replay_since(&self, ts: DateTime<Utc>) -> OutboxResult<u64> {
        let res = sqlx::query(
            r#"
            UPDATE outbox
            SET published = FALSE,
                published_at = NULL
            WHERE created_at >= $1
            "#,
        )
        .bind(ts)
        .execute(&self.pool)
        .await
        .context("Failed to replay outbox rows since timestamp")?;

        Ok(res.rows_affected())
    }
}

#[async_trait]
impl OutboxRepository for SqlxOutboxRepository {
    async fn insert(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        event: &NewOutboxEvent,
    ) -> OutboxResult<()> {
        sqlx::query(
            r#"
            INSERT INTO outbox (
                event_id,
                aggregate_type,
                aggregate_id,
                event_type,
                payload,
                published,
                created_at
            ) VALUES ($1, $2, $3, $4, $5, FALSE, $6)
            "#,
        )
        .bind(event.event_id)
        .bind(&event.aggregate_type)
        .bind(event.aggregate_id)
        .bind(&event.event_type)
        .bind(&event.payload)
        .bind(event.created_at)
        .execute(&mut **tx)
        .await
        .context("Failed to insert event into outbox")?;

        debug!(
            event_id = %event.event_id,
            event_type = %event.event_type,
            aggregate_id = %event.aggregate_id,
            "Event inserted into outbox"
        );

        Ok(())
    }

    async fn fetch_unpublished(&self, limit: i64) -> OutboxResult<Vec<OutboxEvent>> {
        let rows = sqlx::query(
            r#"
            SELECT
                id,
                event_id,
                aggregate_type,
                aggregate_id,
                event_type,
                payload,
                published,
                published_at,
                created_at
            FROM outbox
            WHERE published = FALSE
            ORDER BY created_at ASC, id ASC
            LIMIT $1
            "#,
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .context("Failed to fetch unpublished outbox rows")?;

        let events: Vec<OutboxEvent> = rows
            .into_iter()
            .map(|row| {
                Ok(OutboxEvent {
                    id: row.try_get("id")?,
                    event_id: row.try_get("event_id")?,
                    aggregate_type: row.try_get("aggregate_type")?,
                    aggregate_id: row.try_get("aggregate_id")?,
                    event_type: row.try_get("event_type")?,
                    payload: row.try_get("payload")?,
                    published: row.try_get("published")?,
                    published_at: row.try_get("published_at")?,
                    created_at: row.try_get("created_at")?,
                })
            })
            .collect::<Result<Vec<_>, sqlx::Error>>()
            .context("Failed to parse outbox rows")?;

        debug!(count = events.len(), "Fetched unpublished outbox rows");

        Ok(events)
    }

    async fn mark_published(&self, id: i64) -> OutboxResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE outbox
            SET published = TRUE,
                published_at = NOW()
            WHERE id = $1 AND published = FALSE
            "#,
        )
        .bind(id)
        .execute(&self.pool)
        .await
        .context("Failed to mark outbox row as published")?;

        if result.rows_affected() == 0 {
            warn!(id, "Outbox row missing or already published when marking");
            return Err(OutboxError::RowNotFound(id));
        }

        debug!(id, "Outbox row marked as published");

        Ok(())
    }

    async fn pending_stats(&self) -> OutboxResult<(i64, i64)> {
        let rec = sqlx::query(
            r#"
            SELECT
                COUNT(*)::BIGINT AS pending,
                COALESCE(EXTRACT(EPOCH FROM (NOW() - MIN(created_at)))::BIGINT, 0) AS age_seconds
            FROM outbox
            WHERE published = FALSE
            "#,
        )
        .fetch_one(&self.pool)
        .await
        .context("Failed to compute pending stats")?;

        let pending: i64 = rec.try_get("pending").unwrap_or(0);
        let age: i64 = rec.try_get("age_seconds").unwrap_or(0);
        Ok((pending, age))
    }
}

/// Publisher seam for the broker side of the relay.
#[async_trait]
pub trait OutboxPublisher: Send + Sync {
    /// Publish one row's envelope to the broker. Must not return before the
    /// broker has acknowledged the write.
    async fn publish(&self, event: &OutboxEvent) -> OutboxResult<()>;
}

/// Kafka implementation of [`OutboxPublisher`].
///
/// Publishes every row to a single topic with the aggregate id as partition
/// key. The producer should run with `enable.idempotence=true` and
/// `acks=all`.
pub struct KafkaOutboxPublisher {
    producer: FutureProducer,
    topic: String,
}

impl KafkaOutboxPublisher {
    pub fn new(producer: FutureProducer, topic: String) -> Self {
        Self { producer, topic }
    }
}

#[async_trait]
impl OutboxPublisher for KafkaOutboxPublisher {
    async fn publish(&self, event: &OutboxEvent) -> OutboxResult<()> {
        let envelope = event.envelope();
        let key = envelope.partition_key();
        let payload = serde_json::to_string(&envelope)?;

        let record = FutureRecord::to(&self.topic).key(&key).payload(&payload);

        let delivery_timeout = Duration::from_secs(30);
        self.producer
            .send(record, delivery_timeout)
            .await
            .map_err(|(err, _)| OutboxError::PublishFailed(format!("Kafka publish failed: {}", err)))?;

        info!(
            event_id = %event.event_id,
            event_type = %event.event_type,
            topic = %self.topic,
            "Event published to broker"
        );

        Ok(())
    }
}

/// Background relay draining the outbox to the broker.
///
/// Guarantees:
/// - **At-least-once**: publish happens before mark; a crash in between
///   republishes the row on restart
/// - **Per-aggregate ordering**: rows are drained in creation order and
///   keyed by aggregate id
/// - **No loss**: a committed row stays selected until marked, so it is
///   eventually published absent permanent broker failure
pub struct OutboxRelay<R: OutboxRepository, P: OutboxPublisher> {
    repository: Arc<R>,
    publisher: Arc<P>,
    batch_size: i64,
    poll_interval: Duration,
    error_backoff: Duration,
    metrics: Option<RelayMetrics>,
}

impl<R: OutboxRepository, P: OutboxPublisher> OutboxRelay<R, P> {
    pub fn new(
        repository: Arc<R>,
        publisher: Arc<P>,
        batch_size: i64,
        poll_interval: Duration,
        error_backoff: Duration,
    ) -> Self {
        Self {
            repository,
            publisher,
            batch_size,
            poll_interval,
            error_backoff,
            metrics: None,
        }
    }

    /// Create a relay that also updates Prometheus gauges each cycle.
    pub fn new_with_metrics(
        repository: Arc<R>,
        publisher: Arc<P>,
        metrics: RelayMetrics,
        batch_size: i64,
        poll_interval: Duration,
        error_backoff: Duration,
    ) -> Self {
        Self {
            repository,
            publisher,
            batch_size,
            poll_interval,
            error_backoff,
            metrics: Some(metrics),
        }
    }

    /// Run the relay loop indefinitely.
    ///
    /// An empty select sleeps the poll interval; any error aborts the rest
    /// of the batch and sleeps the error back-off. All errors are logged,
    /// none terminate the loop.
    pub async fn start(&self) -> Result<()> {
        info!(
            event = "STARTUP",
            batch_size = self.batch_size,
            poll_interval_ms = self.poll_interval.as_millis() as u64,
            "Outbox relay starting"
        );

        loop {
            let sleep_for = match self.drain_once().await {
                Ok(0) => {
                    debug!("No outbox rows to publish");
                    self.poll_interval
                }
                Ok(count) => {
                    info!(published_count = count, "Published outbox rows");
                    Duration::ZERO
                }
                Err(e) => {
                    error!(event = "PROCESSING_ERROR", error = ?e, "Outbox relay tick failed");
                    if let Some(metrics) = &self.metrics {
                        metrics.observe_failure();
                    }
                    self.error_backoff
                }
            };

            if let Some(metrics) = &self.metrics {
                if let Ok((pending, age)) = self.repository.pending_stats().await {
                    metrics.observe_backlog(pending, age);
                }
            }

            if !sleep_for.is_zero() {
                tokio::time::sleep(sleep_for).await;
            }
        }
    }

    /// Drain one batch: fetch unpublished rows and publish-then-mark each in
    /// order. The first failure aborts the remainder of the batch so that
    /// per-aggregate ordering is preserved across retries.
    ///
    /// Returns the number of rows marked published.
    pub async fn drain_once(&self) -> OutboxResult<usize> {
        let events = self.repository.fetch_unpublished(self.batch_size).await?;
        let mut published_count = 0;

        for event in events {
            self.publisher.publish(&event).await?;
            self.repository.mark_published(event.id).await?;

            published_count += 1;
            if let Some(metrics) = &self.metrics {
                metrics.observe_published(&event.event_type);
            }
        }

        Ok(published_count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample_event() -> OutboxEvent {
        OutboxEvent {
            id: 42,
            event_id: Uuid::parse_str("f3b9c4de-9d55-4f8f-bd3e-8a0c2b7a1e10").unwrap(),
            aggregate_type: "order".to_string(),
            aggregate_id: Uuid::parse_str("0a8e2b14-3f14-4c4e-9f8e-6a5d4c3b2a19").unwrap(),
            event_type: "OrderCreated".to_string(),
            payload: json!({ "orderId": "0a8e2b14-3f14-4c4e-9f8e-6a5d4c3b2a19" }),
            published: false,
            published_at: None,
            created_at: "2024-03-01T12:00:00Z".parse().unwrap(),
        }
    }

    #[test]
    fn test_envelope_wire_format_is_camel_case() {
        let envelope = sample_event().envelope();
        let value = serde_json::to_value(&envelope).unwrap();
        let obj = value.as_object().unwrap();

        for key in [
            "eventId",
            "eventType",
            "aggregateType",
            "aggregateId",
            "payload",
            "createdAt",
        ] {
            assert!(obj.contains_key(key), "missing wire field {}", key);
        }
        assert_eq!(obj.len(), 6);
        assert_eq!(obj["eventType"], "OrderCreated");
        assert_eq!(obj["aggregateType"], "order");
        // createdAt rides as RFC3339
        assert!(obj["createdAt"].as_str().unwrap().starts_with("2024-03-01T12:00:00"));
    }

    #[test]
    fn test_envelope_round_trip() {
        let envelope = sample_event().envelope();
        let json = serde_json::to_string(&envelope).unwrap();
        let back: EventEnvelope = serde_json::from_str(&json).unwrap();

        assert_eq!(back.event_id, envelope.event_id);
        assert_eq!(back.event_type, envelope.event_type);
        assert_eq!(back.aggregate_id, envelope.aggregate_id);
        assert_eq!(back.payload, envelope.payload);
    }

    #[test]
    fn test_partition_key_is_aggregate_id() {
        let envelope = sample_event().envelope();
        assert_eq!(
            envelope.partition_key(),
            "0a8e2b14-3f14-4c4e-9f8e-6a5d4c3b2a19"
        );
    }

    #[test]
    fn test_new_outbox_events_get_distinct_event_ids() {
        let aggregate = Uuid::new_v4();
        let a = NewOutboxEvent::new("order", aggregate, "OrderCreated", json!({}));
        let b = NewOutboxEvent::new("order", aggregate, "OrderCreated", json!({}));
        assert_ne!(a.event_id, b.event_id);
        assert_eq!(a.aggregate_id, b.aggregate_id);
    }
}
