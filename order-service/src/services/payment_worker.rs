//! The payment worker: consumes `OrderCreated` events and drives each order
//! through its state machine, exactly once in observable side-effects.
//!
//! Per delivery the handler runs four stages:
//!
//! - **dedup check**: advisory ledger pre-check (fast path; the binding
//!   commit happens at settle time)
//! - **advance**: conditional update `CREATED → PAYMENT_PENDING`,
//!   recording the resulting version for the later optimistic guard
//! - **payment**: the provider call, deliberately outside any transaction
//! - **settle**: one transaction holding the conditional terminal update,
//!   the follow-up outbox event, and the dedup row
//!
//! Advance and settle are conditional updates predicated on the exact
//! pre-state, so replays and racing peers fall out as zero-row updates,
//! never as double side-effects. Errors escaping the stages loop through a
//! bounded retry; exhaustion lands the envelope in `dead_letter_events`
//! and the offset still advances. Within one delivery the retry resumes
//! after the advance, carrying the version observed there across attempts:
//! re-running the advance would see a non-CREATED state and silently skip,
//! turning every transient payment failure into a stuck order.
//!
//! Known window: a crash between the advance and the settle commit leaves
//! the order parked in PAYMENT_PENDING with no ledger row; redelivery then
//! skips at the advance. A reconciliation sweep for stuck PAYMENT_PENDING
//! orders is future work.

use idempotent_consumer::IdempotencyLedger;
use rdkafka::config::ClientConfig;
use rdkafka::consumer::{CommitMode, Consumer, StreamConsumer};
use rdkafka::message::{BorrowedMessage, Message};
use sqlx::{PgPool, Row};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};
use transactional_outbox::{EventEnvelope, NewOutboxEvent, OutboxRepository, SqlxOutboxRepository};

use crate::config::{BrokerConfig, WorkerConfig};
use crate::error::Result;
use crate::models::{
    OrderCreatedPayload, OrderEvent, OrderSettledPayload, OrderState, AGGREGATE_ORDER,
    EVENT_ORDER_CREATED, EVENT_ORDER_FAILED, EVENT_ORDER_PAID, ORDER_EVENTS_TOPIC, PAYMENT_GROUP,
    PAYMENT_WORKER_KIND,
};
use crate::services::payment::{PaymentService, PaymentStatus};

/// Counters owned by the consume task; no shared mutable state. The
/// metrics timer snapshots them into a single structured log record.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct WorkerCounters {
    pub events_processed: u64,
    pub duplicates_skipped: u64,
    pub payments_success: u64,
    pub payments_failed: u64,
    pub retried_events: u64,
    pub dlq_events: u64,
}

impl WorkerCounters {
    pub fn log_snapshot(&self) {
        info!(
            event = "METRICS",
            events_processed = self.events_processed,
            duplicates_skipped = self.duplicates_skipped,
            payments_success = self.payments_success,
            payments_failed = self.payments_failed,
            retried_events = self.retried_events,
            dlq_events = self.dlq_events,
            "Worker counters snapshot"
        );
    }
}

/// What one handler invocation did. Everything here is a success from the
/// broker's point of view: the offset advances in all cases.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandlerOutcome {
    /// Terminal transition committed with this payment result
    Settled(PaymentStatus),
    /// Fast path: the ledger already has this event
    Duplicate,
    /// The advance found the order not in CREATED (or absent)
    AlreadyAdvanced,
    /// The settle update affected zero rows; a peer's commit is
    /// authoritative
    LostRace,
}

pub struct PaymentWorker {
    pool: PgPool,
    outbox: SqlxOutboxRepository,
    ledger: IdempotencyLedger,
    payment: Arc<dyn PaymentService>,
    config: WorkerConfig,
}

impl PaymentWorker {
    pub fn new(
        pool: PgPool,
        payment: Arc<dyn PaymentService>,
        config: WorkerConfig,
    ) -> Result<Self> {
        let outbox = SqlxOutboxRepository::new(pool.clone());
        let ledger = IdempotencyLedger::new(pool.clone(), PAYMENT_WORKER_KIND)?;
        Ok(Self {
            pool,
            outbox,
            ledger,
            payment,
            config,
        })
    }

    /// Join the consumer group and process deliveries until the surrounding
    /// task is cancelled.
    ///
    /// Offsets are committed only after the handler returns, never
    /// mid-processing; within a partition deliveries are strictly serial,
    /// which is what makes the per-aggregate FIFO guarantee hold.
    pub async fn run(&self, broker: &BrokerConfig) -> anyhow::Result<()> {
        let consumer: StreamConsumer = ClientConfig::new()
            .set("bootstrap.servers", &broker.addr)
            .set("group.id", PAYMENT_GROUP)
            .set("enable.auto.commit", "false")
            .set("auto.offset.reset", "earliest")
            .set("session.timeout.ms", "30000")
            .create()?;

        consumer.subscribe(&[ORDER_EVENTS_TOPIC])?;

        info!(
            event = "STARTUP",
            topic = ORDER_EVENTS_TOPIC,
            group = PAYMENT_GROUP,
            max_retries = self.config.max_retries,
            retry_backoff_ms = self.config.retry_backoff_ms,
            "Payment worker starting"
        );

        let mut counters = WorkerCounters::default();
        let mut metrics_interval =
            tokio::time::interval(Duration::from_millis(self.config.metrics_interval_ms));

        loop {
            tokio::select! {
                msg = consumer.recv() => match msg {
                    Ok(m) => {
                        self.handle_delivery(&m, &mut counters).await;
                        if let Err(commit_err) = consumer.commit_message(&m, CommitMode::Async) {
                            warn!("Failed to commit broker offset: {}", commit_err);
                        }
                    }
                    Err(e) => warn!("Broker consumer error: {}", e),
                },
                _ = metrics_interval.tick() => counters.log_snapshot(),
            }
        }
    }

    async fn handle_delivery(&self, msg: &BorrowedMessage<'_>, counters: &mut WorkerCounters) {
        let Some(payload) = msg.payload() else {
            warn!(
                topic = msg.topic(),
                "Received broker message with empty payload"
            );
            return;
        };

        let envelope: EventEnvelope = match serde_json::from_slice(payload) {
            Ok(envelope) => envelope,
            Err(err) => {
                // Undecodable bytes carry no event id, so there is nothing
                // to key a dead letter on. Acknowledge and move on.
                error!(
                    event = "PROCESSING_ERROR",
                    topic = msg.topic(),
                    error = %err,
                    "Undecodable envelope, acknowledging"
                );
                return;
            }
        };

        self.handle_envelope(&envelope, counters).await;
    }

    /// Per-envelope contract: dispatch on the event tag, run the staged
    /// handler under the bounded retry loop, dead-letter on exhaustion.
    /// Never fails from the caller's point of view.
    pub async fn handle_envelope(&self, envelope: &EventEnvelope, counters: &mut WorkerCounters) {
        info!(
            event = "EVENT_RECEIVED",
            event_id = %envelope.event_id,
            event_type = %envelope.event_type,
            aggregate_id = %envelope.aggregate_id,
            "Event received"
        );
        counters.events_processed += 1;

        match OrderEvent::from_envelope(envelope) {
            Ok(OrderEvent::Created(_)) => self.process_with_retry(envelope, counters).await,
            Ok(OrderEvent::Paid(_)) | Ok(OrderEvent::Failed(_)) => {
                debug!(
                    event_id = %envelope.event_id,
                    event_type = %envelope.event_type,
                    "Settlement event, not consumed by this worker"
                );
            }
            Ok(OrderEvent::Unknown(tag)) => {
                debug!(event_id = %envelope.event_id, tag, "Unknown event type, acknowledging");
            }
            Err(_) if envelope.event_type == EVENT_ORDER_CREATED => {
                // Known tag with a malformed payload is poison: the retry
                // loop will fail identically each attempt and divert it to
                // the dead-letter sink under its event id.
                self.process_with_retry(envelope, counters).await;
            }
            Err(err) => {
                warn!(
                    event_id = %envelope.event_id,
                    event_type = %envelope.event_type,
                    error = %err,
                    "Malformed payload for an event this worker ignores"
                );
            }
        }
    }

    async fn process_with_retry(&self, envelope: &EventEnvelope, counters: &mut WorkerCounters) {
        let mut attempt: u32 = 0;
        let mut pending_version: Option<i64> = None;
        loop {
            attempt += 1;
            match self
                .handle_order_created(envelope, &mut pending_version)
                .await
            {
                Ok(outcome) => {
                    match outcome {
                        HandlerOutcome::Settled(PaymentStatus::Success) => {
                            counters.payments_success += 1
                        }
                        HandlerOutcome::Settled(PaymentStatus::Failed) => {
                            counters.payments_failed += 1
                        }
                        HandlerOutcome::Duplicate => counters.duplicates_skipped += 1,
                        HandlerOutcome::AlreadyAdvanced | HandlerOutcome::LostRace => {}
                    }
                    return;
                }
                Err(err) => {
                    error!(
                        event = "PROCESSING_ERROR",
                        event_id = %envelope.event_id,
                        attempt,
                        error = %err,
                        "Handler attempt failed"
                    );

                    if attempt >= self.config.max_retries {
                        counters.dlq_events += 1;
                        self.record_dead_letter(envelope, &err.to_string()).await;
                        return;
                    }

                    counters.retried_events += 1;
                    info!(
                        event = "RETRY_SCHEDULED",
                        event_id = %envelope.event_id,
                        attempt,
                        backoff_ms = self.config.retry_backoff_ms,
                        "Retrying after back-off"
                    );
                    tokio::time::sleep(Duration::from_millis(self.config.retry_backoff_ms)).await;
                }
            }
        }
    }

    /// The staged handler. Duplicates, already-advanced orders and lost
    /// races all return an outcome; only transient failures (storage,
    /// payment) escape as errors into the retry loop.
    ///
    /// `resume_version` is the cross-attempt memory of this delivery: once
    /// the order has been advanced, later attempts skip the dedup check
    /// and the advance and continue from the payment call with the version
    /// recorded here.
    pub async fn handle_order_created(
        &self,
        envelope: &EventEnvelope,
        resume_version: &mut Option<i64>,
    ) -> Result<HandlerOutcome> {
        let payload: OrderCreatedPayload = serde_json::from_value(envelope.payload.clone())?;
        let order_id = payload.order_id;

        let pending_version = match *resume_version {
            // An earlier attempt of this delivery already advanced the
            // order; resume at the payment stage.
            Some(version) => version,
            None => {
                if self.ledger.is_processed(envelope.event_id).await? {
                    info!(
                        event = "DUPLICATE_EVENT",
                        event_id = %envelope.event_id,
                        order_id = %order_id,
                        "Event already processed, skipping"
                    );
                    return Ok(HandlerOutcome::Duplicate);
                }

                // The advance admits exactly one caller per order; the
                // loser sees zero rows.
                let advanced = sqlx::query(
                    r#"
                    UPDATE orders
                    SET state = $1, version = version + 1, updated_at = NOW()
                    WHERE id = $2 AND state = $3
                    RETURNING version
                    "#,
                )
                .bind(OrderState::PaymentPending.as_str())
                .bind(order_id)
                .bind(OrderState::Created.as_str())
                .fetch_optional(&self.pool)
                .await?;

                let Some(row) = advanced else {
                    debug!(
                        event_id = %envelope.event_id,
                        order_id = %order_id,
                        "Order not in CREATED, nothing to do"
                    );
                    return Ok(HandlerOutcome::AlreadyAdvanced);
                };
                let version: i64 = row.try_get("version")?;
                *resume_version = Some(version);

                info!(
                    event = "STATE_CHANGE",
                    order_id = %order_id,
                    from = %OrderState::Created,
                    to = %OrderState::PaymentPending,
                    version,
                    "Order advanced"
                );

                version
            }
        };

        // The sole non-transactional side effect. The advance predicate
        // guarantees at most one delivery ever reaches this call per
        // transition, so a non-idempotent provider is safe here.
        let status = self.payment.process(order_id, payload.amount).await?;

        info!(
            event = "PAYMENT_RESULT",
            order_id = %order_id,
            status = ?status,
            "Payment executed"
        );

        let (terminal_state, event_type) = match status {
            PaymentStatus::Success => (OrderState::Paid, EVENT_ORDER_PAID),
            PaymentStatus::Failed => (OrderState::Failed, EVENT_ORDER_FAILED),
        };

        // Settle: terminal update, follow-up event and dedup row in one
        // commit, guarded by the version observed at the advance.
        let mut tx = self.pool.begin().await?;

        let updated = sqlx::query(
            r#"
            UPDATE orders
            SET state = $1, version = version + 1, updated_at = NOW()
            WHERE id = $2 AND state = $3 AND version = $4
            "#,
        )
        .bind(terminal_state.as_str())
        .bind(order_id)
        .bind(OrderState::PaymentPending.as_str())
        .bind(pending_version)
        .execute(&mut *tx)
        .await?;

        if updated.rows_affected() == 0 {
            tx.rollback().await?;
            debug!(
                event_id = %envelope.event_id,
                order_id = %order_id,
                "Lost the terminal-commit race, peer's commit is authoritative"
            );
            return Ok(HandlerOutcome::LostRace);
        }

        let follow_up = NewOutboxEvent::new(
            AGGREGATE_ORDER,
            order_id,
            event_type,
            serde_json::to_value(OrderSettledPayload { order_id })?,
        );
        self.outbox.insert(&mut tx, &follow_up).await?;
        self.ledger.mark_processed(&mut tx, envelope.event_id).await?;

        tx.commit().await?;

        info!(
            event = "STATE_CHANGE",
            order_id = %order_id,
            from = %OrderState::PaymentPending,
            to = %terminal_state,
            version = pending_version + 1,
            "Order settled"
        );

        Ok(HandlerOutcome::Settled(status))
    }

    /// Divert a poison envelope to the dead-letter sink.
    ///
    /// Idempotent on event id. A failure to record is logged and swallowed:
    /// the event is already lost from the normal pipeline, and holding the
    /// partition hostage rescues nothing.
    async fn record_dead_letter(&self, envelope: &EventEnvelope, reason: &str) {
        let result = sqlx::query(
            r#"
            INSERT INTO dead_letter_events (
                event_id, event_type, aggregate_id, payload, failure_reason, failed_at
            ) VALUES ($1, $2, $3, $4, $5, NOW())
            ON CONFLICT (event_id) DO NOTHING
            "#,
        )
        .bind(envelope.event_id)
        .bind(&envelope.event_type)
        .bind(envelope.aggregate_id)
        .bind(&envelope.payload)
        .bind(reason)
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => warn!(
                event = "DLQ_EVENT",
                event_id = %envelope.event_id,
                event_type = %envelope.event_type,
                reason,
                "Event dead-lettered after exhausting retries"
            ),
            Err(err) => error!(
                event = "PROCESSING_ERROR",
                event_id = %envelope.event_id,
                error = %err,
                "Failed to record dead letter; acknowledging anyway"
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_start_at_zero() {
        let counters = WorkerCounters::default();
        assert_eq!(counters, WorkerCounters {
            events_processed: 0,
            duplicates_skipped: 0,
            payments_success: 0,
            payments_failed: 0,
            retried_events: 0,
            dlq_events: 0,
        });
    }

    #[test]
    fn test_settled_outcome_carries_status() {
        assert_ne!(
            HandlerOutcome::Settled(PaymentStatus::Success),
            HandlerOutcome::Settled(PaymentStatus::Failed)
        );
        assert_eq!(HandlerOutcome::Duplicate, HandlerOutcome::Duplicate);
    }
}
