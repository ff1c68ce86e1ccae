use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sqlx::postgres::PgRow;
use sqlx::Row;
use std::str::FromStr;
use thiserror::Error;
use transactional_outbox::EventEnvelope;
use uuid::Uuid;

/// Aggregate type tag carried on every outbox row this service writes.
pub const AGGREGATE_ORDER: &str = "order";

/// Broker topic all order events are published to.
pub const ORDER_EVENTS_TOPIC: &str = "order-events";

/// Consumer group of the payment worker.
pub const PAYMENT_GROUP: &str = "payment-group";

/// Ledger scope of the payment worker (see `processed_events.worker_kind`).
pub const PAYMENT_WORKER_KIND: &str = "payment-worker";

pub const EVENT_ORDER_CREATED: &str = "OrderCreated";
pub const EVENT_ORDER_PAID: &str = "OrderPaid";
pub const EVENT_ORDER_FAILED: &str = "OrderFailed";

/// Order lifecycle state.
///
/// The only legal transitions are CREATED → PAYMENT_PENDING and
/// PAYMENT_PENDING → PAID | FAILED. PAID and FAILED are terminal.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrderState {
    Created,
    PaymentPending,
    Paid,
    Failed,
}

impl OrderState {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderState::Created => "CREATED",
            OrderState::PaymentPending => "PAYMENT_PENDING",
            OrderState::Paid => "PAID",
            OrderState::Failed => "FAILED",
        }
    }

    /// Whether `next` is a legal successor of `self`.
    pub fn can_transition_to(&self, next: OrderState) -> bool {
        matches!(
            (self, next),
            (OrderState::Created, OrderState::PaymentPending)
                | (OrderState::PaymentPending, OrderState::Paid)
                | (OrderState::PaymentPending, OrderState::Failed)
        )
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, OrderState::Paid | OrderState::Failed)
    }
}

impl std::fmt::Display for OrderState {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error)]
#[error("unknown order state: {0}")]
pub struct UnknownOrderState(pub String);

impl FromStr for OrderState {
    type Err = UnknownOrderState;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "CREATED" => Ok(OrderState::Created),
            "PAYMENT_PENDING" => Ok(OrderState::PaymentPending),
            "PAID" => Ok(OrderState::Paid),
            "FAILED" => Ok(OrderState::Failed),
            other => Err(UnknownOrderState(other.to_string())),
        }
    }
}

/// The order aggregate as stored in the `orders` table.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Order {
    pub id: Uuid,
    pub user_id: Uuid,
    #[serde(with = "rust_decimal::serde::float")]
    pub amount: Decimal,
    pub state: OrderState,
    pub version: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Order {
    /// Map a database row. `state` is stored as TEXT; a value outside the
    /// enum means the row was written past the CHECK constraint and is
    /// surfaced as a decode error.
    pub fn from_row(row: &PgRow) -> Result<Self, sqlx::Error> {
        let state_raw: String = row.try_get("state")?;
        let state = state_raw
            .parse::<OrderState>()
            .map_err(|e| sqlx::Error::Decode(Box::new(e)))?;

        Ok(Order {
            id: row.try_get("id")?,
            user_id: row.try_get("user_id")?,
            amount: row.try_get("amount")?,
            state,
            version: row.try_get("version")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }
}

/// Payload of `OrderCreated` events.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderCreatedPayload {
    pub order_id: Uuid,
    pub user_id: Uuid,
    #[serde(with = "rust_decimal::serde::float")]
    pub amount: Decimal,
}

/// Payload of `OrderPaid` / `OrderFailed` events.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderSettledPayload {
    pub order_id: Uuid,
}

/// Tagged dispatch variant for incoming envelopes, keyed by `eventType`.
///
/// Unknown tags are carried, not dropped, so the consumer can acknowledge
/// them explicitly.
#[derive(Debug, Clone)]
pub enum OrderEvent {
    Created(OrderCreatedPayload),
    Paid(OrderSettledPayload),
    Failed(OrderSettledPayload),
    Unknown(String),
}

impl OrderEvent {
    /// Parse the typed payload for a known `eventType`.
    ///
    /// Returns `Err` only when the tag is known but the payload does not
    /// match its shape; that is a poison payload, not an unknown event.
    pub fn from_envelope(envelope: &EventEnvelope) -> Result<Self, serde_json::Error> {
        match envelope.event_type.as_str() {
            EVENT_ORDER_CREATED => Ok(OrderEvent::Created(serde_json::from_value(
                envelope.payload.clone(),
            )?)),
            EVENT_ORDER_PAID => Ok(OrderEvent::Paid(serde_json::from_value(
                envelope.payload.clone(),
            )?)),
            EVENT_ORDER_FAILED => Ok(OrderEvent::Failed(serde_json::from_value(
                envelope.payload.clone(),
            )?)),
            other => Ok(OrderEvent::Unknown(other.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_legal_transitions() {
        assert!(OrderState::Created.can_transition_to(OrderState::PaymentPending));
        assert!(OrderState::PaymentPending.can_transition_to(OrderState::Paid));
        assert!(OrderState::PaymentPending.can_transition_to(OrderState::Failed));
    }

    #[test]
    fn test_illegal_transitions() {
        assert!(!OrderState::Created.can_transition_to(OrderState::Paid));
        assert!(!OrderState::Created.can_transition_to(OrderState::Failed));
        assert!(!OrderState::PaymentPending.can_transition_to(OrderState::Created));
        // Terminal states go nowhere.
        for next in [
            OrderState::Created,
            OrderState::PaymentPending,
            OrderState::Paid,
            OrderState::Failed,
        ] {
            assert!(!OrderState::Paid.can_transition_to(next));
            assert!(!OrderState::Failed.can_transition_to(next));
        }
    }

    #[test]
    fn test_terminal_states() {
        assert!(!OrderState::Created.is_terminal());
        assert!(!OrderState::PaymentPending.is_terminal());
        assert!(OrderState::Paid.is_terminal());
        assert!(OrderState::Failed.is_terminal());
    }

    #[test]
    fn test_state_round_trip() {
        for state in [
            OrderState::Created,
            OrderState::PaymentPending,
            OrderState::Paid,
            OrderState::Failed,
        ] {
            assert_eq!(state.as_str().parse::<OrderState>().unwrap(), state);
        }
        assert!("SHIPPED".parse::<OrderState>().is_err());
    }

    #[test]
    fn test_order_created_payload_wire_shape() {
        let payload = OrderCreatedPayload {
            order_id: Uuid::parse_str("0a8e2b14-3f14-4c4e-9f8e-6a5d4c3b2a19").unwrap(),
            user_id: Uuid::parse_str("f3b9c4de-9d55-4f8f-bd3e-8a0c2b7a1e10").unwrap(),
            amount: Decimal::new(9999, 2),
        };
        let value = serde_json::to_value(&payload).unwrap();

        assert_eq!(
            value["orderId"],
            json!("0a8e2b14-3f14-4c4e-9f8e-6a5d4c3b2a19")
        );
        assert_eq!(value["userId"], json!("f3b9c4de-9d55-4f8f-bd3e-8a0c2b7a1e10"));
        // Amount rides as a JSON number.
        assert!((value["amount"].as_f64().unwrap() - 99.99).abs() < 1e-9);
    }

    fn envelope_with(event_type: &str, payload: serde_json::Value) -> EventEnvelope {
        EventEnvelope {
            event_id: Uuid::new_v4(),
            event_type: event_type.to_string(),
            aggregate_type: AGGREGATE_ORDER.to_string(),
            aggregate_id: Uuid::new_v4(),
            payload,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn test_dispatch_on_event_type() {
        let order_id = Uuid::new_v4();
        let created = envelope_with(
            EVENT_ORDER_CREATED,
            json!({ "orderId": order_id, "userId": Uuid::new_v4(), "amount": 12.50 }),
        );
        assert!(matches!(
            OrderEvent::from_envelope(&created).unwrap(),
            OrderEvent::Created(_)
        ));

        let paid = envelope_with(EVENT_ORDER_PAID, json!({ "orderId": order_id }));
        assert!(matches!(
            OrderEvent::from_envelope(&paid).unwrap(),
            OrderEvent::Paid(_)
        ));

        let unknown = envelope_with("OrderShipped", json!({}));
        match OrderEvent::from_envelope(&unknown).unwrap() {
            OrderEvent::Unknown(tag) => assert_eq!(tag, "OrderShipped"),
            other => panic!("expected Unknown, got {:?}", other),
        }
    }

    #[test]
    fn test_known_tag_with_bad_payload_is_an_error() {
        let envelope = envelope_with(EVENT_ORDER_CREATED, json!({ "nope": true }));
        assert!(OrderEvent::from_envelope(&envelope).is_err());
    }
}
