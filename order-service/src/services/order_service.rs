//! Ingress write path: accept an order and make its `OrderCreated` event
//! durable in the same transaction.

use rust_decimal::Decimal;
use sqlx::PgPool;
use tracing::info;
use transactional_outbox::{NewOutboxEvent, OutboxRepository, SqlxOutboxRepository};
use uuid::Uuid;

use crate::error::{Result, ServiceError};
use crate::models::{
    Order, OrderCreatedPayload, OrderState, AGGREGATE_ORDER, EVENT_ORDER_CREATED,
};

/// Largest accepted amount, bounded by the NUMERIC(12,2) column.
fn max_amount() -> Decimal {
    Decimal::new(999_999_999_999, 2)
}

/// Reject amounts the write path must never see: non-positive, more than
/// two decimal places, or wider than the column.
pub fn validate_amount(amount: Decimal) -> Result<()> {
    if amount <= Decimal::ZERO {
        return Err(ServiceError::Validation(
            "amount must be positive".to_string(),
        ));
    }
    if amount.normalize().scale() > 2 {
        return Err(ServiceError::Validation(
            "amount must have at most two decimal places".to_string(),
        ));
    }
    if amount > max_amount() {
        return Err(ServiceError::Validation(format!(
            "amount exceeds maximum of {}",
            max_amount()
        )));
    }
    Ok(())
}

pub struct OrderService {
    pool: PgPool,
    outbox: SqlxOutboxRepository,
}

impl OrderService {
    pub fn new(pool: PgPool) -> Self {
        let outbox = SqlxOutboxRepository::new(pool.clone());
        Self { pool, outbox }
    }

    /// Record a new order and its `OrderCreated` event atomically.
    ///
    /// Any error rolls back both inserts; the broker is not involved, so
    /// the dual-write problem never arises. There is deliberately no
    /// request-id dedup: two identical submissions create two orders.
    pub async fn submit_order(&self, user_id: Uuid, amount: Decimal) -> Result<(Uuid, OrderState)> {
        validate_amount(amount)?;

        let order_id = Uuid::new_v4();
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            INSERT INTO orders (id, user_id, amount, state, version, created_at, updated_at)
            VALUES ($1, $2, $3, $4, 0, NOW(), NOW())
            "#,
        )
        .bind(order_id)
        .bind(user_id)
        .bind(amount)
        .bind(OrderState::Created.as_str())
        .execute(&mut *tx)
        .await?;

        let payload = serde_json::to_value(OrderCreatedPayload {
            order_id,
            user_id,
            amount,
        })?;
        let event = NewOutboxEvent::new(AGGREGATE_ORDER, order_id, EVENT_ORDER_CREATED, payload);
        self.outbox.insert(&mut tx, &event).await?;

        tx.commit().await?;

        info!(
            event = "STATE_CHANGE",
            order_id = %order_id,
            user_id = %user_id,
            state = %OrderState::Created,
            "Order accepted"
        );

        Ok((order_id, OrderState::Created))
    }

    pub async fn get_order(&self, order_id: Uuid) -> Result<Option<Order>> {
        let row = sqlx::query(
            r#"
            SELECT id, user_id, amount, state, version, created_at, updated_at
            FROM orders
            WHERE id = $1
            "#,
        )
        .bind(order_id)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref()
            .map(Order::from_row)
            .transpose()
            .map_err(Into::into)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn test_rejects_non_positive_amounts() {
        assert!(validate_amount(Decimal::ZERO).is_err());
        assert!(validate_amount(Decimal::new(-100, 2)).is_err());
    }

    #[test]
    fn test_rejects_sub_cent_precision() {
        assert!(validate_amount(Decimal::from_str("9.999").unwrap()).is_err());
        assert!(validate_amount(Decimal::from_str("0.001").unwrap()).is_err());
    }

    #[test]
    fn test_accepts_two_decimal_amounts() {
        assert!(validate_amount(Decimal::from_str("0.01").unwrap()).is_ok());
        assert!(validate_amount(Decimal::from_str("99.99").unwrap()).is_ok());
        assert!(validate_amount(Decimal::from_str("100").unwrap()).is_ok());
        // Trailing zeros beyond two places still denote a valid amount.
        assert!(validate_amount(Decimal::from_str("10.5000").unwrap()).is_ok());
    }

    #[test]
    fn test_rejects_amounts_beyond_column_width() {
        assert!(validate_amount(Decimal::from_str("10000000000.00").unwrap()).is_err());
        assert!(validate_amount(Decimal::from_str("9999999999.99").unwrap()).is_ok());
    }
}
