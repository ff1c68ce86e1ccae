//! Payment execution seam.
//!
//! The worker treats the payment provider as an injected external
//! collaborator that may or may not charge on failure; it is assumed
//! non-idempotent from the outside, which is why the worker only ever calls
//! it once per committed transition.

use async_trait::async_trait;
use rand::Rng;
use rust_decimal::Decimal;
use thiserror::Error;
use tracing::debug;
use uuid::Uuid;

/// Business outcome of a payment attempt. `Failed` is a result, not an
/// error; it transitions the order to FAILED.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PaymentStatus {
    Success,
    Failed,
}

#[derive(Debug, Error)]
pub enum PaymentError {
    /// Provider unreachable or timed out; the caller may retry the whole
    /// handler
    #[error("transient payment failure: {0}")]
    Transient(String),
}

#[async_trait]
pub trait PaymentService: Send + Sync {
    /// Execute the payment for an order. Bounded latency; the caller may
    /// wrap its own deadline around this.
    async fn process(&self, order_id: Uuid, amount: Decimal)
        -> Result<PaymentStatus, PaymentError>;
}

/// Stand-in provider for local runs and drills.
///
/// `failure_ratio` of the calls settle as FAILED; `always_transient` makes
/// every call raise, which is the poison-path drill for the worker's
/// retry/DLQ machinery.
pub struct MockPaymentService {
    failure_ratio: f64,
    always_transient: bool,
}

impl MockPaymentService {
    pub fn new(failure_ratio: f64) -> Self {
        Self {
            failure_ratio: failure_ratio.clamp(0.0, 1.0),
            always_transient: false,
        }
    }

    pub fn always_transient() -> Self {
        Self {
            failure_ratio: 0.0,
            always_transient: true,
        }
    }

    /// `PAYMENT_FAILURE_RATIO` (default 0.2) and `PAYMENT_ALWAYS_TRANSIENT`
    /// (default false).
    pub fn from_env() -> Self {
        let failure_ratio = std::env::var("PAYMENT_FAILURE_RATIO")
            .ok()
            .and_then(|v| v.parse::<f64>().ok())
            .unwrap_or(0.2);
        let always_transient = std::env::var("PAYMENT_ALWAYS_TRANSIENT")
            .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
            .unwrap_or(false);

        if always_transient {
            Self::always_transient()
        } else {
            Self::new(failure_ratio)
        }
    }
}

#[async_trait]
impl PaymentService for MockPaymentService {
    async fn process(
        &self,
        order_id: Uuid,
        amount: Decimal,
    ) -> Result<PaymentStatus, PaymentError> {
        if self.always_transient {
            return Err(PaymentError::Transient(
                "simulated gateway timeout".to_string(),
            ));
        }

        let roll: f64 = rand::thread_rng().gen();
        let status = if roll < self.failure_ratio {
            PaymentStatus::Failed
        } else {
            PaymentStatus::Success
        };

        debug!(order_id = %order_id, %amount, ?status, "Mock payment executed");
        Ok(status)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_zero_ratio_always_succeeds() {
        let payment = MockPaymentService::new(0.0);
        for _ in 0..20 {
            let status = payment
                .process(Uuid::new_v4(), Decimal::new(1000, 2))
                .await
                .unwrap();
            assert_eq!(status, PaymentStatus::Success);
        }
    }

    #[tokio::test]
    async fn test_full_ratio_always_fails() {
        let payment = MockPaymentService::new(1.0);
        for _ in 0..20 {
            let status = payment
                .process(Uuid::new_v4(), Decimal::new(1000, 2))
                .await
                .unwrap();
            assert_eq!(status, PaymentStatus::Failed);
        }
    }

    #[tokio::test]
    async fn test_always_transient_raises() {
        let payment = MockPaymentService::always_transient();
        let err = payment
            .process(Uuid::new_v4(), Decimal::new(1000, 2))
            .await
            .unwrap_err();
        assert!(matches!(err, PaymentError::Transient(_)));
    }

    #[test]
    fn test_ratio_is_clamped() {
        let payment = MockPaymentService::new(7.5);
        assert!(payment.failure_ratio <= 1.0);
        let payment = MockPaymentService::new(-1.0);
        assert!(payment.failure_ratio >= 0.0);
    }
}
