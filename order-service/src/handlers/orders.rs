//! HTTP handlers for the order ingress.

use actix_web::{web, HttpResponse, Result as ActixResult};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::error;
use uuid::Uuid;

use crate::error::ServiceError;
use crate::models::OrderState;
use crate::services::OrderService;

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateOrderRequest {
    pub user_id: Uuid,
    #[serde(with = "rust_decimal::serde::float")]
    pub amount: Decimal,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateOrderResponse {
    pub order_id: Uuid,
    pub state: OrderState,
}

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
}

/// Create a new order
///
/// POST /orders
///
/// Submissions are not deduplicated: two identical bodies create two
/// distinct orders.
pub async fn create_order(
    service: web::Data<Arc<OrderService>>,
    req: web::Json<CreateOrderRequest>,
) -> ActixResult<HttpResponse> {
    match service.submit_order(req.user_id, req.amount).await {
        Ok((order_id, state)) => {
            Ok(HttpResponse::Created().json(CreateOrderResponse { order_id, state }))
        }
        Err(ServiceError::Validation(msg)) => {
            Ok(HttpResponse::BadRequest().json(ErrorResponse { error: msg }))
        }
        Err(e) => {
            error!(error = %e, "Failed to create order");
            Ok(HttpResponse::InternalServerError().json(ErrorResponse {
                error: "Failed to create order".to_string(),
            }))
        }
    }
}

/// Get order by ID
///
/// GET /orders/{id}
pub async fn get_order(
    service: web::Data<Arc<OrderService>>,
    path: web::Path<Uuid>,
) -> ActixResult<HttpResponse> {
    let order_id = path.into_inner();

    match service.get_order(order_id).await {
        Ok(Some(order)) => Ok(HttpResponse::Ok().json(order)),
        Ok(None) => Ok(HttpResponse::NotFound().json(ErrorResponse {
            error: "Order not found".to_string(),
        })),
        Err(e) => {
            error!(order_id = %order_id, error = %e, "Failed to fetch order");
            Ok(HttpResponse::InternalServerError().json(ErrorResponse {
                error: "Failed to fetch order".to_string(),
            }))
        }
    }
}

pub fn register_routes(cfg: &mut web::ServiceConfig) {
    cfg.service(web::resource("/orders").route(web::post().to(create_order)))
        .service(web::resource("/orders/{id}").route(web::get().to(get_order)));
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::str::FromStr;

    #[test]
    fn test_request_accepts_camel_case_number_amount() {
        let body = json!({
            "userId": "f3b9c4de-9d55-4f8f-bd3e-8a0c2b7a1e10",
            "amount": 99.99
        });
        let req: CreateOrderRequest = serde_json::from_value(body).unwrap();
        assert_eq!(
            req.user_id,
            Uuid::parse_str("f3b9c4de-9d55-4f8f-bd3e-8a0c2b7a1e10").unwrap()
        );
        assert_eq!(req.amount, Decimal::from_str("99.99").unwrap());
    }

    #[test]
    fn test_response_wire_shape() {
        let response = CreateOrderResponse {
            order_id: Uuid::parse_str("0a8e2b14-3f14-4c4e-9f8e-6a5d4c3b2a19").unwrap(),
            state: OrderState::Created,
        };
        let value = serde_json::to_value(&response).unwrap();
        assert_eq!(value["orderId"], "0a8e2b14-3f14-4c4e-9f8e-6a5d4c3b2a19");
        assert_eq!(value["state"], "CREATED");
    }
}
