//! Checkout endpoints.

use std::sync::Arc;

use axum::Json;
use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use common::{BuyerId, OrderId};
use order_store::{Catalog, Order, OrderStore, PaymentStore};
use ordering::{CartLine, CartSelection, MAX_IDEMPOTENCY_KEY_LEN, OrderService};
use payments::PaymentLedger;
use serde::{Deserialize, Serialize};

use crate::error::ApiError;

/// Header carrying the client's idempotency token.
pub const IDEMPOTENCY_KEY_HEADER: &str = "idempotency-key";

/// Shared application state accessible from all handlers.
pub struct AppState<S, C> {
    pub order_service: OrderService<S, C>,
    pub payment_ledger: PaymentLedger<S>,
}

// -- Request types --

#[derive(Deserialize)]
pub struct CreateOrderRequest {
    pub buyer_id: i64,
    pub items: Vec<OrderLineRequest>,
    /// Alternative to the `Idempotency-Key` header.
    #[serde(default)]
    pub idempotency_key: Option<String>,
}

#[derive(Deserialize)]
pub struct OrderLineRequest {
    pub product_id: String,
    pub quantity: u32,
}

// -- Response types --

#[derive(Serialize)]
pub struct OrderResponse {
    pub id: String,
    pub reference: String,
    pub buyer_id: i64,
    pub items: Vec<OrderItemResponse>,
    pub total_cents: i64,
    pub created_at: String,
}

#[derive(Serialize)]
pub struct OrderItemResponse {
    pub product_id: Option<String>,
    pub product_name: String,
    pub quantity: u32,
    pub unit_price_cents: i64,
    pub line_price_cents: i64,
}

impl From<Order> for OrderResponse {
    fn from(order: Order) -> Self {
        let items = order
            .items
            .iter()
            .map(|item| OrderItemResponse {
                product_id: item.product_id.as_ref().map(ToString::to_string),
                product_name: item.display_name().to_string(),
                quantity: item.quantity,
                unit_price_cents: item.unit_price.cents(),
                line_price_cents: item.line_price.cents(),
            })
            .collect();

        Self {
            id: order.id.to_string(),
            reference: order.reference,
            buyer_id: order.buyer_id.as_i64(),
            items,
            total_cents: order.total_price.cents(),
            created_at: order.created_at.to_rfc3339(),
        }
    }
}

// -- Handlers --

/// POST /orders: create an order from a cart selection.
#[tracing::instrument(skip(state, headers, req), fields(buyer_id = req.buyer_id))]
pub async fn create<S, C>(
    State(state): State<Arc<AppState<S, C>>>,
    headers: HeaderMap,
    Json(req): Json<CreateOrderRequest>,
) -> Result<(StatusCode, Json<OrderResponse>), ApiError>
where
    S: OrderStore + PaymentStore + Clone + 'static,
    C: Catalog + 'static,
{
    let idempotency_key = resolve_idempotency_key(&headers, req.idempotency_key)?;
    let cart = CartSelection {
        lines: req
            .items
            .into_iter()
            .map(|line| CartLine::new(line.product_id, line.quantity))
            .collect(),
        idempotency_key,
    };

    let order = state
        .order_service
        .create_order(BuyerId::new(req.buyer_id), cart)
        .await?;

    Ok((StatusCode::CREATED, Json(order.into())))
}

/// GET /orders/{id}: load an order by id or by its `ORD-` reference.
#[tracing::instrument(skip(state))]
pub async fn get<S, C>(
    State(state): State<Arc<AppState<S, C>>>,
    Path(id): Path<String>,
) -> Result<Json<OrderResponse>, ApiError>
where
    S: OrderStore + PaymentStore + Clone + 'static,
    C: Catalog + 'static,
{
    let order = if id.starts_with("ORD-") {
        state.order_service.get_order_by_reference(&id).await?
    } else {
        state.order_service.get_order(parse_order_id(&id)?).await?
    };

    order
        .map(|o| Json(o.into()))
        .ok_or_else(|| ApiError::NotFound(format!("Order {id} not found")))
}

/// Takes the key from the header or the body; both present must agree.
fn resolve_idempotency_key(
    headers: &HeaderMap,
    body_key: Option<String>,
) -> Result<Option<String>, ApiError> {
    let header_key = match headers.get(IDEMPOTENCY_KEY_HEADER) {
        Some(value) => Some(
            value
                .to_str()
                .map_err(|_| ApiError::BadRequest("Idempotency-Key must be ASCII".to_string()))?
                .trim()
                .to_string(),
        ),
        None => None,
    };

    let body_key = body_key.map(|k| k.trim().to_string());

    let key = match (header_key, body_key) {
        (Some(h), Some(b)) if h != b => {
            return Err(ApiError::BadRequest(
                "Idempotency-Key header and body disagree".to_string(),
            ));
        }
        (Some(k), _) | (None, Some(k)) => Some(k),
        (None, None) => None,
    };

    match key {
        Some(k) if k.is_empty() => Err(ApiError::BadRequest(
            "Idempotency-Key must not be empty".to_string(),
        )),
        Some(k) if k.len() > MAX_IDEMPOTENCY_KEY_LEN => Err(ApiError::BadRequest(format!(
            "Idempotency-Key must be at most {MAX_IDEMPOTENCY_KEY_LEN} bytes"
        ))),
        other => Ok(other),
    }
}

pub(crate) fn parse_order_id(id: &str) -> Result<OrderId, ApiError> {
    let uuid = uuid::Uuid::parse_str(id)
        .map_err(|e| ApiError::BadRequest(format!("Invalid order ID: {e}")))?;
    Ok(OrderId::from_uuid(uuid))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn test_header_key_is_used() {
        let mut headers = HeaderMap::new();
        headers.insert(IDEMPOTENCY_KEY_HEADER, HeaderValue::from_static("abc"));
        assert_eq!(
            resolve_idempotency_key(&headers, None).unwrap().as_deref(),
            Some("abc")
        );
    }

    #[test]
    fn test_matching_header_and_body_are_accepted() {
        let mut headers = HeaderMap::new();
        headers.insert(IDEMPOTENCY_KEY_HEADER, HeaderValue::from_static("abc"));
        assert!(resolve_idempotency_key(&headers, Some("abc".into())).is_ok());
        assert!(resolve_idempotency_key(&headers, Some("xyz".into())).is_err());
    }

    #[test]
    fn test_empty_key_is_rejected() {
        assert!(resolve_idempotency_key(&HeaderMap::new(), Some(String::new())).is_err());
        assert!(
            resolve_idempotency_key(&HeaderMap::new(), None)
                .unwrap()
                .is_none()
        );
    }

    #[test]
    fn test_body_key_is_trimmed_like_the_header() {
        let mut headers = HeaderMap::new();
        headers.insert(IDEMPOTENCY_KEY_HEADER, HeaderValue::from_static("abc"));
        assert!(resolve_idempotency_key(&headers, Some(" abc ".into())).is_ok());
        assert_eq!(
            resolve_idempotency_key(&HeaderMap::new(), Some(" abc".into()))
                .unwrap()
                .as_deref(),
            Some("abc")
        );
        assert!(resolve_idempotency_key(&HeaderMap::new(), Some("   ".into())).is_err());
    }

    #[test]
    fn test_oversized_key_is_rejected() {
        let long = "k".repeat(MAX_IDEMPOTENCY_KEY_LEN + 1);
        assert!(matches!(
            resolve_idempotency_key(&HeaderMap::new(), Some(long)),
            Err(ApiError::BadRequest(_))
        ));
        let exact = "k".repeat(MAX_IDEMPOTENCY_KEY_LEN);
        assert!(resolve_idempotency_key(&HeaderMap::new(), Some(exact)).is_ok());
    }
}
