//! Payment registration and gateway callback endpoints.

use std::sync::Arc;

use axum::Json;
use axum::extract::State;
use axum::http::StatusCode;
use order_store::{Catalog, OrderStore, Payment, PaymentStore};
use payments::{CallbackNotice, CallbackOutcome};
use serde::{Deserialize, Serialize};

use crate::error::ApiError;
use crate::routes::orders::{AppState, parse_order_id};

#[derive(Deserialize)]
pub struct RegisterPaymentRequest {
    pub order_id: String,
    pub payment_key: String,
}

#[derive(Serialize)]
pub struct PaymentResponse {
    pub id: String,
    pub order_id: String,
    pub payment_key: String,
    pub status: String,
    pub amount_cents: i64,
    pub requested_at: String,
    pub approved_at: Option<String>,
}

impl From<Payment> for PaymentResponse {
    fn from(p: Payment) -> Self {
        Self {
            id: p.id.to_string(),
            order_id: p.order_id.to_string(),
            payment_key: p.payment_key,
            status: p.status.to_string(),
            amount_cents: p.amount.cents(),
            requested_at: p.requested_at.to_rfc3339(),
            approved_at: p.approved_at.map(|t| t.to_rfc3339()),
        }
    }
}

#[derive(Serialize)]
pub struct CallbackResponse {
    pub outcome: &'static str,
    /// Stored status after the callback, when the outcome carries one.
    pub status: Option<String>,
}

impl From<CallbackOutcome> for CallbackResponse {
    fn from(outcome: CallbackOutcome) -> Self {
        match outcome {
            CallbackOutcome::Applied(status) => Self {
                outcome: "applied",
                status: Some(status.to_string()),
            },
            CallbackOutcome::AlreadyApplied => Self {
                outcome: "already_applied",
                status: None,
            },
            CallbackOutcome::Ignored { current } => Self {
                outcome: "ignored",
                status: Some(current.to_string()),
            },
            CallbackOutcome::Superseded => Self {
                outcome: "superseded",
                status: None,
            },
        }
    }
}

/// POST /payments: register a payment for an order.
#[tracing::instrument(skip(state, req), fields(payment_key = %req.payment_key))]
pub async fn register<S, C>(
    State(state): State<Arc<AppState<S, C>>>,
    Json(req): Json<RegisterPaymentRequest>,
) -> Result<(StatusCode, Json<PaymentResponse>), ApiError>
where
    S: OrderStore + PaymentStore + Clone + 'static,
    C: Catalog + 'static,
{
    if req.payment_key.trim().is_empty() {
        return Err(ApiError::BadRequest("payment_key must not be empty".to_string()));
    }
    let order_id = parse_order_id(&req.order_id)?;
    let payment = state
        .payment_ledger
        .register(order_id, &req.payment_key)
        .await?;
    Ok((StatusCode::CREATED, Json(payment.into())))
}

/// POST /payments/callback: apply an asynchronous gateway notification.
///
/// Replays and stale notices answer 200 so the gateway stops retrying them.
#[tracing::instrument(skip(state, notice))]
pub async fn callback<S, C>(
    State(state): State<Arc<AppState<S, C>>>,
    Json(notice): Json<CallbackNotice>,
) -> Result<Json<CallbackResponse>, ApiError>
where
    S: OrderStore + PaymentStore + Clone + 'static,
    C: Catalog + 'static,
{
    let outcome = state.payment_ledger.apply_callback(notice).await?;
    Ok(Json(outcome.into()))
}
