//! API error types with HTTP response mapping.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use order_store::StoreError;
use ordering::OrderError;
use payments::PaymentError;

/// API-level error type that maps to HTTP responses.
#[derive(Debug)]
pub enum ApiError {
    /// Resource not found.
    NotFound(String),
    /// Bad request from the client.
    BadRequest(String),
    /// Order creation error.
    Order(OrderError),
    /// Payment registration or callback error.
    Payment(PaymentError),
    /// Internal server error. The message is logged, not returned.
    Internal(String),
}

impl ApiError {
    fn status_and_message(self) -> (StatusCode, String) {
        match self {
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            ApiError::Order(err) => (order_error_status(&err), err.to_string()),
            ApiError::Payment(err) => (payment_error_status(&err), err.to_string()),
            ApiError::Internal(msg) => {
                tracing::error!(error = %msg, "internal error");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "Internal server error".to_string(),
                )
            }
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = self.status_and_message();
        if status.is_server_error() {
            tracing::error!(%status, error = %message, "request failed");
        }

        let retryable = status == StatusCode::CONFLICT || status == StatusCode::SERVICE_UNAVAILABLE;
        let body = serde_json::json!({ "error": message, "retryable": retryable });
        (status, axum::Json(body)).into_response()
    }
}

fn order_error_status(err: &OrderError) -> StatusCode {
    match err {
        OrderError::Conflict { .. } => StatusCode::CONFLICT,
        OrderError::EmptyCart
        | OrderError::InvalidQuantity { .. }
        | OrderError::InvalidIdempotencyKey(_) => StatusCode::BAD_REQUEST,
        OrderError::ProductNotFound { .. } => StatusCode::NOT_FOUND,
        OrderError::ProductUnavailable { .. }
        | OrderError::IdempotencyKeyReused { .. }
        | OrderError::TotalTooLarge => StatusCode::UNPROCESSABLE_ENTITY,
        OrderError::Lock(_) => StatusCode::SERVICE_UNAVAILABLE,
        OrderError::Store(e) => store_error_status(e),
        OrderError::Payload(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn payment_error_status(err: &PaymentError) -> StatusCode {
    match err {
        PaymentError::UnknownPayment(_) | PaymentError::OrderNotFound(_) => StatusCode::NOT_FOUND,
        PaymentError::InvalidTransition { .. } => StatusCode::CONFLICT,
        PaymentError::Gateway(_) => StatusCode::SERVICE_UNAVAILABLE,
        PaymentError::Store(e) => store_error_status(e),
    }
}

fn store_error_status(err: &StoreError) -> StatusCode {
    match err {
        StoreError::DuplicatePayment(_) | StoreError::DuplicateIdempotencyKey(_) => {
            StatusCode::CONFLICT
        }
        StoreError::NotFound { .. } => StatusCode::NOT_FOUND,
        e if e.is_transient() => StatusCode::SERVICE_UNAVAILABLE,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl From<OrderError> for ApiError {
    fn from(err: OrderError) -> Self {
        match order_error_status(&err) {
            StatusCode::INTERNAL_SERVER_ERROR => ApiError::Internal(err.to_string()),
            _ => ApiError::Order(err),
        }
    }
}

impl From<PaymentError> for ApiError {
    fn from(err: PaymentError) -> Self {
        match payment_error_status(&err) {
            StatusCode::INTERNAL_SERVER_ERROR => ApiError::Internal(err.to_string()),
            _ => ApiError::Payment(err),
        }
    }
}
