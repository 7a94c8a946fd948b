//! Payment gateway query API and in-memory implementation.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use order_store::PaymentStatus;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::{PaymentError, Result};

/// Payment status as reported by the gateway.
///
/// Richer than the local [`PaymentStatus`]; see [`GatewayStatus::local`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum GatewayStatus {
    Ready,
    InProgress,
    WaitingForDeposit,
    Done,
    Canceled,
    PartialCanceled,
    Aborted,
    Expired,
}

impl GatewayStatus {
    /// Maps onto the local status model.
    ///
    /// Partial cancellation counts as canceled; aborted and expired payments
    /// count as failed.
    pub fn local(&self) -> PaymentStatus {
        match self {
            GatewayStatus::Ready => PaymentStatus::Ready,
            GatewayStatus::InProgress => PaymentStatus::InProgress,
            GatewayStatus::WaitingForDeposit => PaymentStatus::WaitingForDeposit,
            GatewayStatus::Done => PaymentStatus::Done,
            GatewayStatus::Canceled | GatewayStatus::PartialCanceled => PaymentStatus::Canceled,
            GatewayStatus::Aborted | GatewayStatus::Expired => PaymentStatus::Failed,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.local().is_terminal()
    }
}

/// Ground truth for one payment, as returned by the gateway.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GatewayPayment {
    pub payment_key: String,
    pub status: GatewayStatus,
    pub approved_at: Option<DateTime<Utc>>,
}

/// Read-only query API of the payment gateway.
#[async_trait]
pub trait PaymentGateway: Send + Sync {
    /// Looks up a payment by its gateway key.
    async fn query(&self, payment_key: &str) -> Result<GatewayPayment>;
}

/// In-memory gateway for tests and local runs.
#[derive(Clone, Default)]
pub struct InMemoryPaymentGateway {
    payments: Arc<RwLock<HashMap<String, GatewayPayment>>>,
    unavailable: Arc<AtomicBool>,
}

impl InMemoryPaymentGateway {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets what the gateway reports for `payment_key`.
    pub async fn set_status(&self, payment_key: &str, status: GatewayStatus) {
        let approved_at = (status == GatewayStatus::Done).then(Utc::now);
        self.payments.write().await.insert(
            payment_key.to_string(),
            GatewayPayment {
                payment_key: payment_key.to_string(),
                status,
                approved_at,
            },
        );
    }

    /// Makes every query fail as if the gateway were down.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }
}

#[async_trait]
impl PaymentGateway for InMemoryPaymentGateway {
    async fn query(&self, payment_key: &str) -> Result<GatewayPayment> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(PaymentError::Gateway("gateway unreachable".into()));
        }
        self.payments
            .read()
            .await
            .get(payment_key)
            .cloned()
            .ok_or_else(|| PaymentError::Gateway(format!("no such payment: {payment_key}")))
    }
}
