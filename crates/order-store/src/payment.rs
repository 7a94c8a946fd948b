//! Payment settlement records.

use std::str::FromStr;

use chrono::{DateTime, Utc};
use common::{Money, OrderId, PaymentId};
use serde::{Deserialize, Serialize};

use crate::StoreError;

/// Settlement state of a payment.
///
/// Transitions only move forward; `Done`, `Canceled` and `Failed` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PaymentStatus {
    Ready,
    InProgress,
    WaitingForDeposit,
    Done,
    Canceled,
    Failed,
}

impl PaymentStatus {
    /// Non-terminal states a reconciliation sweep may force forward.
    pub const RECONCILABLE: [PaymentStatus; 2] =
        [PaymentStatus::InProgress, PaymentStatus::WaitingForDeposit];

    pub fn as_str(&self) -> &'static str {
        match self {
            PaymentStatus::Ready => "READY",
            PaymentStatus::InProgress => "IN_PROGRESS",
            PaymentStatus::WaitingForDeposit => "WAITING_FOR_DEPOSIT",
            PaymentStatus::Done => "DONE",
            PaymentStatus::Canceled => "CANCELED",
            PaymentStatus::Failed => "FAILED",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            PaymentStatus::Done | PaymentStatus::Canceled | PaymentStatus::Failed
        )
    }

    fn rank(&self) -> u8 {
        match self {
            PaymentStatus::Ready => 0,
            PaymentStatus::InProgress => 1,
            PaymentStatus::WaitingForDeposit => 2,
            PaymentStatus::Done | PaymentStatus::Canceled | PaymentStatus::Failed => 3,
        }
    }

    /// Returns true if moving from `self` to `next` keeps the status monotonic.
    pub fn can_transition_to(&self, next: PaymentStatus) -> bool {
        !self.is_terminal() && next.rank() > self.rank()
    }
}

impl std::fmt::Display for PaymentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PaymentStatus {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "READY" => Ok(PaymentStatus::Ready),
            "IN_PROGRESS" => Ok(PaymentStatus::InProgress),
            "WAITING_FOR_DEPOSIT" => Ok(PaymentStatus::WaitingForDeposit),
            "DONE" => Ok(PaymentStatus::Done),
            "CANCELED" => Ok(PaymentStatus::Canceled),
            "FAILED" => Ok(PaymentStatus::Failed),
            other => Err(StoreError::CorruptRow(format!(
                "unknown payment status '{other}'"
            ))),
        }
    }
}

/// Settlement state for one order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Payment {
    pub id: PaymentId,
    pub order_id: OrderId,
    /// Key assigned by the payment gateway.
    pub payment_key: String,
    pub amount: Money,
    pub status: PaymentStatus,
    pub requested_at: DateTime<Utc>,
    pub approved_at: Option<DateTime<Utc>>,
}

/// A payment about to be registered in `Ready` state.
#[derive(Debug, Clone)]
pub struct NewPayment {
    pub order_id: OrderId,
    pub payment_key: String,
    pub amount: Money,
    pub requested_at: DateTime<Utc>,
}

impl NewPayment {
    pub fn into_payment(self) -> Payment {
        Payment {
            id: PaymentId::new(),
            order_id: self.order_id,
            payment_key: self.payment_key,
            amount: self.amount,
            status: PaymentStatus::Ready,
            requested_at: self.requested_at,
            approved_at: None,
        }
    }
}
