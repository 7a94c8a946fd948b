//! Outbox records: durable intents to perform a side effect after commit.

use std::str::FromStr;

use chrono::{DateTime, Utc};
use common::{OrderId, OutboxId};
use serde::{Deserialize, Serialize};

use crate::StoreError;

/// Lifecycle state of an outbox record.
///
/// `Pending` moves to exactly one of the two terminal states and never back.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OutboxStatus {
    Pending,
    Published,
    FailedToPublish,
}

impl OutboxStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OutboxStatus::Pending => "PENDING",
            OutboxStatus::Published => "PUBLISHED",
            OutboxStatus::FailedToPublish => "FAILED_TO_PUBLISH",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, OutboxStatus::Pending)
    }
}

impl std::fmt::Display for OutboxStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OutboxStatus {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PENDING" => Ok(OutboxStatus::Pending),
            "PUBLISHED" => Ok(OutboxStatus::Published),
            "FAILED_TO_PUBLISH" => Ok(OutboxStatus::FailedToPublish),
            other => Err(StoreError::CorruptRow(format!("unknown outbox status '{other}'"))),
        }
    }
}

/// A stored outbox record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutboxRecord {
    pub id: OutboxId,
    /// The order whose commit produced this record.
    pub order_id: OrderId,
    pub event_type: String,
    /// Self-contained notification data; never a reference to live catalog state.
    pub payload: serde_json::Value,
    pub status: OutboxStatus,
    /// Delivery attempts charged against this record. Only ever increases.
    pub retry_count: u32,
    /// When the relay last handed this record to the broker.
    pub relayed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// An outbox record to be written alongside its order.
#[derive(Debug, Clone)]
pub struct NewOutboxRecord {
    pub id: OutboxId,
    pub event_type: String,
    pub payload: serde_json::Value,
}

impl NewOutboxRecord {
    pub fn new(event_type: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            id: OutboxId::new(),
            event_type: event_type.into(),
            payload,
        }
    }

    /// Builds the stored record in `Pending` state.
    pub fn into_record(self, order_id: OrderId, now: DateTime<Utc>) -> OutboxRecord {
        OutboxRecord {
            id: self.id,
            order_id,
            event_type: self.event_type,
            payload: self.payload,
            status: OutboxStatus::Pending,
            retry_count: 0,
            relayed_at: None,
            created_at: now,
            updated_at: now,
        }
    }
}

/// What happened when a dead-lettered delivery was charged to its record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailedDeliveryOutcome {
    /// Retry budget remains; the record is eligible for the next relay cycle.
    Rearmed { retry_count: u32 },
    /// The ceiling was reached; the record is now `FailedToPublish`.
    FailedToPublish { retry_count: u32 },
    /// The record had already reached a terminal state and was left untouched.
    AlreadyTerminal(OutboxStatus),
}

/// Computes the new retry count and status for a failed delivery.
pub(crate) fn charge_failed_delivery(current: u32, attempts: u32, ceiling: u32) -> (u32, OutboxStatus) {
    let retry_count = current
        .saturating_add(attempts.max(1))
        .min(ceiling.max(1))
        .max(current);
    if retry_count >= ceiling {
        (retry_count, OutboxStatus::FailedToPublish)
    } else {
        (retry_count, OutboxStatus::Pending)
    }
}
