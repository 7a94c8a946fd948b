//! Outbox payload for order confirmations.
//!
//! The payload is self-contained: everything the email needs is captured at
//! order time so later catalog changes never alter what is sent. New fields
//! must carry a serde default so records written by older releases still
//! decode, and unknown fields are ignored so older consumers can read newer
//! records.

use common::{BuyerId, Money, OrderId};
use order_store::{NewOrder, OrderItem};
use serde::{Deserialize, Serialize};

use crate::Result;

/// Event type stored on outbox records carrying an [`OrderConfirmation`].
pub const ORDER_CONFIRMATION_EVENT: &str = "OrderConfirmation";

/// Payload shape version written by this release.
pub const CURRENT_VERSION: u16 = 1;

fn first_version() -> u16 {
    1
}

/// One line of the confirmation email.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfirmationLine {
    pub name: String,
    pub quantity: u32,
    pub line_cents: i64,
}

/// Notification data for a newly created order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderConfirmation {
    #[serde(default = "first_version")]
    pub version: u16,
    pub order_id: OrderId,
    pub buyer_id: BuyerId,
    pub total_cents: i64,
    #[serde(default)]
    pub reference: Option<String>,
    #[serde(default)]
    pub lines: Vec<ConfirmationLine>,
}

impl OrderConfirmation {
    /// Captures the confirmation for an order about to be committed.
    pub fn for_order(order: &NewOrder) -> Self {
        Self {
            version: CURRENT_VERSION,
            order_id: order.id,
            buyer_id: order.buyer_id,
            total_cents: order.total_price().cents(),
            reference: Some(order.reference.clone()),
            lines: order.items.iter().map(ConfirmationLine::from).collect(),
        }
    }

    pub fn total(&self) -> Money {
        Money::from_cents(self.total_cents)
    }

    /// Encodes for storage in the outbox `payload` column.
    pub fn to_value(&self) -> Result<serde_json::Value> {
        Ok(serde_json::to_value(self)?)
    }

    /// Decodes a broker message body.
    pub fn decode(body: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(body)?)
    }
}

impl From<&OrderItem> for ConfirmationLine {
    fn from(item: &OrderItem) -> Self {
        Self {
            name: item.display_name().to_string(),
            quantity: item.quantity,
            line_cents: item.line_price.cents(),
        }
    }
}
