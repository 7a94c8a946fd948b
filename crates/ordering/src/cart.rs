//! Cart selections submitted at checkout.

use common::ProductId;
use serde::{Deserialize, Serialize};

/// Largest quantity a single line may ask for; the stored column is a
/// signed 32-bit integer.
pub const MAX_LINE_QUANTITY: u32 = i32::MAX as u32;

/// Longest idempotency key accepted, in bytes.
pub const MAX_IDEMPOTENCY_KEY_LEN: usize = 255;

/// One product and quantity picked by the buyer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CartLine {
    pub product_id: ProductId,
    pub quantity: u32,
}

impl CartLine {
    pub fn new(product_id: impl Into<ProductId>, quantity: u32) -> Self {
        Self {
            product_id: product_id.into(),
            quantity,
        }
    }
}

/// The items a buyer wants to order.
///
/// Prices are never taken from the selection; they are looked up in the
/// catalog at order time.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CartSelection {
    pub lines: Vec<CartLine>,
    /// Client-supplied token used to collapse duplicate submissions.
    #[serde(default)]
    pub idempotency_key: Option<String>,
}

impl CartSelection {
    pub fn new(lines: Vec<CartLine>) -> Self {
        Self {
            lines,
            idempotency_key: None,
        }
    }

    /// Adds a line. Convenience for building selections in code.
    pub fn line(mut self, product_id: impl Into<ProductId>, quantity: u32) -> Self {
        self.lines.push(CartLine::new(product_id, quantity));
        self
    }

    pub fn with_idempotency_key(mut self, key: impl Into<String>) -> Self {
        self.idempotency_key = Some(key.into());
        self
    }

    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }
}
