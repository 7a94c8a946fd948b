//! Order and order item records.

use chrono::{DateTime, Utc};
use common::{BuyerId, Money, OrderId, ProductId};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Name shown for a line whose product has since been removed from the catalog.
pub const REMOVED_PRODUCT_NAME: &str = "(product no longer available)";

/// A committed checkout.
///
/// `total_price` always equals the sum of the items' `line_price` captured at
/// creation time. Orders are never deleted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Order {
    pub id: OrderId,
    pub buyer_id: BuyerId,
    /// Externally visible reference used to correlate with the payment gateway.
    pub reference: String,
    pub idempotency_key: Option<String>,
    pub created_at: DateTime<Utc>,
    pub total_price: Money,
    pub items: Vec<OrderItem>,
}

impl Order {
    pub fn item_count(&self) -> usize {
        self.items.len()
    }
}

/// A line item. Prices are captured at order time and never recomputed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderItem {
    /// Weak reference: `None` once the product has been removed.
    pub product_id: Option<ProductId>,
    /// Product name at order time.
    pub product_name: Option<String>,
    pub quantity: u32,
    pub unit_price: Money,
    pub line_price: Money,
}

impl OrderItem {
    /// Creates a line item, computing the line price from the unit price.
    pub fn new(
        product_id: impl Into<ProductId>,
        product_name: impl Into<String>,
        quantity: u32,
        unit_price: Money,
    ) -> Self {
        Self {
            product_id: Some(product_id.into()),
            product_name: Some(product_name.into()),
            quantity,
            unit_price,
            line_price: unit_price.multiply(quantity),
        }
    }

    /// Returns the name to display for this line.
    pub fn display_name(&self) -> &str {
        self.product_name.as_deref().unwrap_or(REMOVED_PRODUCT_NAME)
    }
}

/// An order that has been validated and priced but not yet committed.
#[derive(Debug, Clone)]
pub struct NewOrder {
    pub id: OrderId,
    pub buyer_id: BuyerId,
    pub reference: String,
    pub idempotency_key: Option<String>,
    pub items: Vec<OrderItem>,
}

impl NewOrder {
    /// Creates a new order with a fresh id and reference.
    pub fn new(buyer_id: BuyerId, items: Vec<OrderItem>, idempotency_key: Option<String>) -> Self {
        Self {
            id: OrderId::new(),
            buyer_id,
            reference: generate_reference(Utc::now()),
            idempotency_key,
            items,
        }
    }

    /// Sum of the line prices.
    pub fn total_price(&self) -> Money {
        self.items.iter().map(|item| item.line_price).sum()
    }

    /// Builds the committed record with the given creation timestamp.
    pub fn into_order(self, created_at: DateTime<Utc>) -> Order {
        let total_price = self.total_price();
        Order {
            id: self.id,
            buyer_id: self.buyer_id,
            reference: self.reference,
            idempotency_key: self.idempotency_key,
            created_at,
            total_price,
            items: self.items,
        }
    }
}

/// Generates an external order reference of the form `ORD-YYYYMMDD-XXXXXXXX`.
pub fn generate_reference(now: DateTime<Utc>) -> String {
    let suffix = Uuid::new_v4().simple().to_string()[..8].to_uppercase();
    format!("ORD-{}-{}", now.format("%Y%m%d"), suffix)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn total_price_is_sum_of_line_prices() {
        let order = NewOrder::new(
            BuyerId::new(42),
            vec![
                OrderItem::new("SKU-001", "Notebook", 1, Money::from_cents(1250)),
                OrderItem::new("SKU-002", "Pen", 1, Money::from_cents(725)),
            ],
            None,
        );
        assert_eq!(order.total_price(), Money::from_cents(1975));

        let committed = order.into_order(Utc::now());
        assert_eq!(committed.total_price.cents(), 1975);
        assert_eq!(committed.item_count(), 2);
    }

    #[test]
    fn line_price_multiplies_quantity() {
        let item = OrderItem::new("SKU-001", "Widget", 3, Money::from_cents(1000));
        assert_eq!(item.line_price.cents(), 3000);
    }

    #[test]
    fn display_name_falls_back_for_removed_products() {
        let mut item = OrderItem::new("SKU-001", "Widget", 1, Money::from_cents(100));
        assert_eq!(item.display_name(), "Widget");

        item.product_id = None;
        item.product_name = None;
        assert_eq!(item.display_name(), REMOVED_PRODUCT_NAME);
    }

    #[test]
    fn reference_has_date_and_random_suffix() {
        let now = Utc.with_ymd_and_hms(2026, 10, 15, 12, 0, 0).unwrap();
        let reference = generate_reference(now);
        assert!(reference.starts_with("ORD-20261015-"));
        assert_eq!(reference.len(), "ORD-20261015-".len() + 8);
        assert_ne!(reference, generate_reference(now));
    }
}
