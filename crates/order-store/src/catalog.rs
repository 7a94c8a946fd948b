//! Read-only view of the product catalog used for pricing at checkout.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use common::{Money, ProductId};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::Result;

/// A product as currently listed in the catalog.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Product {
    pub id: ProductId,
    pub name: String,
    pub price: Money,
    pub purchasable: bool,
}

impl Product {
    pub fn new(id: impl Into<ProductId>, name: impl Into<String>, price: Money) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            price,
            purchasable: true,
        }
    }
}

/// Source of current product state. Catalog management lives elsewhere.
#[async_trait]
pub trait Catalog: Send + Sync {
    /// Returns the products that exist among `ids`. Missing ids are omitted.
    async fn get_products(&self, ids: &[ProductId]) -> Result<Vec<Product>>;
}

/// In-memory catalog for tests and local runs.
#[derive(Clone, Default)]
pub struct InMemoryCatalog {
    products: Arc<RwLock<HashMap<ProductId, Product>>>,
    latency: Arc<RwLock<Option<Duration>>>,
}

impl InMemoryCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a catalog pre-populated with `products`.
    pub fn with_products(products: impl IntoIterator<Item = Product>) -> Self {
        let map = products.into_iter().map(|p| (p.id.clone(), p)).collect();
        Self {
            products: Arc::new(RwLock::new(map)),
            latency: Arc::default(),
        }
    }

    pub async fn upsert(&self, product: Product) {
        self.products.write().await.insert(product.id.clone(), product);
    }

    pub async fn remove(&self, id: &ProductId) {
        self.products.write().await.remove(id);
    }

    /// Delays every lookup, simulating a slow catalog query.
    pub async fn set_latency(&self, latency: Option<Duration>) {
        *self.latency.write().await = latency;
    }
}

#[async_trait]
impl Catalog for InMemoryCatalog {
    async fn get_products(&self, ids: &[ProductId]) -> Result<Vec<Product>> {
        let latency = *self.latency.read().await;
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }

        let products = self.products.read().await;
        Ok(ids.iter().filter_map(|id| products.get(id).cloned()).collect())
    }
}
