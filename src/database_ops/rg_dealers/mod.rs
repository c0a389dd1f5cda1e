pub mod provider;
pub mod retry;

use async_trait::async_trait;
use serde_json::Value;

pub use provider::{FetchError, ProductStub, RgDealersProvider};

/// Where a population run reads the catalog from.
#[async_trait]
pub trait CatalogSource: Send + Sync {
    async fn search_products(&self) -> Result<Vec<ProductStub>, FetchError>;
    async fn get_product_details(&self, sku: &str) -> Result<Value, FetchError>;
}
