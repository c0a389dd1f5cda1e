use anyhow::Result;
use async_trait::async_trait;

use super::record::{AdditionalField, Category, Make, Model, Product, ProductSummary, Year};

/// Something that can open a catalog write transaction.
///
/// Each call to [`CatalogStore::begin`] acquires its own connection/session;
/// nothing is shared between transactions beyond what the backing store
/// serialises itself.
#[async_trait]
pub trait CatalogStore: Send + Sync {
    async fn begin(&self) -> Result<Box<dyn CatalogTx>>;
}

/// One all-or-nothing unit of catalog writes. Every `upsert_*` is
/// merge-by-primary-key: insert if absent, overwrite all non-key columns if present.
///
/// Dropping a transaction without calling [`CatalogTx::commit`] discards its writes.
#[async_trait]
pub trait CatalogTx: Send {
    async fn upsert_category(&mut self, row: &Category) -> Result<()>;
    async fn upsert_product(&mut self, row: &Product) -> Result<()>;
    async fn upsert_product_summary(&mut self, row: &ProductSummary) -> Result<()>;
    async fn upsert_additional_field(&mut self, row: &AdditionalField) -> Result<()>;
    async fn upsert_make(&mut self, row: &Make) -> Result<()>;
    async fn upsert_model(&mut self, row: &Model) -> Result<()>;
    async fn upsert_year(&mut self, row: &Year) -> Result<()>;

    async fn commit(self: Box<Self>) -> Result<()>;
    async fn rollback(self: Box<Self>) -> Result<()>;
}
