//! In-process [`CatalogStore`] with the same keys and foreign keys as the
//! Postgres schema. Used by `rg-sync sync --dry-run` and by tests.
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use anyhow::Result;
use async_trait::async_trait;

use super::record::{AdditionalField, Category, Make, Model, Product, ProductSummary, Year};
use super::store::{CatalogStore, CatalogTx};

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ConstraintViolation {
    #[error("{table}.{column}={id} references a missing {references} row")]
    ForeignKey {
        table: &'static str,
        column: &'static str,
        id: i64,
        references: &'static str,
    },
    #[error("duplicate sku {sku:?}: already used by product {existing_id}")]
    DuplicateSku { sku: String, existing_id: i64 },
}

/// Committed catalog rows keyed like the relational tables.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CatalogTables {
    pub categories: BTreeMap<i64, Category>,
    pub products: BTreeMap<i64, Product>,
    pub product_summary: BTreeMap<i64, ProductSummary>,
    pub additional_fields: BTreeMap<(i64, String), AdditionalField>,
    pub makes: BTreeMap<i64, Make>,
    pub models: BTreeMap<i64, Model>,
    pub years: BTreeMap<i64, Year>,
    sku_index: HashMap<String, i64>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TableCounts {
    pub categories: usize,
    pub products: usize,
    pub product_summary: usize,
    pub additional_fields: usize,
    pub makes: usize,
    pub models: usize,
    pub years: usize,
}

#[derive(Debug, Clone)]
enum Write {
    Category(Category),
    Product(Product),
    ProductSummary(ProductSummary),
    AdditionalField(AdditionalField),
    Make(Make),
    Model(Model),
    Year(Year),
}

impl CatalogTables {
    pub fn counts(&self) -> TableCounts {
        TableCounts {
            categories: self.categories.len(),
            products: self.products.len(),
            product_summary: self.product_summary.len(),
            additional_fields: self.additional_fields.len(),
            makes: self.makes.len(),
            models: self.models.len(),
            years: self.years.len(),
        }
    }

    /// Check a transaction's writes against the committed rows plus the
    /// writes before them, without touching the committed rows.
    fn validate(&self, writes: &[Write]) -> Result<(), ConstraintViolation> {
        let mut pending = Overlay::default();
        for write in writes {
            match write {
                Write::Category(row) => {
                    pending.categories.insert(row.id);
                }
                Write::Product(row) => {
                    require(
                        pending.categories.contains(&row.category_id)
                            || self.categories.contains_key(&row.category_id),
                        "products",
                        "category_id",
                        row.category_id,
                        "categories",
                    )?;
                    if let Some(existing_id) = self.sku_owner(&pending, &row.sku, row.id) {
                        return Err(ConstraintViolation::DuplicateSku {
                            sku: row.sku.clone(),
                            existing_id,
                        });
                    }
                    pending.products.insert(row.id, row.sku.clone());
                }
                Write::ProductSummary(_) => {}
                Write::AdditionalField(row) => require(
                    pending.products.contains_key(&row.product_id)
                        || self.products.contains_key(&row.product_id),
                    "additional_fields",
                    "product_id",
                    row.product_id,
                    "products",
                )?,
                Write::Make(row) => {
                    pending.makes.insert(row.id);
                }
                Write::Model(row) => {
                    require(
                        pending.makes.contains(&row.make_id) || self.makes.contains_key(&row.make_id),
                        "models",
                        "make_id",
                        row.make_id,
                        "makes",
                    )?;
                    pending.models.insert(row.id);
                }
                Write::Year(row) => require(
                    pending.models.contains(&row.model_id) || self.models.contains_key(&row.model_id),
                    "years",
                    "model_id",
                    row.model_id,
                    "models",
                )?,
            }
        }
        Ok(())
    }

    /// Another product id holding `sku` once the pending writes are applied.
    fn sku_owner(&self, pending: &Overlay, sku: &str, id: i64) -> Option<i64> {
        if let Some((&other, _)) = pending.products.iter().find(|(p, s)| **p != id && s.as_str() == sku) {
            return Some(other);
        }
        let committed = *self.sku_index.get(sku)?;
        let renamed = pending
            .products
            .get(&committed)
            .is_some_and(|s| s.as_str() != sku);
        (committed != id && !renamed).then_some(committed)
    }

    fn apply(&mut self, write: Write) {
        match write {
            Write::Category(row) => {
                self.categories.insert(row.id, row);
            }
            Write::Product(row) => {
                if let Some(previous) = self.products.get(&row.id) {
                    if previous.sku != row.sku && self.sku_index.get(&previous.sku) == Some(&row.id) {
                        self.sku_index.remove(&previous.sku);
                    }
                }
                self.sku_index.insert(row.sku.clone(), row.id);
                self.products.insert(row.id, row);
            }
            Write::ProductSummary(row) => {
                self.product_summary.insert(row.id, row);
            }
            Write::AdditionalField(row) => {
                self.additional_fields
                    .insert((row.product_id, row.name.clone()), row);
            }
            Write::Make(row) => {
                self.makes.insert(row.id, row);
            }
            Write::Model(row) => {
                self.models.insert(row.id, row);
            }
            Write::Year(row) => {
                self.years.insert(row.id, row);
            }
        }
    }
}

/// Keys written earlier in the same transaction.
#[derive(Default)]
struct Overlay {
    categories: HashSet<i64>,
    products: HashMap<i64, String>,
    makes: HashSet<i64>,
    models: HashSet<i64>,
}

fn require(
    present: bool,
    table: &'static str,
    column: &'static str,
    id: i64,
    references: &'static str,
) -> Result<(), ConstraintViolation> {
    if present {
        Ok(())
    } else {
        Err(ConstraintViolation::ForeignKey {
            table,
            column,
            id,
            references,
        })
    }
}

#[derive(Debug, Default)]
struct TxStats {
    begun: AtomicUsize,
    committed: AtomicUsize,
    rolled_back: AtomicUsize,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StoreStats {
    pub begun: usize,
    pub committed: usize,
    pub rolled_back: usize,
}

#[derive(Debug, Clone, Default)]
pub struct MemoryCatalogStore {
    tables: Arc<Mutex<CatalogTables>>,
    stats: Arc<TxStats>,
}

impl MemoryCatalogStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, CatalogTables> {
        self.tables.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Copy of the committed state.
    pub fn snapshot(&self) -> CatalogTables {
        self.lock().clone()
    }

    pub fn counts(&self) -> TableCounts {
        self.lock().counts()
    }

    pub fn stats(&self) -> StoreStats {
        StoreStats {
            begun: self.stats.begun.load(Ordering::SeqCst),
            committed: self.stats.committed.load(Ordering::SeqCst),
            rolled_back: self.stats.rolled_back.load(Ordering::SeqCst),
        }
    }
}

#[async_trait]
impl CatalogStore for MemoryCatalogStore {
    async fn begin(&self) -> Result<Box<dyn CatalogTx>> {
        self.stats.begun.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(MemoryTx {
            store: self.clone(),
            writes: Vec::new(),
        }))
    }
}

/// Buffers writes; commit validates them against the committed tables and
/// applies them only if every constraint holds.
struct MemoryTx {
    store: MemoryCatalogStore,
    writes: Vec<Write>,
}

#[async_trait]
impl CatalogTx for MemoryTx {
    async fn upsert_category(&mut self, row: &Category) -> Result<()> {
        self.writes.push(Write::Category(row.clone()));
        Ok(())
    }

    async fn upsert_product(&mut self, row: &Product) -> Result<()> {
        self.writes.push(Write::Product(row.clone()));
        Ok(())
    }

    async fn upsert_product_summary(&mut self, row: &ProductSummary) -> Result<()> {
        self.writes.push(Write::ProductSummary(row.clone()));
        Ok(())
    }

    async fn upsert_additional_field(&mut self, row: &AdditionalField) -> Result<()> {
        self.writes.push(Write::AdditionalField(row.clone()));
        Ok(())
    }

    async fn upsert_make(&mut self, row: &Make) -> Result<()> {
        self.writes.push(Write::Make(row.clone()));
        Ok(())
    }

    async fn upsert_model(&mut self, row: &Model) -> Result<()> {
        self.writes.push(Write::Model(row.clone()));
        Ok(())
    }

    async fn upsert_year(&mut self, row: &Year) -> Result<()> {
        self.writes.push(Write::Year(row.clone()));
        Ok(())
    }

    async fn commit(self: Box<Self>) -> Result<()> {
        let MemoryTx { store, writes } = *self;
        {
            let mut tables = store.lock();
            tables.validate(&writes)?;
            for write in writes {
                tables.apply(write);
            }
        }
        store.stats.committed.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<()> {
        self.store.stats.rolled_back.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}
