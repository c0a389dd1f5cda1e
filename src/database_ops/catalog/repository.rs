use std::sync::Arc;

use anyhow::{Context, Result};
use serde_json::Value;
use tracing::{debug, error, instrument, warn};

use super::record::{record_label, ProductRecord};
use super::store::{CatalogStore, CatalogTx};

/// Rows written by one successful [`CatalogRepository::insert_data`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InsertOutcome {
    pub product_id: i64,
    pub sku: String,
    pub additional_fields: usize,
    pub makes: usize,
    pub models: usize,
    pub years: usize,
}

#[derive(Clone)]
pub struct CatalogRepository {
    store: Arc<dyn CatalogStore>,
}

impl CatalogRepository {
    pub fn new(store: Arc<dyn CatalogStore>) -> Self {
        Self { store }
    }

    /// Upsert one product detail payload as a single transaction.
    ///
    /// Category, product, product summary, additional fields and the
    /// make → model → year tree are written parents-first so every foreign
    /// key resolves inside the transaction. Shared fitment rows go in
    /// ascending id order per table so concurrent products lock them in the
    /// same sequence. Any failure (missing key, bad
    /// value, store error) rolls the whole product back, is logged, and is
    /// returned for this record only.
    #[instrument(skip_all, fields(product = %record_label(value)))]
    pub async fn insert_data(&self, value: &Value) -> Result<InsertOutcome> {
        let result = match ProductRecord::from_value(value) {
            Ok(record) => self.write_record(&record).await,
            Err(e) => Err(anyhow::Error::new(e).context("malformed product record")),
        };
        if let Err(e) = &result {
            error!(error = %format!("{e:#}"), "error inserting product data");
        }
        result
    }

    pub async fn write_record(&self, record: &ProductRecord) -> Result<InsertOutcome> {
        let mut tx = self.store.begin().await.context("begin catalog transaction")?;
        match upsert_record(tx.as_mut(), record).await {
            Ok(outcome) => {
                tx.commit().await.context("commit catalog transaction")?;
                debug!(product_id = outcome.product_id, years = outcome.years, "product committed");
                Ok(outcome)
            }
            Err(e) => {
                if let Err(rb) = tx.rollback().await {
                    warn!(error = %rb, "rollback failed");
                }
                Err(e)
            }
        }
    }
}

async fn upsert_record(tx: &mut dyn CatalogTx, record: &ProductRecord) -> Result<InsertOutcome> {
    let product = &record.product;
    tx.upsert_category(&record.category)
        .await
        .with_context(|| format!("upsert category {}", record.category.id))?;
    tx.upsert_product(product)
        .await
        .with_context(|| format!("upsert product {}", product.id))?;
    tx.upsert_product_summary(&record.summary)
        .await
        .with_context(|| format!("upsert product_summary {}", product.id))?;

    let mut outcome = InsertOutcome {
        product_id: product.id,
        sku: product.sku.clone(),
        ..InsertOutcome::default()
    };

    for field in &record.additional_fields {
        tx.upsert_additional_field(field)
            .await
            .with_context(|| format!("upsert additional field {:?}", field.name))?;
        outcome.additional_fields += 1;
    }

    let fitment = record.fitment_rows();
    for make in &fitment.makes {
        tx.upsert_make(make)
            .await
            .with_context(|| format!("upsert make {}", make.id))?;
    }
    for model in &fitment.models {
        tx.upsert_model(model)
            .await
            .with_context(|| format!("upsert model {}", model.id))?;
    }
    for year in &fitment.years {
        tx.upsert_year(year)
            .await
            .with_context(|| format!("upsert year {}", year.id))?;
    }
    outcome.makes = fitment.makes.len();
    outcome.models = fitment.models.len();
    outcome.years = fitment.years.len();
    Ok(outcome)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database_ops::catalog::memory::{ConstraintViolation, MemoryCatalogStore};
    use crate::database_ops::catalog::record::fixtures::{fitment_json, product_json};
    use crate::database_ops::catalog::record::{
        AdditionalField, Category, Make, Model, Product, ProductSummary, Year,
    };
    use async_trait::async_trait;
    use bigdecimal::BigDecimal;
    use serde_json::json;
    use std::str::FromStr;
    use std::sync::Mutex;

    /// Store that only records the order of upserts.
    #[derive(Default)]
    struct RecordingStore {
        log: Arc<Mutex<Vec<String>>>,
    }

    struct RecordingTx {
        log: Arc<Mutex<Vec<String>>>,
    }

    impl RecordingTx {
        fn push(&self, entry: String) -> Result<()> {
            self.log.lock().unwrap().push(entry);
            Ok(())
        }
    }

    #[async_trait]
    impl CatalogStore for RecordingStore {
        async fn begin(&self) -> Result<Box<dyn CatalogTx>> {
            Ok(Box::new(RecordingTx {
                log: self.log.clone(),
            }))
        }
    }

    #[async_trait]
    impl CatalogTx for RecordingTx {
        async fn upsert_category(&mut self, row: &Category) -> Result<()> {
            self.push(format!("category {}", row.id))
        }
        async fn upsert_product(&mut self, row: &Product) -> Result<()> {
            self.push(format!("product {}", row.id))
        }
        async fn upsert_product_summary(&mut self, row: &ProductSummary) -> Result<()> {
            self.push(format!("summary {}", row.id))
        }
        async fn upsert_additional_field(&mut self, row: &AdditionalField) -> Result<()> {
            self.push(format!("field {}", row.name))
        }
        async fn upsert_make(&mut self, row: &Make) -> Result<()> {
            self.push(format!("make {}", row.id))
        }
        async fn upsert_model(&mut self, row: &Model) -> Result<()> {
            self.push(format!("model {}", row.id))
        }
        async fn upsert_year(&mut self, row: &Year) -> Result<()> {
            self.push(format!("year {}", row.id))
        }
        async fn commit(self: Box<Self>) -> Result<()> {
            self.push("commit".into())
        }
        async fn rollback(self: Box<Self>) -> Result<()> {
            self.push("rollback".into())
        }
    }

    fn two_makes(order: [i64; 2]) -> Value {
        let make = |id: i64| {
            json!({"id": id, "name": format!("make{id}"), "image": null, "models": [
                {"id": id * 10 + 1, "name": "b", "image": null, "years": [
                    {"id": id * 100 + 2, "name": "2022", "mic": "m"},
                    {"id": id * 100 + 1, "name": "2021", "mic": "m"}
                ]},
                {"id": id * 10, "name": "a", "image": null, "years": []}
            ]})
        };
        json!([make(order[0]), make(order[1])])
    }

    fn repo() -> (CatalogRepository, MemoryCatalogStore) {
        let store = MemoryCatalogStore::new();
        (CatalogRepository::new(Arc::new(store.clone())), store)
    }

    #[tokio::test]
    async fn clutch_cover_scenario() {
        let (repo, store) = repo();
        let outcome = repo.insert_data(&product_json(42, "CP0546BL", 7)).await.unwrap();
        assert_eq!(outcome.product_id, 42);
        assert_eq!(outcome.additional_fields, 1);

        let tables = store.snapshot();
        assert_eq!(
            tables.products[&42].dealer_price_gbp,
            Some(BigDecimal::from_str("19.99").unwrap())
        );
        assert_eq!(tables.products[&42].category_id, 7);
        assert_eq!(tables.categories[&7].name.as_deref(), Some("Clutch"));
        assert_eq!(tables.additional_fields.len(), 1);
        assert_eq!(
            tables.additional_fields[&(42, "color".to_string())].value.as_deref(),
            Some("black")
        );
        assert_eq!(tables.product_summary[&42].sku, "CP0546BL");
    }

    #[tokio::test]
    async fn insert_is_idempotent() {
        let (repo, store) = repo();
        let mut v = product_json(42, "CP0546BL", 7);
        v["bikes"] = fitment_json();

        repo.insert_data(&v).await.unwrap();
        let first = store.snapshot();
        repo.insert_data(&v).await.unwrap();

        assert_eq!(store.snapshot(), first);
        let counts = first.counts();
        assert_eq!((counts.makes, counts.models, counts.years), (1, 1, 2));
    }

    #[tokio::test]
    async fn fitment_tree_resolves_its_foreign_keys() {
        let (repo, store) = repo();
        let mut v = product_json(42, "CP0546BL", 7);
        v["bikes"] = fitment_json();
        repo.insert_data(&v).await.unwrap();

        let tables = store.snapshot();
        for model in tables.models.values() {
            assert!(tables.makes.contains_key(&model.make_id));
        }
        for year in tables.years.values() {
            assert!(tables.models.contains_key(&year.model_id));
        }
        assert_eq!(tables.years[&300].mic.as_deref(), Some("KZ900-20"));
    }

    #[tokio::test]
    async fn shared_rows_are_written_in_ascending_id_order() {
        let store = RecordingStore::default();
        let log = store.log.clone();
        let repo = CatalogRepository::new(Arc::new(store));

        let mut forward = product_json(1, "A1", 7);
        forward["bikes"] = two_makes([1, 2]);
        let mut reversed = product_json(2, "B2", 7);
        reversed["bikes"] = two_makes([2, 1]);

        repo.insert_data(&forward).await.unwrap();
        let first: Vec<String> = log.lock().unwrap().drain(..).collect();
        repo.insert_data(&reversed).await.unwrap();
        let second: Vec<String> = log.lock().unwrap().drain(..).collect();

        let shared = |entries: &[String]| -> Vec<String> {
            entries
                .iter()
                .filter(|e| !e.starts_with("product") && !e.starts_with("summary"))
                .cloned()
                .collect()
        };
        assert_eq!(shared(&first), shared(&second));
        assert_eq!(
            shared(&first),
            vec![
                "category 7", "field color", "make 1", "make 2", "model 10", "model 11",
                "model 20", "model 21", "year 101", "year 102", "year 201", "year 202",
                "commit",
            ]
        );
    }

    #[tokio::test]
    async fn additional_fields_merge_by_name() {
        let (repo, store) = repo();
        let mut v = product_json(42, "CP0546BL", 7);
        v["additionalFields"] = json!([{"name": "color", "value": "red"}]);
        repo.insert_data(&v).await.unwrap();
        v["additionalFields"] = json!([{"name": "color", "value": "blue"}]);
        repo.insert_data(&v).await.unwrap();

        let fields = store.snapshot().additional_fields;
        assert_eq!(fields.len(), 1);
        assert_eq!(fields[&(42, "color".to_string())].value.as_deref(), Some("blue"));
    }

    #[tokio::test]
    async fn fields_dropped_upstream_are_left_in_place() {
        let (repo, store) = repo();
        let mut v = product_json(42, "CP0546BL", 7);
        v["additionalFields"] = json!([{"name": "color", "value": "red"}, {"name": "finish", "value": "matt"}]);
        repo.insert_data(&v).await.unwrap();
        v["additionalFields"] = json!([{"name": "color", "value": "red"}]);
        repo.insert_data(&v).await.unwrap();

        assert_eq!(store.counts().additional_fields, 2);
    }

    #[tokio::test]
    async fn missing_key_fails_without_writing() {
        let (repo, store) = repo();
        let mut v = product_json(42, "CP0546BL", 7);
        v["bikes"] = fitment_json();
        v["bikes"][0]["models"][0]["years"][0]
            .as_object_mut()
            .unwrap()
            .remove("mic");

        let err = repo.insert_data(&v).await.unwrap_err();
        assert!(format!("{err:#}").contains("missing key `mic`"));
        assert_eq!(store.counts().categories, 0);
        assert_eq!(store.counts().products, 0);
    }

    #[tokio::test]
    async fn store_failure_rolls_back_the_whole_product() {
        let (repo, store) = repo();
        repo.insert_data(&product_json(1, "CP0546BL", 7)).await.unwrap();

        // Same sku under a new id violates the unique sku; the new category must not land either.
        let err = repo.insert_data(&product_json(2, "CP0546BL", 8)).await.unwrap_err();
        assert!(err.chain().any(|c| c.downcast_ref::<ConstraintViolation>().is_some()));

        let tables = store.snapshot();
        assert!(!tables.categories.contains_key(&8));
        assert!(!tables.products.contains_key(&2));
        assert_eq!(store.stats().committed, 1);
    }
}
