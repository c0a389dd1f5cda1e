//! Population run: list every product, then fetch and upsert each one on a
//! bounded pool of tasks. A product that fails is logged and counted; it never
//! stops the run.
use std::sync::Arc;

use anyhow::{Context, Result};
use futures::{stream, StreamExt};
use tracing::{debug, error, info, instrument};

use crate::database_ops::catalog::repository::{CatalogRepository, InsertOutcome};
use crate::database_ops::rg_dealers::{CatalogSource, FetchError, ProductStub};

#[derive(Debug, thiserror::Error)]
pub enum ProductError {
    #[error("product stub has no sku")]
    MissingSku,
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error("{0:#}")]
    Insert(anyhow::Error),
    #[error("worker task aborted: {0}")]
    Panicked(String),
}

#[derive(Debug)]
pub struct ProductFailure {
    pub sku: Option<String>,
    pub error: ProductError,
}

/// Outcome of one population run. Failures are also in the log stream.
#[derive(Debug, Default)]
pub struct SyncReport {
    pub listed: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub failures: Vec<ProductFailure>,
}

impl SyncReport {
    pub fn is_clean(&self) -> bool {
        self.failed == 0
    }
}

async fn insert_product_data(
    source: &dyn CatalogSource,
    repo: &CatalogRepository,
    stub: &ProductStub,
) -> Result<InsertOutcome, ProductError> {
    let sku = stub.sku.as_deref().ok_or(ProductError::MissingSku)?;
    let details = source.get_product_details(sku).await?;
    repo.insert_data(&details).await.map_err(ProductError::Insert)
}

/// Fetch and upsert a single SKU.
#[instrument(skip(source, repo))]
pub async fn sync_product(
    source: &dyn CatalogSource,
    repo: &CatalogRepository,
    sku: &str,
) -> Result<InsertOutcome> {
    let details = source
        .get_product_details(sku)
        .await
        .with_context(|| format!("fetch product {sku}"))?;
    repo.insert_data(&details).await
}

/// List every product and upsert each one with at most `workers` in flight.
///
/// Only a failed product listing is returned as `Err`; per-product failures
/// are logged and collected into the report.
#[instrument(skip(source, repo))]
pub async fn populate_database(
    source: Arc<dyn CatalogSource>,
    repo: CatalogRepository,
    workers: usize,
) -> Result<SyncReport> {
    let stubs = source
        .search_products()
        .await
        .context("product search failed")?;
    let mut report = SyncReport {
        listed: stubs.len(),
        ..SyncReport::default()
    };
    info!(products = report.listed, workers, "starting catalog population");

    let mut results = stream::iter(stubs)
        .map(|stub| {
            let source = Arc::clone(&source);
            let repo = repo.clone();
            async move {
                let sku = stub.sku.clone();
                // Spawned so workers run on separate runtime threads.
                let joined = tokio::spawn(async move {
                    insert_product_data(source.as_ref(), &repo, &stub).await
                })
                .await;
                (sku, joined)
            }
        })
        .buffer_unordered(workers.max(1));

    while let Some((sku, joined)) = results.next().await {
        let error = match joined {
            Ok(Ok(outcome)) => {
                debug!(sku = %outcome.sku, additional_fields = outcome.additional_fields, years = outcome.years, "product synced");
                report.succeeded += 1;
                continue;
            }
            Ok(Err(e)) => e,
            Err(join_err) => ProductError::Panicked(join_err.to_string()),
        };
        match &error {
            // Already logged with full context by the repository.
            ProductError::Insert(_) => {}
            other => error!(sku = sku.as_deref().unwrap_or("<none>"), error = %other, "error processing product"),
        }
        report.failed += 1;
        report.failures.push(ProductFailure { sku, error });
    }

    info!(
        listed = report.listed,
        succeeded = report.succeeded,
        failed = report.failed,
        "catalog population finished"
    );
    Ok(report)
}
