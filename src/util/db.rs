use anyhow::{Context, Result};
use async_trait::async_trait;
use sqlx::{
    postgres::{PgConnectOptions, PgPoolOptions, PgSslMode},
    PgPool, Postgres, Row, Transaction,
};
use std::str::FromStr;
use std::time::Duration;
use tracing::{info, instrument};

use crate::database_ops::catalog::memory::TableCounts;
use crate::database_ops::catalog::record::{
    AdditionalField, Category, Make, Model, Product, ProductSummary, Year,
};
use crate::database_ops::catalog::store::{CatalogStore, CatalogTx};
use crate::util::env::env_flag;

/// Embedded schema files, applied in version order and tracked in `_catalog_migrations`.
const MIGRATIONS: &[(i64, &str, &str)] = &[(
    1,
    "catalog",
    include_str!("../../migrations/0001_catalog.sql"),
)];

#[derive(Clone)]
pub struct Db {
    pub pool: PgPool,
}

impl Db {
    // SECURITY: never include raw DSNs in tracing spans (they may contain credentials).
    #[instrument(skip(database_url))]
    pub async fn connect(database_url: &str, max_connections: u32) -> Result<Self> {
        let mut connect_options = PgConnectOptions::from_str(database_url)?;

        // Ensure TLS is enabled when DSN contains sslmode=require
        if database_url.contains("sslmode=require") {
            connect_options = connect_options.ssl_mode(PgSslMode::Require);
        }
        if !env_flag("USE_PREPARED", false) {
            // PgBouncer txn mode safe
            connect_options = connect_options.statement_cache_capacity(0);
        }

        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .acquire_timeout(Duration::from_secs(30))
            .idle_timeout(Duration::from_secs(600))
            .connect_with(connect_options)
            .await
            .context("failed to connect to database")?;
        info!(max_connections, "connected to db");
        Ok(Self { pool })
    }

    /// Apply embedded schema files not yet recorded. Every statement is idempotent,
    /// so re-running against a database created by hand is safe.
    pub async fn run_migrations(&self) -> Result<()> {
        sqlx::raw_sql(
            "CREATE TABLE IF NOT EXISTS _catalog_migrations (
                version BIGINT PRIMARY KEY,
                description TEXT,
                installed_at TIMESTAMPTZ DEFAULT now()
             )",
        )
        .execute(&self.pool)
        .await?;

        let applied: Vec<i64> = sqlx::query_scalar("SELECT version FROM _catalog_migrations")
            .persistent(false)
            .fetch_all(&self.pool)
            .await?;

        for &(version, description, sql) in MIGRATIONS {
            if applied.contains(&version) {
                continue;
            }
            info!(version, description, "applying migration");
            let mut tx = self.pool.begin().await?;
            sqlx::raw_sql(sql)
                .execute(&mut *tx)
                .await
                .with_context(|| format!("migration {version}_{description} failed"))?;
            sqlx::query("INSERT INTO _catalog_migrations (version, description) VALUES ($1, $2)")
                .persistent(false)
                .bind(version)
                .bind(description)
                .execute(&mut *tx)
                .await?;
            tx.commit().await?;
        }
        info!(latest = MIGRATIONS.len(), "migrations up-to-date");
        Ok(())
    }

    pub async fn table_counts(&self) -> Result<TableCounts> {
        let row = sqlx::query(
            "SELECT
                (SELECT count(*) FROM categories),
                (SELECT count(*) FROM products),
                (SELECT count(*) FROM product_summary),
                (SELECT count(*) FROM additional_fields),
                (SELECT count(*) FROM makes),
                (SELECT count(*) FROM models),
                (SELECT count(*) FROM years)",
        )
        .persistent(false)
        .fetch_one(&self.pool)
        .await?;
        let n = |i: usize| -> Result<usize> { Ok(row.try_get::<i64, _>(i)?.max(0) as usize) };
        Ok(TableCounts {
            categories: n(0)?,
            products: n(1)?,
            product_summary: n(2)?,
            additional_fields: n(3)?,
            makes: n(4)?,
            models: n(5)?,
            years: n(6)?,
        })
    }
}

/// Postgres-backed [`CatalogStore`]: one pooled connection per transaction.
#[derive(Clone)]
pub struct PgCatalogStore {
    db: Db,
}

impl PgCatalogStore {
    pub fn new(db: Db) -> Self {
        Self { db }
    }
}

#[async_trait]
impl CatalogStore for PgCatalogStore {
    async fn begin(&self) -> Result<Box<dyn CatalogTx>> {
        let tx = self.db.pool.begin().await?;
        Ok(Box::new(PgCatalogTx { tx }))
    }
}

struct PgCatalogTx {
    tx: Transaction<'static, Postgres>,
}

#[async_trait]
impl CatalogTx for PgCatalogTx {
    async fn upsert_category(&mut self, row: &Category) -> Result<()> {
        sqlx::query(
            "INSERT INTO categories (id, name, description, product_description, image, banner_image)
             VALUES ($1, $2, $3, $4, $5, $6)
             ON CONFLICT (id) DO UPDATE SET
                name = EXCLUDED.name,
                description = EXCLUDED.description,
                product_description = EXCLUDED.product_description,
                image = EXCLUDED.image,
                banner_image = EXCLUDED.banner_image",
        )
        .persistent(false)
        .bind(row.id)
        .bind(&row.name)
        .bind(&row.description)
        .bind(&row.product_description)
        .bind(&row.image)
        .bind(&row.banner_image)
        .execute(&mut *self.tx)
        .await?;
        Ok(())
    }

    async fn upsert_product(&mut self, row: &Product) -> Result<()> {
        sqlx::query(
            "INSERT INTO products (
                id, sku, name, category_id, product_type, brand, brief_description,
                full_description, fitting_instructions, fitting_instructions_qr, coversheet,
                date_created, date_modified, ean, site_price,
                dealer_price_gbp, dealer_price_usd, dealer_price_eur)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17, $18)
             ON CONFLICT (id) DO UPDATE SET
                sku = EXCLUDED.sku,
                name = EXCLUDED.name,
                category_id = EXCLUDED.category_id,
                product_type = EXCLUDED.product_type,
                brand = EXCLUDED.brand,
                brief_description = EXCLUDED.brief_description,
                full_description = EXCLUDED.full_description,
                fitting_instructions = EXCLUDED.fitting_instructions,
                fitting_instructions_qr = EXCLUDED.fitting_instructions_qr,
                coversheet = EXCLUDED.coversheet,
                date_created = EXCLUDED.date_created,
                date_modified = EXCLUDED.date_modified,
                ean = EXCLUDED.ean,
                site_price = EXCLUDED.site_price,
                dealer_price_gbp = EXCLUDED.dealer_price_gbp,
                dealer_price_usd = EXCLUDED.dealer_price_usd,
                dealer_price_eur = EXCLUDED.dealer_price_eur",
        )
        .persistent(false)
        .bind(row.id)
        .bind(&row.sku)
        .bind(&row.name)
        .bind(row.category_id)
        .bind(&row.product_type)
        .bind(&row.brand)
        .bind(&row.brief_description)
        .bind(&row.full_description)
        .bind(&row.fitting_instructions)
        .bind(&row.fitting_instructions_qr)
        .bind(&row.coversheet)
        .bind(row.date_created)
        .bind(row.date_modified)
        .bind(&row.ean)
        .bind(&row.site_price)
        .bind(&row.dealer_price_gbp)
        .bind(&row.dealer_price_usd)
        .bind(&row.dealer_price_eur)
        .execute(&mut *self.tx)
        .await?;
        Ok(())
    }

    async fn upsert_product_summary(&mut self, row: &ProductSummary) -> Result<()> {
        sqlx::query(
            "INSERT INTO product_summary (id, sku, date_created, date_modified, site_price)
             VALUES ($1, $2, $3, $4, $5)
             ON CONFLICT (id) DO UPDATE SET
                sku = EXCLUDED.sku,
                date_created = EXCLUDED.date_created,
                date_modified = EXCLUDED.date_modified,
                site_price = EXCLUDED.site_price",
        )
        .persistent(false)
        .bind(row.id)
        .bind(&row.sku)
        .bind(row.date_created)
        .bind(row.date_modified)
        .bind(&row.site_price)
        .execute(&mut *self.tx)
        .await?;
        Ok(())
    }

    async fn upsert_additional_field(&mut self, row: &AdditionalField) -> Result<()> {
        sqlx::query(
            "INSERT INTO additional_fields (product_id, name, value)
             VALUES ($1, $2, $3)
             ON CONFLICT (product_id, name) DO UPDATE SET value = EXCLUDED.value",
        )
        .persistent(false)
        .bind(row.product_id)
        .bind(&row.name)
        .bind(&row.value)
        .execute(&mut *self.tx)
        .await?;
        Ok(())
    }

    async fn upsert_make(&mut self, row: &Make) -> Result<()> {
        sqlx::query(
            "INSERT INTO makes (id, name, image)
             VALUES ($1, $2, $3)
             ON CONFLICT (id) DO UPDATE SET name = EXCLUDED.name, image = EXCLUDED.image",
        )
        .persistent(false)
        .bind(row.id)
        .bind(&row.name)
        .bind(&row.image)
        .execute(&mut *self.tx)
        .await?;
        Ok(())
    }

    async fn upsert_model(&mut self, row: &Model) -> Result<()> {
        sqlx::query(
            "INSERT INTO models (id, name, make_id, image)
             VALUES ($1, $2, $3, $4)
             ON CONFLICT (id) DO UPDATE SET
                name = EXCLUDED.name,
                make_id = EXCLUDED.make_id,
                image = EXCLUDED.image",
        )
        .persistent(false)
        .bind(row.id)
        .bind(&row.name)
        .bind(row.make_id)
        .bind(&row.image)
        .execute(&mut *self.tx)
        .await?;
        Ok(())
    }

    async fn upsert_year(&mut self, row: &Year) -> Result<()> {
        sqlx::query(
            "INSERT INTO years (id, name, model_id, mic, image)
             VALUES ($1, $2, $3, $4, $5)
             ON CONFLICT (id) DO UPDATE SET
                name = EXCLUDED.name,
                model_id = EXCLUDED.model_id,
                mic = EXCLUDED.mic,
                image = EXCLUDED.image",
        )
        .persistent(false)
        .bind(row.id)
        .bind(&row.name)
        .bind(row.model_id)
        .bind(&row.mic)
        .bind(&row.image)
        .execute(&mut *self.tx)
        .await?;
        Ok(())
    }

    async fn commit(self: Box<Self>) -> Result<()> {
        self.tx.commit().await?;
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<()> {
        self.tx.rollback().await?;
        Ok(())
    }
}
