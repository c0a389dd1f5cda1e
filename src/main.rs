use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use clap::{ArgAction, Args, Parser, Subcommand, ValueEnum};
use rg_catalog_sync::config::{ApiConfig, SyncConfig};
use rg_catalog_sync::database_ops::catalog::memory::TableCounts;
use rg_catalog_sync::database_ops::catalog::{CatalogRepository, CatalogStore, MemoryCatalogStore};
use rg_catalog_sync::database_ops::db::{Db, PgCatalogStore};
use rg_catalog_sync::database_ops::rg_dealers::RgDealersProvider;
use rg_catalog_sync::logging::init_tracing;
use rg_catalog_sync::util::env as env_util;
use rg_catalog_sync::{populate_database, sync_product};
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(name = "rg-sync", version, about = "Sync the R&G dealer catalog into Postgres")]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,

    // Allow `rg-sync --workers 4` without the explicit `sync` subcommand.
    // If a subcommand is present, these args are ignored.
    #[command(flatten)]
    sync: SyncArgs,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Full population run (default when no command supplied)
    Sync(SyncArgs),
    /// Fetch and upsert a single product by SKU
    Product {
        sku: String,
        #[command(flatten)]
        target: TargetArgs,
    },
    /// Create the catalog tables if they do not exist
    Migrate,
    /// Print the raw JSON of a catalog endpoint to stdout
    Dump {
        #[arg(value_enum)]
        endpoint: DumpTarget,
    },
}

#[derive(Debug, Default, Clone, Args)]
struct SyncArgs {
    /// Concurrent product workers (defaults to SYNC_WORKERS or 8)
    #[arg(long)]
    workers: Option<usize>,
    #[command(flatten)]
    target: TargetArgs,
}

#[derive(Debug, Default, Clone, Args)]
struct TargetArgs {
    /// Write into an in-memory catalog instead of Postgres
    #[arg(long = "dry-run", action = ArgAction::SetTrue)]
    dry_run: bool,
    /// Apply the schema before writing (also enabled by AUTO_MIGRATE=1)
    #[arg(long, action = ArgAction::SetTrue)]
    migrate: bool,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum DumpTarget {
    Categories,
    Bikes,
    Brands,
    ProductSearch,
}

enum Backend {
    Memory(MemoryCatalogStore),
    Postgres(Db),
}

impl Backend {
    fn store(&self) -> Arc<dyn CatalogStore> {
        match self {
            Backend::Memory(store) => Arc::new(store.clone()),
            Backend::Postgres(db) => Arc::new(PgCatalogStore::new(db.clone())),
        }
    }

    async fn counts(&self) -> Result<TableCounts> {
        match self {
            Backend::Memory(store) => Ok(store.counts()),
            Backend::Postgres(db) => db.table_counts().await,
        }
    }
}

async fn connect_db(cfg: &SyncConfig, migrate: bool) -> Result<Db> {
    let url = cfg.database_url()?;
    let db = Db::connect(&url, cfg.max_db_connections)
        .await
        .context("Db::connect failed")?;
    if migrate || cfg.auto_migrate {
        db.run_migrations().await?;
    }
    Ok(db)
}

async fn open_backend(cfg: &SyncConfig, target: &TargetArgs) -> Result<Backend> {
    if target.dry_run {
        info!("dry run: writing to an in-memory catalog");
        return Ok(Backend::Memory(MemoryCatalogStore::new()));
    }
    Ok(Backend::Postgres(connect_db(cfg, target.migrate).await?))
}

async fn run_sync(args: SyncArgs) -> Result<()> {
    let mut cfg = SyncConfig::from_env()?;
    if let Some(workers) = args.workers {
        cfg.workers = workers.max(1);
        cfg.max_db_connections = cfg.max_db_connections.max(cfg.workers as u32 + 2);
    }
    let backend = open_backend(&cfg, &args.target).await?;
    let provider = Arc::new(RgDealersProvider::new(&cfg.api)?);
    let repo = CatalogRepository::new(backend.store());

    let started = Instant::now();
    let report = populate_database(provider, repo, cfg.workers).await?;
    let counts = backend.counts().await?;
    info!(
        elapsed_ms = started.elapsed().as_millis() as u64,
        succeeded = report.succeeded,
        failed = report.failed,
        ?counts,
        "sync complete"
    );
    if !report.is_clean() {
        let skus: Vec<&str> = report
            .failures
            .iter()
            .map(|f| f.sku.as_deref().unwrap_or("<none>"))
            .collect();
        warn!(failed = report.failed, ?skus, "some products were not synced; see errors above");
    }
    Ok(())
}

async fn run_product(sku: String, target: TargetArgs) -> Result<()> {
    let cfg = SyncConfig::from_env()?;
    let backend = open_backend(&cfg, &target).await?;
    let provider = RgDealersProvider::new(&cfg.api)?;
    let repo = CatalogRepository::new(backend.store());
    let outcome = sync_product(&provider, &repo, &sku).await?;
    info!(?outcome, "product synced");
    Ok(())
}

async fn run_dump(endpoint: DumpTarget) -> Result<()> {
    let provider = RgDealersProvider::new(&ApiConfig::from_env()?)?;
    let body = match endpoint {
        DumpTarget::Categories => provider.get_all_categories().await?,
        DumpTarget::Bikes => provider.get_all_bikes().await?,
        DumpTarget::Brands => provider.get_all_brands().await?,
        DumpTarget::ProductSearch => provider.fetch_json("product/search").await?,
    };
    println!("{}", serde_json::to_string_pretty(&body)?);
    Ok(())
}

async fn run_migrate() -> Result<()> {
    let url = env_util::db_url()?;
    let db = Db::connect(&url, 1).await.context("Db::connect failed")?;
    db.run_migrations().await
}

#[tokio::main]
async fn main() -> Result<()> {
    env_util::init_env();
    init_tracing("info,sqlx=warn")?;

    let cli = Cli::parse();
    match cli.command.unwrap_or(Command::Sync(cli.sync)) {
        Command::Sync(args) => run_sync(args).await,
        Command::Product { sku, target } => run_product(sku, target).await,
        Command::Migrate => run_migrate().await,
        Command::Dump { endpoint } => run_dump(endpoint).await,
    }
}
