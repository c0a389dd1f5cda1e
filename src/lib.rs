pub mod config;
pub mod database_ops;
pub mod orchestrator;
pub mod logging;

pub mod util {
    pub mod db;
    pub mod env;
}

pub use config::SyncConfig;
pub use orchestrator::{populate_database, sync_product, SyncReport};
