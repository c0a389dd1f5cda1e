use std::time::Duration;

use anyhow::Result;

use crate::database_ops::rg_dealers::retry::RetryPolicy;
use crate::util::env::{db_url, env_first, env_flag, env_opt, env_parse, preflight_check};

pub const DEFAULT_BASE_URL: &str = "https://dealers.api.rg-racing.com";
pub const DEFAULT_WORKERS: usize = 8;

/// Vendor API settings.
#[derive(Clone)]
pub struct ApiConfig {
    pub base_url: String,
    pub api_key: String,
    pub timeout: Duration,
    pub retry: RetryPolicy,
}

// Hand-written so the key never lands in logs via `{:?}`.
impl std::fmt::Debug for ApiConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ApiConfig")
            .field("base_url", &self.base_url)
            .field("api_key", &"***")
            .field("timeout", &self.timeout)
            .field("retry", &self.retry)
            .finish()
    }
}

impl ApiConfig {
    pub fn from_env() -> Result<Self> {
        let api_key = env_first(&["RG_API_KEY", "API_KEY", "api_key"])
            .ok_or_else(|| anyhow::anyhow!("missing env var RG_API_KEY (or API_KEY / api_key)"))?;
        let base_url = env_opt("RG_BASE_URL").unwrap_or_else(|| DEFAULT_BASE_URL.to_string());
        let defaults = RetryPolicy::default();
        let retry = RetryPolicy {
            max_attempts: env_parse("HTTP_MAX_ATTEMPTS", defaults.max_attempts).max(1),
            base_delay: Duration::from_millis(env_parse(
                "HTTP_BACKOFF_BASE_MS",
                defaults.base_delay.as_millis() as u64,
            )),
            max_delay: Duration::from_millis(env_parse(
                "HTTP_BACKOFF_MAX_MS",
                defaults.max_delay.as_millis() as u64,
            )),
        };
        Ok(Self {
            base_url,
            api_key,
            timeout: Duration::from_secs(env_parse("HTTP_TIMEOUT_SECS", 30u64)),
            retry,
        })
    }
}

/// Everything a sync run needs, resolved from the environment.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub api: ApiConfig,
    pub workers: usize,
    pub max_db_connections: u32,
    pub auto_migrate: bool,
}

impl SyncConfig {
    pub fn from_env() -> Result<Self> {
        preflight_check(
            "rg-sync",
            &[],
            &[
                "RG_BASE_URL",
                "RG_API_KEY",
                "DATABASE_URL",
                "INSTANCE_HOST",
                "DB_NAME",
                "DB_USER",
                "SYNC_WORKERS",
            ],
        )?;
        let api = ApiConfig::from_env()?;
        let workers = env_parse("SYNC_WORKERS", DEFAULT_WORKERS).max(1);
        let max_db_connections = env_parse("DB_MAX_CONNS", workers as u32 + 2);
        Ok(Self {
            api,
            workers,
            max_db_connections,
            auto_migrate: env_flag("AUTO_MIGRATE", false),
        })
    }

    /// Resolved lazily: dry runs and `dump` never need a database.
    pub fn database_url(&self) -> Result<String> {
        db_url()
    }
}
