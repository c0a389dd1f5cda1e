use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};
use tracing::{debug, instrument, warn};

use super::retry::RetryPolicy;
use super::CatalogSource;
use crate::config::ApiConfig;

fn truncate_for_log(mut s: String, max_len: usize) -> String {
    if s.len() > max_len {
        let mut cut = max_len;
        while !s.is_char_boundary(cut) {
            cut -= 1;
        }
        s.truncate(cut);
        s.push('…');
    }
    s
}

#[derive(Debug, thiserror::Error)]
pub enum FetchError {
    #[error("request to {url} failed: {source}")]
    Transport {
        url: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("{url} returned {status}: {body}")]
    Status {
        url: String,
        status: StatusCode,
        body: String,
    },
    #[error("invalid JSON from {url}: {source}")]
    Decode {
        url: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("giving up on {url} after {attempts} attempts: {last}")]
    Exhausted {
        url: String,
        attempts: u32,
        #[source]
        last: Box<FetchError>,
    },
}

impl FetchError {
    /// Network failures, 5xx, 429 and 408 are worth another attempt.
    pub fn is_transient(&self) -> bool {
        match self {
            FetchError::Transport { source, .. } => !source.is_builder(),
            FetchError::Status { status, .. } => {
                status.is_server_error()
                    || *status == StatusCode::TOO_MANY_REQUESTS
                    || *status == StatusCode::REQUEST_TIMEOUT
            }
            FetchError::Decode { .. } | FetchError::Exhausted { .. } => false,
        }
    }
}

/// Entry of `GET /product/search`. Only `sku` is interpreted; the rest is kept verbatim.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProductStub {
    #[serde(default, deserialize_with = "lenient_sku")]
    pub sku: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl ProductStub {
    /// Never fails: an entry that is not an object becomes a stub without a sku.
    fn from_entry(entry: Value) -> Self {
        match entry {
            Value::Object(map) => {
                serde_json::from_value(Value::Object(map)).unwrap_or_default()
            }
            _ => ProductStub::default(),
        }
    }
}

// Numeric skus are kept as their decimal text; null, blank and non-scalar values mean "no sku".
fn lenient_sku<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(match Value::deserialize(deserializer)? {
        Value::String(s) if !s.trim().is_empty() => Some(s),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    })
}

/// R&G dealers API client.
/// Public API (base): https://dealers.api.rg-racing.com/
///
/// Endpoints:
/// - GET /product/search - every product stub visible to the dealer key
/// - GET /product/get/{sku}?includeExtendedProperties=true - full product record
/// - GET /categories/all, /bikes/all, /brands/all - reference lists
///
/// Every call carries the dealer key in `x-api-key` and is retried with
/// exponential backoff on transient failures.
#[derive(Clone)]
pub struct RgDealersProvider {
    base_url: String,
    http: Client,
    api_key: String,
    retry: RetryPolicy,
}

impl std::fmt::Debug for RgDealersProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RgDealersProvider")
            .field("base_url", &self.base_url)
            .field("retry", &self.retry)
            .finish_non_exhaustive()
    }
}

impl RgDealersProvider {
    pub fn new(cfg: &ApiConfig) -> anyhow::Result<Self> {
        let http = Client::builder()
            .user_agent(concat!("rg-catalog-sync/", env!("CARGO_PKG_VERSION")))
            .timeout(cfg.timeout)
            .build()?;
        Ok(Self {
            base_url: cfg.base_url.trim_end_matches('/').to_string(),
            http,
            api_key: cfg.api_key.clone(),
            retry: cfg.retry,
        })
    }

    fn endpoint(&self, path_and_query: &str) -> String {
        format!("{}/{}", self.base_url, path_and_query.trim_start_matches('/'))
    }

    async fn fetch_once(&self, url: &str) -> Result<Value, FetchError> {
        let transport = |source| FetchError::Transport {
            url: url.to_string(),
            source,
        };
        let resp = self
            .http
            .get(url)
            .header("x-api-key", &self.api_key)
            .header("Content-Type", "application/json")
            .header("Accept", "application/json")
            .send()
            .await
            .map_err(transport)?;
        let status = resp.status();
        if !status.is_success() {
            let body = truncate_for_log(resp.text().await.unwrap_or_default(), 2000);
            return Err(FetchError::Status {
                url: url.to_string(),
                status,
                body,
            });
        }
        let text = resp.text().await.map_err(transport)?;
        serde_json::from_str(&text).map_err(|source| FetchError::Decode {
            url: url.to_string(),
            source,
        })
    }

    /// GET `path_and_query` relative to the base URL, retrying transient failures.
    #[instrument(skip(self), fields(base = %self.base_url))]
    pub async fn fetch_json(&self, path_and_query: &str) -> Result<Value, FetchError> {
        let url = self.endpoint(path_and_query);
        let mut attempt: u32 = 0;
        loop {
            attempt += 1;
            match self.fetch_once(&url).await {
                Ok(body) => {
                    debug!(attempt, "fetched");
                    return Ok(body);
                }
                Err(e) if !e.is_transient() => return Err(e),
                Err(e) if !self.retry.should_retry(attempt) => {
                    return Err(FetchError::Exhausted {
                        url,
                        attempts: attempt,
                        last: Box::new(e),
                    });
                }
                Err(e) => {
                    let sleep = self.retry.delay_for(attempt);
                    warn!(attempt, sleep_ms = sleep.as_millis() as u64, error = %e, "transient fetch failure; backing off");
                    tokio::time::sleep(sleep).await;
                }
            }
        }
    }

    pub async fn get_all_bikes(&self) -> Result<Value, FetchError> {
        self.fetch_json("bikes/all").await
    }

    pub async fn get_all_brands(&self) -> Result<Value, FetchError> {
        self.fetch_json("brands/all").await
    }

    pub async fn get_all_categories(&self) -> Result<Value, FetchError> {
        self.fetch_json("categories/all").await
    }

    pub async fn search_products(&self) -> Result<Vec<ProductStub>, FetchError> {
        let body = self.fetch_json("product/search").await?;
        // Only the envelope is strict; each entry is judged on its own by the orchestrator.
        let entries: Vec<Value> =
            serde_json::from_value(body).map_err(|source| FetchError::Decode {
                url: self.endpoint("product/search"),
                source,
            })?;
        Ok(entries.into_iter().map(ProductStub::from_entry).collect())
    }

    pub async fn get_product_details(&self, sku: &str) -> Result<Value, FetchError> {
        self.fetch_json(&format!(
            "product/get/{}?includeExtendedProperties=true",
            urlencoding::encode(sku)
        ))
        .await
    }
}

#[async_trait]
impl CatalogSource for RgDealersProvider {
    async fn search_products(&self) -> Result<Vec<ProductStub>, FetchError> {
        RgDealersProvider::search_products(self).await
    }

    async fn get_product_details(&self, sku: &str) -> Result<Value, FetchError> {
        RgDealersProvider::get_product_details(self, sku).await
    }
}
