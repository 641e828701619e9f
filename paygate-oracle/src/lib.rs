//! Price oracle client.
//!
//! Fetches the current USD spot price of a token so the backend can convert
//! its fixed fiat price into a token amount at session-creation time. The
//! oracle is a stateless leaf dependency: one bounded HTTP request per call,
//! no caching, no retries — the caller decides how to react to a failure.

use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;
use tracing::debug;

/// Default price API endpoint (CoinGecko simple-price API).
pub const DEFAULT_ORACLE_URL: &str = "https://api.coingecko.com/api/v3";

const DEFAULT_TIMEOUT_SECS: u64 = 10;

/// Errors from a rate lookup. All of them mean the session cannot be priced;
/// the transport variants are retryable from the caller's point of view.
#[derive(Debug, Error)]
pub enum OracleError {
    #[error("price request failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("malformed price response: {0}")]
    Malformed(String),
}

/// Oracle endpoint configuration.
#[derive(Debug, Clone)]
pub struct OracleConfig {
    /// Base URL of the price API.
    pub base_url: String,
    /// Per-request timeout.
    pub timeout: Duration,
}

impl Default for OracleConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_ORACLE_URL.to_string(),
            timeout: Duration::from_secs(DEFAULT_TIMEOUT_SECS),
        }
    }
}

impl OracleConfig {
    /// Use a custom price API base URL.
    pub fn with_base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = url.into();
        self
    }

    /// Set the per-request timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

/// Source of a current USD exchange rate for an asset.
#[async_trait]
pub trait RateSource: Send + Sync {
    /// Current USD price of one unit of `asset_id`.
    async fn rate_usd(&self, asset_id: &str) -> Result<f64, OracleError>;
}

/// [`RateSource`] backed by the CoinGecko simple-price API.
#[derive(Clone)]
pub struct CoinGeckoOracle {
    config: OracleConfig,
    client: reqwest::Client,
}

impl CoinGeckoOracle {
    pub fn new(config: OracleConfig) -> Self {
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .expect("failed to build price oracle http client");
        Self { config, client }
    }
}

impl Default for CoinGeckoOracle {
    fn default() -> Self {
        Self::new(OracleConfig::default())
    }
}

#[async_trait]
impl RateSource for CoinGeckoOracle {
    async fn rate_usd(&self, asset_id: &str) -> Result<f64, OracleError> {
        let url = format!(
            "{}/simple/price?ids={}&vs_currencies=usd",
            self.config.base_url, asset_id
        );
        debug!(%asset_id, "fetching spot price");

        let response = self.client.get(&url).send().await?.error_for_status()?;
        let body: Value = response.json().await?;
        parse_rate(&body, asset_id)
    }
}

/// Extract and validate the USD rate from a simple-price response body,
/// e.g. `{"solana": {"usd": 147.23}}`.
fn parse_rate(body: &Value, asset_id: &str) -> Result<f64, OracleError> {
    let rate = body
        .get(asset_id)
        .and_then(|entry| entry.get("usd"))
        .and_then(Value::as_f64)
        .ok_or_else(|| {
            OracleError::Malformed(format!("no usd rate for '{asset_id}' in response"))
        })?;

    if !rate.is_finite() || rate <= 0.0 {
        return Err(OracleError::Malformed(format!(
            "non-positive usd rate {rate} for '{asset_id}'"
        )));
    }

    Ok(rate)
}
