//! Chain observer client.
//!
//! Answers one question for the session lifecycle: has any transaction
//! referencing a given marker reached the chain? The observer never decides
//! what a confirmation means — it reports evidence and the backend drives the
//! state transition. Absence of evidence is a normal outcome (the buyer
//! simply has not paid yet), not an error.

use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use thiserror::Error;
use tracing::debug;

/// Default Solana JSON-RPC endpoint.
pub const DEFAULT_RPC_URL: &str = "https://api.mainnet-beta.solana.com";

const DEFAULT_TIMEOUT_SECS: u64 = 10;

/// Errors from a chain lookup. All variants are retryable from the caller's
/// point of view: the next poll may succeed.
#[derive(Debug, Error)]
pub enum ChainError {
    #[error("rpc request failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("rpc error {code}: {message}")]
    Rpc { code: i64, message: String },
    #[error("malformed rpc response: {0}")]
    Malformed(String),
}

/// RPC endpoint configuration.
#[derive(Debug, Clone)]
pub struct ChainConfig {
    /// JSON-RPC endpoint URL.
    pub rpc_url: String,
    /// Per-request timeout.
    pub timeout: Duration,
}

impl Default for ChainConfig {
    fn default() -> Self {
        Self {
            rpc_url: DEFAULT_RPC_URL.to_string(),
            timeout: Duration::from_secs(DEFAULT_TIMEOUT_SECS),
        }
    }
}

impl ChainConfig {
    /// Use a custom RPC endpoint.
    pub fn with_rpc_url(mut self, url: impl Into<String>) -> Self {
        self.rpc_url = url.into();
        self
    }

    /// Set the per-request timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

/// Answers whether a transaction referencing `marker` has been observed.
#[async_trait]
pub trait ChainObserver: Send + Sync {
    async fn find_transaction_by_marker(&self, marker: &str) -> Result<bool, ChainError>;
}

/// [`ChainObserver`] backed by a Solana JSON-RPC node.
///
/// The reference marker is queried with `getSignaturesForAddress`: any
/// signature listed against the marker means the payer included it in a
/// transaction, which is the evidence the lifecycle needs.
#[derive(Clone)]
pub struct SolanaRpcObserver {
    config: ChainConfig,
    client: reqwest::Client,
}

impl SolanaRpcObserver {
    pub fn new(config: ChainConfig) -> Self {
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .expect("failed to build chain observer http client");
        Self { config, client }
    }
}

impl Default for SolanaRpcObserver {
    fn default() -> Self {
        Self::new(ChainConfig::default())
    }
}

#[async_trait]
impl ChainObserver for SolanaRpcObserver {
    async fn find_transaction_by_marker(&self, marker: &str) -> Result<bool, ChainError> {
        debug!("querying chain for reference marker");

        let request = json!({
            "jsonrpc": "2.0",
            "id": 1,
            "method": "getSignaturesForAddress",
            "params": [marker, { "limit": 1 }],
        });

        let response = self
            .client
            .post(&self.config.rpc_url)
            .json(&request)
            .send()
            .await?
            .error_for_status()?;

        let body: Value = response.json().await?;
        parse_signatures_response(&body)
    }
}

/// Interpret a `getSignaturesForAddress` response: a non-empty `result`
/// array means the marker was seen on-chain.
fn parse_signatures_response(body: &Value) -> Result<bool, ChainError> {
    if let Some(error) = body.get("error") {
        return Err(ChainError::Rpc {
            code: error.get("code").and_then(Value::as_i64).unwrap_or(0),
            message: error
                .get("message")
                .and_then(Value::as_str)
                .unwrap_or("unknown rpc error")
                .to_string(),
        });
    }

    let signatures = body
        .get("result")
        .and_then(Value::as_array)
        .ok_or_else(|| ChainError::Malformed("missing result array".to_string()))?;

    Ok(!signatures.is_empty())
}
