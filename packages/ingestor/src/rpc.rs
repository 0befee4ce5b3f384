//! Node RPC Transport
//!
//! JSON-RPC 2.0 over HTTP against a Tendermint/CometBFT node.
//! Holds the connection settings and a thin client that turns RPC envelopes
//! into typed results.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};

/// Default node RPC endpoint
pub const DEFAULT_RPC_URL: &str = "http://127.0.0.1:26657";

/// Per-request timeout in milliseconds
pub const REQUEST_TIMEOUT_MS: u64 = 15000;

/// Errors that can occur while talking to the node
#[derive(Error, Debug)]
pub enum RpcError {
    #[error("Request to {0} timed out")]
    Timeout(String),

    #[error("HTTP transport error: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("RPC error {code}: {message} {data}")]
    Rpc {
        code: i64,
        message: String,
        data: String,
    },

    #[error("Response for '{0}' carried neither result nor error")]
    EmptyResponse(String),

    #[error("Failed to decode response: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("Invalid RPC url: {0}")]
    InvalidUrl(String),
}

impl RpcError {
    /// Whether the request simply ran out of time before the node answered
    pub fn is_timeout(&self) -> bool {
        match self {
            RpcError::Timeout(_) => true,
            RpcError::Transport(e) => e.is_timeout(),
            _ => false,
        }
    }
}

/// Configuration for the node RPC connection
#[derive(Debug, Clone)]
pub struct RpcConfig {
    /// Base URL of the node RPC server
    pub url: String,
    /// Per-request timeout in milliseconds
    pub timeout_ms: u64,
}

impl Default for RpcConfig {
    fn default() -> Self {
        Self {
            url: DEFAULT_RPC_URL.to_string(),
            timeout_ms: REQUEST_TIMEOUT_MS,
        }
    }
}

impl RpcConfig {
    /// Create a new config pointing at the given node URL
    pub fn with_url(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Default::default()
        }
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

/// Validate that a URL looks like an HTTP(S) RPC endpoint
pub fn validate_rpc_url(url: &str) -> Result<(), RpcError> {
    if url.is_empty() {
        return Err(RpcError::InvalidUrl("URL cannot be empty".to_string()));
    }
    if !url.starts_with("http://") && !url.starts_with("https://") {
        return Err(RpcError::InvalidUrl(format!(
            "'{}' must start with http:// or https://",
            url
        )));
    }
    Ok(())
}

#[derive(Debug, Serialize)]
struct RpcRequest<'a, P> {
    jsonrpc: &'static str,
    id: u64,
    method: &'a str,
    params: P,
}

#[derive(Debug, Deserialize)]
struct RpcResponse<R> {
    result: Option<R>,
    error: Option<RpcErrorBody>,
}

#[derive(Debug, Deserialize)]
struct RpcErrorBody {
    code: i64,
    #[serde(default)]
    message: String,
    #[serde(default)]
    data: String,
}

/// Unwrap a JSON-RPC response body into its result
fn decode_response<R: DeserializeOwned>(method: &str, body: &[u8]) -> Result<R, RpcError> {
    let response: RpcResponse<R> = serde_json::from_slice(body)?;
    if let Some(err) = response.error {
        return Err(RpcError::Rpc {
            code: err.code,
            message: err.message,
            data: err.data,
        });
    }
    response
        .result
        .ok_or_else(|| RpcError::EmptyResponse(method.to_string()))
}

/// JSON-RPC client for a single node
pub struct RpcClient {
    config: RpcConfig,
    http: reqwest::Client,
    next_id: AtomicU64,
}

impl RpcClient {
    /// Create a client for the given configuration
    pub fn new(config: RpcConfig) -> Result<Self, RpcError> {
        validate_rpc_url(&config.url)?;
        let http = reqwest::Client::builder().timeout(config.timeout()).build()?;
        Ok(Self {
            config,
            http,
            next_id: AtomicU64::new(0),
        })
    }

    /// Create a client with default settings for the given URL
    pub fn with_url(url: impl Into<String>) -> Result<Self, RpcError> {
        Self::new(RpcConfig::with_url(url))
    }

    pub fn url(&self) -> &str {
        &self.config.url
    }

    pub fn config(&self) -> &RpcConfig {
        &self.config
    }

    /// Check the node answers at all; used as the initial connection check
    pub async fn health(&self) -> Result<(), RpcError> {
        info!("Checking node RPC at {}", self.config.url);
        let _: serde_json::Value = self.call("health", serde_json::json!({})).await?;
        info!("Node RPC is reachable");
        Ok(())
    }

    /// Issue a JSON-RPC call and decode its result
    pub async fn call<P, R>(&self, method: &str, params: P) -> Result<R, RpcError>
    where
        P: Serialize,
        R: DeserializeOwned,
    {
        self.call_with_timeout(method, params, self.config.timeout())
            .await
    }

    /// Issue a JSON-RPC call with an explicit deadline
    pub async fn call_with_timeout<P, R>(
        &self,
        method: &str,
        params: P,
        timeout: Duration,
    ) -> Result<R, RpcError>
    where
        P: Serialize,
        R: DeserializeOwned,
    {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let request = RpcRequest {
            jsonrpc: "2.0",
            id,
            method,
            params,
        };
        debug!(method, id, "Sending RPC request");

        let response = self
            .http
            .post(&self.config.url)
            .timeout(timeout)
            .json(&request)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    RpcError::Timeout(method.to_string())
                } else {
                    RpcError::Transport(e)
                }
            })?;
        let body = response.bytes().await?;
        decode_response(method, &body)
    }
}
