//! Oracle Vote Penalty Query
//!
//! One-shot lookup of a validator's oracle vote penalty counters through the
//! node's REST gateway, rendered as a single counter with a `type` label.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use prometheus::core::Collector;
use prometheus::{CounterVec, Opts};
use reqwest::Url;
use serde::{Deserialize, Deserializer};
use thiserror::Error;
use tracing::{debug, error, info};
use uuid::Uuid;

use crate::exporter::{encode_families, ExportError};

/// Endpoint path serving vote penalty metrics
pub const ORACLE_ENDPOINT: &str = "/metrics/oracle";

pub const VOTE_PENALTY_METRIC_NAME: &str = "cosmos_oracle_vote_penalty_count";

/// Default REST gateway of the node
pub const DEFAULT_LCD_URL: &str = "http://127.0.0.1:1317";

/// Timeout of the single upstream call
pub const QUERY_TIMEOUT_MS: u64 = 5000;

/// Longest accepted validator address
pub const MAX_ADDRESS_LEN: usize = 128;

const PENALTY_PATH_PREFIX: [&str; 4] = ["sei-protocol", "sei-chain", "oracle", "validators"];

/// Errors that can occur while querying penalties
#[derive(Error, Debug)]
pub enum OracleError {
    #[error("Validator address is required")]
    MissingAddress,

    #[error("Invalid validator address: {0}")]
    InvalidAddress(String),

    #[error("Invalid gateway URL: {0}")]
    InvalidBaseUrl(String),

    #[error("Vote penalty query failed: {0}")]
    Query(#[from] reqwest::Error),

    #[error("Failed to build vote penalty metric: {0}")]
    Metric(#[from] prometheus::Error),
}

fn u64_or_string<'de, D: Deserializer<'de>>(deserializer: D) -> Result<u64, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum U64OrString {
        Int(u64),
        Str(String),
    }

    match U64OrString::deserialize(deserializer)? {
        U64OrString::Int(n) => Ok(n),
        U64OrString::Str(s) => s.parse().map_err(serde::de::Error::custom),
    }
}

/// Miss / abstain / success counts of one validator
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
pub struct VotePenaltyCounter {
    #[serde(default, deserialize_with = "u64_or_string")]
    pub miss_count: u64,
    #[serde(default, deserialize_with = "u64_or_string")]
    pub abstain_count: u64,
    #[serde(default, deserialize_with = "u64_or_string")]
    pub success_count: u64,
}

#[derive(Debug, Deserialize)]
struct VotePenaltyResponse {
    vote_penalty_counter: VotePenaltyCounter,
}

/// Build the counter metric for a validator's penalties
pub fn penalty_metric(
    counter: Option<VotePenaltyCounter>,
    const_labels: &HashMap<String, String>,
) -> Result<CounterVec, OracleError> {
    let metric = CounterVec::new(
        Opts::new(VOTE_PENALTY_METRIC_NAME, "Vote penalty miss count")
            .const_labels(const_labels.clone()),
        &["type"],
    )?;
    if let Some(counter) = counter {
        metric
            .with_label_values(&["miss"])
            .inc_by(counter.miss_count as f64);
        metric
            .with_label_values(&["abstain"])
            .inc_by(counter.abstain_count as f64);
        metric
            .with_label_values(&["success"])
            .inc_by(counter.success_count as f64);
    }
    Ok(metric)
}

/// Check that an address is a plain bech32-style string
pub fn validate_address(address: &str) -> Result<(), OracleError> {
    if address.is_empty() {
        return Err(OracleError::MissingAddress);
    }
    if address.len() > MAX_ADDRESS_LEN || !address.chars().all(|c| c.is_ascii_alphanumeric()) {
        return Err(OracleError::InvalidAddress(address.to_string()));
    }
    Ok(())
}

/// REST client for the oracle module
pub struct VotePenaltyClient {
    base_url: Url,
    http: reqwest::Client,
    const_labels: HashMap<String, String>,
}

impl VotePenaltyClient {
    pub fn new(base_url: &str, const_labels: HashMap<String, String>) -> Result<Self, OracleError> {
        let base_url =
            Url::parse(base_url).map_err(|e| OracleError::InvalidBaseUrl(e.to_string()))?;
        if base_url.cannot_be_a_base() {
            return Err(OracleError::InvalidBaseUrl(base_url.to_string()));
        }
        let http = reqwest::Client::builder()
            .timeout(Duration::from_millis(QUERY_TIMEOUT_MS))
            .build()?;
        Ok(Self {
            base_url,
            http,
            const_labels,
        })
    }

    /// Penalty counter URL of one validator
    pub fn penalty_url(&self, address: &str) -> Result<Url, OracleError> {
        validate_address(address)?;
        join_address(&self.base_url, address)
    }

    /// Fetch the counters for one validator
    pub async fn query(&self, address: &str) -> Result<VotePenaltyCounter, OracleError> {
        let url = self.penalty_url(address)?;
        let response: VotePenaltyResponse = self
            .http
            .get(url)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        Ok(response.vote_penalty_counter)
    }

    /// Query and render; a failed query renders an empty metric
    pub async fn scrape(&self, address: &str) -> Result<String, ExportError> {
        let request_start = Instant::now();
        let request_id = Uuid::new_v4();

        debug!(request_id = %request_id, address, "Started querying oracle feeder metrics");
        let counter = match self.query(address).await {
            Ok(counter) => {
                debug!(
                    request_id = %request_id,
                    request_time = request_start.elapsed().as_secs_f64(),
                    "Finished querying oracle feeder metrics"
                );
                Some(counter)
            }
            Err(e) => {
                error!(request_id = %request_id, "Could not get oracle feeder metrics: {}", e);
                None
            }
        };

        let body = match penalty_metric(counter, &self.const_labels) {
            Ok(metric) => encode_families(&metric.collect()),
            Err(OracleError::Metric(e)) => Err(ExportError::Collect(e)),
            Err(e) => {
                error!(request_id = %request_id, "Could not build oracle metric: {}", e);
                Ok(String::new())
            }
        };

        info!(
            request_id = %request_id,
            method = "GET",
            endpoint = ORACLE_ENDPOINT,
            request_time = request_start.elapsed().as_secs_f64(),
            "Request processed"
        );
        body
    }
}

/// Append the penalty path to `base`, the address as one escaped segment
fn join_address(base: &Url, address: &str) -> Result<Url, OracleError> {
    let mut url = base.clone();
    url.path_segments_mut()
        .map_err(|_| OracleError::InvalidBaseUrl(base.to_string()))?
        .pop_if_empty()
        .extend(PENALTY_PATH_PREFIX)
        .push(address)
        .push("vote_penalty_counter");
    Ok(url)
}
