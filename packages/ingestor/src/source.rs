//! Event Source
//!
//! Delivers batches of matching transactions from the node.
//!
//! Two implementations share the [`EventSource`] trait:
//! - [`EventLogSource`] long-polls the node's cursor-based `events` log and
//!   reports a gap when the log has already discarded items newer than the
//!   last cursor it delivered. This is the canonical source.
//! - [`LatestTxSource`] polls `tx_search` for the single most recent matching
//!   transaction on a fixed interval. It cannot detect gaps and misses
//!   transactions whenever more than one lands inside an interval, so it is
//!   only meant for nodes that do not serve the event log.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::time::sleep;
use tracing::{debug, warn};

use crate::rpc::{RpcClient, RpcError};

/// Default number of items requested per event-log page
pub const DEFAULT_MAX_ITEMS: u32 = 100;

/// Default long-poll wait for the event log, in milliseconds
pub const DEFAULT_WAIT_TIME_MS: u64 = 10000;

/// Default interval between fallback polls, in milliseconds
pub const DEFAULT_POLL_INTERVAL_MS: u64 = 300;

/// Default request timeout for fallback polls, in milliseconds
pub const DEFAULT_POLL_TIMEOUT_MS: u64 = 500;

/// Errors reported by an event source
#[derive(Error, Debug)]
pub enum SourceError {
    #[error("Missed items: newest seen {newest_seen}, oldest still present {oldest_present}")]
    MissedItems {
        newest_seen: Cursor,
        oldest_present: Cursor,
    },

    #[error("Transient query failure: {0}")]
    Transient(#[source] RpcError),

    #[error("Query failed: {0}")]
    Query(#[source] RpcError),

    #[error("Malformed event data: {0}")]
    Malformed(String),

    #[error("Event source unavailable: {0}")]
    Unavailable(#[source] RpcError),
}

impl SourceError {
    /// The source could not deliver every matching item since its last batch
    pub fn is_gap(&self) -> bool {
        matches!(self, SourceError::MissedItems { .. })
    }

    /// A failed fetch that is worth retrying as-is
    pub fn is_transient(&self) -> bool {
        matches!(self, SourceError::Transient(_))
    }
}

/// Position in the node's event log
///
/// Rendered by the node as `<16 hex digit timestamp>-<4 hex digit sequence>`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Cursor {
    timestamp: u64,
    sequence: u16,
}

impl Cursor {
    pub fn new(timestamp: u64, sequence: u16) -> Self {
        Self {
            timestamp,
            sequence,
        }
    }

    /// Parse a cursor where the empty string means "no cursor"
    pub fn parse_optional(s: &str) -> Result<Option<Self>, SourceError> {
        if s.is_empty() {
            return Ok(None);
        }
        s.parse().map(Some)
    }
}

impl FromStr for Cursor {
    type Err = SourceError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let malformed = || SourceError::Malformed(format!("invalid cursor '{}'", s));
        let (ts, seq) = s.split_once('-').ok_or_else(malformed)?;
        let timestamp = u64::from_str_radix(ts, 16).map_err(|_| malformed())?;
        let sequence = u16::from_str_radix(seq, 16).map_err(|_| malformed())?;
        Ok(Self::new(timestamp, sequence))
    }
}

impl fmt::Display for Cursor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}-{:04x}", self.timestamp, self.sequence)
    }
}

/// One key/value attribute of an ABCI event
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct EventAttribute {
    #[serde(default, deserialize_with = "null_as_empty")]
    pub key: String,
    #[serde(default, deserialize_with = "null_as_empty")]
    pub value: String,
}

impl EventAttribute {
    pub fn new(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
        }
    }
}

/// An ABCI event emitted while executing a transaction
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Event {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub attributes: Vec<EventAttribute>,
}

impl Event {
    pub fn new(kind: impl Into<String>, attributes: Vec<EventAttribute>) -> Self {
        Self {
            kind: kind.into(),
            attributes,
        }
    }
}

/// All events of one delivered transaction, keyed by its content hash
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TxEvents {
    /// Lowercase hex SHA-256 of the raw transaction bytes
    pub hash: String,
    pub height: i64,
    pub events: Vec<Event>,
}

/// Transactions delivered together by one fetch
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EventBatch {
    pub items: Vec<TxEvents>,
}

impl EventBatch {
    pub fn new(items: Vec<TxEvents>) -> Self {
        Self { items }
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

/// A remote feed of matching transactions
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait EventSource: Send + 'static {
    /// Human-readable description used in logs
    fn describe(&self) -> String;

    /// Establish the connection; called once before the first fetch
    async fn connect(&mut self) -> Result<(), SourceError>;

    /// Wait for and return the next batch of matching transactions
    async fn next_batch(&mut self) -> Result<EventBatch, SourceError>;

    /// Forget delivery position so the next fetch resumes from the current head
    fn reset(&mut self);
}

fn null_as_empty<'de, D: Deserializer<'de>>(deserializer: D) -> Result<String, D::Error> {
    Ok(Option::<String>::deserialize(deserializer)?.unwrap_or_default())
}

/// Tendermint encodes 64-bit integers as JSON strings
fn int_or_string<'de, D: Deserializer<'de>>(deserializer: D) -> Result<i64, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum IntOrString {
        Int(i64),
        Str(String),
    }

    match IntOrString::deserialize(deserializer)? {
        IntOrString::Int(n) => Ok(n),
        IntOrString::Str(s) => s.parse().map_err(D::Error::custom),
    }
}

#[derive(Debug, Default, Deserialize)]
struct ExecResult {
    #[serde(default)]
    events: Vec<Event>,
}

#[derive(Debug, Deserialize)]
struct TxResult {
    #[serde(default, deserialize_with = "int_or_string")]
    height: i64,
    #[serde(default)]
    tx: String,
    #[serde(default)]
    result: ExecResult,
}

/// Compute the transaction hash the node uses: SHA-256 over the raw bytes
pub fn tx_hash(raw_tx_base64: &str) -> Result<String, SourceError> {
    let raw = BASE64
        .decode(raw_tx_base64)
        .map_err(|e| SourceError::Malformed(format!("transaction bytes: {}", e)))?;
    Ok(hex::encode(Sha256::digest(&raw)))
}

/// Decode the `value` of a `tendermint/event/Tx` payload
///
/// Older nodes nest the result under `TxResult`, newer ones inline it.
pub fn decode_tx_event(value: &serde_json::Value) -> Result<TxEvents, SourceError> {
    let inner = value
        .get("TxResult")
        .or_else(|| value.get("tx_result"))
        .unwrap_or(value);
    let tx_result = TxResult::deserialize(inner)
        .map_err(|e| SourceError::Malformed(format!("tx result: {}", e)))?;
    Ok(TxEvents {
        hash: tx_hash(&tx_result.tx)?,
        height: tx_result.height,
        events: tx_result.result.events,
    })
}

// ==================== Event log ====================

/// Configuration for the cursor-based event log source
#[derive(Debug, Clone)]
pub struct EventLogConfig {
    /// Items requested per page
    pub max_items: u32,
    /// How long the node may hold a request open waiting for new items
    pub wait_time_ms: u64,
}

impl Default for EventLogConfig {
    fn default() -> Self {
        Self {
            max_items: DEFAULT_MAX_ITEMS,
            wait_time_ms: DEFAULT_WAIT_TIME_MS,
        }
    }
}

#[derive(Debug, Serialize)]
struct EventFilter<'a> {
    query: &'a str,
}

#[derive(Debug, Serialize)]
struct EventsRequest<'a> {
    filter: EventFilter<'a>,
    #[serde(rename = "maxItems")]
    max_items: String,
    before: String,
    after: String,
    #[serde(rename = "waitTime")]
    wait_time: String,
}

#[derive(Debug, Deserialize)]
struct EventItemData {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    value: serde_json::Value,
}

#[derive(Debug, Deserialize)]
struct EventItem {
    cursor: String,
    #[serde(default)]
    event: String,
    data: EventItemData,
}

impl EventItem {
    fn is_tx(&self) -> bool {
        self.event.eq_ignore_ascii_case("tx") || self.data.kind.ends_with("/Tx")
    }
}

#[derive(Debug, Deserialize)]
struct EventsResult {
    #[serde(default)]
    items: Vec<EventItem>,
    #[serde(default)]
    more: bool,
    #[serde(default)]
    oldest: String,
    #[serde(default)]
    newest: String,
}

/// Gap-aware source reading the node's `events` log
pub struct EventLogSource {
    client: Arc<RpcClient>,
    query: String,
    config: EventLogConfig,
    after: Option<Cursor>,
}

impl EventLogSource {
    pub fn new(client: Arc<RpcClient>, query: impl Into<String>, config: EventLogConfig) -> Self {
        Self {
            client,
            query: query.into(),
            config,
            after: None,
        }
    }

    /// Cursor of the newest item delivered so far
    pub fn position(&self) -> Option<Cursor> {
        self.after
    }

    async fn request_page(
        &self,
        after: Option<Cursor>,
        before: Option<Cursor>,
        wait: Duration,
    ) -> Result<EventsResult, RpcError> {
        let request = EventsRequest {
            filter: EventFilter { query: &self.query },
            max_items: self.config.max_items.to_string(),
            before: before.map(|c| c.to_string()).unwrap_or_default(),
            after: after.map(|c| c.to_string()).unwrap_or_default(),
            wait_time: wait.as_nanos().to_string(),
        };
        // The node holds the request for up to `wait` before answering.
        let deadline = wait + self.client.config().timeout();
        self.client
            .call_with_timeout("events", request, deadline)
            .await
    }

    async fn fetch_page(&self, before: Option<Cursor>) -> Result<EventsResult, SourceError> {
        let wait = Duration::from_millis(self.config.wait_time_ms);
        self.request_page(self.after, before, wait)
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    SourceError::Transient(e)
                } else {
                    SourceError::Query(e)
                }
            })
    }
}

/// Fail with a gap when the log no longer holds the item after `after`
fn check_gap(after: Option<Cursor>, oldest: Option<Cursor>) -> Result<(), SourceError> {
    match (after, oldest) {
        (Some(newest_seen), Some(oldest_present)) if oldest_present > newest_seen => {
            Err(SourceError::MissedItems {
                newest_seen,
                oldest_present,
            })
        }
        _ => Ok(()),
    }
}

/// Turn event-log items (newest first) into a batch in delivery order
fn items_to_batch(items: Vec<EventItem>) -> EventBatch {
    let mut batch = Vec::with_capacity(items.len());
    for item in items.into_iter().rev().filter(EventItem::is_tx) {
        match decode_tx_event(&item.data.value) {
            Ok(tx) => batch.push(tx),
            Err(e) => warn!(cursor = %item.cursor, "Skipping undecodable event log item: {}", e),
        }
    }
    EventBatch::new(batch)
}

#[async_trait]
impl EventSource for EventLogSource {
    fn describe(&self) -> String {
        format!("event log at {} for {}", self.client.url(), self.query)
    }

    async fn connect(&mut self) -> Result<(), SourceError> {
        self.client.health().await.map_err(SourceError::Unavailable)?;

        // Start at the head of the log; items already there are not delivered.
        let head = self
            .request_page(None, None, Duration::ZERO)
            .await
            .map_err(SourceError::Unavailable)?;
        self.after = Cursor::parse_optional(&head.newest)?;
        debug!(after = ?self.after, "Positioned at event log head");
        Ok(())
    }

    async fn next_batch(&mut self) -> Result<EventBatch, SourceError> {
        let mut items = Vec::new();
        let mut newest = None;
        let mut before = None;

        loop {
            let page = self.fetch_page(before).await?;
            check_gap(self.after, Cursor::parse_optional(&page.oldest)?)?;
            if newest.is_none() {
                newest = Cursor::parse_optional(&page.newest)?;
            }

            let last = match page.items.last() {
                Some(item) => Some(item.cursor.parse::<Cursor>()?),
                None => None,
            };
            let more = page.more;
            items.extend(page.items);

            // Only page backwards when catching up from a known position;
            // after a reset the most recent page is all that is wanted.
            match last {
                Some(last) if more && self.after.is_some() => before = Some(last),
                _ => break,
            }
        }

        if newest.is_some() {
            self.after = newest;
        }
        debug!(items = items.len(), after = ?self.after, "Fetched event log");
        Ok(items_to_batch(items))
    }

    fn reset(&mut self) {
        self.after = None;
    }
}

// ==================== Polling fallback ====================

/// Configuration for the polling fallback source
#[derive(Debug, Clone)]
pub struct PollConfig {
    /// Delay between polls in milliseconds
    pub interval_ms: u64,
    /// Per-request timeout in milliseconds
    pub timeout_ms: u64,
}

impl Default for PollConfig {
    fn default() -> Self {
        Self {
            interval_ms: DEFAULT_POLL_INTERVAL_MS,
            timeout_ms: DEFAULT_POLL_TIMEOUT_MS,
        }
    }
}

#[derive(Debug, Serialize)]
struct TxSearchRequest<'a> {
    query: &'a str,
    prove: bool,
    page: &'static str,
    per_page: &'static str,
    order_by: &'static str,
}

#[derive(Debug, Deserialize)]
struct SearchedTx {
    hash: String,
    #[serde(default, deserialize_with = "int_or_string")]
    height: i64,
    #[serde(default)]
    tx_result: ExecResult,
}

#[derive(Debug, Deserialize)]
struct TxSearchResult {
    #[serde(default)]
    txs: Vec<SearchedTx>,
}

/// Fallback source polling for the single most recent matching transaction
pub struct LatestTxSource {
    client: Arc<RpcClient>,
    query: String,
    config: PollConfig,
    polled: bool,
}

impl LatestTxSource {
    pub fn new(client: Arc<RpcClient>, query: impl Into<String>, config: PollConfig) -> Self {
        Self {
            client,
            query: query.into(),
            config,
            polled: false,
        }
    }
}

fn search_to_batch(result: TxSearchResult) -> EventBatch {
    EventBatch::new(
        result
            .txs
            .into_iter()
            .map(|tx| TxEvents {
                hash: tx.hash.to_ascii_lowercase(),
                height: tx.height,
                events: tx.tx_result.events,
            })
            .collect(),
    )
}

#[async_trait]
impl EventSource for LatestTxSource {
    fn describe(&self) -> String {
        format!(
            "latest-tx poll every {}ms at {} for {}",
            self.config.interval_ms,
            self.client.url(),
            self.query
        )
    }

    async fn connect(&mut self) -> Result<(), SourceError> {
        self.client.health().await.map_err(SourceError::Unavailable)
    }

    async fn next_batch(&mut self) -> Result<EventBatch, SourceError> {
        if self.polled {
            sleep(Duration::from_millis(self.config.interval_ms)).await;
        }
        self.polled = true;

        let request = TxSearchRequest {
            query: &self.query,
            prove: false,
            page: "1",
            per_page: "1",
            order_by: "desc",
        };
        let result: TxSearchResult = self
            .client
            .call_with_timeout(
                "tx_search",
                request,
                Duration::from_millis(self.config.timeout_ms),
            )
            .await
            .map_err(SourceError::Transient)?;
        Ok(search_to_batch(result))
    }

    fn reset(&mut self) {}
}
