//! Transfer Filtering
//!
//! The subscription predicate sent to the node and the threshold gate applied
//! to parsed transfers.

use std::fmt;

use crate::parser::TransferRecord;

/// Default minimum amount (exclusive) for a transfer to be reported
pub const DEFAULT_THRESHOLD: f64 = 1e11;

/// Event key carrying the event kind in node queries
pub const EVENT_TYPE_KEY: &str = "tm.event";

/// Event kind value for executed transactions
pub const EVENT_TX_VALUE: &str = "Tx";

/// Message action of a bank send
pub const MSG_SEND_ACTION: &str = "/cosmos.bank.v1beta1.MsgSend";

/// Conjunction of tag equalities understood by the node's query language
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct TransferQuery {
    conditions: Vec<(String, String)>,
}

impl TransferQuery {
    pub fn new() -> Self {
        Self::default()
    }

    /// Transactions carrying a bank `MsgSend`
    pub fn bank_send() -> Self {
        Self::new()
            .and(EVENT_TYPE_KEY, EVENT_TX_VALUE)
            .and("message.action", MSG_SEND_ACTION)
    }

    /// Add a `key='value'` condition
    pub fn and(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.conditions.push((key.into(), value.into()));
        self
    }

    pub fn is_empty(&self) -> bool {
        self.conditions.is_empty()
    }
}

impl fmt::Display for TransferQuery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, (key, value)) in self.conditions.iter().enumerate() {
            if i > 0 {
                f.write_str(" AND ")?;
            }
            // Single quotes delimit values; escape embedded ones.
            write!(f, "{}='{}'", key, value.replace('\'', "\\'"))?;
        }
        Ok(())
    }
}

/// Drops transfers that are not strictly above a configured amount
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ThresholdGate {
    threshold: f64,
}

impl ThresholdGate {
    pub fn new(threshold: f64) -> Self {
        Self { threshold }
    }

    pub fn threshold(&self) -> f64 {
        self.threshold
    }

    /// `true` iff the record's amount strictly exceeds the threshold
    pub fn accept(&self, record: &TransferRecord) -> bool {
        record.amount > self.threshold
    }
}

impl Default for ThresholdGate {
    fn default() -> Self {
        Self::new(DEFAULT_THRESHOLD)
    }
}
