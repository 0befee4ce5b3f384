//! Service Self-Metrics
//!
//! Counters and histograms describing the exporter itself, exposed next to
//! the transfer metrics on the stream endpoint.

use std::time::Duration;

use prometheus::core::Collector;
use prometheus::proto::MetricFamily;
use prometheus::{HistogramOpts, HistogramVec, IntCounterVec, Opts, Registry};

pub const TRANSACTIONS_METRIC_NAME: &str = "chainwatch_ingest_transactions_total";
pub const TRANSFERS_METRIC_NAME: &str = "chainwatch_ingest_transfers_total";
pub const SCRAPE_METRIC_NAME: &str = "chainwatch_scrape_duration_seconds";

/// Outcome of one delivered transaction or transfer event
///
/// `Processed` and `Duplicate` count transactions; the rest count transfer
/// events and land in a separate counter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IngestOutcome {
    /// A transaction passed deduplication
    Processed,
    /// A transaction was already seen
    Duplicate,
    /// A transfer event could not be parsed
    Malformed,
    /// A transfer was at or below the threshold
    BelowThreshold,
    /// A transfer was projected
    Accepted,
}

impl IngestOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            IngestOutcome::Processed => "processed",
            IngestOutcome::Duplicate => "duplicate",
            IngestOutcome::Malformed => "malformed",
            IngestOutcome::BelowThreshold => "below_threshold",
            IngestOutcome::Accepted => "accepted",
        }
    }

    /// Whether the outcome is about a whole transaction
    pub fn is_transaction(&self) -> bool {
        matches!(self, IngestOutcome::Processed | IngestOutcome::Duplicate)
    }
}

/// Registry of the service's own metrics
pub struct ServiceMetrics {
    registry: Registry,
    transactions: IntCounterVec,
    transfers: IntCounterVec,
    scrape_duration: HistogramVec,
}

impl ServiceMetrics {
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();
        let transactions = IntCounterVec::new(
            Opts::new(TRANSACTIONS_METRIC_NAME, "Delivered transactions by outcome"),
            &["outcome"],
        )?;
        let transfers = IntCounterVec::new(
            Opts::new(TRANSFERS_METRIC_NAME, "Transfer events by outcome"),
            &["outcome"],
        )?;
        let scrape_duration = HistogramVec::new(
            HistogramOpts::new(SCRAPE_METRIC_NAME, "Time spent answering a scrape"),
            &["endpoint"],
        )?;
        registry.register(Box::new(transactions.clone()))?;
        registry.register(Box::new(transfers.clone()))?;
        registry.register(Box::new(scrape_duration.clone()))?;
        Ok(Self {
            registry,
            transactions,
            transfers,
            scrape_duration,
        })
    }

    fn counter_for(&self, outcome: IngestOutcome) -> &IntCounterVec {
        if outcome.is_transaction() {
            &self.transactions
        } else {
            &self.transfers
        }
    }

    pub fn record_ingest(&self, outcome: IngestOutcome) {
        self.counter_for(outcome)
            .with_label_values(&[outcome.as_str()])
            .inc();
    }

    /// Current count for an outcome; reading never creates the series
    pub fn ingest_count(&self, outcome: IngestOutcome) -> u64 {
        self.counter_for(outcome)
            .collect()
            .iter()
            .flat_map(|family| family.get_metric())
            .find(|metric| {
                metric.get_label().iter().any(|pair| {
                    pair.get_name() == "outcome" && pair.get_value() == outcome.as_str()
                })
            })
            .map(|metric| metric.get_counter().get_value() as u64)
            .unwrap_or(0)
    }

    pub fn observe_scrape(&self, endpoint: &str, elapsed: Duration) {
        self.scrape_duration
            .with_label_values(&[endpoint])
            .observe(elapsed.as_secs_f64());
    }

    pub fn gather(&self) -> Vec<MetricFamily> {
        self.registry.gather()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ingest_counts_by_outcome() {
        let metrics = ServiceMetrics::new().unwrap();
        metrics.record_ingest(IngestOutcome::Accepted);
        metrics.record_ingest(IngestOutcome::Accepted);
        metrics.record_ingest(IngestOutcome::Duplicate);

        assert_eq!(metrics.ingest_count(IngestOutcome::Accepted), 2);
        assert_eq!(metrics.ingest_count(IngestOutcome::Duplicate), 1);
        assert_eq!(metrics.ingest_count(IngestOutcome::Malformed), 0);
    }

    #[test]
    fn test_transaction_and_transfer_outcomes_are_split() {
        let metrics = ServiceMetrics::new().unwrap();
        metrics.record_ingest(IngestOutcome::Processed);
        metrics.record_ingest(IngestOutcome::BelowThreshold);

        let families = metrics.gather();
        let outcomes_of = |name: &str| -> Vec<String> {
            families
                .iter()
                .filter(|f| f.get_name() == name)
                .flat_map(|f| f.get_metric())
                .flat_map(|m| m.get_label())
                .map(|l| l.get_value().to_string())
                .collect()
        };
        assert_eq!(outcomes_of(TRANSACTIONS_METRIC_NAME), vec!["processed"]);
        assert_eq!(outcomes_of(TRANSFERS_METRIC_NAME), vec!["below_threshold"]);
    }

    #[test]
    fn test_reading_count_does_not_create_series() {
        let metrics = ServiceMetrics::new().unwrap();
        assert_eq!(metrics.ingest_count(IngestOutcome::Malformed), 0);
        assert_eq!(metrics.ingest_count(IngestOutcome::Duplicate), 0);
        assert!(metrics.gather().is_empty());
    }

    #[test]
    fn test_gather_includes_scrape_histogram() {
        let metrics = ServiceMetrics::new().unwrap();
        metrics.observe_scrape("/metrics/stream", Duration::from_millis(3));

        let names: Vec<String> = metrics
            .gather()
            .iter()
            .map(|f| f.get_name().to_string())
            .collect();
        assert!(names.contains(&SCRAPE_METRIC_NAME.to_string()));
    }
}
