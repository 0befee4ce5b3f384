//! Metric Projection
//!
//! Holds the exported state for accepted transfers, keyed by
//! `(denom, sender, recipient)`. One of three projections is active per
//! deployment:
//!
//! - `ExpiringGauge` (default): the latest amount per label tuple, removed a
//!   fixed time after it was last written.
//! - `Counter`: cumulative amount per label tuple, never expires.
//! - `Histogram`: per-denom distribution over exponential buckets.
//!
//! The ingest task writes through [`MetricProjector::record`]; expiry timers
//! and scrapes run on other tasks, so all state sits behind a mutex.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use prometheus::core::Collector;
use prometheus::proto::MetricFamily;
use prometheus::{GaugeVec, HistogramOpts, HistogramVec, Opts};
use thiserror::Error;
use tokio::runtime::Handle;
use tokio::time::sleep;
use tracing::debug;

use crate::parser::TransferRecord;

/// Exported metric name for transfer amounts
pub const TRANSFER_METRIC_NAME: &str = "cosmos_bank_transfer_amount";

pub const TRANSFER_METRIC_HELP: &str = "Number of tokens transferred in a transfer message";

/// Label names of the full label tuple
pub const TRANSFER_LABELS: [&str; 3] = ["denom", "sender", "recipient"];

/// Default lifetime of an expiring sample
pub const DEFAULT_EXPIRY: Duration = Duration::from_secs(5 * 60);

/// Lowest histogram bucket bound; each following bucket is 10x the previous
pub const HISTOGRAM_BUCKET_START: f64 = 1e6;

pub const HISTOGRAM_BUCKET_COUNT: i32 = 10;

/// Errors that can occur while recording a transfer
#[derive(Error, Debug)]
pub enum ProjectorError {
    #[error("Expiring samples need a Tokio runtime to schedule their expiry")]
    NoRuntime,
}

/// Which projection a deployment runs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ProjectionKind {
    Counter,
    #[default]
    ExpiringGauge,
    Histogram,
}

impl ProjectionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProjectionKind::Counter => "counter",
            ProjectionKind::ExpiringGauge => "expiring-gauge",
            ProjectionKind::Histogram => "histogram",
        }
    }
}

impl fmt::Display for ProjectionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProjectionKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "counter" => Ok(ProjectionKind::Counter),
            "expiring-gauge" | "gauge" => Ok(ProjectionKind::ExpiringGauge),
            "histogram" => Ok(ProjectionKind::Histogram),
            other => Err(format!(
                "unknown projection '{}', expected counter, expiring-gauge or histogram",
                other
            )),
        }
    }
}

/// Identity of one exported time series
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TransferLabels {
    pub denom: String,
    pub sender: String,
    pub recipient: String,
}

impl TransferLabels {
    pub fn new(
        denom: impl Into<String>,
        sender: impl Into<String>,
        recipient: impl Into<String>,
    ) -> Self {
        Self {
            denom: denom.into(),
            sender: sender.into(),
            recipient: recipient.into(),
        }
    }

    fn values(&self) -> [&str; 3] {
        [&self.denom, &self.sender, &self.recipient]
    }
}

impl From<&TransferRecord> for TransferLabels {
    fn from(record: &TransferRecord) -> Self {
        Self::new(&record.denom, &record.sender, &record.recipient)
    }
}

/// Projector settings
#[derive(Debug, Clone)]
pub struct ProjectorConfig {
    pub kind: ProjectionKind,
    /// Lifetime of an expiring sample after its last write
    pub expiry: Duration,
    /// Labels attached to every exported series
    pub const_labels: HashMap<String, String>,
    /// Upper bounds of the histogram buckets
    pub buckets: Vec<f64>,
}

impl Default for ProjectorConfig {
    fn default() -> Self {
        Self {
            kind: ProjectionKind::default(),
            expiry: DEFAULT_EXPIRY,
            const_labels: HashMap::new(),
            buckets: default_buckets(),
        }
    }
}

impl ProjectorConfig {
    pub fn with_kind(kind: ProjectionKind) -> Self {
        Self {
            kind,
            ..Default::default()
        }
    }
}

/// `1e6, 1e7, ..., 1e15`
pub fn default_buckets() -> Vec<f64> {
    (0..HISTOGRAM_BUCKET_COUNT)
        .map(|k| HISTOGRAM_BUCKET_START * 10f64.powi(k))
        .collect()
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    // Every critical section leaves the map consistent, so a poisoned lock
    // still guards valid data.
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[derive(Debug, Clone, Copy)]
struct Sample {
    value: f64,
    version: u64,
}

/// Latest value per label tuple, each removed `ttl` after its last write
pub struct ExpiringGauge {
    samples: Mutex<HashMap<TransferLabels, Sample>>,
    next_version: AtomicU64,
    ttl: Duration,
}

impl ExpiringGauge {
    pub fn new(ttl: Duration) -> Arc<Self> {
        Arc::new(Self {
            samples: Mutex::new(HashMap::new()),
            next_version: AtomicU64::new(1),
            ttl,
        })
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Write a value and schedule its expiry; returns the new version token
    ///
    /// Must be called from within a Tokio runtime. Outside one the sample is
    /// not written, since it could never expire.
    pub fn set(
        self: &Arc<Self>,
        labels: TransferLabels,
        value: f64,
    ) -> Result<u64, ProjectorError> {
        let handle = Handle::try_current().map_err(|_| ProjectorError::NoRuntime)?;
        let version = {
            let mut samples = lock(&self.samples);
            let version = self.next_version.fetch_add(1, Ordering::Relaxed);
            samples.insert(labels.clone(), Sample { value, version });
            version
        };
        self.schedule_expiry(&handle, labels, version);
        Ok(version)
    }

    fn schedule_expiry(self: &Arc<Self>, handle: &Handle, labels: TransferLabels, version: u64) {
        let gauge: Weak<Self> = Arc::downgrade(self);
        let ttl = self.ttl;
        handle.spawn(async move {
            sleep(ttl).await;
            if let Some(gauge) = gauge.upgrade() {
                gauge.expire(&labels, version);
            }
        });
    }

    /// Remove the sample only if it still carries `version`
    pub fn expire(&self, labels: &TransferLabels, version: u64) -> bool {
        let mut samples = lock(&self.samples);
        match samples.get(labels) {
            Some(sample) if sample.version == version => {
                samples.remove(labels);
                debug!(denom = %labels.denom, sender = %labels.sender, "Sample expired");
                true
            }
            _ => false,
        }
    }

    /// Version token of the live sample, if any
    pub fn version(&self, labels: &TransferLabels) -> Option<u64> {
        lock(&self.samples).get(labels).map(|s| s.version)
    }

    pub fn snapshot(&self) -> HashMap<TransferLabels, f64> {
        lock(&self.samples)
            .iter()
            .map(|(labels, sample)| (labels.clone(), sample.value))
            .collect()
    }

    pub fn len(&self) -> usize {
        lock(&self.samples).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

enum Projection {
    Counter(Mutex<HashMap<TransferLabels, f64>>),
    ExpiringGauge(Arc<ExpiringGauge>),
    Histogram(HistogramVec),
}

/// Current exported state of accepted transfers
pub struct MetricProjector {
    kind: ProjectionKind,
    const_labels: HashMap<String, String>,
    projection: Projection,
}

impl MetricProjector {
    pub fn new(config: ProjectorConfig) -> Result<Self, prometheus::Error> {
        let projection = match config.kind {
            ProjectionKind::Counter => Projection::Counter(Mutex::new(HashMap::new())),
            ProjectionKind::ExpiringGauge => {
                Projection::ExpiringGauge(ExpiringGauge::new(config.expiry))
            }
            ProjectionKind::Histogram => {
                let opts = HistogramOpts::new(TRANSFER_METRIC_NAME, TRANSFER_METRIC_HELP)
                    .const_labels(config.const_labels.clone())
                    .buckets(config.buckets.clone());
                Projection::Histogram(HistogramVec::new(opts, &TRANSFER_LABELS[..1])?)
            }
        };
        Ok(Self {
            kind: config.kind,
            const_labels: config.const_labels,
            projection,
        })
    }

    pub fn kind(&self) -> ProjectionKind {
        self.kind
    }

    /// Fold an accepted transfer into the active projection
    pub fn record(&self, record: &TransferRecord) -> Result<(), ProjectorError> {
        match &self.projection {
            Projection::Counter(totals) => {
                *lock(totals).entry(TransferLabels::from(record)).or_insert(0.0) += record.amount;
            }
            Projection::ExpiringGauge(gauge) => {
                gauge.set(TransferLabels::from(record), record.amount)?;
            }
            Projection::Histogram(histogram) => {
                histogram
                    .with_label_values(&[&record.denom])
                    .observe(record.amount);
            }
        }
        Ok(())
    }

    /// The expiring gauge, when that projection is active
    pub fn expiring_gauge(&self) -> Option<&Arc<ExpiringGauge>> {
        match &self.projection {
            Projection::ExpiringGauge(gauge) => Some(gauge),
            _ => None,
        }
    }

    /// Live value per label tuple
    ///
    /// Gauge: latest amount. Counter: cumulative amount. Histogram: sum of
    /// observations per denom, with empty sender and recipient.
    pub fn snapshot(&self) -> HashMap<TransferLabels, f64> {
        match &self.projection {
            Projection::Counter(totals) => lock(totals).clone(),
            Projection::ExpiringGauge(gauge) => gauge.snapshot(),
            Projection::Histogram(histogram) => histogram
                .collect()
                .iter()
                .flat_map(|family| family.get_metric())
                .map(|metric| {
                    let denom = metric
                        .get_label()
                        .iter()
                        .find(|pair| pair.get_name() == TRANSFER_LABELS[0])
                        .map(|pair| pair.get_value().to_string())
                        .unwrap_or_default();
                    (
                        TransferLabels::new(denom, "", ""),
                        metric.get_histogram().get_sample_sum(),
                    )
                })
                .collect(),
        }
    }

    /// Render the current state as metric families
    pub fn collect(&self) -> Result<Vec<MetricFamily>, prometheus::Error> {
        let opts = Opts::new(TRANSFER_METRIC_NAME, TRANSFER_METRIC_HELP)
            .const_labels(self.const_labels.clone());
        match &self.projection {
            Projection::Counter(totals) => {
                let counter = prometheus::CounterVec::new(opts, &TRANSFER_LABELS)?;
                for (labels, total) in lock(totals).iter() {
                    counter.with_label_values(&labels.values()).inc_by(*total);
                }
                Ok(counter.collect())
            }
            Projection::ExpiringGauge(gauge) => {
                let vec = GaugeVec::new(opts, &TRANSFER_LABELS)?;
                for (labels, value) in gauge.snapshot() {
                    vec.with_label_values(&labels.values()).set(value);
                }
                Ok(vec.collect())
            }
            Projection::Histogram(histogram) => Ok(histogram.collect()),
        }
    }
}
