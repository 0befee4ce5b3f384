//! Metric Snapshot Exporter
//!
//! Renders the projector's live state, plus the service's own metrics, in the
//! Prometheus text exposition format. Every scrape takes a fresh snapshot.

use std::sync::Arc;
use std::time::Instant;

use prometheus::proto::MetricFamily;
use prometheus::{Encoder, TextEncoder};
use thiserror::Error;
use tracing::info;
use uuid::Uuid;

use crate::metrics::ServiceMetrics;
use crate::projector::MetricProjector;

/// Endpoint path serving transfer metrics
pub const STREAM_ENDPOINT: &str = "/metrics/stream";

/// Errors that can occur while rendering
#[derive(Error, Debug)]
pub enum ExportError {
    #[error("Failed to collect metrics: {0}")]
    Collect(#[from] prometheus::Error),

    #[error("Rendered metrics are not valid UTF-8: {0}")]
    Utf8(#[from] std::string::FromUtf8Error),
}

/// Encode metric families as exposition text, skipping empty families
pub fn encode_families(families: &[MetricFamily]) -> Result<String, ExportError> {
    let populated: Vec<MetricFamily> = families
        .iter()
        .filter(|family| !family.get_metric().is_empty())
        .cloned()
        .collect();
    let mut buffer = Vec::new();
    TextEncoder::new().encode(&populated, &mut buffer)?;
    Ok(String::from_utf8(buffer)?)
}

/// Content type of the exposition text
pub fn content_type() -> &'static str {
    prometheus::TEXT_FORMAT
}

/// Answers scrape requests from the projector's current state
pub struct MetricSnapshotExporter {
    projector: Arc<MetricProjector>,
    metrics: Arc<ServiceMetrics>,
}

impl MetricSnapshotExporter {
    pub fn new(projector: Arc<MetricProjector>, metrics: Arc<ServiceMetrics>) -> Self {
        Self { projector, metrics }
    }

    pub fn metrics(&self) -> &Arc<ServiceMetrics> {
        &self.metrics
    }

    /// Render transfer metrics followed by the service's own metrics
    pub fn render(&self) -> Result<String, ExportError> {
        let mut families = self.projector.collect()?;
        families.extend(self.metrics.gather());
        encode_families(&families)
    }

    /// Render for one request, recording its latency and logging it
    pub fn scrape(&self, endpoint: &str) -> Result<String, ExportError> {
        let request_start = Instant::now();
        let request_id = Uuid::new_v4();

        let body = self.render();

        let elapsed = request_start.elapsed();
        self.metrics.observe_scrape(endpoint, elapsed);
        info!(
            request_id = %request_id,
            method = "GET",
            endpoint,
            request_time = elapsed.as_secs_f64(),
            "Request processed"
        );
        body
    }
}
