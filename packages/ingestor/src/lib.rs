//! Chainwatch Ingestor Library
//!
//! This crate provides components for following a Cosmos node's transaction
//! events, picking out large bank transfers and exposing them as Prometheus
//! metrics.

pub mod dedup;
pub mod exporter;
pub mod filter;
pub mod metrics;
pub mod oracle;
pub mod parser;
pub mod pipeline;
pub mod projector;
pub mod rpc;
pub mod server;
pub mod session;
pub mod source;

// Re-export commonly used types
pub use dedup::Deduplicator;
pub use exporter::MetricSnapshotExporter;
pub use filter::{ThresholdGate, TransferQuery};
pub use parser::{parse_coin, parse_transfer, TransferRecord};
pub use pipeline::TransferPipeline;
pub use projector::{MetricProjector, ProjectionKind, ProjectorConfig, TransferLabels};
pub use session::{SessionState, SubscriptionSession};
pub use source::{Event, EventAttribute, EventBatch, EventSource, SourceError, TxEvents};
