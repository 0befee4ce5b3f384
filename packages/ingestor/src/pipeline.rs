//! Ingest Pipeline
//!
//! One ingest step per delivered batch: dedupe each transaction, parse its
//! transfer events, gate on amount and project what passes.
//! Per-event failures are logged and skipped; nothing here aborts a batch.

use std::sync::Arc;

use tracing::{debug, warn};

use crate::dedup::Deduplicator;
use crate::filter::ThresholdGate;
use crate::metrics::{IngestOutcome, ServiceMetrics};
use crate::parser::{is_transfer_event, parse_transfer};
use crate::projector::MetricProjector;
use crate::source::{EventBatch, TxEvents};

/// What happened to one batch
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BatchStats {
    pub transactions: usize,
    pub duplicates: usize,
    pub transfers: usize,
    pub malformed: usize,
    pub below_threshold: usize,
    pub accepted: usize,
}

impl BatchStats {
    fn merge(&mut self, other: BatchStats) {
        self.transactions += other.transactions;
        self.duplicates += other.duplicates;
        self.transfers += other.transfers;
        self.malformed += other.malformed;
        self.below_threshold += other.below_threshold;
        self.accepted += other.accepted;
    }
}

/// Single-writer ingest state: dedup cache, gate and projector handle
pub struct TransferPipeline {
    dedup: Deduplicator,
    gate: ThresholdGate,
    projector: Arc<MetricProjector>,
    metrics: Arc<ServiceMetrics>,
}

impl TransferPipeline {
    pub fn new(
        dedup: Deduplicator,
        gate: ThresholdGate,
        projector: Arc<MetricProjector>,
        metrics: Arc<ServiceMetrics>,
    ) -> Self {
        Self {
            dedup,
            gate,
            projector,
            metrics,
        }
    }

    pub fn projector(&self) -> &Arc<MetricProjector> {
        &self.projector
    }

    /// Process every transaction of a batch in delivery order
    pub fn process_batch(&mut self, batch: &EventBatch) -> BatchStats {
        let mut stats = BatchStats::default();
        for tx in &batch.items {
            stats.merge(self.process_tx(tx));
        }
        stats
    }

    /// Process one transaction unless it was already seen
    pub fn process_tx(&mut self, tx: &TxEvents) -> BatchStats {
        let mut stats = BatchStats {
            transactions: 1,
            ..Default::default()
        };

        if !self.dedup.check_and_record(&tx.hash) {
            debug!(tx_hash = %tx.hash, "Skipping already processed transaction");
            self.metrics.record_ingest(IngestOutcome::Duplicate);
            stats.duplicates = 1;
            return stats;
        }
        self.metrics.record_ingest(IngestOutcome::Processed);

        for event in tx.events.iter().filter(|e| is_transfer_event(e)) {
            stats.transfers += 1;
            let record = match parse_transfer(event) {
                Ok(record) => record,
                Err(e) => {
                    warn!(tx_hash = %tx.hash, height = tx.height, "Dropping transfer event: {}", e);
                    self.metrics.record_ingest(IngestOutcome::Malformed);
                    stats.malformed += 1;
                    continue;
                }
            };

            if !self.gate.accept(&record) {
                self.metrics.record_ingest(IngestOutcome::BelowThreshold);
                stats.below_threshold += 1;
                continue;
            }

            debug!(
                tx_hash = %tx.hash,
                denom = %record.denom,
                amount = record.amount,
                "Recording large transfer"
            );
            if let Err(e) = self.projector.record(&record) {
                warn!(tx_hash = %tx.hash, "Could not project transfer: {}", e);
                continue;
            }
            self.metrics.record_ingest(IngestOutcome::Accepted);
            stats.accepted += 1;
        }

        stats
    }
}
