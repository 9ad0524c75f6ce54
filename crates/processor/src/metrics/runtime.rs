//! Processing loop metrics.

use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::gauge::Gauge;
use serde::{Deserialize, Serialize};

use super::registry::MetricsRegistry;

/// Counters maintained by the processing loop.
#[derive(Debug, Clone, Default)]
pub struct RuntimeMetrics {
    pub messages_processed: Counter,
    pub rows_processed: Counter,
    pub rows_filtered: Counter,
    pub processing_errors: Counter,
    pub suppressed_errors: Counter,
    pub changelog_produced: Counter,
    pub changelog_recovered: Counter,
    pub offset_ahead_warnings: Counter,
    pub partitions_recovering: Gauge,
}

impl RuntimeMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register every metric in `registry`. Handles stay shared with `self`.
    pub fn register(&self, registry: &MetricsRegistry) {
        registry.register_with(|r| {
            r.register(
                "messages_processed",
                "Messages fully processed and acknowledged",
                self.messages_processed.clone(),
            );
            r.register(
                "rows_processed",
                "Rows passed through the pipeline",
                self.rows_processed.clone(),
            );
            r.register(
                "rows_filtered",
                "Rows dropped by the pipeline",
                self.rows_filtered.clone(),
            );
            r.register(
                "processing_errors",
                "Errors raised while consuming, processing or producing",
                self.processing_errors.clone(),
            );
            r.register(
                "suppressed_errors",
                "Errors suppressed by a callback",
                self.suppressed_errors.clone(),
            );
            r.register(
                "changelog_produced",
                "Changelog records produced",
                self.changelog_produced.clone(),
            );
            r.register(
                "changelog_recovered",
                "Changelog records applied during recovery",
                self.changelog_recovered.clone(),
            );
            r.register(
                "offset_ahead_warnings",
                "Assignments where local state was ahead of the committed offset",
                self.offset_ahead_warnings.clone(),
            );
            r.register(
                "partitions_recovering",
                "Input partitions currently replaying changelogs",
                self.partitions_recovering.clone(),
            );
        });
    }

    pub fn snapshot(&self) -> ApplicationStats {
        ApplicationStats {
            messages_processed: self.messages_processed.get(),
            rows_processed: self.rows_processed.get(),
            rows_filtered: self.rows_filtered.get(),
            processing_errors: self.processing_errors.get(),
            suppressed_errors: self.suppressed_errors.get(),
            changelog_produced: self.changelog_produced.get(),
            changelog_recovered: self.changelog_recovered.get(),
            offset_ahead_warnings: self.offset_ahead_warnings.get(),
            partitions_recovering: self.partitions_recovering.get(),
        }
    }
}

/// Point-in-time view of [`RuntimeMetrics`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApplicationStats {
    pub messages_processed: u64,
    pub rows_processed: u64,
    pub rows_filtered: u64,
    pub processing_errors: u64,
    pub suppressed_errors: u64,
    pub changelog_produced: u64,
    pub changelog_recovered: u64,
    pub offset_ahead_warnings: u64,
    pub partitions_recovering: i64,
}
