//! Prometheus metrics for the processing runtime
//!
//! Metrics are kept in `prometheus_client` types and registered in a
//! [`MetricsRegistry`], which encodes them in the OpenMetrics text format.

mod registry;
mod runtime;

pub use registry::MetricsRegistry;
pub use runtime::{ApplicationStats, RuntimeMetrics};

use thiserror::Error;

/// Errors that can occur in the metrics subsystem
#[derive(Error, Debug)]
pub enum MetricsError {
    #[error("Metric encoding error: {0}")]
    EncodingError(String),
}

pub type Result<T> = std::result::Result<T, MetricsError>;
