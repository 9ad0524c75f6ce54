//! Metrics registry
//!
//! Wraps a `prometheus_client` [`Registry`] behind a lock. Each application
//! owns one, shared with whoever scrapes it.

use parking_lot::RwLock;
use prometheus_client::registry::Registry;
use std::sync::Arc;

use super::{MetricsError, Result};

/// Thread-safe registry for Prometheus metrics
#[derive(Clone)]
pub struct MetricsRegistry {
    registry: Arc<RwLock<Registry>>,
}

impl MetricsRegistry {
    pub fn new() -> Self {
        Self::from_registry(Registry::default())
    }

    /// Registry whose metric names all start with `prefix`.
    pub fn with_prefix(prefix: &str) -> Self {
        Self::from_registry(Registry::with_prefix(prefix))
    }

    fn from_registry(registry: Registry) -> Self {
        Self {
            registry: Arc::new(RwLock::new(registry)),
        }
    }

    /// Run `f` with write access to the underlying registry.
    pub fn register_with<F>(&self, f: F)
    where
        F: FnOnce(&mut Registry),
    {
        f(&mut self.registry.write());
    }

    /// Encode metrics in the OpenMetrics text format
    pub fn encode(&self) -> Result<String> {
        let registry = self.registry.read();
        let mut buffer = String::new();

        prometheus_client::encoding::text::encode(&mut buffer, &registry)
            .map_err(|e| MetricsError::EncodingError(e.to_string()))?;

        Ok(buffer)
    }
}

impl Default for MetricsRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use prometheus_client::metrics::counter::Counter;

    #[test]
    fn test_encode_includes_registered_metric() {
        let registry = MetricsRegistry::with_prefix("test");
        let counter: Counter = Counter::default();
        registry.register_with(|r| r.register("events", "Events seen", counter.clone()));
        counter.inc_by(3);

        let text = registry.encode().unwrap();
        assert!(text.contains("test_events_total 3"));
        assert!(text.ends_with("# EOF\n"));
    }
}
