//! Producer adapter.
//!
//! `produce` only enqueues a record. Delivery acknowledgements are collected
//! by the client's background I/O and handed back to the processing loop by
//! [`Producer::poll`], so nothing mutates loop state concurrently.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rdkafka::message::{Header, Message, OwnedHeaders};
use rdkafka::producer::{BaseRecord, DeliveryResult, Producer as _, ProducerContext, ThreadedProducer};
use rdkafka::util::Timeout;
use rdkafka::ClientContext;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use super::config::{client_config, KafkaProducerConfig};
use super::error::{KafkaError, Result};
use crate::core::TopicPartition;

/// An outgoing record.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ProducerRecord {
    pub topic: String,
    pub partition: Option<i32>,
    pub key: Option<Vec<u8>>,
    pub value: Option<Vec<u8>>,
    pub headers: Vec<(String, Vec<u8>)>,
    pub timestamp: Option<DateTime<Utc>>,
}

impl ProducerRecord {
    pub fn new(topic: impl Into<String>) -> Self {
        Self {
            topic: topic.into(),
            ..Default::default()
        }
    }

    pub fn with_key(mut self, key: impl Into<Vec<u8>>) -> Self {
        self.key = Some(key.into());
        self
    }

    pub fn with_value(mut self, value: impl Into<Vec<u8>>) -> Self {
        self.value = Some(value.into());
        self
    }

    /// Serialize `value` as JSON.
    pub fn with_json<T: serde::Serialize + ?Sized>(self, value: &T) -> Result<Self> {
        let bytes = serde_json::to_vec(value)?;
        Ok(self.with_value(bytes))
    }

    pub fn with_partition(mut self, partition: i32) -> Self {
        self.partition = Some(partition);
        self
    }

    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<Vec<u8>>) -> Self {
        self.headers.push((key.into(), value.into()));
        self
    }

    pub fn with_timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = Some(timestamp);
        self
    }
}

/// Outcome of a single produced record.
#[derive(Debug, Clone)]
pub struct DeliveryReport {
    pub topic: String,
    pub partition: i32,
    /// Offset assigned by the broker, `None` on failure
    pub offset: Option<i64>,
    pub error: Option<KafkaError>,
}

impl DeliveryReport {
    pub fn delivered(topic: impl Into<String>, partition: i32, offset: i64) -> Self {
        Self {
            topic: topic.into(),
            partition,
            offset: Some(offset),
            error: None,
        }
    }

    pub fn failed(topic: impl Into<String>, partition: i32, error: KafkaError) -> Self {
        Self {
            topic: topic.into(),
            partition,
            offset: None,
            error: Some(error),
        }
    }

    pub fn topic_partition(&self) -> TopicPartition {
        TopicPartition::new(self.topic.clone(), self.partition)
    }
}

/// Output adapter shared by the pipeline and the changelog writer.
#[async_trait]
pub trait Producer: Send + Sync {
    /// Enqueue a record for delivery.
    fn produce(&self, record: ProducerRecord) -> Result<()>;

    /// Collect delivery reports, waiting at most `timeout` when none are ready.
    async fn poll(&self, timeout: Duration) -> Vec<DeliveryReport>;

    /// Wait until every enqueued record has a delivery report.
    async fn flush(&self, timeout: Duration) -> Result<()>;
}

/// Buffers delivery callbacks fired on the client's background thread.
struct DeliveryRecorder {
    reports: Mutex<Vec<DeliveryReport>>,
}

impl ClientContext for DeliveryRecorder {}

impl ProducerContext for DeliveryRecorder {
    type DeliveryOpaque = ();

    fn delivery(&self, delivery_result: &DeliveryResult<'_>, _opaque: Self::DeliveryOpaque) {
        let report = match delivery_result {
            Ok(message) => {
                DeliveryReport::delivered(message.topic(), message.partition(), message.offset())
            }
            Err((err, message)) => DeliveryReport::failed(
                message.topic(),
                message.partition(),
                KafkaError::production(err.to_string(), message.topic(), Some(message.partition())),
            ),
        };
        self.reports.lock().push(report);
    }
}

/// rdkafka implementation of [`Producer`] backed by a `ThreadedProducer`.
pub struct KafkaProducer {
    producer: Arc<ThreadedProducer<DeliveryRecorder>>,
}

impl KafkaProducer {
    pub fn new(config: KafkaProducerConfig) -> Result<Self> {
        let context = DeliveryRecorder {
            reports: Mutex::new(Vec::new()),
        };
        let producer: ThreadedProducer<DeliveryRecorder> =
            client_config(&config.to_rdkafka_properties())
                .create_with_context(context)
                .map_err(|e| KafkaError::connection(e.to_string(), config.broker_address.clone()))?;

        info!(brokers = %config.broker_address, "Kafka producer created");

        Ok(Self {
            producer: Arc::new(producer),
        })
    }

    fn drain(&self) -> Vec<DeliveryReport> {
        std::mem::take(&mut *self.producer.context().reports.lock())
    }
}

#[async_trait]
impl Producer for KafkaProducer {
    fn produce(&self, record: ProducerRecord) -> Result<()> {
        let mut base: BaseRecord<'_, [u8], [u8]> = BaseRecord::to(&record.topic);

        if let Some(ref key) = record.key {
            base = base.key(key.as_slice());
        }
        if let Some(ref value) = record.value {
            base = base.payload(value.as_slice());
        }
        if let Some(partition) = record.partition {
            base = base.partition(partition);
        }
        if let Some(timestamp) = record.timestamp {
            base = base.timestamp(timestamp.timestamp_millis());
        }
        if !record.headers.is_empty() {
            let mut headers = OwnedHeaders::new();
            for (key, value) in &record.headers {
                headers = headers.insert(Header {
                    key: key.as_str(),
                    value: Some(value.as_slice()),
                });
            }
            base = base.headers(headers);
        }

        self.producer.send(base).map_err(|(err, _)| {
            KafkaError::production(err.to_string(), record.topic.clone(), record.partition)
        })?;

        debug!(topic = %record.topic, "Record enqueued");
        Ok(())
    }

    async fn poll(&self, timeout: Duration) -> Vec<DeliveryReport> {
        let reports = self.drain();
        if !reports.is_empty() || timeout.is_zero() {
            return reports;
        }
        tokio::time::sleep(timeout).await;
        self.drain()
    }

    async fn flush(&self, timeout: Duration) -> Result<()> {
        let producer = Arc::clone(&self.producer);
        let flushed = tokio::task::spawn_blocking(move || producer.flush(Timeout::After(timeout)))
            .await
            .map_err(|e| KafkaError::Other(format!("flush task failed: {e}")))?;

        flushed.map_err(|e| {
            warn!(error = %e, "Producer flush incomplete");
            KafkaError::timeout("producer flush", timeout.as_millis() as u64)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_builder() {
        let record = ProducerRecord::new("totals")
            .with_key("customer-1")
            .with_json(&serde_json::json!({"total": 10}))
            .unwrap()
            .with_partition(2)
            .with_header("source", "rowstream");

        assert_eq!(record.topic, "totals");
        assert_eq!(record.key.as_deref(), Some(&b"customer-1"[..]));
        assert_eq!(record.value.as_deref(), Some(&br#"{"total":10}"#[..]));
        assert_eq!(record.partition, Some(2));
        assert_eq!(record.headers.len(), 1);
    }

    #[test]
    fn test_delivery_report_constructors() {
        let ok = DeliveryReport::delivered("totals", 1, 7);
        assert_eq!(ok.offset, Some(7));
        assert!(ok.error.is_none());
        assert_eq!(ok.topic_partition(), TopicPartition::new("totals", 1));

        let failed = DeliveryReport::failed("totals", 1, KafkaError::timeout("send", 10));
        assert!(failed.offset.is_none());
        assert!(failed.error.is_some());
    }
}
