//! Changelog topics
//!
//! Every store mutation is mirrored into a compacted changelog topic so a
//! store partition can be rebuilt on another instance. Changelog partition
//! `n` always belongs to input partition `n`.

use std::sync::Arc;
use tracing::trace;

use crate::core::TopicPartition;
use crate::kafka::{KafkaResult, Producer, ProducerRecord};

/// Header carrying the input offset whose processing produced the record.
pub const PROCESSED_OFFSET_HEADER: &str = "__processed_offset__";

const CHANGELOG_PREFIX: &str = "changelog";

/// Name of the changelog topic for `store` on input `topic`.
///
/// # Examples
///
/// ```
/// use rowstream::state::changelog_topic_name;
///
/// assert_eq!(
///     changelog_topic_name("billing", "orders", "totals"),
///     "changelog__billing--orders--totals"
/// );
/// ```
pub fn changelog_topic_name(group: &str, topic: &str, store: &str) -> String {
    format!("{CHANGELOG_PREFIX}__{group}--{topic}--{store}")
}

/// Encode a processed offset as a header value.
pub fn encode_processed_offset(offset: i64) -> Vec<u8> {
    offset.to_string().into_bytes()
}

/// Decode the processed-offset header value.
pub fn decode_processed_offset(raw: &[u8]) -> Option<i64> {
    std::str::from_utf8(raw).ok()?.trim().parse().ok()
}

/// Producer-side handle for one changelog partition.
#[derive(Clone)]
pub struct ChangelogWriter {
    producer: Arc<dyn Producer>,
    partition: TopicPartition,
}

impl std::fmt::Debug for ChangelogWriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChangelogWriter")
            .field("partition", &self.partition)
            .finish()
    }
}

impl ChangelogWriter {
    pub fn new(producer: Arc<dyn Producer>, partition: TopicPartition) -> Self {
        Self {
            producer,
            partition,
        }
    }

    pub fn partition(&self) -> &TopicPartition {
        &self.partition
    }

    /// Enqueue one mutation. `value == None` produces a tombstone.
    pub fn produce(&self, key: &[u8], value: Option<&[u8]>, processed_offset: i64) -> KafkaResult<()> {
        let mut record = ProducerRecord::new(self.partition.topic.clone())
            .with_partition(self.partition.partition)
            .with_key(key.to_vec())
            .with_header(
                PROCESSED_OFFSET_HEADER,
                encode_processed_offset(processed_offset),
            );
        record.value = value.map(<[u8]>::to_vec);

        trace!(
            changelog = %self.partition,
            processed_offset,
            tombstone = value.is_none(),
            "Producing changelog record"
        );
        self.producer.produce(record)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kafka::memory::InMemoryBroker;

    #[test]
    fn test_processed_offset_header_codec() {
        assert_eq!(decode_processed_offset(&encode_processed_offset(42)), Some(42));
        assert_eq!(decode_processed_offset(b"-1"), Some(-1));
        assert_eq!(decode_processed_offset(b"forty-two"), None);
        assert_eq!(decode_processed_offset(&[0xff, 0xfe]), None);
    }

    #[tokio::test]
    async fn test_writer_produces_records_and_tombstones() {
        let broker = InMemoryBroker::new();
        let topic = changelog_topic_name("g", "orders", "totals");
        broker.create_topic(&topic, 2);

        let writer = ChangelogWriter::new(
            Arc::new(broker.producer()),
            TopicPartition::new(topic.clone(), 1),
        );
        writer.produce(b"k", Some(b"1"), 7).unwrap();
        writer.produce(b"k", None, 8).unwrap();

        let messages = broker.messages(&TopicPartition::new(topic, 1));
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].key.as_deref(), Some(&b"k"[..]));
        assert_eq!(
            messages[0].header(PROCESSED_OFFSET_HEADER),
            Some(&b"7"[..])
        );
        assert!(messages[1].payload.is_none());
    }
}
