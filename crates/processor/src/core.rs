//! Core types shared by the processing loop, the state layer and the adapters.
//!
//! A [`Row`] is one logical record handed to the pipeline. Several rows may be
//! produced from a single physical message, in which case they all share the
//! same [`MessageContext`] and therefore the same source offset.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// A (topic, partition) pair.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TopicPartition {
    pub topic: String,
    pub partition: i32,
}

impl TopicPartition {
    pub fn new(topic: impl Into<String>, partition: i32) -> Self {
        Self {
            topic: topic.into(),
            partition,
        }
    }
}

impl fmt::Display for TopicPartition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}[{}]", self.topic, self.partition)
    }
}

/// Metadata of the message a row was decoded from.
///
/// Passed explicitly to the pipeline through the processing context.
#[derive(Debug, Clone, PartialEq)]
pub struct MessageContext {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
    pub key: Option<Vec<u8>>,
    pub timestamp: Option<DateTime<Utc>>,
    pub headers: Vec<(String, Vec<u8>)>,
    /// Payload size in bytes
    pub size: usize,
}

impl MessageContext {
    pub fn topic_partition(&self) -> TopicPartition {
        TopicPartition::new(self.topic.clone(), self.partition)
    }

    /// Look up the first header with the given name.
    pub fn header(&self, name: &str) -> Option<&[u8]> {
        self.headers
            .iter()
            .find(|(key, _)| key == name)
            .map(|(_, value)| value.as_slice())
    }
}

/// A deserialized record together with its source metadata.
#[derive(Debug, Clone, PartialEq)]
pub struct Row {
    pub value: serde_json::Value,
    pub context: MessageContext,
}

impl Row {
    pub fn new(value: serde_json::Value, context: MessageContext) -> Self {
        Self { value, context }
    }

    pub fn topic(&self) -> &str {
        &self.context.topic
    }

    pub fn partition(&self) -> i32 {
        self.context.partition
    }

    pub fn offset(&self) -> i64 {
        self.context.offset
    }

    pub fn key(&self) -> Option<&[u8]> {
        self.context.key.as_deref()
    }
}
