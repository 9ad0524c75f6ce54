//! Per-row processing context.

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::warn;

use crate::callbacks::Callbacks;
use crate::core::{MessageContext, Row};
use crate::error::ProcessingError;
use crate::kafka::{KafkaError, Producer, ProducerRecord};
use crate::state::{State, TransactionScope};

/// Everything a pipeline may touch while processing one row: the source
/// message metadata, the stores of the row's partition and the producer.
pub struct ProcessingContext<'a> {
    row: &'a Row,
    scope: &'a mut TransactionScope,
    producer: &'a dyn Producer,
    callbacks: &'a dyn Callbacks,
    produced: u64,
    suppressed: u64,
}

impl<'a> ProcessingContext<'a> {
    pub fn new(
        row: &'a Row,
        scope: &'a mut TransactionScope,
        producer: &'a dyn Producer,
        callbacks: &'a dyn Callbacks,
    ) -> Self {
        Self {
            row,
            scope,
            producer,
            callbacks,
            produced: 0,
            suppressed: 0,
        }
    }

    pub fn message(&self) -> &MessageContext {
        &self.row.context
    }

    pub fn topic(&self) -> &str {
        &self.row.context.topic
    }

    pub fn partition(&self) -> i32 {
        self.row.context.partition
    }

    pub fn offset(&self) -> i64 {
        self.row.context.offset
    }

    pub fn key(&self) -> Option<&[u8]> {
        self.row.context.key.as_deref()
    }

    pub fn timestamp(&self) -> Option<DateTime<Utc>> {
        self.row.context.timestamp
    }

    pub fn header(&self, name: &str) -> Option<&[u8]> {
        self.row.context.header(name)
    }

    /// Access a store of the current partition, scoped to the message key.
    pub fn state(&mut self, store: &str) -> Result<State<'_>, ProcessingError> {
        let row: &'a Row = self.row;
        let prefix = row.context.key.as_deref().unwrap_or_default();
        Ok(self.scope.state(store, prefix)?)
    }

    /// Enqueue an output record.
    ///
    /// A rejected record goes to the producer-error callback; if it is not
    /// suppressed the error is returned and processing of the message stops.
    pub fn produce(&mut self, record: ProducerRecord) -> Result<(), ProcessingError> {
        let topic = record.topic.clone();
        match self.producer.produce(record) {
            Ok(()) => {
                self.produced += 1;
                Ok(())
            }
            Err(err) => self.producer_error(&topic, err),
        }
    }

    /// Produce `value` as JSON to `topic`, keyed by the current message key.
    ///
    /// A value that cannot be encoded is routed like a rejected record.
    pub fn produce_json<T: Serialize + ?Sized>(
        &mut self,
        topic: &str,
        value: &T,
    ) -> Result<(), ProcessingError> {
        let mut record = match ProducerRecord::new(topic).with_json(value) {
            Ok(record) => record,
            Err(err) => return self.producer_error(topic, err),
        };
        record.key = self.row.context.key.clone();
        record.timestamp = self.row.context.timestamp;
        self.produce(record)
    }

    fn producer_error(&mut self, topic: &str, err: KafkaError) -> Result<(), ProcessingError> {
        if self.callbacks.on_producer_error(&err, Some(self.row)) {
            warn!(
                topic = %topic,
                source_offset = self.offset(),
                error = %err,
                "Produce error suppressed"
            );
            self.suppressed += 1;
            Ok(())
        } else {
            Err(ProcessingError::Produce(err))
        }
    }

    /// Records accepted by the producer so far.
    pub fn produced(&self) -> u64 {
        self.produced
    }

    /// Produce errors suppressed by the callback so far.
    pub fn suppressed(&self) -> u64 {
        self.suppressed
    }
}
