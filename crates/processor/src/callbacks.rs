//! Error and progress callbacks.
//!
//! The processing loop consults a [`Callbacks`] implementation whenever an
//! error could be skipped. Returning `true` suppresses the error; the loop
//! then moves on as if the affected message or row had been handled.
//! Returning `false` stops the loop and the error is returned from
//! [`crate::app::Application::run`].

use tracing::{error, warn};

use crate::core::Row;
use crate::error::ProcessingError;
use crate::kafka::{ConsumedMessage, ErrorSeverity, KafkaError};

/// Hooks invoked by the processing loop.
///
/// Every method has a default: errors are logged and not suppressed.
pub trait Callbacks: Send + Sync {
    /// Consumer poll or deserialization failure.
    ///
    /// The default logs at a level matching the error's severity.
    fn on_consumer_error(&self, error: &KafkaError, message: Option<&ConsumedMessage>) -> bool {
        let severity = error.severity();
        let record = message.map(|m| format!("{}[{}]@{}", m.topic, m.partition, m.offset));
        if severity >= ErrorSeverity::Error {
            error!(severity = %severity, record = ?record, error = %error, "Consumer error");
        } else {
            warn!(severity = %severity, record = ?record, error = %error, "Consumer error");
        }
        false
    }

    /// Pipeline or state failure while processing `row`.
    fn on_processing_error(&self, error: &ProcessingError, row: &Row) -> bool {
        error!(
            topic = %row.topic(),
            partition = row.partition(),
            offset = row.offset(),
            error = %error,
            "Failed to process row"
        );
        false
    }

    /// Produce or delivery failure. `row` is set when the record was produced
    /// while processing it.
    fn on_producer_error(&self, error: &KafkaError, row: Option<&Row>) -> bool {
        match row {
            Some(row) => error!(
                topic = %row.topic(),
                partition = row.partition(),
                offset = row.offset(),
                error = %error,
                "Failed to produce record"
            ),
            None => error!(error = %error, "Failed to deliver record"),
        }
        false
    }

    /// Called once a message is fully processed and its offset stored.
    fn on_message_processed(&self, _topic: &str, _partition: i32, _offset: i64) {}
}

/// Callbacks with every default in place.
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultCallbacks;

impl Callbacks for DefaultCallbacks {}

impl<C: Callbacks + ?Sized> Callbacks for std::sync::Arc<C> {
    fn on_consumer_error(&self, error: &KafkaError, message: Option<&ConsumedMessage>) -> bool {
        (**self).on_consumer_error(error, message)
    }

    fn on_processing_error(&self, error: &ProcessingError, row: &Row) -> bool {
        (**self).on_processing_error(error, row)
    }

    fn on_producer_error(&self, error: &KafkaError, row: Option<&Row>) -> bool {
        (**self).on_producer_error(error, row)
    }

    fn on_message_processed(&self, topic: &str, partition: i32, offset: i64) {
        (**self).on_message_processed(topic, partition, offset)
    }
}

impl<C: Callbacks + ?Sized> Callbacks for Box<C> {
    fn on_consumer_error(&self, error: &KafkaError, message: Option<&ConsumedMessage>) -> bool {
        (**self).on_consumer_error(error, message)
    }

    fn on_processing_error(&self, error: &ProcessingError, row: &Row) -> bool {
        (**self).on_processing_error(error, row)
    }

    fn on_producer_error(&self, error: &KafkaError, row: Option<&Row>) -> bool {
        (**self).on_producer_error(error, row)
    }

    fn on_message_processed(&self, topic: &str, partition: i32, offset: i64) {
        (**self).on_message_processed(topic, partition, offset)
    }
}
