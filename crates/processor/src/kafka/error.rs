//! Kafka-specific error types and error handling.
//!
//! This module provides the error type shared by every adapter (rdkafka and
//! in-memory): connection, consumption, production, (de)serialization,
//! offset management and metadata errors.

use std::fmt;
use thiserror::Error;

/// Result type alias for Kafka operations.
pub type Result<T> = std::result::Result<T, KafkaError>;

/// Error type for Kafka adapter operations.
///
/// # Examples
///
/// ```rust
/// use rowstream::kafka::error::{KafkaError, Result};
///
/// fn connect_to_kafka() -> Result<()> {
///     Err(KafkaError::Connection {
///         message: "Failed to connect to broker".to_string(),
///         broker: "localhost:9092".to_string(),
///     })
/// }
///
/// match connect_to_kafka() {
///     Ok(_) => println!("Connected successfully"),
///     Err(KafkaError::Connection { message, broker }) => {
///         eprintln!("Connection error to {}: {}", broker, message);
///     }
///     Err(e) => eprintln!("Other error: {}", e),
/// }
/// ```
#[derive(Error, Debug, Clone)]
pub enum KafkaError {
    /// Error establishing connection to Kafka broker.
    #[error("Failed to connect to Kafka broker {broker}: {message}")]
    Connection {
        /// Error message describing the connection failure.
        message: String,
        /// Broker address that failed to connect.
        broker: String,
    },

    /// Error during message consumption.
    #[error("Failed to consume message from topic {topic}: {message}")]
    Consumption {
        /// Error message describing the consumption failure.
        message: String,
        /// Topic from which consumption failed.
        topic: String,
        /// Partition number if available.
        partition: Option<i32>,
        /// Offset if available.
        offset: Option<i64>,
    },

    /// Error during message production.
    #[error("Failed to produce message to topic {topic}: {message}")]
    Production {
        /// Error message describing the production failure.
        message: String,
        /// Topic to which production failed.
        topic: String,
        /// Partition number if available.
        partition: Option<i32>,
    },

    /// Error during serialization of messages.
    #[error("Serialization error: {message}")]
    Serialization {
        /// Error message describing the serialization failure.
        message: String,
        /// Optional context about what was being serialized.
        context: Option<String>,
    },

    /// Error during deserialization of messages.
    #[error("Deserialization error: {message}")]
    Deserialization {
        /// Error message describing the deserialization failure.
        message: String,
        /// Optional context about what was being deserialized.
        context: Option<String>,
        /// Raw bytes that failed to deserialize (truncated for display).
        payload_sample: Option<Vec<u8>>,
    },

    /// Configuration validation error.
    #[error("Invalid configuration: {message}")]
    InvalidConfiguration {
        /// Error message describing the configuration issue.
        message: String,
        /// Field name that has invalid configuration.
        field: Option<String>,
    },

    /// Error storing or committing offsets.
    #[error("Failed to commit offsets for topic {topic}: {message}")]
    OffsetCommit {
        /// Error message describing the commit failure.
        message: String,
        /// Topic for which offset commit failed.
        topic: String,
        /// Partition for which offset commit failed.
        partition: i32,
        /// Offset that failed to commit.
        offset: i64,
    },

    /// Error during consumer group coordination.
    #[error("Consumer group coordination error for group {group_id}: {message}")]
    GroupCoordination {
        /// Error message describing the coordination failure.
        message: String,
        /// Consumer group ID.
        group_id: String,
    },

    /// Timeout error during Kafka operations.
    #[error("Operation timed out after {timeout_ms}ms: {operation}")]
    Timeout {
        /// Description of the operation that timed out.
        operation: String,
        /// Timeout duration in milliseconds.
        timeout_ms: u64,
    },

    /// Error related to topic metadata.
    #[error("Topic metadata error for topic {topic}: {message}")]
    TopicMetadata {
        /// Error message describing the metadata failure.
        message: String,
        /// Topic name.
        topic: String,
    },

    /// Error when a topic partition doesn't exist.
    #[error("Topic partition {topic}:{partition} does not exist")]
    PartitionNotFound {
        /// Topic name.
        topic: String,
        /// Partition number.
        partition: i32,
    },

    /// Error from the underlying rdkafka library.
    #[error("Kafka client error: {message} (error code: {code:?})")]
    KafkaClient {
        /// Error message from rdkafka.
        message: String,
        /// rdkafka error code.
        code: Option<i32>,
    },

    /// Generic error for cases not covered by specific variants.
    #[error("Kafka error: {0}")]
    Other(String),
}

impl KafkaError {
    /// Create a connection error.
    pub fn connection(message: impl Into<String>, broker: impl Into<String>) -> Self {
        Self::Connection {
            message: message.into(),
            broker: broker.into(),
        }
    }

    /// Create a consumption error.
    pub fn consumption(
        message: impl Into<String>,
        topic: impl Into<String>,
        partition: Option<i32>,
        offset: Option<i64>,
    ) -> Self {
        Self::Consumption {
            message: message.into(),
            topic: topic.into(),
            partition,
            offset,
        }
    }

    /// Create a production error.
    pub fn production(
        message: impl Into<String>,
        topic: impl Into<String>,
        partition: Option<i32>,
    ) -> Self {
        Self::Production {
            message: message.into(),
            topic: topic.into(),
            partition,
        }
    }

    /// Create a serialization error.
    pub fn serialization(message: impl Into<String>, context: Option<String>) -> Self {
        Self::Serialization {
            message: message.into(),
            context,
        }
    }

    /// Create a deserialization error.
    ///
    /// The payload sample is truncated to 64 bytes.
    pub fn deserialization(
        message: impl Into<String>,
        context: Option<String>,
        payload: Option<&[u8]>,
    ) -> Self {
        Self::Deserialization {
            message: message.into(),
            context,
            payload_sample: payload.map(|p| p[..p.len().min(64)].to_vec()),
        }
    }

    /// Create an invalid configuration error.
    pub fn invalid_config(message: impl Into<String>, field: Option<String>) -> Self {
        Self::InvalidConfiguration {
            message: message.into(),
            field,
        }
    }

    /// Create an offset commit error.
    pub fn offset_commit(
        message: impl Into<String>,
        topic: impl Into<String>,
        partition: i32,
        offset: i64,
    ) -> Self {
        Self::OffsetCommit {
            message: message.into(),
            topic: topic.into(),
            partition,
            offset,
        }
    }

    /// Create a group coordination error.
    pub fn group_coordination(message: impl Into<String>, group_id: impl Into<String>) -> Self {
        Self::GroupCoordination {
            message: message.into(),
            group_id: group_id.into(),
        }
    }

    /// Create a timeout error.
    pub fn timeout(operation: impl Into<String>, timeout_ms: u64) -> Self {
        Self::Timeout {
            operation: operation.into(),
            timeout_ms,
        }
    }

    /// Create a topic metadata error.
    pub fn topic_metadata(message: impl Into<String>, topic: impl Into<String>) -> Self {
        Self::TopicMetadata {
            message: message.into(),
            topic: topic.into(),
        }
    }

    /// Create a partition not found error.
    pub fn partition_not_found(topic: impl Into<String>, partition: i32) -> Self {
        Self::PartitionNotFound {
            topic: topic.into(),
            partition,
        }
    }

    /// Create a Kafka client error.
    pub fn kafka_client(message: impl Into<String>, code: Option<i32>) -> Self {
        Self::KafkaClient {
            message: message.into(),
            code,
        }
    }

    /// Check if the error is retryable.
    ///
    /// Returns `true` if the operation that caused this error can be retried.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            KafkaError::Timeout { .. }
                | KafkaError::Connection { .. }
                | KafkaError::GroupCoordination { .. }
                | KafkaError::Consumption { .. }
        )
    }

    /// Check if the error is fatal and requires system shutdown.
    pub fn is_fatal(&self) -> bool {
        matches!(self, KafkaError::InvalidConfiguration { .. })
    }

    /// Whether the error reports a topic or partition that does not exist.
    pub fn is_unknown_partition(&self) -> bool {
        matches!(self, KafkaError::PartitionNotFound { .. })
    }

    /// Get error severity level.
    pub fn severity(&self) -> ErrorSeverity {
        match self {
            KafkaError::InvalidConfiguration { .. } => ErrorSeverity::Critical,
            KafkaError::Connection { .. }
            | KafkaError::GroupCoordination { .. }
            | KafkaError::Production { .. }
            | KafkaError::PartitionNotFound { .. } => ErrorSeverity::Error,
            KafkaError::Timeout { .. }
            | KafkaError::Consumption { .. }
            | KafkaError::Deserialization { .. } => ErrorSeverity::Warning,
            _ => ErrorSeverity::Info,
        }
    }
}

/// Error severity levels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ErrorSeverity {
    /// Informational messages.
    Info,
    /// Warning messages for potential issues.
    Warning,
    /// Error messages for failures.
    Error,
    /// Critical errors requiring immediate attention.
    Critical,
}

impl fmt::Display for ErrorSeverity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorSeverity::Info => write!(f, "INFO"),
            ErrorSeverity::Warning => write!(f, "WARNING"),
            ErrorSeverity::Error => write!(f, "ERROR"),
            ErrorSeverity::Critical => write!(f, "CRITICAL"),
        }
    }
}

impl From<serde_json::Error> for KafkaError {
    fn from(err: serde_json::Error) -> Self {
        KafkaError::Serialization {
            message: err.to_string(),
            context: Some("JSON serialization".to_string()),
        }
    }
}

impl From<rdkafka::error::KafkaError> for KafkaError {
    fn from(err: rdkafka::error::KafkaError) -> Self {
        use rdkafka::error::KafkaError as RdKafkaError;
        use rdkafka::types::RDKafkaErrorCode;

        if let Some(
            RDKafkaErrorCode::UnknownTopicOrPartition
            | RDKafkaErrorCode::UnknownTopic
            | RDKafkaErrorCode::UnknownPartition,
        ) = err.rdkafka_error_code()
        {
            return KafkaError::partition_not_found("unknown", -1);
        }

        match err {
            RdKafkaError::ClientCreation(msg) => KafkaError::connection(msg, "unknown"),

            RdKafkaError::MetadataFetch(code) => {
                KafkaError::topic_metadata(code.to_string(), "unknown")
            }

            RdKafkaError::Subscription(msg) => KafkaError::group_coordination(msg, "unknown"),

            RdKafkaError::MessageProduction(code) => KafkaError::production(
                format!("Message production failed with code: {:?}", code),
                "unknown",
                None,
            ),

            RdKafkaError::MessageConsumption(code) => KafkaError::consumption(
                format!("Message consumption failed with code: {:?}", code),
                "unknown",
                None,
                None,
            ),

            RdKafkaError::StoreOffset(code)
            | RdKafkaError::OffsetFetch(code)
            | RdKafkaError::ConsumerCommit(code) => {
                KafkaError::offset_commit(code.to_string(), "unknown", -1, -1)
            }

            _ => KafkaError::kafka_client(err.to_string(), None),
        }
    }
}
