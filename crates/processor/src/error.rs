//! Error types for the rowstream runtime
//!
//! This module provides the error hierarchy used by the processing loop,
//! the state layer and the user pipeline. Adapter errors live in
//! [`crate::kafka::error`] and are wrapped here where they cross into the loop.

use crate::kafka::KafkaError;
use thiserror::Error;

/// Top-level error returned by [`crate::app::Application::run`]
#[derive(Error, Debug)]
pub enum ProcessorError {
    /// Configuration errors
    #[error("configuration error: {source}")]
    Configuration {
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    /// State store errors
    #[error("state error: {0}")]
    State(#[from] StateError),

    /// Adapter errors that are not routed through a callback
    #[error("kafka error: {0}")]
    Kafka(#[from] KafkaError),

    /// Unsuppressed pipeline failure
    #[error("processing failed at {topic}[{partition}]@{offset}: {source}")]
    Processing {
        topic: String,
        partition: i32,
        offset: i64,
        #[source]
        source: ProcessingError,
    },

    /// Unsuppressed producer failure
    #[error("producer error: {source}")]
    Producer {
        #[source]
        source: KafkaError,
    },

    /// Unsuppressed consumer or deserialization failure
    #[error("consumer error: {source}")]
    Consumer {
        #[source]
        source: KafkaError,
    },

    /// Serialization/deserialization errors
    #[error("serialization error: {0}")]
    Serialization(String),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Generic error for unexpected conditions
    #[error("unexpected error: {0}")]
    Unexpected(String),
}

impl ProcessorError {
    pub fn configuration(message: impl Into<String>) -> Self {
        ProcessorError::Configuration {
            source: message.into().into(),
        }
    }
}

/// State store operation errors
#[derive(Error, Debug)]
pub enum StateError {
    /// No store with this name is registered for the topic
    #[error("store '{store}' is not registered for topic '{topic}'")]
    StoreNotFound { topic: String, store: String },

    /// Store name already used by another topic
    #[error("store '{store}' is already registered for topic '{existing_topic}'")]
    DuplicateStore {
        store: String,
        existing_topic: String,
    },

    /// The partition has no open store partitions
    #[error("partition {topic}[{partition}] is not assigned")]
    PartitionNotAssigned { topic: String, partition: i32 },

    /// A second transaction was requested for a partition
    #[error("a transaction is already open for {topic}[{partition}]")]
    TransactionAlreadyOpen { topic: String, partition: i32 },

    /// Stores cannot be cleared while in use
    #[error("cannot clear stores: {reason}")]
    StoresInUse { reason: String },

    /// State serialization failed
    #[error("state serialization failed for key '{key}': {reason}")]
    SerializationFailed { key: String, reason: String },

    /// State deserialization failed
    #[error("state deserialization failed for key '{key}': {reason}")]
    DeserializationFailed { key: String, reason: String },

    /// State backend storage error
    #[error("storage error in {backend_type}: {details}")]
    StorageError {
        backend_type: String,
        details: String,
    },

    /// Changelog topic or partition does not exist
    #[error("changelog {topic}[{partition}] is missing: {details}")]
    ChangelogMissing {
        topic: String,
        partition: i32,
        details: String,
    },

    /// Changelog message cannot be applied
    #[error("corrupt changelog message at {topic}[{partition}]@{offset}: {reason}")]
    CorruptChangelog {
        topic: String,
        partition: i32,
        offset: i64,
        reason: String,
    },

    /// Changelog or recovery I/O failed
    #[error("changelog error: {0}")]
    Changelog(#[from] KafkaError),
}

impl StateError {
    pub(crate) fn storage(details: impl std::fmt::Display) -> Self {
        StateError::StorageError {
            backend_type: "sled".to_string(),
            details: details.to_string(),
        }
    }

    /// Broken invariants that no callback is allowed to suppress.
    pub fn is_consistency_violation(&self) -> bool {
        matches!(
            self,
            StateError::TransactionAlreadyOpen { .. }
                | StateError::ChangelogMissing { .. }
                | StateError::CorruptChangelog { .. }
                | StateError::PartitionNotAssigned { .. }
        )
    }
}

/// Error raised while the pipeline processes a row
#[derive(Error, Debug)]
pub enum ProcessingError {
    /// The user pipeline failed
    #[error("pipeline error: {0}")]
    Pipeline(#[source] anyhow::Error),

    /// Producing an output record failed and was not suppressed
    #[error("produce failed: {0}")]
    Produce(#[source] KafkaError),

    /// Reading or writing state failed
    #[error("state access failed: {0}")]
    State(#[from] StateError),
}

impl ProcessingError {
    pub fn pipeline(err: impl Into<anyhow::Error>) -> Self {
        ProcessingError::Pipeline(err.into())
    }

    /// Whether the processing-error callback may see this error.
    pub fn is_suppressible(&self) -> bool {
        match self {
            ProcessingError::Pipeline(_) => true,
            ProcessingError::Produce(_) => false,
            ProcessingError::State(err) => !err.is_consistency_violation(),
        }
    }
}

impl From<anyhow::Error> for ProcessingError {
    fn from(err: anyhow::Error) -> Self {
        ProcessingError::Pipeline(err)
    }
}

impl From<serde_json::Error> for ProcessingError {
    fn from(err: serde_json::Error) -> Self {
        ProcessingError::Pipeline(err.into())
    }
}

/// Result type alias for processor operations
pub type Result<T> = std::result::Result<T, ProcessorError>;

/// Result type alias for state operations
pub type StateResult<T> = std::result::Result<T, StateError>;

impl From<serde_json::Error> for ProcessorError {
    fn from(err: serde_json::Error) -> Self {
        ProcessorError::Serialization(err.to_string())
    }
}

impl From<anyhow::Error> for ProcessorError {
    fn from(err: anyhow::Error) -> Self {
        ProcessorError::Unexpected(err.to_string())
    }
}

impl From<sled::Error> for StateError {
    fn from(err: sled::Error) -> Self {
        StateError::storage(err)
    }
}
