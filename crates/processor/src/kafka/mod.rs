//! Message log adapters
//!
//! The runtime depends only on the traits defined here. Two implementations
//! are provided for each of them:
//!
//! ## rdkafka
//! - [`KafkaConsumer`]: `StreamConsumer` with rebalance callbacks recorded and
//!   surfaced through `poll`, explicit offset storage and cooperative
//!   incremental assignment
//! - [`KafkaProducer`]: `ThreadedProducer` whose delivery callbacks are
//!   buffered and drained by the processing loop
//! - [`KafkaAdmin`]: changelog topic provisioning
//!
//! ## In-memory
//! - [`memory::InMemoryBroker`] with [`memory::MemoryConsumer`] and
//!   [`memory::MemoryProducer`], used by tests and for embedding
//!
//! ## Error Handling
//! - Kafka-specific error types with proper context
//! - Error severity levels for monitoring
//! - Retryable vs fatal error classification
//!
//! # Example
//!
//! ```rust,no_run
//! use rowstream::config::ApplicationConfig;
//! use rowstream::kafka::{KafkaConsumer, KafkaConsumerConfig, KafkaProducer, KafkaProducerConfig};
//!
//! # fn example() -> rowstream::kafka::KafkaResult<()> {
//! let config = ApplicationConfig::default();
//! let consumer = KafkaConsumer::new(KafkaConsumerConfig::from_app(&config))?;
//! let producer = KafkaProducer::new(KafkaProducerConfig::from_app(&config))?;
//! # let _ = (consumer, producer);
//! # Ok(())
//! # }
//! ```

pub mod admin;
pub mod config;
pub mod consumer;
pub mod error;
pub mod memory;
pub mod producer;
pub mod serialization;

pub use admin::{KafkaAdmin, TopicAdmin, TopicSpec};
pub use config::{KafkaConsumerConfig, KafkaProducerConfig};
pub use consumer::{ConsumedMessage, Consumer, ConsumerEvent, KafkaConsumer, RebalanceEvent};
pub use error::{ErrorSeverity, KafkaError, Result as KafkaResult};
pub use producer::{DeliveryReport, KafkaProducer, Producer, ProducerRecord};
pub use serialization::{JsonDeserializer, RowDeserializer};
