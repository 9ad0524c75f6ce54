//! Topic administration used to provision changelog topics.

use async_trait::async_trait;
use rdkafka::admin::{AdminClient, AdminOptions, NewTopic, TopicReplication};
use rdkafka::client::DefaultClientContext;
use rdkafka::types::RDKafkaErrorCode;
use std::collections::HashMap;
use std::time::Duration;
use tracing::{debug, info};

use super::config::client_config;
use super::error::{KafkaError, Result};

/// Desired shape of a topic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicSpec {
    pub name: String,
    pub partitions: i32,
    pub replication_factor: i32,
    pub config: HashMap<String, String>,
}

impl TopicSpec {
    /// A compacted topic, the shape every changelog uses.
    pub fn compacted(name: impl Into<String>, partitions: i32) -> Self {
        let mut config = HashMap::new();
        config.insert("cleanup.policy".to_string(), "compact".to_string());
        Self {
            name: name.into(),
            partitions,
            replication_factor: 1,
            config,
        }
    }
}

#[async_trait]
pub trait TopicAdmin: Send + Sync {
    /// Number of partitions of an existing topic, `None` if it does not exist.
    async fn partition_count(&self, topic: &str) -> Result<Option<i32>>;

    /// Create a topic. An already existing topic is not an error.
    async fn create_topic(&self, spec: &TopicSpec) -> Result<()>;
}

/// rdkafka implementation of [`TopicAdmin`].
pub struct KafkaAdmin {
    client: AdminClient<DefaultClientContext>,
    timeout: Duration,
}

impl KafkaAdmin {
    pub fn new(broker_address: &str, timeout: Duration) -> Result<Self> {
        let mut props = HashMap::new();
        props.insert("bootstrap.servers".to_string(), broker_address.to_string());
        let client = client_config(&props)
            .create()
            .map_err(|e| KafkaError::connection(e.to_string(), broker_address))?;
        Ok(Self { client, timeout })
    }
}

#[async_trait]
impl TopicAdmin for KafkaAdmin {
    async fn partition_count(&self, topic: &str) -> Result<Option<i32>> {
        let metadata = self
            .client
            .inner()
            .fetch_metadata(Some(topic), self.timeout)
            .map_err(|e| KafkaError::topic_metadata(e.to_string(), topic))?;

        let count = metadata
            .topics()
            .iter()
            .find(|t| t.name() == topic && t.error().is_none())
            .map(|t| t.partitions().len() as i32)
            .filter(|count| *count > 0);
        Ok(count)
    }

    async fn create_topic(&self, spec: &TopicSpec) -> Result<()> {
        let mut topic = NewTopic::new(
            &spec.name,
            spec.partitions,
            TopicReplication::Fixed(spec.replication_factor),
        );
        for (key, value) in &spec.config {
            topic = topic.set(key, value);
        }

        let options = AdminOptions::new().request_timeout(Some(self.timeout));
        let results = self
            .client
            .create_topics(&[topic], &options)
            .await
            .map_err(|e| KafkaError::topic_metadata(e.to_string(), spec.name.clone()))?;

        for result in results {
            match result {
                Ok(name) => info!(topic = %name, partitions = spec.partitions, "Topic created"),
                Err((name, RDKafkaErrorCode::TopicAlreadyExists)) => {
                    debug!(topic = %name, "Topic already exists")
                }
                Err((name, code)) => {
                    return Err(KafkaError::topic_metadata(code.to_string(), name));
                }
            }
        }
        Ok(())
    }
}
