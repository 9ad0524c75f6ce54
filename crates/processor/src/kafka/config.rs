//! librdkafka client properties.
//!
//! Converts [`ApplicationConfig`] into the property maps handed to the
//! rdkafka consumer, producer and admin clients.

use crate::config::ApplicationConfig;
use std::collections::HashMap;

/// Consumer properties derived from the application config.
#[derive(Debug, Clone)]
pub struct KafkaConsumerConfig {
    pub broker_address: String,
    pub group_id: String,
    pub auto_offset_reset: String,
    pub enable_auto_commit: bool,
    pub assignment_strategy: String,
    pub extra: HashMap<String, String>,
}

impl KafkaConsumerConfig {
    pub fn from_app(config: &ApplicationConfig) -> Self {
        Self {
            broker_address: config.broker_address.clone(),
            group_id: config.consumer_group.clone(),
            auto_offset_reset: config.auto_offset_reset.as_str().to_string(),
            enable_auto_commit: config.auto_commit_enable,
            assignment_strategy: config.assignment_strategy.clone(),
            extra: config.consumer_extra_config.clone(),
        }
    }

    /// Validate configuration.
    pub fn validate(&self) -> Result<(), String> {
        if self.broker_address.is_empty() {
            return Err("broker_address cannot be empty".to_string());
        }
        if self.group_id.is_empty() {
            return Err("group_id cannot be empty".to_string());
        }
        Ok(())
    }

    /// Convert to rdkafka ClientConfig properties.
    ///
    /// Offsets are only ever stored explicitly after a record has been
    /// processed, so `enable.auto.offset.store` is always off.
    pub fn to_rdkafka_properties(&self) -> HashMap<String, String> {
        let mut props = HashMap::new();

        props.insert("bootstrap.servers".to_string(), self.broker_address.clone());
        props.insert("group.id".to_string(), self.group_id.clone());
        props.insert(
            "auto.offset.reset".to_string(),
            self.auto_offset_reset.clone(),
        );
        props.insert(
            "enable.auto.commit".to_string(),
            self.enable_auto_commit.to_string(),
        );
        props.insert("enable.auto.offset.store".to_string(), "false".to_string());
        props.insert(
            "partition.assignment.strategy".to_string(),
            self.assignment_strategy.clone(),
        );
        props.insert("enable.partition.eof".to_string(), "false".to_string());

        for (key, value) in &self.extra {
            props.insert(key.clone(), value.clone());
        }

        props
    }
}

/// Producer properties derived from the application config.
#[derive(Debug, Clone)]
pub struct KafkaProducerConfig {
    pub broker_address: String,
    pub extra: HashMap<String, String>,
}

impl KafkaProducerConfig {
    pub fn from_app(config: &ApplicationConfig) -> Self {
        Self {
            broker_address: config.broker_address.clone(),
            extra: config.producer_extra_config.clone(),
        }
    }

    /// Convert to rdkafka ClientConfig properties.
    pub fn to_rdkafka_properties(&self) -> HashMap<String, String> {
        let mut props = HashMap::new();

        props.insert("bootstrap.servers".to_string(), self.broker_address.clone());
        props.insert("enable.idempotence".to_string(), "true".to_string());
        props.insert("acks".to_string(), "all".to_string());
        props.insert("linger.ms".to_string(), "5".to_string());

        for (key, value) in &self.extra {
            props.insert(key.clone(), value.clone());
        }

        props
    }
}

pub(crate) fn client_config(props: &HashMap<String, String>) -> rdkafka::ClientConfig {
    let mut client_config = rdkafka::ClientConfig::new();
    for (key, value) in props {
        client_config.set(key, value);
    }
    client_config
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_consumer_properties() {
        let mut app = ApplicationConfig::default();
        app.consumer_group = "orders".to_string();
        app.consumer_extra_config
            .insert("session.timeout.ms".to_string(), "6000".to_string());

        let props = KafkaConsumerConfig::from_app(&app).to_rdkafka_properties();
        assert_eq!(props.get("group.id").map(String::as_str), Some("orders"));
        assert_eq!(
            props.get("enable.auto.offset.store").map(String::as_str),
            Some("false")
        );
        assert_eq!(
            props.get("partition.assignment.strategy").map(String::as_str),
            Some("cooperative-sticky")
        );
        assert_eq!(
            props.get("session.timeout.ms").map(String::as_str),
            Some("6000")
        );
    }

    #[test]
    fn test_consumer_validation() {
        let mut config = KafkaConsumerConfig::from_app(&ApplicationConfig::default());
        assert!(config.validate().is_ok());
        config.group_id.clear();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_producer_extra_overrides_defaults() {
        let mut app = ApplicationConfig::default();
        app.producer_extra_config
            .insert("linger.ms".to_string(), "50".to_string());

        let props = KafkaProducerConfig::from_app(&app).to_rdkafka_properties();
        assert_eq!(props.get("linger.ms").map(String::as_str), Some("50"));
    }
}
