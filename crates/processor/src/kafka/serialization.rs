//! Payload decoding.
//!
//! A [`RowDeserializer`] turns one consumed message into zero or more row
//! values. Returning several values is how a single message fans out into
//! multiple rows that share the same offset.

use serde_json::Value;

use super::consumer::ConsumedMessage;
use super::error::{KafkaError, Result};

pub trait RowDeserializer: Send + Sync {
    fn deserialize(&self, message: &ConsumedMessage) -> Result<Vec<Value>>;
}

/// Decodes JSON payloads.
#[derive(Debug, Clone, Default)]
pub struct JsonDeserializer {
    /// Emit one row per element when the payload is a top-level array
    pub split_arrays: bool,
}

impl JsonDeserializer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn split_arrays(mut self, split: bool) -> Self {
        self.split_arrays = split;
        self
    }
}

impl RowDeserializer for JsonDeserializer {
    fn deserialize(&self, message: &ConsumedMessage) -> Result<Vec<Value>> {
        let Some(payload) = message.payload.as_deref() else {
            // tombstones carry no row
            return Ok(Vec::new());
        };

        let value: Value = serde_json::from_slice(payload).map_err(|e| {
            KafkaError::deserialization(
                e.to_string(),
                Some(format!(
                    "{}[{}]@{}",
                    message.topic, message.partition, message.offset
                )),
                Some(payload),
            )
        })?;

        match value {
            Value::Array(items) if self.split_arrays => Ok(items),
            value => Ok(vec![value]),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn message(payload: Option<&[u8]>) -> ConsumedMessage {
        ConsumedMessage {
            topic: "orders".to_string(),
            partition: 0,
            offset: 4,
            key: None,
            payload: payload.map(<[u8]>::to_vec),
            timestamp: None,
            headers: Vec::new(),
        }
    }

    #[test]
    fn test_single_value() {
        let rows = JsonDeserializer::new()
            .deserialize(&message(Some(br#"{"a":1}"#)))
            .unwrap();
        assert_eq!(rows, vec![json!({"a": 1})]);
    }

    #[test]
    fn test_array_fan_out() {
        let payload = br#"[{"a":1},{"a":2}]"#;
        let plain = JsonDeserializer::new()
            .deserialize(&message(Some(payload)))
            .unwrap();
        assert_eq!(plain.len(), 1);

        let split = JsonDeserializer::new()
            .split_arrays(true)
            .deserialize(&message(Some(payload)))
            .unwrap();
        assert_eq!(split, vec![json!({"a": 1}), json!({"a": 2})]);
    }

    #[test]
    fn test_invalid_payload() {
        let err = JsonDeserializer::new()
            .deserialize(&message(Some(b"not json")))
            .unwrap_err();
        assert!(matches!(err, KafkaError::Deserialization { .. }));
        assert!(err.to_string().contains("Deserialization"));
    }

    #[test]
    fn test_tombstone_has_no_rows() {
        let rows = JsonDeserializer::new().deserialize(&message(None)).unwrap();
        assert!(rows.is_empty());
    }
}
