//! In-memory message log.
//!
//! [`InMemoryBroker`] implements enough of the broker to drive the runtime
//! deterministically: partitioned topics, group offsets, pause/resume, seek
//! and watermarks. Rebalances are triggered from the outside through a
//! [`ConsumerControl`] handle.
//!
//! Auto commit is modelled as an immediate commit of every stored offset.
//!
//! # Example
//!
//! ```rust,no_run
//! use rowstream::kafka::memory::InMemoryBroker;
//! use rowstream::config::AutoOffsetReset;
//!
//! let broker = InMemoryBroker::new();
//! broker.create_topic("orders", 2);
//! broker.append_json("orders", 0, Some(b"customer-1"), &serde_json::json!({"amount": 3}));
//!
//! let consumer = broker.consumer("billing", AutoOffsetReset::Earliest, true);
//! let control = consumer.control();
//! let producer = broker.producer();
//! # let _ = (control, producer);
//! ```

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use super::admin::{TopicAdmin, TopicSpec};
use super::consumer::{ConsumedMessage, Consumer, ConsumerEvent, RebalanceEvent};
use super::error::{KafkaError, Result};
use super::producer::{DeliveryReport, Producer, ProducerRecord};
use crate::config::AutoOffsetReset;
use crate::core::TopicPartition;

const IDLE_POLL: Duration = Duration::from_millis(5);

#[derive(Debug, Clone)]
struct StoredRecord {
    key: Option<Vec<u8>>,
    value: Option<Vec<u8>>,
    headers: Vec<(String, Vec<u8>)>,
    timestamp: DateTime<Utc>,
}

#[derive(Default)]
struct BrokerState {
    topics: DashMap<String, Vec<Vec<StoredRecord>>>,
    topic_config: DashMap<String, HashMap<String, String>>,
    committed: DashMap<(String, TopicPartition), i64>,
    failing_topics: DashMap<String, String>,
}

/// Shared in-process broker. Cloning yields another handle to the same log.
#[derive(Clone, Default)]
pub struct InMemoryBroker {
    state: Arc<BrokerState>,
}

impl InMemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a topic. Returns `false` if it already exists.
    pub fn create_topic(&self, name: &str, partitions: i32) -> bool {
        if self.state.topics.contains_key(name) {
            return false;
        }
        let partitions = (0..partitions.max(1)).map(|_| Vec::new()).collect();
        self.state.topics.insert(name.to_string(), partitions);
        true
    }

    pub fn topic_exists(&self, name: &str) -> bool {
        self.state.topics.contains_key(name)
    }

    /// Topic-level settings given at creation time through [`TopicAdmin`].
    pub fn topic_config(&self, name: &str) -> Option<HashMap<String, String>> {
        self.state.topic_config.get(name).map(|c| c.clone())
    }

    pub fn partition_count(&self, topic: &str) -> Option<i32> {
        self.state.topics.get(topic).map(|p| p.len() as i32)
    }

    /// Append a record and return its (partition, offset).
    pub fn append(&self, record: &ProducerRecord) -> Result<(i32, i64)> {
        let mut partitions = self
            .state
            .topics
            .get_mut(&record.topic)
            .ok_or_else(|| KafkaError::partition_not_found(record.topic.clone(), record.partition.unwrap_or(-1)))?;

        let count = partitions.len() as i32;
        let partition = match record.partition {
            Some(p) if p >= 0 && p < count => p,
            Some(p) => return Err(KafkaError::partition_not_found(record.topic.clone(), p)),
            None => record
                .key
                .as_deref()
                .map(|key| partition_for_key(key, count))
                .unwrap_or(0),
        };

        let log = &mut partitions[partition as usize];
        log.push(StoredRecord {
            key: record.key.clone(),
            value: record.value.clone(),
            headers: record.headers.clone(),
            timestamp: record.timestamp.unwrap_or_else(Utc::now),
        });
        Ok((partition, log.len() as i64 - 1))
    }

    /// Append a JSON value to a partition and return its offset.
    pub fn append_json(
        &self,
        topic: &str,
        partition: i32,
        key: Option<&[u8]>,
        value: &serde_json::Value,
    ) -> Result<i64> {
        let mut record = ProducerRecord::new(topic)
            .with_partition(partition)
            .with_json(value)?;
        record.key = key.map(<[u8]>::to_vec);
        self.append(&record).map(|(_, offset)| offset)
    }

    pub fn watermarks(&self, tp: &TopicPartition) -> Result<(i64, i64)> {
        let partitions = self
            .state
            .topics
            .get(&tp.topic)
            .ok_or_else(|| KafkaError::partition_not_found(tp.topic.clone(), tp.partition))?;
        let log = usize::try_from(tp.partition)
            .ok()
            .and_then(|p| partitions.get(p))
            .ok_or_else(|| KafkaError::partition_not_found(tp.topic.clone(), tp.partition))?;
        Ok((0, log.len() as i64))
    }

    /// Every record of a partition, in offset order.
    pub fn messages(&self, tp: &TopicPartition) -> Vec<ConsumedMessage> {
        let Ok((_, high)) = self.watermarks(tp) else {
            return Vec::new();
        };
        (0..high).filter_map(|offset| self.fetch(tp, offset)).collect()
    }

    fn fetch(&self, tp: &TopicPartition, offset: i64) -> Option<ConsumedMessage> {
        let partitions = self.state.topics.get(&tp.topic)?;
        let log = partitions.get(usize::try_from(tp.partition).ok()?)?;
        let record = log.get(usize::try_from(offset).ok()?)?;
        Some(ConsumedMessage {
            topic: tp.topic.clone(),
            partition: tp.partition,
            offset,
            key: record.key.clone(),
            payload: record.value.clone(),
            timestamp: Some(record.timestamp),
            headers: record.headers.clone(),
        })
    }

    pub fn committed(&self, group: &str, tp: &TopicPartition) -> Option<i64> {
        self.state
            .committed
            .get(&(group.to_string(), tp.clone()))
            .map(|offset| *offset)
    }

    pub fn commit(&self, group: &str, tp: &TopicPartition, offset: i64) {
        self.state
            .committed
            .insert((group.to_string(), tp.clone()), offset);
    }

    /// Make every delivery to `topic` fail asynchronously.
    pub fn fail_deliveries(&self, topic: &str, reason: &str) {
        self.state
            .failing_topics
            .insert(topic.to_string(), reason.to_string());
    }

    pub fn restore_deliveries(&self, topic: &str) {
        self.state.failing_topics.remove(topic);
    }

    pub fn consumer(
        &self,
        group: &str,
        auto_offset_reset: AutoOffsetReset,
        auto_commit: bool,
    ) -> MemoryConsumer {
        MemoryConsumer {
            broker: self.clone(),
            group: group.to_string(),
            auto_offset_reset,
            auto_commit,
            state: Arc::new(Mutex::new(ConsumerState::default())),
        }
    }

    pub fn producer(&self) -> MemoryProducer {
        MemoryProducer {
            broker: self.clone(),
            reports: Arc::new(Mutex::new(Vec::new())),
        }
    }
}

fn partition_for_key(key: &[u8], count: i32) -> i32 {
    let hash = key
        .iter()
        .fold(0u32, |h, b| h.wrapping_mul(31).wrapping_add(u32::from(*b)));
    (hash % count as u32) as i32
}

#[async_trait]
impl TopicAdmin for InMemoryBroker {
    async fn partition_count(&self, topic: &str) -> Result<Option<i32>> {
        Ok(InMemoryBroker::partition_count(self, topic))
    }

    async fn create_topic(&self, spec: &TopicSpec) -> Result<()> {
        if InMemoryBroker::create_topic(self, &spec.name, spec.partitions) {
            self.state
                .topic_config
                .insert(spec.name.clone(), spec.config.clone());
        }
        Ok(())
    }
}

#[derive(Default)]
struct ConsumerState {
    subscription: Vec<String>,
    /// Fetch position per assigned partition
    assignment: BTreeMap<TopicPartition, i64>,
    paused: HashSet<TopicPartition>,
    stored: HashMap<TopicPartition, i64>,
    events: VecDeque<RebalanceEvent>,
    cursor: usize,
}

/// Consumer over an [`InMemoryBroker`].
pub struct MemoryConsumer {
    broker: InMemoryBroker,
    group: String,
    auto_offset_reset: AutoOffsetReset,
    auto_commit: bool,
    state: Arc<Mutex<ConsumerState>>,
}

impl MemoryConsumer {
    /// Handle for triggering rebalances and inspecting offsets from a test.
    pub fn control(&self) -> ConsumerControl {
        ConsumerControl {
            broker: self.broker.clone(),
            group: self.group.clone(),
            state: Arc::clone(&self.state),
        }
    }

    fn start_position(&self, tp: &TopicPartition) -> Result<i64> {
        if let Some(committed) = self.broker.committed(&self.group, tp) {
            return Ok(committed);
        }
        let (low, high) = self.broker.watermarks(tp)?;
        match self.auto_offset_reset {
            AutoOffsetReset::Earliest => Ok(low),
            AutoOffsetReset::Latest => Ok(high),
            AutoOffsetReset::Error => Err(KafkaError::consumption(
                "no committed offset and auto.offset.reset=error",
                tp.topic.clone(),
                Some(tp.partition),
                None,
            )),
        }
    }

    fn commit_partitions(&self, state: &ConsumerState, partitions: &[TopicPartition]) {
        for tp in partitions {
            if let Some(offset) = state.stored.get(tp) {
                self.broker.commit(&self.group, tp, *offset);
            }
        }
    }

    fn poll_now(&self) -> Result<Option<ConsumerEvent>> {
        let mut state = self.state.lock();

        if let Some(event) = state.events.pop_front() {
            match &event {
                RebalanceEvent::Assigned(tps) => {
                    for tp in tps {
                        let position = self.start_position(tp)?;
                        state.assignment.insert(tp.clone(), position);
                    }
                }
                RebalanceEvent::Revoked(tps) => {
                    if self.auto_commit {
                        self.commit_partitions(&state, tps);
                    }
                    for tp in tps {
                        state.assignment.remove(tp);
                        state.paused.remove(tp);
                        state.stored.remove(tp);
                    }
                }
                RebalanceEvent::Lost(tps) => {
                    for tp in tps {
                        state.assignment.remove(tp);
                        state.paused.remove(tp);
                        state.stored.remove(tp);
                    }
                }
            }
            debug!(group = %self.group, event = ?event, "Rebalance delivered");
            return Ok(Some(ConsumerEvent::Rebalance(event)));
        }

        let candidates: Vec<(TopicPartition, i64)> = state
            .assignment
            .iter()
            .filter(|(tp, _)| !state.paused.contains(*tp))
            .map(|(tp, position)| (tp.clone(), *position))
            .collect();
        if candidates.is_empty() {
            return Ok(None);
        }

        let start = state.cursor % candidates.len();
        for i in 0..candidates.len() {
            let (tp, position) = &candidates[(start + i) % candidates.len()];
            if let Some(message) = self.broker.fetch(tp, *position) {
                state.assignment.insert(tp.clone(), position + 1);
                state.cursor = start + i + 1;
                return Ok(Some(ConsumerEvent::Message(message)));
            }
        }
        Ok(None)
    }
}

#[async_trait]
impl Consumer for MemoryConsumer {
    fn subscribe(&mut self, topics: &[String]) -> Result<()> {
        let mut state = self.state.lock();
        state.subscription = topics.to_vec();

        let mut assigned = Vec::new();
        for topic in topics {
            let count = self.broker.partition_count(topic).ok_or_else(|| {
                KafkaError::partition_not_found(topic.clone(), -1)
            })?;
            assigned.extend((0..count).map(|p| TopicPartition::new(topic.clone(), p)));
        }
        if !assigned.is_empty() {
            state.events.push_back(RebalanceEvent::Assigned(assigned));
        }
        Ok(())
    }

    async fn poll(&mut self, timeout: Duration) -> Result<Option<ConsumerEvent>> {
        if let Some(event) = self.poll_now()? {
            return Ok(Some(event));
        }
        tokio::time::sleep(timeout.min(IDLE_POLL)).await;
        Ok(None)
    }

    fn store_offsets(&mut self, offsets: &[(TopicPartition, i64)]) -> Result<()> {
        let mut state = self.state.lock();
        for (tp, offset) in offsets {
            if !state.assignment.contains_key(tp) {
                return Err(KafkaError::offset_commit(
                    "partition is not assigned",
                    tp.topic.clone(),
                    tp.partition,
                    *offset,
                ));
            }
            state.stored.insert(tp.clone(), *offset);
            if self.auto_commit {
                self.broker.commit(&self.group, tp, *offset);
            }
        }
        Ok(())
    }

    async fn commit(&mut self) -> Result<()> {
        let state = self.state.lock();
        let partitions: Vec<TopicPartition> = state.stored.keys().cloned().collect();
        self.commit_partitions(&state, &partitions);
        Ok(())
    }

    async fn committed(
        &self,
        partitions: &[TopicPartition],
        _timeout: Duration,
    ) -> Result<Vec<(TopicPartition, Option<i64>)>> {
        Ok(partitions
            .iter()
            .map(|tp| (tp.clone(), self.broker.committed(&self.group, tp)))
            .collect())
    }

    fn incremental_assign(&mut self, partitions: &[(TopicPartition, i64)]) -> Result<()> {
        let mut state = self.state.lock();
        for (tp, offset) in partitions {
            self.broker.watermarks(tp)?;
            state.assignment.insert(tp.clone(), *offset);
        }
        Ok(())
    }

    fn incremental_unassign(&mut self, partitions: &[TopicPartition]) -> Result<()> {
        let mut state = self.state.lock();
        for tp in partitions {
            state.assignment.remove(tp);
            state.paused.remove(tp);
        }
        Ok(())
    }

    fn pause(&mut self, partitions: &[TopicPartition]) -> Result<()> {
        let mut state = self.state.lock();
        state.paused.extend(partitions.iter().cloned());
        Ok(())
    }

    fn resume(&mut self, partitions: &[TopicPartition]) -> Result<()> {
        let mut state = self.state.lock();
        for tp in partitions {
            state.paused.remove(tp);
        }
        Ok(())
    }

    async fn seek(
        &mut self,
        partition: &TopicPartition,
        offset: i64,
        _timeout: Duration,
    ) -> Result<()> {
        let mut state = self.state.lock();
        match state.assignment.get_mut(partition) {
            Some(position) => {
                *position = offset;
                Ok(())
            }
            None => Err(KafkaError::consumption(
                "cannot seek an unassigned partition",
                partition.topic.clone(),
                Some(partition.partition),
                Some(offset),
            )),
        }
    }

    async fn watermarks(
        &self,
        partition: &TopicPartition,
        _timeout: Duration,
    ) -> Result<(i64, i64)> {
        self.broker.watermarks(partition)
    }

    async fn close(&mut self) -> Result<()> {
        let mut state = self.state.lock();
        let partitions: Vec<TopicPartition> = state.stored.keys().cloned().collect();
        self.commit_partitions(&state, &partitions);
        state.assignment.clear();
        state.paused.clear();
        state.events.clear();
        Ok(())
    }
}

/// Test-side handle of a [`MemoryConsumer`].
#[derive(Clone)]
pub struct ConsumerControl {
    broker: InMemoryBroker,
    group: String,
    state: Arc<Mutex<ConsumerState>>,
}

impl ConsumerControl {
    /// Queue a clean revocation.
    pub fn revoke(&self, partitions: Vec<TopicPartition>) {
        self.state
            .lock()
            .events
            .push_back(RebalanceEvent::Revoked(partitions));
    }

    /// Queue an assignment loss.
    pub fn lose(&self, partitions: Vec<TopicPartition>) {
        self.state
            .lock()
            .events
            .push_back(RebalanceEvent::Lost(partitions));
    }

    /// Queue an assignment.
    pub fn assign(&self, partitions: Vec<TopicPartition>) {
        self.state
            .lock()
            .events
            .push_back(RebalanceEvent::Assigned(partitions));
    }

    /// Next offset to consume as stored by the application.
    pub fn stored_offset(&self, tp: &TopicPartition) -> Option<i64> {
        self.state.lock().stored.get(tp).copied()
    }

    pub fn committed_offset(&self, tp: &TopicPartition) -> Option<i64> {
        self.broker.committed(&self.group, tp)
    }

    pub fn position(&self, tp: &TopicPartition) -> Option<i64> {
        self.state.lock().assignment.get(tp).copied()
    }

    pub fn assignment(&self) -> Vec<TopicPartition> {
        self.state.lock().assignment.keys().cloned().collect()
    }

    pub fn is_paused(&self, tp: &TopicPartition) -> bool {
        self.state.lock().paused.contains(tp)
    }
}

/// Producer over an [`InMemoryBroker`]. Records are appended on `produce`.
#[derive(Clone)]
pub struct MemoryProducer {
    broker: InMemoryBroker,
    reports: Arc<Mutex<Vec<DeliveryReport>>>,
}

#[async_trait]
impl Producer for MemoryProducer {
    fn produce(&self, record: ProducerRecord) -> Result<()> {
        if !self.broker.topic_exists(&record.topic) {
            return Err(KafkaError::production(
                "unknown topic",
                record.topic.clone(),
                record.partition,
            ));
        }

        let failure = self
            .broker
            .state
            .failing_topics
            .get(&record.topic)
            .map(|reason| reason.clone());
        let report = match failure {
            Some(reason) => DeliveryReport::failed(
                record.topic.clone(),
                record.partition.unwrap_or(-1),
                KafkaError::production(reason, record.topic.clone(), record.partition),
            ),
            None => {
                let (partition, offset) = self.broker.append(&record)?;
                DeliveryReport::delivered(record.topic.clone(), partition, offset)
            }
        };
        self.reports.lock().push(report);
        Ok(())
    }

    async fn poll(&self, _timeout: Duration) -> Vec<DeliveryReport> {
        std::mem::take(&mut *self.reports.lock())
    }

    async fn flush(&self, _timeout: Duration) -> Result<()> {
        Ok(())
    }
}
