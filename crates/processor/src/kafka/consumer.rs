//! Consumer adapter.
//!
//! The processing loop talks to the message log only through the [`Consumer`]
//! trait. Group rebalances are surfaced as [`ConsumerEvent::Rebalance`] from
//! the same `poll` call that returns records, and are always delivered before
//! any record fetched after them, so rebalance handling never interleaves
//! with the processing of a record.

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use parking_lot::Mutex;
use rdkafka::bindings;
use rdkafka::client::NativeClient;
use rdkafka::consumer::{CommitMode, Consumer as _, ConsumerContext, StreamConsumer};
use rdkafka::message::{BorrowedMessage, Headers};
use rdkafka::types::RDKafkaRespErr;
use rdkafka::{ClientContext, Message, Offset, TopicPartitionList};
use std::collections::VecDeque;
use std::time::Duration;
use tracing::{error, info, warn};

use super::config::{client_config, KafkaConsumerConfig};
use super::error::{KafkaError, Result};
use crate::core::{MessageContext, TopicPartition};

/// A raw record as returned by the consumer.
#[derive(Debug, Clone, PartialEq)]
pub struct ConsumedMessage {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
    pub key: Option<Vec<u8>>,
    pub payload: Option<Vec<u8>>,
    pub timestamp: Option<DateTime<Utc>>,
    pub headers: Vec<(String, Vec<u8>)>,
}

impl ConsumedMessage {
    pub fn topic_partition(&self) -> TopicPartition {
        TopicPartition::new(self.topic.clone(), self.partition)
    }

    pub fn header(&self, name: &str) -> Option<&[u8]> {
        self.headers
            .iter()
            .find(|(key, _)| key == name)
            .map(|(_, value)| value.as_slice())
    }

    /// Metadata shared by every row decoded from this message.
    pub fn context(&self) -> MessageContext {
        MessageContext {
            topic: self.topic.clone(),
            partition: self.partition,
            offset: self.offset,
            key: self.key.clone(),
            timestamp: self.timestamp,
            headers: self.headers.clone(),
            size: self.payload.as_ref().map_or(0, Vec::len),
        }
    }
}

/// Partition ownership change reported by the group protocol.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RebalanceEvent {
    Assigned(Vec<TopicPartition>),
    Revoked(Vec<TopicPartition>),
    /// Partitions taken away without a clean handoff
    Lost(Vec<TopicPartition>),
}

/// Everything `poll` can return.
#[derive(Debug, Clone, PartialEq)]
pub enum ConsumerEvent {
    Rebalance(RebalanceEvent),
    Message(ConsumedMessage),
}

/// Input adapter used by the processing loop and the recovery manager.
#[async_trait]
pub trait Consumer: Send + Sync {
    /// Join the group and subscribe to the given topics.
    fn subscribe(&mut self, topics: &[String]) -> Result<()>;

    /// Wait up to `timeout` for the next rebalance event or record.
    async fn poll(&mut self, timeout: Duration) -> Result<Option<ConsumerEvent>>;

    /// Mark the next offsets to consume. Committed later by the client.
    fn store_offsets(&mut self, offsets: &[(TopicPartition, i64)]) -> Result<()>;

    /// Synchronously commit stored offsets.
    async fn commit(&mut self) -> Result<()>;

    /// Committed offsets of the group, `None` when nothing was committed.
    async fn committed(
        &self,
        partitions: &[TopicPartition],
        timeout: Duration,
    ) -> Result<Vec<(TopicPartition, Option<i64>)>>;

    /// Add partitions to the current assignment, starting at the given offsets.
    fn incremental_assign(&mut self, partitions: &[(TopicPartition, i64)]) -> Result<()>;

    /// Remove partitions from the current assignment.
    fn incremental_unassign(&mut self, partitions: &[TopicPartition]) -> Result<()>;

    fn pause(&mut self, partitions: &[TopicPartition]) -> Result<()>;

    fn resume(&mut self, partitions: &[TopicPartition]) -> Result<()>;

    /// Move the fetch position of an assigned partition.
    async fn seek(&mut self, partition: &TopicPartition, offset: i64, timeout: Duration)
        -> Result<()>;

    /// Low and high watermarks of a partition.
    async fn watermarks(&self, partition: &TopicPartition, timeout: Duration)
        -> Result<(i64, i64)>;

    /// Commit what is stored and leave the group.
    async fn close(&mut self) -> Result<()>;
}

/// Records rebalance callbacks so `poll` can surface them in order.
struct RebalanceRecorder {
    events: Mutex<VecDeque<RebalanceEvent>>,
}

impl RebalanceRecorder {
    fn new() -> Self {
        Self {
            events: Mutex::new(VecDeque::new()),
        }
    }

    fn record_revoke(&self, partitions: Vec<TopicPartition>, lost: bool) {
        let event = if lost {
            warn!(partitions = ?partitions, "Partition assignment lost");
            RebalanceEvent::Lost(partitions)
        } else {
            info!(partitions = ?partitions, "Partition revocation");
            RebalanceEvent::Revoked(partitions)
        };
        self.events.lock().push_back(event);
    }

    fn record_assign(&self, partitions: Vec<TopicPartition>) {
        info!(partitions = ?partitions, "Partitions assigned");
        self.events
            .lock()
            .push_back(RebalanceEvent::Assigned(partitions));
    }

    fn drain(&self) -> Vec<RebalanceEvent> {
        self.events.lock().drain(..).collect()
    }
}

/// Context with no overrides; runs the client's stock assign/unassign.
struct StockRebalance;

impl ClientContext for StockRebalance {}

impl ConsumerContext for StockRebalance {}

impl ClientContext for RebalanceRecorder {}

impl ConsumerContext for RebalanceRecorder {
    fn rebalance(
        &self,
        native_client: &NativeClient,
        err: RDKafkaRespErr,
        tpl: &mut TopicPartitionList,
    ) {
        let partitions = to_partitions(tpl);
        match err {
            RDKafkaRespErr::RD_KAFKA_RESP_ERR__REVOKE_PARTITIONS => {
                // librdkafka clears the lost flag once the partitions are unassigned.
                // SAFETY: the client handle is valid for the duration of the callback.
                let lost =
                    unsafe { bindings::rd_kafka_assignment_lost(native_client.ptr()) } == 1;
                self.record_revoke(partitions, lost);
                StockRebalance.rebalance(native_client, err, tpl);
            }
            RDKafkaRespErr::RD_KAFKA_RESP_ERR__ASSIGN_PARTITIONS => {
                StockRebalance.rebalance(native_client, err, tpl);
                self.record_assign(partitions);
            }
            _ => {
                error!(error = ?err, "Rebalance error");
                StockRebalance.rebalance(native_client, err, tpl);
            }
        }
    }
}

/// rdkafka implementation of [`Consumer`] on top of a `StreamConsumer`.
pub struct KafkaConsumer {
    consumer: StreamConsumer<RebalanceRecorder>,
    pending: VecDeque<ConsumerEvent>,
    group_id: String,
}

impl KafkaConsumer {
    pub fn new(config: KafkaConsumerConfig) -> Result<Self> {
        config
            .validate()
            .map_err(|e| KafkaError::invalid_config(e, None))?;

        let context = RebalanceRecorder::new();
        let consumer: StreamConsumer<RebalanceRecorder> =
            client_config(&config.to_rdkafka_properties())
                .create_with_context(context)
                .map_err(|e| KafkaError::connection(e.to_string(), config.broker_address.clone()))?;

        info!(
            group_id = %config.group_id,
            brokers = %config.broker_address,
            "Kafka consumer created"
        );

        Ok(Self {
            consumer,
            pending: VecDeque::new(),
            group_id: config.group_id,
        })
    }

    fn drain_rebalances(&mut self) {
        for event in self.consumer.context().drain() {
            self.pending.push_back(ConsumerEvent::Rebalance(event));
        }
    }
}

fn to_partitions(tpl: &TopicPartitionList) -> Vec<TopicPartition> {
    tpl.elements()
        .iter()
        .map(|elem| TopicPartition::new(elem.topic(), elem.partition()))
        .collect()
}

fn to_tpl(partitions: &[TopicPartition]) -> TopicPartitionList {
    let mut tpl = TopicPartitionList::new();
    for tp in partitions {
        tpl.add_partition(&tp.topic, tp.partition);
    }
    tpl
}

fn to_tpl_with_offsets(offsets: &[(TopicPartition, i64)]) -> Result<TopicPartitionList> {
    let mut tpl = TopicPartitionList::new();
    for (tp, offset) in offsets {
        tpl.add_partition_offset(&tp.topic, tp.partition, Offset::Offset(*offset))
            .map_err(|e| {
                KafkaError::offset_commit(e.to_string(), tp.topic.clone(), tp.partition, *offset)
            })?;
    }
    Ok(tpl)
}

fn to_consumed(message: &BorrowedMessage<'_>) -> ConsumedMessage {
    let headers = message
        .headers()
        .map(|headers| {
            headers
                .iter()
                .map(|header| {
                    (
                        header.key.to_string(),
                        header.value.map(<[u8]>::to_vec).unwrap_or_default(),
                    )
                })
                .collect()
        })
        .unwrap_or_default();

    ConsumedMessage {
        topic: message.topic().to_string(),
        partition: message.partition(),
        offset: message.offset(),
        key: message.key().map(<[u8]>::to_vec),
        payload: message.payload().map(<[u8]>::to_vec),
        timestamp: message
            .timestamp()
            .to_millis()
            .and_then(|ms| Utc.timestamp_millis_opt(ms).single()),
        headers,
    }
}

#[async_trait]
impl Consumer for KafkaConsumer {
    fn subscribe(&mut self, topics: &[String]) -> Result<()> {
        let topics: Vec<&str> = topics.iter().map(String::as_str).collect();
        self.consumer
            .subscribe(&topics)
            .map_err(|e| KafkaError::group_coordination(e.to_string(), self.group_id.clone()))?;
        info!(group_id = %self.group_id, topics = ?topics, "Subscribed");
        Ok(())
    }

    async fn poll(&mut self, timeout: Duration) -> Result<Option<ConsumerEvent>> {
        self.drain_rebalances();
        if let Some(event) = self.pending.pop_front() {
            return Ok(Some(event));
        }

        let received = match tokio::time::timeout(timeout, self.consumer.recv()).await {
            Err(_elapsed) => None,
            Ok(Ok(message)) => Some(Ok(to_consumed(&message))),
            Ok(Err(e)) => Some(Err(KafkaError::from(e))),
        };

        self.drain_rebalances();
        match received {
            Some(Ok(message)) => self.pending.push_back(ConsumerEvent::Message(message)),
            Some(Err(e)) => return Err(e),
            None => {}
        }

        Ok(self.pending.pop_front())
    }

    fn store_offsets(&mut self, offsets: &[(TopicPartition, i64)]) -> Result<()> {
        let tpl = to_tpl_with_offsets(offsets)?;
        self.consumer.store_offsets(&tpl)?;
        Ok(())
    }

    async fn commit(&mut self) -> Result<()> {
        match self.consumer.commit_consumer_state(CommitMode::Sync) {
            Ok(()) => Ok(()),
            // nothing stored since the last commit
            Err(e)
                if e.rdkafka_error_code()
                    == Some(rdkafka::types::RDKafkaErrorCode::NoOffset) =>
            {
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn committed(
        &self,
        partitions: &[TopicPartition],
        timeout: Duration,
    ) -> Result<Vec<(TopicPartition, Option<i64>)>> {
        let committed = self
            .consumer
            .committed_offsets(to_tpl(partitions), timeout)?;

        Ok(committed
            .elements()
            .iter()
            .map(|elem| {
                let offset = match elem.offset() {
                    Offset::Offset(offset) => Some(offset),
                    _ => None,
                };
                (TopicPartition::new(elem.topic(), elem.partition()), offset)
            })
            .collect())
    }

    fn incremental_assign(&mut self, partitions: &[(TopicPartition, i64)]) -> Result<()> {
        let tpl = to_tpl_with_offsets(partitions)?;
        self.consumer.incremental_assign(&tpl)?;
        Ok(())
    }

    fn incremental_unassign(&mut self, partitions: &[TopicPartition]) -> Result<()> {
        self.consumer.incremental_unassign(&to_tpl(partitions))?;
        Ok(())
    }

    fn pause(&mut self, partitions: &[TopicPartition]) -> Result<()> {
        self.consumer.pause(&to_tpl(partitions))?;
        Ok(())
    }

    fn resume(&mut self, partitions: &[TopicPartition]) -> Result<()> {
        self.consumer.resume(&to_tpl(partitions))?;
        Ok(())
    }

    async fn seek(
        &mut self,
        partition: &TopicPartition,
        offset: i64,
        timeout: Duration,
    ) -> Result<()> {
        self.consumer.seek(
            &partition.topic,
            partition.partition,
            Offset::Offset(offset),
            timeout,
        )?;
        Ok(())
    }

    async fn watermarks(
        &self,
        partition: &TopicPartition,
        timeout: Duration,
    ) -> Result<(i64, i64)> {
        self.consumer
            .fetch_watermarks(&partition.topic, partition.partition, timeout)
            .map_err(|e| match KafkaError::from(e) {
                KafkaError::PartitionNotFound { .. } => {
                    KafkaError::partition_not_found(partition.topic.clone(), partition.partition)
                }
                other => other,
            })
    }

    async fn close(&mut self) -> Result<()> {
        let result = self.commit().await;
        self.consumer.unsubscribe();
        info!(group_id = %self.group_id, "Kafka consumer closed");
        result
    }
}
