//! Changelog recovery
//!
//! When a store partition is assigned, its changelog partition is compared
//! with what the local files already reflect. Missing entries are replayed
//! before the input partition is resumed:
//!
//! - the input partition is paused while it has a pending [`RecoveryPartition`]
//! - the changelog partition is assigned to the consumer at the first
//!   missing offset
//! - each [`RecoveryManager::do_recovery`] call polls the consumer once and
//!   applies what it receives
//! - once a changelog partition reaches its high watermark it is unassigned,
//!   and the input partition is resumed after its last task finishes

use std::collections::BTreeMap;
use std::time::Duration;
use tracing::{debug, info, warn};

use super::changelog::{decode_processed_offset, PROCESSED_OFFSET_HEADER};
use super::partition::StorePartition;
use crate::core::TopicPartition;
use crate::error::{StateError, StateResult};
use crate::kafka::{ConsumedMessage, Consumer, ConsumerEvent};

/// Replay task of one store partition.
#[derive(Debug)]
pub struct RecoveryPartition {
    input: TopicPartition,
    store_name: String,
    changelog: TopicPartition,
    partition: StorePartition,
    /// Next changelog offset to apply
    offset: i64,
    high_watermark: i64,
}

impl RecoveryPartition {
    pub fn input(&self) -> &TopicPartition {
        &self.input
    }

    pub fn store_name(&self) -> &str {
        &self.store_name
    }

    pub fn changelog(&self) -> &TopicPartition {
        &self.changelog
    }

    pub fn offset(&self) -> i64 {
        self.offset
    }

    pub fn high_watermark(&self) -> i64 {
        self.high_watermark
    }

    pub fn is_complete(&self) -> bool {
        self.offset >= self.high_watermark
    }

    /// Number of changelog records left to apply.
    pub fn remaining(&self) -> i64 {
        (self.high_watermark - self.offset).max(0)
    }

    fn apply(&mut self, message: &ConsumedMessage) -> StateResult<()> {
        let corrupt = |reason: &str| StateError::CorruptChangelog {
            topic: message.topic.clone(),
            partition: message.partition,
            offset: message.offset,
            reason: reason.to_string(),
        };

        let key = message
            .key
            .as_deref()
            .ok_or_else(|| corrupt("record has no key"))?;
        let processed_offset = message
            .header(PROCESSED_OFFSET_HEADER)
            .ok_or_else(|| corrupt("missing processed offset header"))
            .and_then(|raw| {
                decode_processed_offset(raw).ok_or_else(|| corrupt("invalid processed offset header"))
            })?;

        self.partition.apply_changelog(
            key,
            message.payload.as_deref(),
            processed_offset,
            message.offset,
        )?;
        self.offset = message.offset + 1;
        Ok(())
    }
}

/// Result of one unit of recovery work.
#[derive(Debug, Default)]
pub struct RecoveryOutcome {
    /// Changelog records applied
    pub applied: u64,
    /// An event that does not belong to recovery, for the caller to handle
    pub event: Option<ConsumerEvent>,
}

/// Plans and drives changelog replay.
#[derive(Debug)]
pub struct RecoveryManager {
    tasks: BTreeMap<TopicPartition, RecoveryPartition>,
    poll_timeout: Duration,
    metadata_timeout: Duration,
}

impl RecoveryManager {
    pub fn new(poll_timeout: Duration, metadata_timeout: Duration) -> Self {
        Self {
            tasks: BTreeMap::new(),
            poll_timeout,
            metadata_timeout,
        }
    }

    /// Whether any recovery task is pending.
    pub fn recovering(&self) -> bool {
        !self.tasks.is_empty()
    }

    pub fn is_recovering(&self, input: &TopicPartition) -> bool {
        self.tasks.values().any(|task| &task.input == input)
    }

    /// Input partitions with at least one pending task.
    pub fn partitions_recovering(&self) -> usize {
        let mut inputs: Vec<&TopicPartition> = self.tasks.values().map(|t| &t.input).collect();
        inputs.sort();
        inputs.dedup();
        inputs.len()
    }

    pub fn tasks(&self) -> impl Iterator<Item = &RecoveryPartition> {
        self.tasks.values()
    }

    pub fn is_changelog_assigned(&self, changelog: &TopicPartition) -> bool {
        self.tasks.contains_key(changelog)
    }

    /// Plan recovery for one store partition.
    ///
    /// Returns `true` if a task was created, in which case `input` is paused
    /// and `changelog` assigned at the first missing offset.
    pub async fn assign_partition(
        &mut self,
        input: &TopicPartition,
        store_name: &str,
        changelog: TopicPartition,
        partition: &StorePartition,
        consumer: &mut dyn Consumer,
    ) -> StateResult<bool> {
        let (low, high) = match consumer.watermarks(&changelog, self.metadata_timeout).await {
            Ok(watermarks) => watermarks,
            Err(e) if e.is_unknown_partition() => {
                return Err(StateError::ChangelogMissing {
                    topic: changelog.topic,
                    partition: changelog.partition,
                    details: e.to_string(),
                });
            }
            Err(e) => return Err(StateError::Changelog(e)),
        };

        let start = if partition.is_recovery_required()? {
            info!(
                store = store_name,
                partition = %input,
                "Partition was lost, rebuilding from changelog"
            );
            partition.wipe()?;
            low
        } else {
            partition
                .changelog_offset()?
                .map_or(low, |offset| (offset + 1).max(low))
        };

        if start >= high {
            debug!(
                store = store_name,
                changelog = %changelog,
                start,
                high,
                "Store partition is up to date"
            );
            return Ok(false);
        }

        consumer.pause(std::slice::from_ref(input))?;
        consumer.incremental_assign(&[(changelog.clone(), start)])?;
        info!(
            store = store_name,
            partition = %input,
            changelog = %changelog,
            start,
            high,
            "Recovery started"
        );

        self.tasks.insert(
            changelog.clone(),
            RecoveryPartition {
                input: input.clone(),
                store_name: store_name.to_string(),
                changelog,
                partition: partition.clone(),
                offset: start,
                high_watermark: high,
            },
        );
        Ok(true)
    }

    /// Drop the tasks of a revoked or lost input partition.
    pub fn revoke_partition(
        &mut self,
        input: &TopicPartition,
        consumer: &mut dyn Consumer,
    ) -> StateResult<()> {
        let changelogs: Vec<TopicPartition> = self
            .tasks
            .values()
            .filter(|task| &task.input == input)
            .map(|task| task.changelog.clone())
            .collect();
        if changelogs.is_empty() {
            return Ok(());
        }

        for changelog in &changelogs {
            self.tasks.remove(changelog);
        }
        consumer.incremental_unassign(&changelogs)?;
        info!(partition = %input, tasks = changelogs.len(), "Recovery cancelled");
        Ok(())
    }

    /// Forget every task without touching the consumer.
    pub fn clear(&mut self) {
        self.tasks.clear();
    }

    /// Poll once and apply whatever changelog record arrives.
    pub async fn do_recovery(&mut self, consumer: &mut dyn Consumer) -> StateResult<RecoveryOutcome> {
        let event = match consumer.poll(self.poll_timeout).await {
            Ok(event) => event,
            Err(e) if e.is_retryable() => {
                warn!(error = %e, "Recovery poll failed, retrying");
                return Ok(RecoveryOutcome::default());
            }
            Err(e) => return Err(StateError::Changelog(e)),
        };

        let message = match event {
            Some(ConsumerEvent::Message(message)) => message,
            other => {
                return Ok(RecoveryOutcome {
                    applied: 0,
                    event: other,
                })
            }
        };

        let changelog = message.topic_partition();
        let Some(task) = self.tasks.get_mut(&changelog) else {
            return Ok(RecoveryOutcome {
                applied: 0,
                event: Some(ConsumerEvent::Message(message)),
            });
        };

        task.apply(&message)?;
        if task.is_complete() {
            self.finish(&changelog, consumer)?;
        }

        Ok(RecoveryOutcome {
            applied: 1,
            event: None,
        })
    }

    fn finish(&mut self, changelog: &TopicPartition, consumer: &mut dyn Consumer) -> StateResult<()> {
        let Some(task) = self.tasks.remove(changelog) else {
            return Ok(());
        };
        task.partition.flush()?;
        consumer.incremental_unassign(std::slice::from_ref(changelog))?;
        info!(
            store = %task.store_name,
            changelog = %changelog,
            offset = task.offset,
            "Store partition recovered"
        );

        if !self.is_recovering(&task.input) {
            consumer.resume(std::slice::from_ref(&task.input))?;
            info!(partition = %task.input, "Recovery finished, partition resumed");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AutoOffsetReset;
    use crate::kafka::memory::InMemoryBroker;
    use crate::kafka::ProducerRecord;
    use crate::state::changelog::encode_processed_offset;
    use crate::state::partition::PartitionConfig;
    use tempfile::TempDir;

    const CHANGELOG: &str = "changelog__g--orders--totals";

    fn changelog_record(key: &str, value: Option<&str>, processed: i64) -> ProducerRecord {
        let mut record = ProducerRecord::new(CHANGELOG)
            .with_partition(0)
            .with_key(key.as_bytes().to_vec())
            .with_header(PROCESSED_OFFSET_HEADER, encode_processed_offset(processed));
        record.value = value.map(|v| v.as_bytes().to_vec());
        record
    }

    fn setup() -> (TempDir, InMemoryBroker, StorePartition) {
        let dir = TempDir::new().unwrap();
        let broker = InMemoryBroker::new();
        broker.create_topic("orders", 1);
        broker.create_topic(CHANGELOG, 1);
        let partition = StorePartition::open(&PartitionConfig::new(dir.path().join("0"))).unwrap();
        (dir, broker, partition)
    }

    fn manager() -> RecoveryManager {
        RecoveryManager::new(Duration::from_millis(1), Duration::from_millis(1))
    }

    async fn run_to_completion(
        recovery: &mut RecoveryManager,
        consumer: &mut dyn Consumer,
    ) -> u64 {
        let mut applied = 0;
        for _ in 0..100 {
            if !recovery.recovering() {
                break;
            }
            applied += recovery.do_recovery(consumer).await.unwrap().applied;
        }
        applied
    }

    #[tokio::test]
    async fn test_recovery_replays_only_missing_entries() {
        let (_dir, broker, partition) = setup();
        for (i, key) in ["a", "b", "c", "d"].iter().enumerate() {
            broker.append(&changelog_record(key, Some("1"), i as i64 * 10)).unwrap();
        }
        partition.set_changelog_offset(1).unwrap();

        let mut consumer = broker.consumer("g", AutoOffsetReset::Earliest, false);
        consumer.subscribe(&["orders".to_string()]).unwrap();
        consumer.poll(Duration::from_millis(1)).await.unwrap();
        let control = consumer.control();
        let input = TopicPartition::new("orders", 0);

        let mut recovery = manager();
        let created = recovery
            .assign_partition(&input, "totals", TopicPartition::new(CHANGELOG, 0), &partition, &mut consumer)
            .await
            .unwrap();
        assert!(created);
        assert!(control.is_paused(&input));
        assert_eq!(recovery.partitions_recovering(), 1);

        let applied = run_to_completion(&mut recovery, &mut consumer).await;
        assert_eq!(applied, 2);
        assert!(!control.is_paused(&input));
        assert_eq!(control.assignment(), vec![input]);
        assert!(partition.get(b"c").unwrap().is_some());
        assert!(partition.get(b"a").unwrap().is_none());
        assert_eq!(partition.changelog_offset().unwrap(), Some(3));
        assert_eq!(partition.processed_offset().unwrap(), Some(30));
    }

    #[tokio::test]
    async fn test_up_to_date_partition_needs_no_task() {
        let (_dir, broker, partition) = setup();
        broker.append(&changelog_record("a", Some("1"), 0)).unwrap();
        partition.set_changelog_offset(0).unwrap();

        let mut consumer = broker.consumer("g", AutoOffsetReset::Earliest, false);
        let mut recovery = manager();
        let created = recovery
            .assign_partition(
                &TopicPartition::new("orders", 0),
                "totals",
                TopicPartition::new(CHANGELOG, 0),
                &partition,
                &mut consumer,
            )
            .await
            .unwrap();
        assert!(!created);
        assert!(!recovery.recovering());
    }

    #[tokio::test]
    async fn test_lost_marker_forces_full_rebuild() {
        let (_dir, broker, partition) = setup();
        broker.append(&changelog_record("a", Some("1"), 0)).unwrap();
        broker.append(&changelog_record("a", None, 1)).unwrap();
        partition.apply_changelog(b"stale", Some(b"x"), 1, 1).unwrap();
        partition.mark_recovery_required().unwrap();

        let mut consumer = broker.consumer("g", AutoOffsetReset::Earliest, false);
        let mut recovery = manager();
        recovery
            .assign_partition(
                &TopicPartition::new("orders", 0),
                "totals",
                TopicPartition::new(CHANGELOG, 0),
                &partition,
                &mut consumer,
            )
            .await
            .unwrap();

        assert_eq!(run_to_completion(&mut recovery, &mut consumer).await, 2);
        assert!(partition.is_empty());
        assert!(!partition.is_recovery_required().unwrap());
        assert_eq!(partition.changelog_offset().unwrap(), Some(1));
    }

    #[tokio::test]
    async fn test_missing_changelog_is_fatal() {
        let (_dir, broker, partition) = setup();
        let mut consumer = broker.consumer("g", AutoOffsetReset::Earliest, false);
        let err = manager()
            .assign_partition(
                &TopicPartition::new("orders", 0),
                "totals",
                TopicPartition::new("changelog__g--orders--missing", 0),
                &partition,
                &mut consumer,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, StateError::ChangelogMissing { .. }));
        assert!(err.is_consistency_violation());
    }

    #[tokio::test]
    async fn test_record_without_header_is_corrupt() {
        let (_dir, broker, partition) = setup();
        broker
            .append(&ProducerRecord::new(CHANGELOG).with_partition(0).with_key("a").with_value("1"))
            .unwrap();

        let mut consumer = broker.consumer("g", AutoOffsetReset::Earliest, false);
        let mut recovery = manager();
        recovery
            .assign_partition(
                &TopicPartition::new("orders", 0),
                "totals",
                TopicPartition::new(CHANGELOG, 0),
                &partition,
                &mut consumer,
            )
            .await
            .unwrap();

        let err = recovery.do_recovery(&mut consumer).await.unwrap_err();
        assert!(matches!(err, StateError::CorruptChangelog { offset: 0, .. }));
    }

    #[tokio::test]
    async fn test_revoke_cancels_tasks() {
        let (_dir, broker, partition) = setup();
        broker.append(&changelog_record("a", Some("1"), 0)).unwrap();
        let mut consumer = broker.consumer("g", AutoOffsetReset::Earliest, false);
        let control = consumer.control();
        let input = TopicPartition::new("orders", 0);

        let mut recovery = manager();
        recovery
            .assign_partition(&input, "totals", TopicPartition::new(CHANGELOG, 0), &partition, &mut consumer)
            .await
            .unwrap();
        assert!(recovery.is_recovering(&input));

        recovery.revoke_partition(&input, &mut consumer).unwrap();
        assert!(!recovery.recovering());
        assert!(control.assignment().is_empty());
    }

    #[tokio::test]
    async fn test_replaying_twice_yields_identical_contents() {
        let (_dir, broker, _) = setup();
        broker.append(&changelog_record("a", Some("1"), 0)).unwrap();
        broker.append(&changelog_record("b", Some("2"), 1)).unwrap();
        broker.append(&changelog_record("a", Some("3"), 2)).unwrap();
        broker.append(&changelog_record("b", None, 3)).unwrap();

        let mut snapshots = Vec::new();
        for _ in 0..2 {
            let dir = TempDir::new().unwrap();
            let partition = StorePartition::open(&PartitionConfig::new(dir.path().join("0"))).unwrap();
            let mut consumer = broker.consumer("g", AutoOffsetReset::Earliest, false);
            let mut recovery = manager();
            recovery
                .assign_partition(
                    &TopicPartition::new("orders", 0),
                    "totals",
                    TopicPartition::new(CHANGELOG, 0),
                    &partition,
                    &mut consumer,
                )
                .await
                .unwrap();
            run_to_completion(&mut recovery, &mut consumer).await;
            snapshots.push(partition.entries().unwrap());
        }

        assert_eq!(snapshots[0], snapshots[1]);
        assert_eq!(snapshots[0], vec![(b"a".to_vec(), b"3".to_vec())]);
    }
}
