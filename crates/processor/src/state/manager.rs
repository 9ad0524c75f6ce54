//! Store registry and partition lifecycle.
//!
//! [`StateStoreManager`] owns every store partition of the application. It
//! reacts to the consumer group's rebalance events, hands out
//! [`TransactionScope`]s to the processing loop and delegates changelog
//! replay to the [`RecoveryManager`].
//!
//! Store partitions live at `{state_dir}/{group}/{store}/{partition}`.

use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use super::changelog::{changelog_topic_name, ChangelogWriter};
use super::partition::{PartitionConfig, StorePartition};
use super::recovery::{RecoveryManager, RecoveryOutcome};
use super::transaction::{OpenScopes, PartitionTransaction, TransactionScope};
use crate::config::StateConfig;
use crate::core::TopicPartition;
use crate::error::{StateError, StateResult};
use crate::kafka::{Consumer, ConsumerEvent, Producer};

const DEFAULT_RECOVERY_POLL_TIMEOUT: Duration = Duration::from_millis(100);
const DEFAULT_METADATA_TIMEOUT: Duration = Duration::from_secs(10);

/// A registered store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreDefinition {
    pub name: String,
    pub topic: String,
    /// Changelog topic, when changelogs are in use
    pub changelog_topic: Option<String>,
}

/// Registry and lifecycle owner of all store partitions.
pub struct StateStoreManager {
    group: String,
    config: StateConfig,
    producer: Option<Arc<dyn Producer>>,
    stores: BTreeMap<String, StoreDefinition>,
    assigned: HashMap<TopicPartition, BTreeMap<String, StorePartition>>,
    open_scopes: OpenScopes,
    recovery: RecoveryManager,
}

impl StateStoreManager {
    /// Create a manager without changelogs.
    pub fn new(group: impl Into<String>, config: StateConfig) -> Self {
        Self {
            group: group.into(),
            config,
            producer: None,
            stores: BTreeMap::new(),
            assigned: HashMap::new(),
            open_scopes: OpenScopes::default(),
            recovery: RecoveryManager::new(DEFAULT_RECOVERY_POLL_TIMEOUT, DEFAULT_METADATA_TIMEOUT),
        }
    }

    /// Mirror mutations to changelog topics through `producer`.
    ///
    /// Ignored when `use_changelog_topics` is off.
    pub fn with_changelog_producer(mut self, producer: Arc<dyn Producer>) -> Self {
        if self.config.use_changelog_topics {
            self.producer = Some(producer);
        }
        self
    }

    pub fn with_timeouts(mut self, recovery_poll: Duration, metadata: Duration) -> Self {
        self.recovery = RecoveryManager::new(recovery_poll, metadata);
        self
    }

    pub fn group(&self) -> &str {
        &self.group
    }

    pub fn using_changelogs(&self) -> bool {
        self.producer.is_some()
    }

    /// Root directory of this group's stores.
    pub fn state_dir(&self) -> PathBuf {
        self.config.dir.join(&self.group)
    }

    pub fn partition_path(&self, store: &str, partition: i32) -> PathBuf {
        self.state_dir().join(store).join(partition.to_string())
    }

    /// Declare `store_name` on `topic`. Registering the same pair twice is a no-op.
    pub fn register_store(&mut self, topic: &str, store_name: &str) -> StateResult<()> {
        if let Some(existing) = self.stores.get(store_name) {
            if existing.topic == topic {
                return Ok(());
            }
            return Err(StateError::DuplicateStore {
                store: store_name.to_string(),
                existing_topic: existing.topic.clone(),
            });
        }

        let changelog_topic = self
            .using_changelogs()
            .then(|| changelog_topic_name(&self.group, topic, store_name));
        info!(
            store = store_name,
            topic,
            changelog = changelog_topic.as_deref().unwrap_or("-"),
            "Store registered"
        );
        self.stores.insert(
            store_name.to_string(),
            StoreDefinition {
                name: store_name.to_string(),
                topic: topic.to_string(),
                changelog_topic,
            },
        );
        Ok(())
    }

    pub fn stores(&self) -> impl Iterator<Item = &StoreDefinition> {
        self.stores.values()
    }

    pub fn stores_for_topic<'a>(&'a self, topic: &'a str) -> impl Iterator<Item = &'a StoreDefinition> + 'a {
        self.stores.values().filter(move |store| store.topic == topic)
    }

    pub fn has_stores(&self, topic: &str) -> bool {
        self.stores_for_topic(topic).next().is_some()
    }

    /// `(source topic, changelog topic)` for every store with a changelog.
    pub fn changelog_topics(&self) -> Vec<(String, String)> {
        self.stores
            .values()
            .filter_map(|store| {
                store
                    .changelog_topic
                    .as_ref()
                    .map(|changelog| (store.topic.clone(), changelog.clone()))
            })
            .collect()
    }

    fn is_changelog_topic(&self, topic: &str) -> bool {
        self.stores
            .values()
            .any(|store| store.changelog_topic.as_deref() == Some(topic))
    }

    pub fn assigned_partitions(&self) -> Vec<TopicPartition> {
        let mut partitions: Vec<TopicPartition> = self.assigned.keys().cloned().collect();
        partitions.sort();
        partitions
    }

    pub fn store_partition(&self, tp: &TopicPartition, store: &str) -> Option<&StorePartition> {
        self.assigned.get(tp).and_then(|stores| stores.get(store))
    }

    fn open_partition(&self, store: &str, partition: i32) -> StateResult<StorePartition> {
        let flush_every_ms = (self.config.flush_every_ms > 0).then_some(self.config.flush_every_ms);
        let config = PartitionConfig::new(self.partition_path(store, partition))
            .with_cache_capacity(self.config.cache_capacity)
            .with_flush_every_ms(flush_every_ms);
        StorePartition::open(&config)
    }

    /// Open every store partition of `tp` and plan its recovery.
    pub async fn on_partition_assign(
        &mut self,
        tp: &TopicPartition,
        consumer: &mut dyn Consumer,
    ) -> StateResult<Vec<StorePartition>> {
        if let Some(existing) = self.assigned.get(tp) {
            debug!(partition = %tp, "Store partitions already assigned");
            return Ok(existing.values().cloned().collect());
        }

        let definitions: Vec<StoreDefinition> = self.stores_for_topic(&tp.topic).cloned().collect();
        if definitions.is_empty() {
            return Ok(Vec::new());
        }

        let mut opened = BTreeMap::new();
        for definition in &definitions {
            let partition = self.open_partition(&definition.name, tp.partition)?;
            opened.insert(definition.name.clone(), partition);
        }
        let partitions: Vec<StorePartition> = opened.values().cloned().collect();
        self.assigned.insert(tp.clone(), opened);
        info!(partition = %tp, stores = definitions.len(), "Store partitions assigned");

        for definition in &definitions {
            let Some(changelog_topic) = &definition.changelog_topic else {
                continue;
            };
            let Some(partition) = self.store_partition(tp, &definition.name).cloned() else {
                continue;
            };
            self.recovery
                .assign_partition(
                    tp,
                    &definition.name,
                    TopicPartition::new(changelog_topic.clone(), tp.partition),
                    &partition,
                    consumer,
                )
                .await?;
        }

        Ok(partitions)
    }

    /// Close the store partitions of `tp`, keeping their data.
    pub fn on_partition_revoke(
        &mut self,
        tp: &TopicPartition,
        consumer: &mut dyn Consumer,
    ) -> StateResult<()> {
        self.recovery.revoke_partition(tp, consumer)?;
        if let Some(stores) = self.assigned.remove(tp) {
            for partition in stores.values() {
                partition.flush()?;
            }
            info!(partition = %tp, stores = stores.len(), "Store partitions revoked");
        }
        Ok(())
    }

    /// Close the store partitions of `tp` and force a full rebuild on the
    /// next assignment.
    pub fn on_partition_lost(
        &mut self,
        tp: &TopicPartition,
        consumer: &mut dyn Consumer,
    ) -> StateResult<()> {
        if self.using_changelogs() {
            if let Some(stores) = self.assigned.get(tp) {
                for partition in stores.values() {
                    partition.mark_recovery_required()?;
                }
            }
        }
        warn!(partition = %tp, "Store partitions lost");
        self.on_partition_revoke(tp, consumer)
    }

    /// Open the transaction scope for the record at `offset`.
    ///
    /// Topics without stores get a no-op scope.
    pub fn start_store_transaction(
        &self,
        topic: &str,
        partition: i32,
        offset: i64,
    ) -> StateResult<TransactionScope> {
        let tp = TopicPartition::new(topic, partition);
        if !self.has_stores(topic) {
            return Ok(TransactionScope::noop(tp, offset));
        }

        let stores = self
            .assigned
            .get(&tp)
            .ok_or_else(|| StateError::PartitionNotAssigned {
                topic: topic.to_string(),
                partition,
            })?;

        let mut transactions = BTreeMap::new();
        for (name, store_partition) in stores {
            let changelog = match (&self.producer, self.stores.get(name)) {
                (Some(producer), Some(StoreDefinition { changelog_topic: Some(changelog), .. })) => {
                    Some(ChangelogWriter::new(
                        Arc::clone(producer),
                        TopicPartition::new(changelog.clone(), partition),
                    ))
                }
                _ => None,
            };
            transactions.insert(
                name.clone(),
                PartitionTransaction::new(name.clone(), store_partition.clone(), changelog),
            );
        }

        TransactionScope::open(tp, offset, transactions, Arc::clone(&self.open_scopes))
    }

    /// Whether any store partition is still replaying its changelog.
    pub fn recovery_required(&self) -> bool {
        self.recovery.recovering()
    }

    pub fn is_recovering(&self, tp: &TopicPartition) -> bool {
        self.recovery.is_recovering(tp)
    }

    pub fn partitions_recovering(&self) -> usize {
        self.recovery.partitions_recovering()
    }

    /// Perform one unit of recovery.
    ///
    /// Events unrelated to recovery are returned in the outcome; stray
    /// changelog records are dropped.
    pub async fn do_recovery(&mut self, consumer: &mut dyn Consumer) -> StateResult<RecoveryOutcome> {
        let mut outcome = self.recovery.do_recovery(consumer).await?;
        if let Some(ConsumerEvent::Message(message)) = &outcome.event {
            if self.is_changelog_topic(&message.topic) {
                debug!(
                    topic = %message.topic,
                    partition = message.partition,
                    offset = message.offset,
                    "Dropping changelog record without recovery task"
                );
                outcome.event = None;
            }
        }
        Ok(outcome)
    }

    /// Record a delivered changelog offset in the owning store partition.
    pub fn on_changelog_delivered(&self, changelog: &TopicPartition, offset: i64) -> StateResult<()> {
        let Some(store) = self
            .stores
            .values()
            .find(|store| store.changelog_topic.as_deref() == Some(changelog.topic.as_str()))
        else {
            return Ok(());
        };

        let input = TopicPartition::new(store.topic.clone(), changelog.partition);
        match self.store_partition(&input, &store.name) {
            Some(partition) => partition.set_changelog_offset(offset),
            None => {
                debug!(changelog = %changelog, offset, "Delivery for unassigned store partition");
                Ok(())
            }
        }
    }

    /// Remove all local state of this group.
    pub fn clear_stores(&self) -> StateResult<()> {
        if !self.assigned.is_empty() {
            return Err(StateError::StoresInUse {
                reason: format!("{} partitions are assigned", self.assigned.len()),
            });
        }
        if !self.open_scopes.lock().is_empty() {
            return Err(StateError::StoresInUse {
                reason: "a transaction is open".to_string(),
            });
        }

        let dir = self.state_dir();
        if dir.exists() {
            std::fs::remove_dir_all(&dir)
                .map_err(|e| StateError::storage(format!("Failed to remove {}: {}", dir.display(), e)))?;
            info!(path = %dir.display(), "State cleared");
        }
        Ok(())
    }

    /// Release every store partition.
    pub fn close(&mut self) -> StateResult<()> {
        self.recovery.clear();
        for (tp, stores) in self.assigned.drain() {
            for partition in stores.values() {
                partition.flush()?;
            }
            debug!(partition = %tp, "Store partitions closed");
        }
        Ok(())
    }
}
