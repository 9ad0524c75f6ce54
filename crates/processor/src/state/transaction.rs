//! Store transactions
//!
//! A [`TransactionScope`] is opened for one input record and holds one
//! [`PartitionTransaction`] per store registered for the record's topic.
//! Mutations stay in an in-memory update cache until the scope commits:
//!
//! 1. every cached mutation is produced to the store's changelog partition,
//!    tagged with the processed offset
//! 2. each store partition writes its updates and the processed offset in a
//!    single sled transaction
//!
//! Dropping a scope without committing discards it. At most one scope per
//! input partition is alive at any time.

use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use tracing::{debug, trace};

use super::changelog::ChangelogWriter;
use super::partition::{StorePartition, UpdateCache};
use crate::core::TopicPartition;
use crate::error::{StateError, StateResult};

/// Separates the message key prefix from the user key.
pub const PREFIX_SEPARATOR: &[u8] = b"|";

/// Registry of input partitions that currently have an open scope.
pub(crate) type OpenScopes = Arc<Mutex<HashSet<TopicPartition>>>;

/// Buffered mutations of one store partition.
pub struct PartitionTransaction {
    store_name: String,
    partition: StorePartition,
    changelog: Option<ChangelogWriter>,
    updates: UpdateCache,
}

impl PartitionTransaction {
    pub(crate) fn new(
        store_name: impl Into<String>,
        partition: StorePartition,
        changelog: Option<ChangelogWriter>,
    ) -> Self {
        Self {
            store_name: store_name.into(),
            partition,
            changelog,
            updates: UpdateCache::new(),
        }
    }

    pub fn store_name(&self) -> &str {
        &self.store_name
    }

    /// Number of keys mutated so far.
    pub fn update_count(&self) -> usize {
        self.updates.len()
    }

    /// Read a key, preferring the local update cache over the partition.
    pub fn get_bytes(&self, key: &[u8]) -> StateResult<Option<Vec<u8>>> {
        match self.updates.get(key) {
            Some(cached) => Ok(cached.clone()),
            None => self.partition.get(key),
        }
    }

    pub fn set_bytes(&mut self, key: Vec<u8>, value: Vec<u8>) {
        self.updates.insert(key, Some(value));
    }

    pub fn delete_bytes(&mut self, key: Vec<u8>) {
        self.updates.insert(key, None);
    }

    pub fn exists_bytes(&self, key: &[u8]) -> StateResult<bool> {
        match self.updates.get(key) {
            Some(cached) => Ok(cached.is_some()),
            None => self.partition.exists(key),
        }
    }

    fn produce_changelog(&self, processed_offset: i64) -> StateResult<usize> {
        let Some(writer) = &self.changelog else {
            return Ok(0);
        };
        for (key, value) in &self.updates {
            writer.produce(key, value.as_deref(), processed_offset)?;
        }
        Ok(self.updates.len())
    }

    fn write(&self, processed_offset: i64) -> StateResult<()> {
        self.partition.write(&self.updates, processed_offset)
    }
}

/// Typed view of one store, scoped to the current message key.
///
/// Keys and values are encoded as JSON; keys are prefixed with the message
/// key so rows with different keys never see each other's entries.
pub struct State<'a> {
    tx: &'a mut PartitionTransaction,
    prefix: &'a [u8],
}

impl<'a> State<'a> {
    fn encode_key<K: Serialize + ?Sized>(&self, key: &K) -> StateResult<Vec<u8>> {
        let encoded = serde_json::to_vec(key).map_err(|e| StateError::SerializationFailed {
            key: "<key>".to_string(),
            reason: e.to_string(),
        })?;
        let mut full = Vec::with_capacity(self.prefix.len() + PREFIX_SEPARATOR.len() + encoded.len());
        full.extend_from_slice(self.prefix);
        full.extend_from_slice(PREFIX_SEPARATOR);
        full.extend_from_slice(&encoded);
        Ok(full)
    }

    pub fn get<K, V>(&self, key: &K) -> StateResult<Option<V>>
    where
        K: Serialize + ?Sized,
        V: DeserializeOwned,
    {
        let raw_key = self.encode_key(key)?;
        match self.tx.get_bytes(&raw_key)? {
            Some(raw) => serde_json::from_slice(&raw).map(Some).map_err(|e| {
                StateError::DeserializationFailed {
                    key: String::from_utf8_lossy(&raw_key).into_owned(),
                    reason: e.to_string(),
                }
            }),
            None => Ok(None),
        }
    }

    /// Like [`State::get`], falling back to `default` for a missing key.
    pub fn get_or<K, V>(&self, key: &K, default: V) -> StateResult<V>
    where
        K: Serialize + ?Sized,
        V: DeserializeOwned,
    {
        Ok(self.get(key)?.unwrap_or(default))
    }

    pub fn set<K, V>(&mut self, key: &K, value: &V) -> StateResult<()>
    where
        K: Serialize + ?Sized,
        V: Serialize + ?Sized,
    {
        let raw_key = self.encode_key(key)?;
        let raw = serde_json::to_vec(value).map_err(|e| StateError::SerializationFailed {
            key: String::from_utf8_lossy(&raw_key).into_owned(),
            reason: e.to_string(),
        })?;
        self.tx.set_bytes(raw_key, raw);
        Ok(())
    }

    pub fn delete<K: Serialize + ?Sized>(&mut self, key: &K) -> StateResult<()> {
        let raw_key = self.encode_key(key)?;
        self.tx.delete_bytes(raw_key);
        Ok(())
    }

    pub fn exists<K: Serialize + ?Sized>(&self, key: &K) -> StateResult<bool> {
        let raw_key = self.encode_key(key)?;
        self.tx.exists_bytes(&raw_key)
    }
}

/// Guard over the store transactions of one input record.
pub struct TransactionScope {
    tp: TopicPartition,
    offset: i64,
    transactions: BTreeMap<String, PartitionTransaction>,
    registry: Option<OpenScopes>,
    finished: bool,
}

impl TransactionScope {
    /// Claim the partition slot in `registry` and build the scope.
    pub(crate) fn open(
        tp: TopicPartition,
        offset: i64,
        transactions: BTreeMap<String, PartitionTransaction>,
        registry: OpenScopes,
    ) -> StateResult<Self> {
        if !registry.lock().insert(tp.clone()) {
            return Err(StateError::TransactionAlreadyOpen {
                topic: tp.topic,
                partition: tp.partition,
            });
        }
        trace!(partition = %tp, offset, stores = transactions.len(), "Transaction scope opened");
        Ok(Self {
            tp,
            offset,
            transactions,
            registry: Some(registry),
            finished: false,
        })
    }

    /// Scope for a topic without stores. Commit only acknowledges the offset.
    pub fn noop(tp: TopicPartition, offset: i64) -> Self {
        Self {
            tp,
            offset,
            transactions: BTreeMap::new(),
            registry: None,
            finished: false,
        }
    }

    pub fn topic_partition(&self) -> &TopicPartition {
        &self.tp
    }

    pub fn offset(&self) -> i64 {
        self.offset
    }

    pub fn is_noop(&self) -> bool {
        self.transactions.is_empty()
    }

    pub fn store_names(&self) -> impl Iterator<Item = &str> {
        self.transactions.keys().map(String::as_str)
    }

    /// Access `store` for rows keyed by `prefix`.
    pub fn state<'a>(&'a mut self, store: &str, prefix: &'a [u8]) -> StateResult<State<'a>> {
        let tx = self
            .transactions
            .get_mut(store)
            .ok_or_else(|| StateError::StoreNotFound {
                topic: self.tp.topic.clone(),
                store: store.to_string(),
            })?;
        Ok(State { tx, prefix })
    }

    /// Raw access to one store's transaction.
    pub fn transaction(&mut self, store: &str) -> Option<&mut PartitionTransaction> {
        self.transactions.get_mut(store)
    }

    /// Produce changelog records, then persist every store partition.
    ///
    /// Returns the number of changelog records produced.
    pub fn commit(mut self) -> StateResult<usize> {
        let mut produced = 0;
        for tx in self.transactions.values() {
            produced += tx.produce_changelog(self.offset)?;
        }
        for tx in self.transactions.values() {
            tx.write(self.offset)?;
        }
        self.finished = true;
        debug!(
            partition = %self.tp,
            offset = self.offset,
            changelog_records = produced,
            "Transaction scope committed"
        );
        Ok(produced)
    }

    /// Drop every buffered mutation.
    pub fn discard(mut self) {
        self.finished = true;
        trace!(partition = %self.tp, offset = self.offset, "Transaction scope discarded");
    }
}

impl Drop for TransactionScope {
    fn drop(&mut self) {
        if let Some(registry) = &self.registry {
            registry.lock().remove(&self.tp);
        }
        if !self.finished {
            let pending: usize = self.transactions.values().map(|tx| tx.update_count()).sum();
            if pending > 0 {
                debug!(partition = %self.tp, offset = self.offset, pending, "Uncommitted scope dropped");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kafka::memory::InMemoryBroker;
    use crate::state::changelog::PROCESSED_OFFSET_HEADER;
    use crate::state::partition::PartitionConfig;
    use tempfile::TempDir;

    struct Fixture {
        _dir: TempDir,
        partition: StorePartition,
        registry: OpenScopes,
    }

    fn fixture() -> Fixture {
        let dir = TempDir::new().unwrap();
        let partition = StorePartition::open(&PartitionConfig::new(dir.path().join("0"))).unwrap();
        Fixture {
            _dir: dir,
            partition,
            registry: OpenScopes::default(),
        }
    }

    fn scope(f: &Fixture, offset: i64, changelog: Option<ChangelogWriter>) -> StateResult<TransactionScope> {
        let mut txs = BTreeMap::new();
        txs.insert(
            "totals".to_string(),
            PartitionTransaction::new("totals", f.partition.clone(), changelog),
        );
        TransactionScope::open(TopicPartition::new("orders", 0), offset, txs, Arc::clone(&f.registry))
    }

    #[test]
    fn test_reads_see_local_writes_only_until_commit() {
        let f = fixture();
        let mut scope = scope(&f, 5, None).unwrap();
        {
            let mut state = scope.state("totals", b"customer-1").unwrap();
            state.set("sum", &10).unwrap();
            assert_eq!(state.get::<_, i64>("sum").unwrap(), Some(10));
        }
        assert!(f.partition.is_empty());

        scope.commit().unwrap();
        assert_eq!(f.partition.len(), 1);
        assert_eq!(f.partition.processed_offset().unwrap(), Some(5));
    }

    #[test]
    fn test_discarded_scope_leaves_no_trace() {
        let f = fixture();
        let mut scope = scope(&f, 1, None).unwrap();
        scope.state("totals", b"k").unwrap().set("a", "b").unwrap();
        scope.discard();

        assert!(f.partition.is_empty());
        assert_eq!(f.partition.processed_offset().unwrap(), None);
        assert!(f.registry.lock().is_empty());
    }

    #[test]
    fn test_second_scope_for_partition_is_rejected() {
        let f = fixture();
        let first = scope(&f, 1, None).unwrap();
        let err = scope(&f, 2, None).err().unwrap();
        assert!(matches!(err, StateError::TransactionAlreadyOpen { partition: 0, .. }));

        drop(first);
        assert!(scope(&f, 2, None).is_ok());
    }

    #[test]
    fn test_prefixes_isolate_message_keys() {
        let f = fixture();
        let mut scope = scope(&f, 3, None).unwrap();
        scope.state("totals", b"a").unwrap().set("count", &1).unwrap();
        scope.commit().unwrap();

        let mut scope = self::scope(&f, 4, None).unwrap();
        let state = scope.state("totals", b"b").unwrap();
        assert!(!state.exists("count").unwrap());
        assert_eq!(state.get_or("count", 0i64).unwrap(), 0);
    }

    #[test]
    fn test_delete_shadows_stored_value() {
        let f = fixture();
        let mut s = scope(&f, 1, None).unwrap();
        s.state("totals", b"k").unwrap().set("x", &1).unwrap();
        s.commit().unwrap();

        let mut s = scope(&f, 2, None).unwrap();
        {
            let mut state = s.state("totals", b"k").unwrap();
            state.delete("x").unwrap();
            assert!(!state.exists("x").unwrap());
        }
        s.commit().unwrap();
        assert!(f.partition.is_empty());
        assert_eq!(f.partition.processed_offset().unwrap(), Some(2));
    }

    #[test]
    fn test_unknown_store() {
        let f = fixture();
        let mut s = scope(&f, 1, None).unwrap();
        assert!(matches!(
            s.state("missing", b"k"),
            Err(StateError::StoreNotFound { .. })
        ));
    }

    #[test]
    fn test_commit_produces_changelog_with_offset_header() {
        let f = fixture();
        let broker = InMemoryBroker::new();
        broker.create_topic("changelog__g--orders--totals", 1);
        let writer = ChangelogWriter::new(
            Arc::new(broker.producer()),
            TopicPartition::new("changelog__g--orders--totals", 0),
        );

        let mut s = scope(&f, 41, Some(writer)).unwrap();
        {
            let mut state = s.state("totals", b"k").unwrap();
            state.set("a", &1).unwrap();
            state.delete("b").unwrap();
        }
        assert_eq!(s.commit().unwrap(), 2);

        let records = broker.messages(&TopicPartition::new("changelog__g--orders--totals", 0));
        assert_eq!(records.len(), 2);
        assert!(records
            .iter()
            .all(|r| r.header(PROCESSED_OFFSET_HEADER) == Some(&b"41"[..])));
        assert_eq!(records.iter().filter(|r| r.payload.is_none()).count(), 1);
    }

    #[test]
    fn test_noop_scope() {
        let s = TransactionScope::noop(TopicPartition::new("orders", 0), 9);
        assert!(s.is_noop());
        assert_eq!(s.commit().unwrap(), 0);
    }
}
