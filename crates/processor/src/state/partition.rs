//! Sled-backed store partition
//!
//! One [`StorePartition`] is the physical instance of a named store for one
//! input partition. It owns a sled database with two trees:
//!
//! - `data`: the user key-value pairs
//! - `__metadata__`: the processed offset, the last changelog offset
//!   reflected locally and the forced-recovery marker
//!
//! Every write goes through a multi-tree sled transaction so data and offsets
//! always move together.

use sled::transaction::TransactionResult;
use sled::{Db, Transactional, Tree};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::{debug, info, trace};

use crate::error::{StateError, StateResult};

const DATA_TREE: &str = "data";
const METADATA_TREE: &str = "__metadata__";
const PROCESSED_OFFSET_KEY: &[u8] = b"processed_offset";
const CHANGELOG_OFFSET_KEY: &[u8] = b"changelog_offset";
const RECOVERY_REQUIRED_KEY: &[u8] = b"recovery_required";

/// Mutations collected by a transaction: `None` deletes the key.
pub type UpdateCache = BTreeMap<Vec<u8>, Option<Vec<u8>>>;

/// Configuration for opening a store partition
#[derive(Debug, Clone)]
pub struct PartitionConfig {
    /// Path to the database directory
    pub path: PathBuf,
    /// Cache size in bytes (default: 64MB)
    pub cache_capacity: u64,
    /// Background flush interval, `None` flushes only on close
    pub flush_every_ms: Option<u64>,
}

impl PartitionConfig {
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            cache_capacity: 64 * 1024 * 1024,
            flush_every_ms: Some(500),
        }
    }

    pub fn with_cache_capacity(mut self, capacity: u64) -> Self {
        self.cache_capacity = capacity;
        self
    }

    pub fn with_flush_every_ms(mut self, flush_every_ms: Option<u64>) -> Self {
        self.flush_every_ms = flush_every_ms;
        self
    }
}

/// Physical per-partition handle of a store.
///
/// Cloning is cheap and yields another handle to the same database.
#[derive(Clone)]
pub struct StorePartition {
    path: PathBuf,
    db: Db,
    data: Tree,
    meta: Tree,
}

impl std::fmt::Debug for StorePartition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StorePartition")
            .field("path", &self.path)
            .finish()
    }
}

fn encode_offset(offset: i64) -> [u8; 8] {
    offset.to_be_bytes()
}

fn decode_offset(raw: &[u8]) -> StateResult<i64> {
    let bytes: [u8; 8] = raw.try_into().map_err(|_| StateError::DeserializationFailed {
        key: "offset".to_string(),
        reason: format!("expected 8 bytes, found {}", raw.len()),
    })?;
    Ok(i64::from_be_bytes(bytes))
}

impl StorePartition {
    /// Open or create the partition at `config.path`.
    pub fn open(config: &PartitionConfig) -> StateResult<Self> {
        std::fs::create_dir_all(&config.path).map_err(|e| {
            StateError::storage(format!("Failed to create directory: {}", e))
        })?;

        let db = sled::Config::new()
            .path(&config.path)
            .cache_capacity(config.cache_capacity)
            .flush_every_ms(config.flush_every_ms)
            .open()
            .map_err(|e| StateError::storage(format!("Failed to open database: {}", e)))?;

        let data = db.open_tree(DATA_TREE)?;
        let meta = db.open_tree(METADATA_TREE)?;

        debug!(path = ?config.path, keys = data.len(), "Store partition opened");

        Ok(Self {
            path: config.path.clone(),
            db,
            data,
            meta,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn get(&self, key: &[u8]) -> StateResult<Option<Vec<u8>>> {
        trace!(key_len = key.len(), "GET");
        Ok(self.data.get(key)?.map(|v| v.to_vec()))
    }

    pub fn exists(&self, key: &[u8]) -> StateResult<bool> {
        Ok(self.data.contains_key(key)?)
    }

    /// Number of keys in the data tree.
    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Snapshot of all key-value pairs in key order.
    pub fn entries(&self) -> StateResult<Vec<(Vec<u8>, Vec<u8>)>> {
        self.data
            .iter()
            .map(|entry| {
                entry
                    .map(|(k, v)| (k.to_vec(), v.to_vec()))
                    .map_err(StateError::from)
            })
            .collect()
    }

    fn meta_offset(&self, key: &[u8]) -> StateResult<Option<i64>> {
        self.meta
            .get(key)?
            .map(|raw| decode_offset(&raw))
            .transpose()
    }

    /// Last input offset whose mutations are committed here.
    pub fn processed_offset(&self) -> StateResult<Option<i64>> {
        self.meta_offset(PROCESSED_OFFSET_KEY)
    }

    /// Last changelog offset reflected in this partition.
    pub fn changelog_offset(&self) -> StateResult<Option<i64>> {
        self.meta_offset(CHANGELOG_OFFSET_KEY)
    }

    pub fn is_recovery_required(&self) -> StateResult<bool> {
        Ok(self.meta.contains_key(RECOVERY_REQUIRED_KEY)?)
    }

    /// Persist the marker that forces a full rebuild on next assignment.
    pub fn mark_recovery_required(&self) -> StateResult<()> {
        self.meta.insert(RECOVERY_REQUIRED_KEY, &[1u8][..])?;
        self.flush()?;
        Ok(())
    }

    /// Atomically apply `updates` and record `processed_offset`.
    ///
    /// The stored processed offset never moves backwards.
    pub fn write(&self, updates: &UpdateCache, processed_offset: i64) -> StateResult<()> {
        let result: TransactionResult<()> = (&self.data, &self.meta).transaction(|(data, meta)| {
            for (key, value) in updates {
                match value {
                    Some(value) => {
                        data.insert(key.as_slice(), value.as_slice())?;
                    }
                    None => {
                        data.remove(key.as_slice())?;
                    }
                }
            }

            let current = meta
                .get(PROCESSED_OFFSET_KEY)?
                .and_then(|raw| decode_offset(&raw).ok());
            if current.map_or(true, |current| processed_offset > current) {
                meta.insert(PROCESSED_OFFSET_KEY, &encode_offset(processed_offset)[..])?;
            }
            Ok(())
        });

        result.map_err(|e| StateError::storage(format!("Transaction failed: {e:?}")))?;
        trace!(
            path = ?self.path,
            updates = updates.len(),
            processed_offset,
            "Partition write committed"
        );
        Ok(())
    }

    /// Atomically apply one changelog record.
    ///
    /// `value == None` is a tombstone. The processed offset only moves
    /// forward; the changelog offset is set to `changelog_offset`.
    pub fn apply_changelog(
        &self,
        key: &[u8],
        value: Option<&[u8]>,
        processed_offset: i64,
        changelog_offset: i64,
    ) -> StateResult<()> {
        let result: TransactionResult<()> = (&self.data, &self.meta).transaction(|(data, meta)| {
            match value {
                Some(value) => {
                    data.insert(key, value)?;
                }
                None => {
                    data.remove(key)?;
                }
            }

            let current = meta
                .get(PROCESSED_OFFSET_KEY)?
                .and_then(|raw| decode_offset(&raw).ok());
            if current.map_or(true, |current| processed_offset > current) {
                meta.insert(PROCESSED_OFFSET_KEY, &encode_offset(processed_offset)[..])?;
            }
            meta.insert(CHANGELOG_OFFSET_KEY, &encode_offset(changelog_offset)[..])?;
            Ok(())
        });

        result.map_err(|e| StateError::storage(format!("Changelog apply failed: {e:?}")))?;
        Ok(())
    }

    /// Record a delivered changelog offset. Lower offsets are ignored.
    pub fn set_changelog_offset(&self, offset: i64) -> StateResult<()> {
        let current = self.changelog_offset()?;
        if current.map_or(true, |current| offset > current) {
            self.meta
                .insert(CHANGELOG_OFFSET_KEY, &encode_offset(offset)[..])?;
        }
        Ok(())
    }

    /// Drop all data and metadata, including the recovery marker.
    pub fn wipe(&self) -> StateResult<()> {
        self.data.clear()?;
        self.meta.clear()?;
        self.flush()?;
        info!(path = ?self.path, "Store partition wiped");
        Ok(())
    }

    /// Flush all pending writes to disk
    pub fn flush(&self) -> StateResult<usize> {
        let flushed = self
            .db
            .flush()
            .map_err(|e| StateError::storage(format!("Flush failed: {}", e)))?;
        trace!(bytes = flushed, "Flushed store partition");
        Ok(flushed)
    }
}
