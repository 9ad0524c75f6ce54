//! State management for stream processing
//!
//! Local, partitioned key-value stores that survive restarts and rebalances.
//!
//! ## Architecture
//!
//! The state module is organized around four core concepts:
//!
//! 1. **Store Partitions**: one sled database per (store, partition), holding
//!    the data and the offsets it reflects
//! 2. **Transactions**: per-record update caches committed atomically
//!    together with the processed offset
//! 3. **Changelogs**: compacted topics mirroring every committed mutation
//! 4. **Recovery**: replay of missing changelog entries before an assigned
//!    partition resumes processing
//!
//! ## Example Usage
//!
//! ```rust,no_run
//! use rowstream::config::StateConfig;
//! use rowstream::state::StateStoreManager;
//!
//! # fn main() -> rowstream::error::StateResult<()> {
//! let mut manager = StateStoreManager::new("billing", StateConfig::default());
//! manager.register_store("orders", "totals")?;
//!
//! // after the partition is assigned
//! let mut scope = manager.start_store_transaction("orders", 0, 42)?;
//! let mut state = scope.state("totals", b"customer-1")?;
//! let sum: i64 = state.get_or("sum", 0)?;
//! state.set("sum", &(sum + 1))?;
//! scope.commit()?;
//! # Ok(())
//! # }
//! ```

pub mod changelog;
pub mod manager;
pub mod partition;
pub mod recovery;
pub mod transaction;

pub use changelog::{changelog_topic_name, ChangelogWriter, PROCESSED_OFFSET_HEADER};
pub use manager::{StateStoreManager, StoreDefinition};
pub use partition::{PartitionConfig, StorePartition, UpdateCache};
pub use recovery::{RecoveryManager, RecoveryOutcome, RecoveryPartition};
pub use transaction::{PartitionTransaction, State, TransactionScope, PREFIX_SEPARATOR};
