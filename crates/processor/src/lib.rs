//! Stateful stream processing over Kafka
//!
//! This crate consumes messages from one or more topics, runs user pipelines
//! over the decoded rows and keeps per-partition state in local sled stores
//! that are backed up to compacted changelog topics.
//!
//! ## Features
//!
//! - **Processing loop**: [`Application`] drives consumption, rebalances and
//!   shutdown
//! - **State**: per-partition key-value stores with transactional updates
//!   and changelog recovery, see [`state`]
//! - **Error routing**: consumer, producer and pipeline errors go through
//!   [`Callbacks`] which may suppress them
//! - **At-least-once**: offsets are stored only after a message's state is
//!   committed
//!
//! ## Example
//!
//! ```rust,no_run
//! use rowstream::{from_fn, Application, ApplicationConfig, PipelineOutcome};
//!
//! #[tokio::main]
//! async fn main() -> rowstream::Result<()> {
//!     let config = ApplicationConfig::load(None)?;
//!     let mut app = Application::from_config(config)?
//!         .with_store("clicks", "counts")?
//!         .with_pipeline("clicks", from_fn(|_value, ctx| {
//!             let mut counts = ctx.state("counts")?;
//!             let seen: u64 = counts.get_or("seen", 0)?;
//!             counts.set("seen", &(seen + 1))?;
//!             Ok(PipelineOutcome::Continue)
//!         }));
//!
//!     app.run().await
//! }
//! ```

pub mod app;
pub mod callbacks;
pub mod config;
pub mod core;
pub mod error;
pub mod kafka;
pub mod logging;
pub mod metrics;
pub mod pipeline;
pub mod state;

pub use app::{Application, StopHandle};
pub use callbacks::{Callbacks, DefaultCallbacks};
pub use config::{ApplicationConfig, AutoOffsetReset, StateConfig};
pub use core::{MessageContext, Row, TopicPartition};
pub use error::{ProcessingError, ProcessorError, Result, StateError, StateResult};
pub use logging::init_logging;
pub use metrics::ApplicationStats;
pub use pipeline::{from_fn, Pipeline, PipelineOutcome, ProcessingContext};
pub use state::{State, StateStoreManager};
