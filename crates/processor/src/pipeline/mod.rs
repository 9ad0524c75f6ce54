//! User processing logic
//!
//! A [`Pipeline`] receives one row value at a time together with a
//! [`ProcessingContext`] and decides whether the row continues or is filtered.
//! Pipelines are synchronous; everything they touch (stores, producer) is
//! local or buffered.
//!
//! Pipelines are plain types implementing [`Pipeline`], or closures wrapped
//! with [`from_fn`].
//!
//! # Example
//!
//! ```rust
//! use rowstream::pipeline::{from_fn, PipelineOutcome};
//!
//! let pipeline = from_fn(|value, ctx| {
//!     if value["paid"] != serde_json::json!(true) {
//!         return Ok(PipelineOutcome::Filtered);
//!     }
//!     let mut state = ctx.state("totals")?;
//!     let total: f64 = state.get_or("total", 0.0)?;
//!     state.set("total", &(total + value["amount"].as_f64().unwrap_or(0.0)))?;
//!     ctx.produce_json("paid-orders", &value)?;
//!     Ok(PipelineOutcome::Continue)
//! });
//! # let _ = pipeline;
//! ```

pub mod context;

pub use context::ProcessingContext;

use serde_json::Value;

use crate::error::ProcessingError;

/// What happened to a row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineOutcome {
    /// The row went through every step
    Continue,
    /// A step dropped the row
    Filtered,
}

/// Processing logic applied to every row.
pub trait Pipeline: Send + Sync {
    fn process(
        &self,
        value: Value,
        ctx: &mut ProcessingContext<'_>,
    ) -> Result<PipelineOutcome, ProcessingError>;
}

/// Pipeline backed by a closure, see [`from_fn`].
pub struct FnPipeline<F> {
    f: F,
}

/// Build a [`Pipeline`] from a closure.
pub fn from_fn<F>(f: F) -> FnPipeline<F>
where
    F: Fn(Value, &mut ProcessingContext<'_>) -> Result<PipelineOutcome, ProcessingError>
        + Send
        + Sync,
{
    FnPipeline { f }
}

impl<F> Pipeline for FnPipeline<F>
where
    F: Fn(Value, &mut ProcessingContext<'_>) -> Result<PipelineOutcome, ProcessingError>
        + Send
        + Sync,
{
    fn process(
        &self,
        value: Value,
        ctx: &mut ProcessingContext<'_>,
    ) -> Result<PipelineOutcome, ProcessingError> {
        (self.f)(value, ctx)
    }
}

impl<P: Pipeline + ?Sized> Pipeline for Box<P> {
    fn process(
        &self,
        value: Value,
        ctx: &mut ProcessingContext<'_>,
    ) -> Result<PipelineOutcome, ProcessingError> {
        (**self).process(value, ctx)
    }
}

impl<P: Pipeline + ?Sized> Pipeline for std::sync::Arc<P> {
    fn process(
        &self,
        value: Value,
        ctx: &mut ProcessingContext<'_>,
    ) -> Result<PipelineOutcome, ProcessingError> {
        (**self).process(value, ctx)
    }
}
