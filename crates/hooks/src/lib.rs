//! Micro-agent hook pipeline.
//!
//! Micro-agents observe and steer a workflow run at named trigger points.
//! They never mutate engine state directly: each receives a read-only
//! snapshot of the [`HookContext`] and returns a [`HookOutcome`] describing
//! the effects it wants. The pipeline merges outcomes back into the context
//! in a fixed field order, so the result is deterministic even when two
//! hooks touch the same field.

pub mod context;
pub mod pipeline;
pub mod stuck;

pub use context::{HookContext, HookOutcome, HookTrigger};
pub use pipeline::{HookPipeline, MicroAgent, PipelineVerdict};
pub use stuck::StuckDetector;
