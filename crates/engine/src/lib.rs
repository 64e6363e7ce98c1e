//! The Relay orchestration engine.
//!
//! One workflow run drives the multi-round loop for a single user message:
//! rebuild context, call the model gateway, execute requested tools, feed
//! observations back, repeat until the model answers in plain text or a
//! bound is hit. Every side-effecting stage runs inside a durable step, so
//! an at-least-once host can retry a crashed run without duplicating model
//! calls, tool executions, or credit deductions.

pub mod accumulator;
pub mod billing;
pub mod context;
pub mod run;

pub use accumulator::{StreamAccumulator, StreamOutcome};
pub use billing::{BalanceLedger, MemoryLedger};
pub use run::{Engine, RunOutcome, RunRequest, RunStatus};
