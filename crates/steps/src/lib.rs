//! Durable step execution.
//!
//! A workflow run is a sequence of named steps. Each step's output is
//! recorded in a [`StepLog`] under a deterministic key; re-running the same
//! workflow (after a crash, or an at-least-once redelivery) replays recorded
//! outputs instead of executing the step again. Side effects therefore live
//! *inside* steps and never between them.
//!
//! [`StepRunner::wait_for_event`] suspends a run until an external event is
//! delivered through the [`EventBus`] or a timeout elapses; the outcome is
//! recorded like any other step so replay is deterministic.

pub mod bus;
pub mod log;
pub mod runner;

pub use bus::EventBus;
pub use log::{JsonlStepLog, MemoryStepLog, StepLog};
pub use runner::StepRunner;
