//! Shared domain types for the Relay orchestration engine.
//!
//! Everything here is serialization-friendly and free of I/O: sessions,
//! messages, tool calls/results, streaming events, agent definitions, and
//! engine configuration. The heavier crates (store, steps, engine) depend on
//! this one and nothing in the other direction.

pub mod agent;
pub mod config;
pub mod error;
pub mod message;
pub mod stream;

pub use error::{Error, Result};
