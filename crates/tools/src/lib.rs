//! Tool registry and dispatch.
//!
//! Server tools execute in-process through [`ToolExecutor`]; client tool
//! names form a fixed set the dispatcher refuses to execute locally. Every
//! failure mode (bad JSON, unknown name, missing required argument, executor
//! error) becomes a `success:false` [`ToolResult`] so a single bad call can
//! never abort a round.

pub mod builtin;
pub mod registry;

pub use builtin::{Terminate, TERMINATE_TOOL};
pub use registry::{ToolExecutor, ToolRegistry};
