//! Session and message persistence.
//!
//! The engine talks to [`MessageStore`] only; the in-memory implementation in
//! [`memory`] backs the test suite and single-process deployments. A SQL
//! adapter would implement the same trait.

pub mod memory;

use async_trait::async_trait;

use relay_domain::message::{Message, Session, SessionStatus, ToolResult};
use relay_domain::Result;

pub use memory::MemoryStore;

/// Persistence seam between the engine and storage.
///
/// Two operations carry concurrency semantics: `try_begin_processing` is a
/// compare-and-set on the session status (Idle → Processing) and is the only
/// way a run may start, and `append_tool_result` must be idempotent per
/// `(message, tool_call_id)` so replayed steps cannot double-append.
#[async_trait]
pub trait MessageStore: Send + Sync {
    async fn session(&self, session_id: &str) -> Result<Session>;

    /// Atomically flip Idle → Processing. Returns false when the session is
    /// already Processing or Cancelled.
    async fn try_begin_processing(&self, session_id: &str) -> Result<bool>;

    async fn set_session_status(&self, session_id: &str, status: SessionStatus) -> Result<()>;

    /// All messages in the session, oldest first.
    async fn messages(&self, session_id: &str) -> Result<Vec<Message>>;

    async fn message(&self, message_id: &str) -> Result<Message>;

    async fn insert_message(&self, message: Message) -> Result<()>;

    /// Replace the stored message wholesale (matched by id).
    async fn update_message(&self, message: Message) -> Result<()>;

    /// Attach one tool result to its assistant message. A result for a
    /// `tool_call_id` that is already present is ignored.
    async fn append_tool_result(&self, message_id: &str, result: ToolResult) -> Result<()>;
}
