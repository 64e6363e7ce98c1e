//! In-memory `MessageStore`.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::RwLock;

use relay_domain::message::{Message, Session, SessionStatus, ToolResult};
use relay_domain::{Error, Result};

use crate::MessageStore;

#[derive(Default)]
struct Inner {
    sessions: HashMap<String, Session>,
    /// Message ids per session, in insertion order.
    order: HashMap<String, Vec<String>>,
    messages: HashMap<String, Message>,
}

/// Process-local store guarded by a single RwLock. Every trait method takes
/// the lock once and releases it before returning, so awaiting callers never
/// hold it across a suspension point.
#[derive(Default)]
pub struct MemoryStore {
    inner: RwLock<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_session(&self, session: Session) {
        let mut inner = self.inner.write();
        inner.order.entry(session.id.clone()).or_default();
        inner.sessions.insert(session.id.clone(), session);
    }
}

#[async_trait]
impl MessageStore for MemoryStore {
    async fn session(&self, session_id: &str) -> Result<Session> {
        self.inner
            .read()
            .sessions
            .get(session_id)
            .cloned()
            .ok_or_else(|| Error::SessionNotFound(session_id.to_string()))
    }

    async fn try_begin_processing(&self, session_id: &str) -> Result<bool> {
        let mut inner = self.inner.write();
        let session = inner
            .sessions
            .get_mut(session_id)
            .ok_or_else(|| Error::SessionNotFound(session_id.to_string()))?;
        if session.status != SessionStatus::Idle {
            return Ok(false);
        }
        session.status = SessionStatus::Processing;
        session.updated_at = Utc::now();
        Ok(true)
    }

    async fn set_session_status(&self, session_id: &str, status: SessionStatus) -> Result<()> {
        let mut inner = self.inner.write();
        let session = inner
            .sessions
            .get_mut(session_id)
            .ok_or_else(|| Error::SessionNotFound(session_id.to_string()))?;
        session.status = status;
        session.updated_at = Utc::now();
        Ok(())
    }

    async fn messages(&self, session_id: &str) -> Result<Vec<Message>> {
        let inner = self.inner.read();
        if !inner.sessions.contains_key(session_id) {
            return Err(Error::SessionNotFound(session_id.to_string()));
        }
        let ids = inner.order.get(session_id).cloned().unwrap_or_default();
        Ok(ids
            .iter()
            .filter_map(|id| inner.messages.get(id).cloned())
            .collect())
    }

    async fn message(&self, message_id: &str) -> Result<Message> {
        self.inner
            .read()
            .messages
            .get(message_id)
            .cloned()
            .ok_or_else(|| Error::MessageNotFound(message_id.to_string()))
    }

    async fn insert_message(&self, message: Message) -> Result<()> {
        let mut inner = self.inner.write();
        inner
            .order
            .entry(message.session_id.clone())
            .or_default()
            .push(message.id.clone());
        inner.messages.insert(message.id.clone(), message);
        Ok(())
    }

    async fn update_message(&self, mut message: Message) -> Result<()> {
        let mut inner = self.inner.write();
        if !inner.messages.contains_key(&message.id) {
            return Err(Error::MessageNotFound(message.id));
        }
        message.updated_at = Utc::now();
        inner.messages.insert(message.id.clone(), message);
        Ok(())
    }

    async fn append_tool_result(&self, message_id: &str, result: ToolResult) -> Result<()> {
        let mut inner = self.inner.write();
        let message = inner
            .messages
            .get_mut(message_id)
            .ok_or_else(|| Error::MessageNotFound(message_id.to_string()))?;
        let results = message.tool_results.get_or_insert_with(Vec::new);
        if results.iter().any(|r| r.tool_call_id == result.tool_call_id) {
            tracing::debug!(
                message_id,
                tool_call_id = %result.tool_call_id,
                "duplicate tool result ignored"
            );
            return Ok(());
        }
        results.push(result);
        message.updated_at = Utc::now();
        Ok(())
    }
}
