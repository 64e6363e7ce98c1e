//! Conversation model: sessions, messages, tool calls and tool results.
//!
//! The pairing invariant lives here: an assistant message that requested N
//! tools is complete context only once it carries exactly N results, one per
//! call id. [`Message::tool_results_paired`] is the single source of truth
//! for that check; the engine's context builder and the store adapter both
//! call it rather than re-deriving the rule.

use std::collections::HashSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::stream::Usage;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Session
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// One conversation. The `status` field doubles as a coarse per-session run
/// lock: a workflow run starts only by flipping Idle → Processing, and every
/// exit path flips it back to Idle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub id: String,
    pub organization_id: String,
    pub status: SessionStatus,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Idle,
    Processing,
    Cancelled,
}

impl Session {
    pub fn new(id: impl Into<String>, organization_id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            organization_id: organization_id.into(),
            status: SessionStatus::Idle,
            updated_at: Utc::now(),
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Roles and content
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MessageContent {
    Text(String),
    Parts(Vec<ContentPart>),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ContentPart {
    #[serde(rename = "text")]
    Text { text: String },
    #[serde(rename = "image")]
    Image {
        url: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        media_type: Option<String>,
    },
}

impl MessageContent {
    /// Extract the plain-text content (first text part, or the full text).
    pub fn text(&self) -> Option<&str> {
        match self {
            MessageContent::Text(t) => Some(t.as_str()),
            MessageContent::Parts(parts) => parts.iter().find_map(|p| match p {
                ContentPart::Text { text } => Some(text.as_str()),
                _ => None,
            }),
        }
    }

    pub fn is_empty(&self) -> bool {
        match self {
            MessageContent::Text(t) => t.is_empty(),
            MessageContent::Parts(parts) => parts.is_empty(),
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tool call / tool result
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// A tool invocation requested by the model. `arguments` stays the raw
/// accumulated string from the stream; parsing happens at dispatch so that a
/// malformed payload can be reported back as a failed result instead of
/// poisoning the message record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    pub arguments: String,
}

/// The outcome of exactly one tool call. Created once per call per round;
/// never mutated afterwards except to merge late token usage into the owning
/// message's counters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolResult {
    pub tool_call_id: String,
    pub tool_name: String,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub usage: Option<Usage>,
}

impl ToolResult {
    pub fn ok(call: &ToolCall, data: serde_json::Value) -> Self {
        Self {
            tool_call_id: call.id.clone(),
            tool_name: call.name.clone(),
            success: true,
            data: Some(data),
            error: None,
            message: None,
            usage: None,
        }
    }

    pub fn err(call: &ToolCall, error: impl Into<String>) -> Self {
        Self {
            tool_call_id: call.id.clone(),
            tool_name: call.name.clone(),
            success: false,
            data: None,
            error: Some(error.into()),
            message: None,
            usage: None,
        }
    }

    /// Render the result into the text fed back to the model as the tool
    /// observation, truncated to `max_bytes` on a char boundary.
    pub fn render_observation(&self, max_bytes: usize) -> String {
        let body = if self.success {
            self.data
                .as_ref()
                .map(|d| match d {
                    serde_json::Value::String(s) => s.clone(),
                    other => other.to_string(),
                })
                .unwrap_or_default()
        } else {
            format!(
                "Error: {}",
                self.error.as_deref().unwrap_or("tool failed")
            )
        };
        truncate_str(&body, max_bytes)
    }
}

/// Unicode-safe truncation with a trailing ellipsis marker.
pub fn truncate_str(s: &str, max_bytes: usize) -> String {
    if s.len() <= max_bytes {
        return s.to_string();
    }
    let mut end = max_bytes;
    while end > 0 && !s.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}...", &s[..end])
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Message
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// One conversation turn as persisted by the message store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    pub session_id: String,
    pub role: Role,
    pub content: MessageContent,
    /// Whether this turn is finished from the engine's point of view.
    pub is_complete: bool,
    /// Whether deltas are still being streamed into this turn.
    pub is_streaming: bool,
    /// Present only on assistant messages that requested tools.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Vec<ToolCall>>,
    /// Present only once tool calls have been executed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_results: Option<Vec<ToolResult>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finish_reason: Option<String>,
    #[serde(default)]
    pub input_tokens: u32,
    #[serde(default)]
    pub output_tokens: u32,
    /// Free-form markers: `interrupted`, `awaiting_client_tools`,
    /// `resume_event`, terminal-condition tags.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Value>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Message {
    fn base(session_id: impl Into<String>, role: Role, content: MessageContent) -> Self {
        let now = Utc::now();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            session_id: session_id.into(),
            role,
            content,
            is_complete: true,
            is_streaming: false,
            tool_calls: None,
            tool_results: None,
            finish_reason: None,
            input_tokens: 0,
            output_tokens: 0,
            metadata: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn user(session_id: impl Into<String>, text: impl Into<String>) -> Self {
        Self::base(session_id, Role::User, MessageContent::Text(text.into()))
    }

    pub fn assistant(session_id: impl Into<String>, text: impl Into<String>) -> Self {
        Self::base(session_id, Role::Assistant, MessageContent::Text(text.into()))
    }

    /// Empty, incomplete assistant placeholder that will own one round's
    /// streamed output.
    pub fn placeholder(session_id: impl Into<String>) -> Self {
        let mut m = Self::base(session_id, Role::Assistant, MessageContent::Text(String::new()));
        m.is_complete = false;
        m.is_streaming = true;
        m
    }

    /// The set of call ids on this message (empty when no tools requested).
    pub fn tool_call_ids(&self) -> HashSet<&str> {
        self.tool_calls
            .as_deref()
            .unwrap_or_default()
            .iter()
            .map(|c| c.id.as_str())
            .collect()
    }

    /// The pairing invariant: every requested call id has exactly one result
    /// and no result points at an unknown call id.
    pub fn tool_results_paired(&self) -> bool {
        let calls = self.tool_call_ids();
        let results = self.tool_results.as_deref().unwrap_or_default();
        if results.len() != calls.len() {
            return false;
        }
        let mut seen = HashSet::new();
        for r in results {
            if !calls.contains(r.tool_call_id.as_str()) || !seen.insert(r.tool_call_id.as_str()) {
                return false;
            }
        }
        true
    }

    /// Whether this assistant message still owes tool execution: it carries
    /// calls but the result set is not a complete pairing yet.
    pub fn owes_tool_results(&self) -> bool {
        self.tool_calls.as_deref().map_or(false, |c| !c.is_empty()) && !self.tool_results_paired()
    }

    /// Fetch a metadata flag, treating absent metadata as false.
    pub fn flag(&self, key: &str) -> bool {
        self.metadata
            .as_ref()
            .and_then(|m| m.get(key))
            .and_then(|v| v.as_bool())
            .unwrap_or(false)
    }

    /// Set a metadata key, creating the metadata object when needed.
    pub fn set_meta(&mut self, key: &str, value: serde_json::Value) {
        let meta = self
            .metadata
            .get_or_insert_with(|| serde_json::Value::Object(Default::default()));
        if let serde_json::Value::Object(map) = meta {
            map.insert(key.to_string(), value);
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[cfg(test)]
mod tests {
    use super::*;

    fn call(id: &str) -> ToolCall {
        ToolCall {
            id: id.into(),
            name: "get_current_weather".into(),
            arguments: r#"{"city":"Beijing"}"#.into(),
        }
    }

    #[test]
    fn pairing_holds_with_zero_calls_and_zero_results() {
        let m = Message::assistant("s1", "hello");
        assert!(m.tool_results_paired());
        assert!(!m.owes_tool_results());
    }

    #[test]
    fn pairing_fails_with_partial_results() {
        let mut m = Message::placeholder("s1");
        m.tool_calls = Some(vec![call("a"), call("b")]);
        m.tool_results = Some(vec![ToolResult::ok(&call("a"), serde_json::json!("ok"))]);
        assert!(!m.tool_results_paired());
        assert!(m.owes_tool_results());
    }

    #[test]
    fn pairing_fails_with_foreign_call_id() {
        let mut m = Message::placeholder("s1");
        m.tool_calls = Some(vec![call("a")]);
        m.tool_results = Some(vec![ToolResult::ok(&call("z"), serde_json::json!("ok"))]);
        assert!(!m.tool_results_paired());
    }

    #[test]
    fn pairing_fails_with_duplicate_result_for_one_call() {
        let mut m = Message::placeholder("s1");
        m.tool_calls = Some(vec![call("a"), call("b")]);
        m.tool_results = Some(vec![
            ToolResult::ok(&call("a"), serde_json::json!(1)),
            ToolResult::ok(&call("a"), serde_json::json!(2)),
        ]);
        assert!(!m.tool_results_paired());
    }

    #[test]
    fn pairing_holds_with_permuted_results() {
        let mut m = Message::placeholder("s1");
        m.tool_calls = Some(vec![call("a"), call("b")]);
        m.tool_results = Some(vec![
            ToolResult::ok(&call("b"), serde_json::json!(2)),
            ToolResult::ok(&call("a"), serde_json::json!(1)),
        ]);
        assert!(m.tool_results_paired());
        assert!(!m.owes_tool_results());
    }

    #[test]
    fn metadata_flags() {
        let mut m = Message::placeholder("s1");
        assert!(!m.flag("interrupted"));
        m.set_meta("interrupted", serde_json::json!(true));
        assert!(m.flag("interrupted"));
    }

    #[test]
    fn truncate_unicode_safe() {
        assert_eq!(truncate_str("hello", 10), "hello");
        assert_eq!(truncate_str("hello world", 5), "hello...");
        let t = truncate_str("héllo", 2);
        assert!(t.ends_with("..."));
    }

    #[test]
    fn observation_rendering_truncates_and_reports_errors() {
        let c = call("a");
        let ok = ToolResult::ok(&c, serde_json::json!("sunny, 21C"));
        assert_eq!(ok.render_observation(100), "sunny, 21C");

        let err = ToolResult::err(&c, "upstream 500");
        assert_eq!(err.render_observation(100), "Error: upstream 500");

        let long = ToolResult::ok(&c, serde_json::json!("x".repeat(50)));
        assert!(long.render_observation(10).len() <= 13);
    }
}
