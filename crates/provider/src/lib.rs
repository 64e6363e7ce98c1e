//! Model gateway abstraction.
//!
//! The engine never talks to a vendor API directly; it builds a
//! [`ChatRequest`] and hands it to whatever [`ModelGateway`] it was
//! constructed with. The [`mock`] module provides the scripted gateway the
//! test suites run against.

pub mod mock;

use async_trait::async_trait;

use relay_domain::agent::ToolSpec;
use relay_domain::message::{Role, ToolCall};
use relay_domain::stream::{BoxStream, StreamEvent};
use relay_domain::Result;

pub use mock::{FailingGateway, ScriptedGateway};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Request types
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// One message in gateway wire form. Assistant turns that requested tools
/// carry `tool_calls`; tool observations carry `tool_call_id`.
#[derive(Debug, Clone)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
    pub tool_calls: Vec<ToolCall>,
    pub tool_call_id: Option<String>,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self::plain(Role::System, content)
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::plain(Role::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::plain(Role::Assistant, content)
    }

    pub fn assistant_with_calls(content: impl Into<String>, tool_calls: Vec<ToolCall>) -> Self {
        Self {
            tool_calls,
            ..Self::plain(Role::Assistant, content)
        }
    }

    /// A tool observation paired to one call id.
    pub fn tool(tool_call_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            tool_call_id: Some(tool_call_id.into()),
            ..Self::plain(Role::Tool, content)
        }
    }

    fn plain(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            tool_calls: Vec::new(),
            tool_call_id: None,
        }
    }
}

/// A gateway-agnostic chat completion request.
#[derive(Debug, Clone, Default)]
pub struct ChatRequest {
    /// Model identifier, e.g. "gpt-4o".
    pub model: String,
    pub messages: Vec<ChatMessage>,
    /// Tool specs the model may invoke.
    pub tools: Vec<ToolSpec>,
    pub temperature: Option<f32>,
    pub max_tokens: Option<u32>,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Gateway trait
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// One model backend. Implementations translate [`ChatRequest`] into the
/// vendor wire format and surface the response as a stream of
/// [`StreamEvent`]s ending in `Finish`.
#[async_trait]
pub trait ModelGateway: Send + Sync {
    async fn chat_stream(&self, req: ChatRequest) -> Result<BoxStream<Result<StreamEvent>>>;

    /// A unique identifier for this gateway instance.
    fn gateway_id(&self) -> &str;
}
