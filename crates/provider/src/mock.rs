//! Scripted gateways for tests.
//!
//! A [`ScriptedGateway`] holds a queue of pre-built event streams; each
//! `chat_stream` call pops one. Requests are recorded so tests can assert on
//! the exact context the engine sent.

use std::collections::VecDeque;

use async_trait::async_trait;
use parking_lot::Mutex;

use relay_domain::stream::{BoxStream, FinishReason, StreamEvent, Usage};
use relay_domain::{Error, Result};

use crate::{ChatRequest, ModelGateway};

/// Builder for one scripted model response.
#[derive(Debug, Clone, Default)]
pub struct Script {
    events: Vec<StreamEvent>,
}

impl Script {
    pub fn new() -> Self {
        Self::default()
    }

    /// Split `text` into per-word content deltas.
    pub fn text(mut self, text: &str) -> Self {
        let mut first = true;
        for word in text.split(' ') {
            let chunk = if first {
                word.to_string()
            } else {
                format!(" {word}")
            };
            first = false;
            self.events.push(StreamEvent::ContentDelta { text: chunk });
        }
        self
    }

    /// One complete tool call at `index`, arguments split into two fragments
    /// the way real gateways deliver them.
    pub fn tool_call(mut self, index: usize, id: &str, name: &str, arguments: &str) -> Self {
        let mid = arguments.len() / 2;
        let mid = (0..=mid).rev().find(|&i| arguments.is_char_boundary(i)).unwrap_or(0);
        self.events.push(StreamEvent::ToolCallDelta {
            index,
            id: Some(id.to_string()),
            name: Some(name.to_string()),
            arguments: arguments[..mid].to_string(),
        });
        if mid < arguments.len() {
            self.events.push(StreamEvent::ToolCallDelta {
                index,
                id: None,
                name: None,
                arguments: arguments[mid..].to_string(),
            });
        }
        self
    }

    pub fn usage(mut self, input_tokens: u32, output_tokens: u32) -> Self {
        self.events.push(StreamEvent::UsageDelta {
            usage: Usage { input_tokens, output_tokens },
        });
        self
    }

    pub fn finish(mut self, reason: FinishReason) -> Self {
        self.events.push(StreamEvent::Finish { reason });
        self
    }

    /// Plain text answer with usage and a stop finish.
    pub fn answer(text: &str) -> Self {
        Self::new()
            .text(text)
            .usage(100, 20)
            .finish(FinishReason::Stop)
    }

    /// Single tool call with usage and a tool_calls finish.
    pub fn calls_tool(id: &str, name: &str, arguments: &str) -> Self {
        Self::new()
            .tool_call(0, id, name, arguments)
            .usage(100, 30)
            .finish(FinishReason::ToolCalls)
    }

    pub fn into_events(self) -> Vec<StreamEvent> {
        self.events
    }
}

/// Gateway that replays queued scripts in order.
pub struct ScriptedGateway {
    scripts: Mutex<VecDeque<Vec<StreamEvent>>>,
    requests: Mutex<Vec<ChatRequest>>,
}

impl ScriptedGateway {
    pub fn new(scripts: impl IntoIterator<Item = Script>) -> Self {
        Self {
            scripts: Mutex::new(scripts.into_iter().map(Script::into_events).collect()),
            requests: Mutex::new(Vec::new()),
        }
    }

    /// Queue another script after construction.
    pub fn push(&self, script: Script) {
        self.scripts.lock().push_back(script.into_events());
    }

    /// Every request received so far, in order.
    pub fn requests(&self) -> Vec<ChatRequest> {
        self.requests.lock().clone()
    }

    pub fn calls_made(&self) -> usize {
        self.requests.lock().len()
    }
}

#[async_trait]
impl ModelGateway for ScriptedGateway {
    async fn chat_stream(&self, req: ChatRequest) -> Result<BoxStream<Result<StreamEvent>>> {
        self.requests.lock().push(req);
        let events = self.scripts.lock().pop_front().ok_or_else(|| Error::Gateway {
            gateway: "scripted".into(),
            message: "no script queued for this call".into(),
        })?;
        Ok(Box::pin(futures_util::stream::iter(events.into_iter().map(Ok))))
    }

    fn gateway_id(&self) -> &str {
        "scripted"
    }
}

/// Gateway whose every call fails, for error-path tests.
pub struct FailingGateway {
    message: String,
}

impl FailingGateway {
    pub fn new(message: impl Into<String>) -> Self {
        Self { message: message.into() }
    }
}

#[async_trait]
impl ModelGateway for FailingGateway {
    async fn chat_stream(&self, _req: ChatRequest) -> Result<BoxStream<Result<StreamEvent>>> {
        Err(Error::Gateway {
            gateway: "failing".into(),
            message: self.message.clone(),
        })
    }

    fn gateway_id(&self) -> &str {
        "failing"
    }
}
