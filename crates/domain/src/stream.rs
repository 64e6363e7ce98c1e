//! Streaming events emitted by a model gateway.
//!
//! Tool-call fragments are keyed by the provider's stream *index*, not by
//! call id: most providers only send the id on the first fragment of each
//! call. The accumulator in the engine owns the index → call mapping.

use std::pin::Pin;

use futures_core::Stream;
use serde::{Deserialize, Serialize};

pub type BoxStream<T> = Pin<Box<dyn Stream<Item = T> + Send>>;

/// One incremental event from a streamed model response.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamEvent {
    /// A fragment of assistant text.
    ContentDelta { text: String },
    /// A fragment of one tool call. `id` and `name` arrive on the first
    /// fragment for a given index; later fragments carry only `arguments`.
    ToolCallDelta {
        index: usize,
        #[serde(skip_serializing_if = "Option::is_none")]
        id: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        name: Option<String>,
        #[serde(default)]
        arguments: String,
    },
    /// Token counts, usually once near the end of the stream.
    UsageDelta { usage: Usage },
    /// Terminal event. No further events follow.
    Finish { reason: FinishReason },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FinishReason {
    Stop,
    ToolCalls,
    Length,
    ContentFilter,
    Error,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    #[serde(default)]
    pub input_tokens: u32,
    #[serde(default)]
    pub output_tokens: u32,
}

impl Usage {
    pub fn total(&self) -> u32 {
        self.input_tokens + self.output_tokens
    }

    pub fn add(&mut self, other: Usage) {
        self.input_tokens += other.input_tokens;
        self.output_tokens += other.output_tokens;
    }
}
