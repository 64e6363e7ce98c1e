//! Hook context and outcome types.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use relay_domain::message::{Message, ToolCall, ToolResult};

/// Where in the round a hook fires. Order within one round is fixed:
/// PreIteration, then PreToolCall/PostToolCall per call, then PreFinalAnswer
/// (rounds that end without tool calls only), then PostIteration.
/// Initialization fires once per session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HookTrigger {
    Initialization,
    PreIteration,
    PreToolCall,
    PostToolCall,
    PreFinalAnswer,
    PostIteration,
}

/// Snapshot of run state handed to each hook. Hooks get it by reference and
/// cannot mutate it; proposed changes travel back in [`HookOutcome`] and are
/// merged by the pipeline. `version` increments on every merged change so
/// the engine can tell whether a pipeline pass altered anything.
#[derive(Debug, Clone)]
pub struct HookContext {
    pub version: u64,
    pub session_id: String,
    pub agent_id: String,
    /// Model the next call will use. Hooks may swap it via
    /// `replacement_model`.
    pub model: String,
    pub round: u32,
    pub messages: Vec<Message>,
    /// Prompt fragment ids activated so far; the system prompt builder
    /// appends the corresponding blocks.
    pub activated_fragments: BTreeSet<String>,
    pub intent_metadata: serde_json::Map<String, serde_json::Value>,
    /// Set for PreToolCall and PostToolCall.
    pub current_tool_call: Option<ToolCall>,
    /// Set for PostToolCall.
    pub current_tool_result: Option<ToolResult>,
    /// Set for PreFinalAnswer.
    pub final_answer: Option<String>,
}

impl HookContext {
    pub fn new(
        session_id: impl Into<String>,
        agent_id: impl Into<String>,
        model: impl Into<String>,
    ) -> Self {
        Self {
            version: 0,
            session_id: session_id.into(),
            agent_id: agent_id.into(),
            model: model.into(),
            round: 0,
            messages: Vec::new(),
            activated_fragments: BTreeSet::new(),
            intent_metadata: serde_json::Map::new(),
            current_tool_call: None,
            current_tool_result: None,
            final_answer: None,
        }
    }

    /// Assistant message texts, oldest first. Used by stuck detection.
    pub fn assistant_texts(&self) -> Vec<&str> {
        self.messages
            .iter()
            .filter(|m| matches!(m.role, relay_domain::message::Role::Assistant))
            .filter_map(|m| m.content.text())
            .collect()
    }
}

/// Effects one hook proposes. Everything defaults to "no effect".
#[derive(Debug, Clone, Default)]
pub struct HookOutcome {
    pub success: bool,
    pub data: Option<serde_json::Value>,
    pub error: Option<String>,
    pub should_update_system_prompt: bool,
    /// Re-run PreIteration for the same round instead of advancing.
    pub should_retry: bool,
    /// Merged into `intent_metadata`, per-key last-writer-wins.
    pub metadata: Option<serde_json::Map<String, serde_json::Value>>,
    /// Unioned into `activated_fragments`.
    pub activate_fragments: Vec<String>,
    /// Replaces the context message list wholesale. Last hook wins.
    pub replacement_messages: Option<Vec<Message>>,
    /// Replaces the model for subsequent calls. Last hook wins.
    pub replacement_model: Option<String>,
}

impl HookOutcome {
    pub fn ok() -> Self {
        Self {
            success: true,
            ..Self::default()
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            success: false,
            error: Some(error.into()),
            ..Self::default()
        }
    }

    pub fn activate(mut self, fragment: impl Into<String>) -> Self {
        self.activate_fragments.push(fragment.into());
        self
    }

    pub fn update_system_prompt(mut self) -> Self {
        self.should_update_system_prompt = true;
        self
    }

    pub fn retry(mut self) -> Self {
        self.should_retry = true;
        self
    }

    pub fn with_meta(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.metadata
            .get_or_insert_with(serde_json::Map::new)
            .insert(key.into(), value);
        self
    }
}
