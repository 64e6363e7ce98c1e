//! Model-facing context reconstruction.
//!
//! The system prompt is re-serialized fresh every round so hook-driven
//! configuration changes take effect immediately. History filtering enforces
//! the pairing rules: an abandoned incomplete assistant turn without tool
//! calls is dropped, and an assistant turn that requested tools is included
//! only once every call id has its result, rendered in call order.

use std::collections::HashMap;

use relay_domain::agent::AgentDefinition;
use relay_domain::config::EngineConfig;
use relay_domain::message::{Message, Role};
use relay_provider::ChatMessage;

/// Maps activated fragment ids to prompt blocks appended after the agent's
/// own system prompt blocks.
pub type FragmentLibrary = HashMap<String, String>;

pub fn default_fragments() -> FragmentLibrary {
    let mut lib = FragmentLibrary::new();
    lib.insert(
        relay_hooks::stuck::CHANGE_STRATEGY_FRAGMENT.to_string(),
        relay_hooks::stuck::CHANGE_STRATEGY_PROMPT.to_string(),
    );
    lib
}

/// Fresh system message for this round: agent blocks plus one block per
/// activated fragment, in fragment-id order.
pub fn build_system_prompt(
    agent: &AgentDefinition,
    activated: impl IntoIterator<Item = impl AsRef<str>>,
    fragments: &FragmentLibrary,
) -> String {
    let mut blocks = vec![agent.system_prompt()];
    for id in activated {
        let id = id.as_ref();
        match fragments.get(id) {
            Some(block) => blocks.push(block.clone()),
            None => tracing::warn!(fragment = id, "unknown prompt fragment activated"),
        }
    }
    blocks.retain(|b| !b.is_empty());
    blocks.join("\n\n")
}

/// Serialize history into gateway wire form.
pub fn build_messages(
    agent: &AgentDefinition,
    system_prompt: &str,
    history: &[Message],
    config: &EngineConfig,
) -> Vec<ChatMessage> {
    let mut out = vec![ChatMessage::system(system_prompt)];
    let mut last_had_results = false;

    for message in history {
        match message.role {
            Role::System => {}
            Role::User => {
                last_had_results = false;
                out.push(ChatMessage::user(message.content.text().unwrap_or_default()));
            }
            Role::Assistant => {
                last_had_results = false;
                let calls = message.tool_calls.as_deref().unwrap_or_default();
                if calls.is_empty() {
                    // Abandoned in-flight turn.
                    if !message.is_complete {
                        continue;
                    }
                    out.push(ChatMessage::assistant(message.content.text().unwrap_or_default()));
                    continue;
                }
                // Still owed tool execution; sending calls without results
                // would be rejected by the chat API.
                if !message.tool_results_paired() {
                    continue;
                }
                out.push(ChatMessage::assistant_with_calls(
                    message.content.text().unwrap_or_default(),
                    calls.to_vec(),
                ));
                let results = message.tool_results.as_deref().unwrap_or_default();
                // One tool message per call, in call order.
                for call in calls {
                    if let Some(r) = results.iter().find(|r| r.tool_call_id == call.id) {
                        out.push(ChatMessage::tool(
                            call.id.clone(),
                            r.render_observation(config.max_observe),
                        ));
                    }
                }
                last_had_results = true;
            }
            Role::Tool => {}
        }
    }

    if last_had_results {
        if let Some(prompt) = &agent.observation_prompt {
            out.push(ChatMessage::user(prompt.clone()));
        }
    }

    out
}
