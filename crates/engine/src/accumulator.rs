//! Stream accumulation.
//!
//! Providers stream tool-call fragments keyed by position index; the id and
//! function name arrive once, argument strings arrive in pieces cut at
//! arbitrary byte boundaries. The accumulator concatenates fragments per
//! index in arrival order, so any split of the same stream produces the same
//! final calls.

use std::collections::BTreeMap;

use futures_util::StreamExt;

use relay_domain::message::ToolCall;
use relay_domain::stream::{BoxStream, FinishReason, StreamEvent, Usage};
use relay_domain::Result;

#[derive(Debug, Default)]
struct PartialCall {
    id: Option<String>,
    name: Option<String>,
    arguments: String,
}

/// Everything one model call produced.
#[derive(Debug, Clone)]
pub struct StreamOutcome {
    pub content: String,
    pub tool_calls: Vec<ToolCall>,
    pub usage: Usage,
    pub finish_reason: FinishReason,
}

#[derive(Debug, Default)]
pub struct StreamAccumulator {
    content: String,
    calls: BTreeMap<usize, PartialCall>,
    usage: Usage,
    finish: Option<FinishReason>,
}

impl StreamAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one event. Returns true once a terminal finish has been seen;
    /// callers must stop feeding after that.
    pub fn push(&mut self, event: StreamEvent) -> bool {
        match event {
            StreamEvent::ContentDelta { text } => self.content.push_str(&text),
            StreamEvent::ToolCallDelta { index, id, name, arguments } => {
                let slot = self.calls.entry(index).or_default();
                if let Some(id) = id {
                    slot.id = Some(id);
                }
                if let Some(name) = name {
                    slot.name = Some(name);
                }
                slot.arguments.push_str(&arguments);
            }
            StreamEvent::UsageDelta { usage } => self.usage.add(usage),
            StreamEvent::Finish { reason } => self.finish = Some(reason),
        }
        self.finish.is_some()
    }

    /// Finalize. Calls in index order; a fragment set that never received an
    /// id or name is dropped with a warning rather than failing the round.
    pub fn finish(self) -> StreamOutcome {
        let tool_calls = self
            .calls
            .into_iter()
            .filter_map(|(index, partial)| match (partial.id, partial.name) {
                (Some(id), Some(name)) => Some(ToolCall {
                    id,
                    name,
                    arguments: partial.arguments,
                }),
                (id, name) => {
                    tracing::warn!(
                        index,
                        has_id = id.is_some(),
                        has_name = name.is_some(),
                        "dropping incomplete tool call fragments"
                    );
                    None
                }
            })
            .collect();

        StreamOutcome {
            content: self.content,
            tool_calls,
            usage: self.usage,
            finish_reason: self.finish.unwrap_or(FinishReason::Stop),
        }
    }
}

/// Drain a gateway stream into one outcome, stopping at the first terminal
/// finish reason.
pub async fn consume(mut stream: BoxStream<Result<StreamEvent>>) -> Result<StreamOutcome> {
    let mut acc = StreamAccumulator::new();
    while let Some(event) = stream.next().await {
        if acc.push(event?) {
            break;
        }
    }
    Ok(acc.finish())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn delta(index: usize, id: Option<&str>, name: Option<&str>, args: &str) -> StreamEvent {
        StreamEvent::ToolCallDelta {
            index,
            id: id.map(String::from),
            name: name.map(String::from),
            arguments: args.to_string(),
        }
    }

    fn run_events(events: Vec<StreamEvent>) -> StreamOutcome {
        let mut acc = StreamAccumulator::new();
        for ev in events {
            acc.push(ev);
        }
        acc.finish()
    }

    #[test]
    fn split_invariance_over_argument_fragments() {
        let args = r#"{"query":"weather in Beijing"}"#;

        // Unsplit.
        let whole = run_events(vec![
            delta(0, Some("c1"), Some("search"), args),
            StreamEvent::Finish { reason: FinishReason::ToolCalls },
        ]);

        // Split at every byte boundary.
        for cut in 1..args.len() {
            if !args.is_char_boundary(cut) {
                continue;
            }
            let split = run_events(vec![
                delta(0, Some("c1"), Some("search"), &args[..cut]),
                delta(0, None, None, &args[cut..]),
                StreamEvent::Finish { reason: FinishReason::ToolCalls },
            ]);
            assert_eq!(split.tool_calls, whole.tool_calls, "cut at {cut}");
        }
    }

    #[test]
    fn interleaved_indices_accumulate_independently() {
        let out = run_events(vec![
            delta(0, Some("c1"), Some("first"), "{\"a\":"),
            delta(1, Some("c2"), Some("second"), "{\"b\":"),
            delta(0, None, None, "1}"),
            delta(1, None, None, "2}"),
            StreamEvent::Finish { reason: FinishReason::ToolCalls },
        ]);
        assert_eq!(out.tool_calls.len(), 2);
        assert_eq!(out.tool_calls[0].id, "c1");
        assert_eq!(out.tool_calls[0].arguments, "{\"a\":1}");
        assert_eq!(out.tool_calls[1].id, "c2");
        assert_eq!(out.tool_calls[1].arguments, "{\"b\":2}");
    }

    #[test]
    fn content_and_usage_accumulate() {
        let out = run_events(vec![
            StreamEvent::ContentDelta { text: "Hello ".into() },
            StreamEvent::ContentDelta { text: "world".into() },
            StreamEvent::UsageDelta { usage: Usage { input_tokens: 12, output_tokens: 0 } },
            StreamEvent::UsageDelta { usage: Usage { input_tokens: 0, output_tokens: 4 } },
            StreamEvent::Finish { reason: FinishReason::Stop },
        ]);
        assert_eq!(out.content, "Hello world");
        assert_eq!(out.usage.input_tokens, 12);
        assert_eq!(out.usage.output_tokens, 4);
        assert_eq!(out.finish_reason, FinishReason::Stop);
        assert!(out.tool_calls.is_empty());
    }

    #[test]
    fn push_signals_terminal_finish() {
        let mut acc = StreamAccumulator::new();
        assert!(!acc.push(StreamEvent::ContentDelta { text: "x".into() }));
        assert!(acc.push(StreamEvent::Finish { reason: FinishReason::Stop }));
    }

    #[test]
    fn incomplete_fragments_are_dropped() {
        let out = run_events(vec![
            delta(0, None, None, "{\"orphan\":true}"),
            delta(1, Some("c2"), Some("kept"), "{}"),
            StreamEvent::Finish { reason: FinishReason::ToolCalls },
        ]);
        assert_eq!(out.tool_calls.len(), 1);
        assert_eq!(out.tool_calls[0].name, "kept");
    }
}
