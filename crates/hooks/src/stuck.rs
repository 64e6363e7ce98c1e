//! Stuck-state detection.
//!
//! A model that keeps producing the same reply is looping, not progressing.
//! This micro-agent fires after each round; when the newest assistant text
//! has already appeared `threshold` times it activates a strategy-change
//! prompt fragment and asks for a system-prompt rebuild, nudging the next
//! round onto a different path.

use async_trait::async_trait;

use relay_domain::Result;

use crate::context::{HookContext, HookOutcome, HookTrigger};
use crate::pipeline::MicroAgent;

/// Fragment id the system prompt builder maps to the strategy-change block.
pub const CHANGE_STRATEGY_FRAGMENT: &str = "change-strategy";

/// Prompt block appended when the fragment is active.
pub const CHANGE_STRATEGY_PROMPT: &str = "Observed duplicate responses. Consider new strategies \
and avoid repeating ineffective paths already attempted.";

pub struct StuckDetector {
    threshold: u32,
}

impl StuckDetector {
    pub fn new(threshold: u32) -> Self {
        Self { threshold: threshold.max(1) }
    }
}

#[async_trait]
impl MicroAgent for StuckDetector {
    fn name(&self) -> &str {
        "stuck-detector"
    }

    fn triggers(&self) -> &[HookTrigger] {
        &[HookTrigger::PostIteration]
    }

    async fn on_trigger(&self, _trigger: HookTrigger, ctx: &HookContext) -> Result<HookOutcome> {
        let texts = ctx.assistant_texts();
        let Some(&last) = texts.last() else {
            return Ok(HookOutcome::ok());
        };
        if last.is_empty() {
            return Ok(HookOutcome::ok());
        }

        let duplicates = texts[..texts.len() - 1]
            .iter()
            .filter(|&&t| t == last)
            .count() as u32;

        if duplicates >= self.threshold {
            tracing::info!(
                session_id = %ctx.session_id,
                round = ctx.round,
                duplicates,
                "stuck state detected"
            );
            return Ok(HookOutcome::ok()
                .activate(CHANGE_STRATEGY_FRAGMENT)
                .update_system_prompt()
                .with_meta("stuck", serde_json::json!(true)));
        }

        Ok(HookOutcome::ok())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use relay_domain::message::Message;

    fn ctx_with_assistant_texts(texts: &[&str]) -> HookContext {
        let mut ctx = HookContext::new("s1", "assistant", "gpt-4o");
        ctx.messages = texts.iter().map(|t| Message::assistant("s1", *t)).collect();
        ctx
    }

    #[tokio::test]
    async fn two_duplicates_trigger_the_nudge() {
        let d = StuckDetector::new(2);
        let ctx = ctx_with_assistant_texts(&["same reply", "same reply", "same reply"]);
        let out = d.on_trigger(HookTrigger::PostIteration, &ctx).await.unwrap();
        assert!(out.activate_fragments.contains(&CHANGE_STRATEGY_FRAGMENT.to_string()));
        assert!(out.should_update_system_prompt);
    }

    #[tokio::test]
    async fn varied_replies_do_not_trigger() {
        let d = StuckDetector::new(2);
        let ctx = ctx_with_assistant_texts(&["check weather", "weather is sunny", "done"]);
        let out = d.on_trigger(HookTrigger::PostIteration, &ctx).await.unwrap();
        assert!(out.activate_fragments.is_empty());
        assert!(!out.should_update_system_prompt);
    }

    #[tokio::test]
    async fn one_duplicate_is_under_the_default_threshold() {
        let d = StuckDetector::new(2);
        let ctx = ctx_with_assistant_texts(&["same reply", "same reply"]);
        let out = d.on_trigger(HookTrigger::PostIteration, &ctx).await.unwrap();
        assert!(out.activate_fragments.is_empty());
    }

    #[tokio::test]
    async fn empty_history_is_not_stuck() {
        let d = StuckDetector::new(2);
        let ctx = ctx_with_assistant_texts(&[]);
        let out = d.on_trigger(HookTrigger::PostIteration, &ctx).await.unwrap();
        assert!(out.activate_fragments.is_empty());
    }
}
