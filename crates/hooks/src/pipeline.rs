//! Pipeline runner.

use std::sync::Arc;

use async_trait::async_trait;

use relay_domain::Result;

use crate::context::{HookContext, HookOutcome, HookTrigger};

/// One pluggable stage. `triggers` declares which points it fires at; the
/// pipeline skips it everywhere else.
#[async_trait]
pub trait MicroAgent: Send + Sync {
    fn name(&self) -> &str;

    fn triggers(&self) -> &[HookTrigger];

    async fn on_trigger(&self, trigger: HookTrigger, ctx: &HookContext) -> Result<HookOutcome>;
}

/// What the engine needs to know after one pipeline pass.
#[derive(Debug, Clone, Copy, Default)]
pub struct PipelineVerdict {
    pub should_update_system_prompt: bool,
    pub should_retry: bool,
}

/// Runs every registered micro-agent for a trigger and merges their
/// outcomes back into the context.
#[derive(Default)]
pub struct HookPipeline {
    agents: Vec<Arc<dyn MicroAgent>>,
}

impl HookPipeline {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, agent: Arc<dyn MicroAgent>) {
        self.agents.push(agent);
    }

    pub fn is_empty(&self) -> bool {
        self.agents.is_empty()
    }

    /// Fire one trigger. Hooks run in registration order; a hook that errors
    /// or reports failure is logged and skipped, never aborting the others.
    ///
    /// Merge order across outcomes is by field, not by hook: first all
    /// intent metadata, then all fragment activations, then the last
    /// replacement message list, then the last replacement model. The
    /// context version increments once per applied field group.
    pub async fn fire(&self, trigger: HookTrigger, ctx: &mut HookContext) -> PipelineVerdict {
        let mut outcomes = Vec::new();
        for agent in &self.agents {
            if !agent.triggers().contains(&trigger) {
                continue;
            }
            match agent.on_trigger(trigger, ctx).await {
                Ok(outcome) if outcome.success => outcomes.push(outcome),
                Ok(outcome) => {
                    tracing::warn!(
                        hook = agent.name(),
                        ?trigger,
                        error = outcome.error.as_deref().unwrap_or("unspecified"),
                        "hook reported failure"
                    );
                }
                Err(e) => {
                    tracing::warn!(hook = agent.name(), ?trigger, error = %e, "hook errored");
                }
            }
        }

        let mut verdict = PipelineVerdict::default();
        for o in &outcomes {
            verdict.should_update_system_prompt |= o.should_update_system_prompt;
            verdict.should_retry |= o.should_retry;
        }

        // Field-ordered merge.
        let metadata: Vec<_> = outcomes.iter().filter_map(|o| o.metadata.as_ref()).collect();
        if !metadata.is_empty() {
            for m in metadata {
                for (k, v) in m {
                    ctx.intent_metadata.insert(k.clone(), v.clone());
                }
            }
            ctx.version += 1;
        }

        let fragments: Vec<_> = outcomes
            .iter()
            .flat_map(|o| o.activate_fragments.iter().cloned())
            .collect();
        if !fragments.is_empty() {
            ctx.activated_fragments.extend(fragments);
            ctx.version += 1;
        }

        if let Some(messages) = outcomes.iter().rev().find_map(|o| o.replacement_messages.clone()) {
            ctx.messages = messages;
            ctx.version += 1;
        }

        if let Some(model) = outcomes.iter().rev().find_map(|o| o.replacement_model.clone()) {
            ctx.model = model;
            ctx.version += 1;
        }

        verdict
    }
}
