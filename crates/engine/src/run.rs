//! The round loop.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::Instrument;

use relay_domain::agent::{AgentDefinition, AgentRegistry, ToolRuntime};
use relay_domain::config::EngineConfig;
use relay_domain::message::{Message, MessageContent, Role, SessionStatus, ToolCall, ToolResult};
use relay_domain::stream::{FinishReason, Usage};
use relay_domain::{Error, Result};
use relay_hooks::{HookContext, HookPipeline, HookTrigger, MicroAgent, StuckDetector};
use relay_provider::{ChatRequest, ModelGateway};
use relay_steps::{EventBus, MemoryStepLog, StepLog, StepRunner};
use relay_store::MessageStore;
use relay_tools::{ToolRegistry, TERMINATE_TOOL};

use crate::accumulator;
use crate::billing::{self, BalanceLedger};
use crate::context::{self, FragmentLibrary};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Request / outcome
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Inbound trigger for one workflow run.
#[derive(Debug, Clone)]
pub struct RunRequest {
    pub organization_id: String,
    pub session_id: String,
    /// The user message that started this run. Part of the run identity, so
    /// a redelivered trigger replays rather than re-executes.
    pub user_message_id: String,
    pub model_id: Option<String>,
    pub agent_id: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunStatus {
    Completed,
    /// Another run already holds the session.
    Busy,
    Cancelled,
    MaxRounds,
    InsufficientBalance,
    /// Model call failed after retries; a terminal error message was written.
    Failed,
}

#[derive(Debug, Clone)]
pub struct RunOutcome {
    pub status: RunStatus,
    pub rounds: u32,
}

/// What one model call produced, as recorded by its durable step. A gateway
/// failure is captured in `error` instead of failing the step, so replay is
/// deterministic and the run can end with a user-visible message.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct LlmRound {
    content: String,
    tool_calls: Vec<ToolCall>,
    usage: Usage,
    finish_reason: FinishReason,
    error: Option<String>,
}

/// Hook-requested retries of one round are bounded; past this the loop
/// advances regardless.
const MAX_ROUND_RETRIES: u32 = 3;

fn step_key(round: u32, attempt: u32, name: &str) -> String {
    if attempt == 0 {
        format!("round-{round}-{name}")
    } else {
        format!("round-{round}-a{attempt}-{name}")
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Engine
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub struct Engine {
    store: Arc<dyn MessageStore>,
    gateway: Arc<dyn ModelGateway>,
    agents: AgentRegistry,
    tools: Arc<ToolRegistry>,
    ledger: Arc<dyn BalanceLedger>,
    hooks: HookPipeline,
    fragments: FragmentLibrary,
    step_log: Arc<dyn StepLog>,
    bus: Arc<EventBus>,
    config: EngineConfig,
}

impl Engine {
    pub fn new(
        store: Arc<dyn MessageStore>,
        gateway: Arc<dyn ModelGateway>,
        agents: AgentRegistry,
        tools: Arc<ToolRegistry>,
        ledger: Arc<dyn BalanceLedger>,
        config: EngineConfig,
    ) -> Self {
        let mut hooks = HookPipeline::new();
        hooks.register(Arc::new(StuckDetector::new(config.stuck_threshold)));
        Self {
            store,
            gateway,
            agents,
            tools,
            ledger,
            hooks,
            fragments: context::default_fragments(),
            step_log: Arc::new(MemoryStepLog::new()),
            bus: Arc::new(EventBus::new()),
            config,
        }
    }

    /// Swap the step log (e.g. for the JSONL-backed one).
    pub fn with_step_log(mut self, log: Arc<dyn StepLog>) -> Self {
        self.step_log = log;
        self
    }

    pub fn add_hook(&mut self, hook: Arc<dyn MicroAgent>) {
        self.hooks.register(hook);
    }

    pub fn add_fragment(&mut self, id: impl Into<String>, block: impl Into<String>) {
        self.fragments.insert(id.into(), block.into());
    }

    /// Event name a resumer derives from ids it already knows; no
    /// engine-internal state needed.
    pub fn resume_event_name(session_id: &str, message_id: &str) -> String {
        format!("resume:{session_id}:{message_id}")
    }

    /// Deliver an out-of-band event (client tool result, form submission)
    /// to a suspended run.
    pub fn notify(&self, event: &str, payload: serde_json::Value) {
        self.bus.notify(event, payload);
    }

    // ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
    // Run entry
    // ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

    pub async fn run(&self, req: RunRequest) -> Result<RunOutcome> {
        let run_id = format!("{}:{}", req.session_id, req.user_message_id);
        let steps = StepRunner::new(run_id, self.step_log.clone(), self.bus.clone());

        // The lock acquisition is itself a step, recorded only on success: a
        // replayed run must not be refused by the session it released on its
        // previous attempt, and a refusal must stay non-binding so a
        // redelivered trigger can start once the session frees.
        let acquired = steps
            .run("acquire-session", || async {
                if self.store.try_begin_processing(&req.session_id).await? {
                    Ok(())
                } else {
                    Err(Error::SessionBusy(req.session_id.clone()))
                }
            })
            .await;
        match acquired {
            Ok(()) => {}
            Err(Error::SessionBusy(_)) => {
                tracing::info!(session_id = %req.session_id, "session busy; run refused");
                return Ok(RunOutcome { status: RunStatus::Busy, rounds: 0 });
            }
            Err(e) => return Err(e),
        }

        let outcome = self.drive(&req, &steps).await;

        // Release on every exit path; a stuck session must never block the
        // next user message.
        if let Err(e) = self
            .store
            .set_session_status(&req.session_id, SessionStatus::Idle)
            .await
        {
            tracing::error!(session_id = %req.session_id, error = %e, "failed to release session");
        }

        match &outcome {
            Ok(o) => tracing::info!(
                session_id = %req.session_id,
                status = ?o.status,
                rounds = o.rounds,
                "run finished"
            ),
            Err(e) => tracing::error!(session_id = %req.session_id, error = %e, "run aborted"),
        }
        outcome
    }

    // ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
    // Round loop
    // ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

    async fn drive(&self, req: &RunRequest, steps: &StepRunner) -> Result<RunOutcome> {
        let agent = self.agents.resolve(req.agent_id.as_deref()).clone();
        let model = req.model_id.clone().unwrap_or_else(|| self.config.model.clone());

        let mut ctx = HookContext::new(&req.session_id, &agent.id, model);

        let history = self.store.messages(&req.session_id).await?;
        if !history.iter().any(|m| m.role == Role::Assistant) {
            ctx.messages = history;
            self.hooks.fire(HookTrigger::Initialization, &mut ctx).await;
        }

        let mut round: u32 = 0;
        let mut attempt: u32 = 0;

        loop {
            if round >= self.config.max_rounds {
                self.write_terminal(
                    req,
                    steps,
                    "terminal-max-rounds",
                    "I reached the maximum number of reasoning rounds for this request. \
                     Please send a follow-up message to continue.",
                    "max_rounds",
                )
                .await?;
                return Ok(RunOutcome { status: RunStatus::MaxRounds, rounds: round });
            }

            // Cancellation check, once before context load.
            if self.cancelled(req).await? {
                self.mark_interrupted(req).await?;
                return Ok(RunOutcome { status: RunStatus::Cancelled, rounds: round });
            }

            // 1. Load and reconstruct context.
            let history = self.store.messages(&req.session_id).await?;
            ctx.round = round;
            ctx.messages = history;
            ctx.final_answer = None;

            self.hooks.fire(HookTrigger::PreIteration, &mut ctx).await;

            let system_prompt =
                context::build_system_prompt(&agent, &ctx.activated_fragments, &self.fragments);
            let request = ChatRequest {
                model: ctx.model.clone(),
                messages: context::build_messages(&agent, &system_prompt, &ctx.messages, &self.config),
                tools: agent.tools.clone(),
                temperature: None,
                max_tokens: None,
            };

            // 3. Budget check against the estimate. Hard stop, not retryable.
            let affordable: bool = steps
                .run(&step_key(round, attempt, "check-balance"), || async {
                    let cost = billing::estimate_round_cost(&self.config, &request);
                    let balance = self.ledger.balance(&req.organization_id).await?;
                    Ok(balance >= cost)
                })
                .await?;
            if !affordable {
                self.write_terminal(
                    req,
                    steps,
                    "terminal-balance",
                    "Your organization has insufficient credits to continue this \
                     conversation. Please add credits and try again.",
                    "insufficient_balance",
                )
                .await?;
                return Ok(RunOutcome { status: RunStatus::InsufficientBalance, rounds: round });
            }

            // 4. Placeholder owning this round's output.
            let placeholder_id: String = steps
                .run(&step_key(round, attempt, "create-placeholder"), || async {
                    let m = Message::placeholder(&req.session_id);
                    let id = m.id.clone();
                    self.store.insert_message(m).await?;
                    Ok(id)
                })
                .await?;

            // Second cancellation check, immediately before the model call.
            if self.cancelled(req).await? {
                self.mark_interrupted(req).await?;
                return Ok(RunOutcome { status: RunStatus::Cancelled, rounds: round });
            }

            // 5. Model call, streaming, inside its step.
            let span = tracing::info_span!(
                "round",
                session_id = %req.session_id,
                round,
                model = %ctx.model
            );
            let llm: LlmRound = steps
                .run(&step_key(round, attempt, "call-llm"), || {
                    self.call_model(request.clone()).instrument(span)
                })
                .await?;

            if let Some(error) = &llm.error {
                self.fail_round(req, steps, round, attempt, &placeholder_id, error).await?;
                return Ok(RunOutcome { status: RunStatus::Failed, rounds: round });
            }

            // 6. Persist the round's output.
            steps
                .run(&step_key(round, attempt, "persist-output"), || async {
                    let mut m = self.store.message(&placeholder_id).await?;
                    m.content = MessageContent::Text(llm.content.clone());
                    m.tool_calls =
                        (!llm.tool_calls.is_empty()).then(|| llm.tool_calls.clone());
                    m.finish_reason = serde_json::to_value(llm.finish_reason)
                        .ok()
                        .and_then(|v| v.as_str().map(String::from));
                    m.input_tokens = llm.usage.input_tokens;
                    m.output_tokens = llm.usage.output_tokens;
                    m.is_streaming = false;
                    m.is_complete = llm.finish_reason != FinishReason::ToolCalls;
                    self.store.update_message(m).await
                })
                .await?;

            // 7. Deduct actual cost, priced by the model that ran the round.
            steps
                .run(&step_key(round, attempt, "deduct"), || async {
                    let cost = billing::actual_round_cost(&self.config, &request.model, llm.usage);
                    if cost > 0.0 {
                        self.ledger.deduct(&req.organization_id, cost).await?;
                    }
                    Ok(cost)
                })
                .await?;

            // 8. Branch on finish reason. A hook may reject the final answer
            // and force the round to run again, within the retry budget.
            if llm.tool_calls.is_empty() {
                ctx.final_answer = Some(llm.content.clone());
                let pre = self.hooks.fire(HookTrigger::PreFinalAnswer, &mut ctx).await;
                let post = self.hooks.fire(HookTrigger::PostIteration, &mut ctx).await;
                if (pre.should_retry || post.should_retry) && attempt < MAX_ROUND_RETRIES {
                    attempt += 1;
                    tracing::info!(
                        session_id = %req.session_id,
                        round,
                        attempt,
                        "hook rejected the final answer; repeating round"
                    );
                    continue;
                }
                return Ok(RunOutcome { status: RunStatus::Completed, rounds: round + 1 });
            }

            let terminate_requested = self
                .execute_tools(req, steps, round, attempt, &placeholder_id, &llm.tool_calls, &agent, &mut ctx)
                .await?;

            // Reload so PostIteration (and stuck detection) sees this round.
            ctx.messages = self.store.messages(&req.session_id).await?;
            let verdict = self.hooks.fire(HookTrigger::PostIteration, &mut ctx).await;

            if terminate_requested {
                return Ok(RunOutcome { status: RunStatus::Completed, rounds: round + 1 });
            }

            if verdict.should_retry && attempt < MAX_ROUND_RETRIES {
                attempt += 1;
                tracing::info!(
                    session_id = %req.session_id,
                    round,
                    attempt,
                    "hook requested retry; repeating round"
                );
            } else {
                round += 1;
                attempt = 0;
            }
        }
    }

    // ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
    // Tool execution
    // ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

    #[allow(clippy::too_many_arguments)]
    async fn execute_tools(
        &self,
        req: &RunRequest,
        steps: &StepRunner,
        round: u32,
        attempt: u32,
        placeholder_id: &str,
        calls: &[ToolCall],
        agent: &AgentDefinition,
        ctx: &mut HookContext,
    ) -> Result<bool> {
        let (server_calls, client_calls): (Vec<&ToolCall>, Vec<&ToolCall>) =
            calls.iter().partition(|c| !self.is_client_call(agent, &c.name));

        let mut terminate_requested = false;

        // Sequential on purpose; later tools may depend on earlier effects.
        for call in server_calls {
            ctx.current_tool_call = Some(call.clone());
            self.hooks.fire(HookTrigger::PreToolCall, ctx).await;

            let result: ToolResult = steps
                .run(&step_key(round, attempt, &format!("tool-{}", call.id)), || async {
                    let result = self.tools.dispatch(call).await;
                    // Persisted inside the step so the pairing invariant
                    // holds before any later step can observe this message.
                    self.store.append_tool_result(placeholder_id, result.clone()).await?;
                    Ok(result)
                })
                .await?;

            if call.name == TERMINATE_TOOL && result.success {
                terminate_requested = true;
            }

            ctx.current_tool_result = Some(result);
            self.hooks.fire(HookTrigger::PostToolCall, ctx).await;
            ctx.current_tool_call = None;
            ctx.current_tool_result = None;
        }

        if !client_calls.is_empty() {
            let event = Self::resume_event_name(&req.session_id, placeholder_id);

            for &call in &client_calls {
                ctx.current_tool_call = Some(call.clone());
                self.hooks.fire(HookTrigger::PreToolCall, ctx).await;
            }
            ctx.current_tool_call = None;

            steps
                .run(&step_key(round, attempt, "mark-waiting"), || async {
                    let mut m = self.store.message(placeholder_id).await?;
                    m.set_meta("awaiting_client_tools", json!(true));
                    m.set_meta("resume_event", json!(event.clone()));
                    self.store.update_message(m).await
                })
                .await?;

            let payload = steps
                .wait_for_event(
                    &step_key(round, attempt, "wait-client"),
                    &event,
                    Duration::from_millis(self.config.client_tool_timeout_ms),
                )
                .await?;

            let results: Vec<ToolResult> = steps
                .run(&step_key(round, attempt, "fold-client-results"), || async {
                    let mut results = Vec::with_capacity(client_calls.len());
                    for &call in &client_calls {
                        let result = client_result(call, payload.as_ref());
                        self.store.append_tool_result(placeholder_id, result.clone()).await?;
                        results.push(result);
                    }
                    let mut m = self.store.message(placeholder_id).await?;
                    m.set_meta("awaiting_client_tools", json!(false));
                    self.store.update_message(m).await?;
                    Ok(results)
                })
                .await?;

            for (&call, result) in client_calls.iter().zip(results) {
                ctx.current_tool_call = Some(call.clone());
                ctx.current_tool_result = Some(result);
                self.hooks.fire(HookTrigger::PostToolCall, ctx).await;
            }
            ctx.current_tool_call = None;
            ctx.current_tool_result = None;
        }

        // Close the round: all results are in, the message is complete
        // context for the next round.
        steps
            .run(&step_key(round, attempt, "close-round"), || async {
                let mut m = self.store.message(placeholder_id).await?;
                m.is_complete = true;
                self.store.update_message(m).await
            })
            .await?;

        Ok(terminate_requested)
    }

    fn is_client_call(&self, agent: &AgentDefinition, name: &str) -> bool {
        self.tools.is_client_tool(name)
            || agent.tool(name).is_some_and(|t| t.runtime == ToolRuntime::Client)
    }

    // ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
    // Helpers
    // ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

    async fn call_model(&self, request: ChatRequest) -> Result<LlmRound> {
        let mut last_error = String::new();
        for attempt in 0..=self.config.max_model_retries {
            match self.gateway.chat_stream(request.clone()).await {
                Ok(stream) => match accumulator::consume(stream).await {
                    Ok(out) => {
                        return Ok(LlmRound {
                            content: out.content,
                            tool_calls: out.tool_calls,
                            usage: out.usage,
                            finish_reason: out.finish_reason,
                            error: None,
                        })
                    }
                    Err(e) => last_error = e.to_string(),
                },
                Err(e) => last_error = e.to_string(),
            }
            tracing::warn!(attempt, error = %last_error, "model call failed");
        }
        Ok(LlmRound {
            content: String::new(),
            tool_calls: Vec::new(),
            usage: Usage::default(),
            finish_reason: FinishReason::Error,
            error: Some(last_error),
        })
    }

    async fn cancelled(&self, req: &RunRequest) -> Result<bool> {
        // Idle here means a previous attempt of this run already released
        // the session, so only an explicit Cancelled counts.
        Ok(self.store.session(&req.session_id).await?.status == SessionStatus::Cancelled)
    }

    /// Finalize the newest incomplete assistant message as interrupted
    /// instead of leaving it dangling.
    async fn mark_interrupted(&self, req: &RunRequest) -> Result<()> {
        let history = self.store.messages(&req.session_id).await?;
        if let Some(m) = history
            .iter()
            .rev()
            .find(|m| m.role == Role::Assistant && !m.is_complete)
        {
            let mut m = m.clone();
            m.set_meta("interrupted", json!(true));
            m.is_complete = true;
            m.is_streaming = false;
            self.store.update_message(m).await?;
        }
        tracing::info!(session_id = %req.session_id, "run interrupted by cancellation");
        Ok(())
    }

    /// Persist a user-visible terminal message. Memoized, so a replayed run
    /// does not write it twice.
    async fn write_terminal(
        &self,
        req: &RunRequest,
        steps: &StepRunner,
        key: &str,
        text: &str,
        tag: &str,
    ) -> Result<String> {
        steps
            .run(key, || async {
                let mut m = Message::assistant(&req.session_id, text);
                m.set_meta(tag, json!(true));
                let id = m.id.clone();
                self.store.insert_message(m).await?;
                Ok(id)
            })
            .await
    }

    /// Convert a model-call failure into a terminal error message on the
    /// round's placeholder.
    async fn fail_round(
        &self,
        req: &RunRequest,
        steps: &StepRunner,
        round: u32,
        attempt: u32,
        placeholder_id: &str,
        error: &str,
    ) -> Result<()> {
        tracing::error!(session_id = %req.session_id, round, error, "model call failed terminally");
        steps
            .run(&step_key(round, attempt, "fail-round"), || async {
                let mut m = self.store.message(placeholder_id).await?;
                m.content = MessageContent::Text(
                    "I ran into a problem while generating a response. Please try again."
                        .to_string(),
                );
                m.set_meta("error", json!(true));
                m.is_complete = true;
                m.is_streaming = false;
                self.store.update_message(m).await
            })
            .await
    }
}

/// Build one client tool's result from the resume payload: an object keyed
/// by call id, each value either `{success, data?, error?}` or a bare data
/// value. A missing entry (including a timed-out wait) fails the call so the
/// pairing invariant still holds.
fn client_result(call: &ToolCall, payload: Option<&serde_json::Value>) -> ToolResult {
    let Some(value) = payload.and_then(|p| p.get(&call.id)) else {
        return ToolResult::err(call, "client tool result was not delivered before the timeout");
    };

    if let Some(obj) = value.as_object() {
        if let Some(success) = obj.get("success").and_then(|s| s.as_bool()) {
            return ToolResult {
                tool_call_id: call.id.clone(),
                tool_name: call.name.clone(),
                success,
                data: obj.get("data").cloned(),
                error: obj.get("error").and_then(|e| e.as_str()).map(String::from),
                message: None,
                usage: None,
            };
        }
    }

    ToolResult::ok(call, value.clone())
}
