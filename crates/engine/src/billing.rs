//! Credit accounting.
//!
//! The engine checks the organization's balance before every model call
//! against an estimate, then deducts the actual cost once real token counts
//! are known. Both operations happen inside durable steps, so a replayed run
//! never double-deducts.

use std::collections::HashMap;

use async_trait::async_trait;
use parking_lot::Mutex;

use relay_domain::config::EngineConfig;
use relay_domain::stream::Usage;
use relay_provider::ChatRequest;
use relay_domain::Result;

/// Per-organization credit balance in USD.
#[async_trait]
pub trait BalanceLedger: Send + Sync {
    async fn balance(&self, organization_id: &str) -> Result<f64>;

    async fn deduct(&self, organization_id: &str, amount: f64) -> Result<()>;
}

/// Rough input-token estimate: four bytes per token over the serialized
/// request. Only used for the pre-round affordability check.
pub fn estimate_input_tokens(req: &ChatRequest) -> u32 {
    let bytes: usize = req
        .messages
        .iter()
        .map(|m| m.content.len() + m.tool_calls.iter().map(|c| c.arguments.len() + c.name.len()).sum::<usize>())
        .sum();
    (bytes / 4) as u32
}

/// Estimated cost of the next round, priced by the model the request will
/// actually run on. Zero when no pricing is configured for that model, which
/// makes the balance check a no-op.
pub fn estimate_round_cost(config: &EngineConfig, req: &ChatRequest) -> f64 {
    match config.model_pricing(&req.model) {
        Some(p) => p.estimate_cost(estimate_input_tokens(req), config.assumed_output_tokens),
        None => 0.0,
    }
}

/// Actual cost of a finished round on the given model.
pub fn actual_round_cost(config: &EngineConfig, model: &str, usage: Usage) -> f64 {
    match config.model_pricing(model) {
        Some(p) => p.estimate_cost(usage.input_tokens, usage.output_tokens),
        None => 0.0,
    }
}

/// In-memory ledger for tests and single-process deployments. Unknown
/// organizations have zero balance; deductions may drive a balance negative
/// because the pre-round check, not the deduction, is the enforcement point.
#[derive(Default)]
pub struct MemoryLedger {
    balances: Mutex<HashMap<String, f64>>,
}

impl MemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn credit(&self, organization_id: &str, amount: f64) {
        *self.balances.lock().entry(organization_id.to_string()).or_default() += amount;
    }
}

#[async_trait]
impl BalanceLedger for MemoryLedger {
    async fn balance(&self, organization_id: &str) -> Result<f64> {
        Ok(self.balances.lock().get(organization_id).copied().unwrap_or(0.0))
    }

    async fn deduct(&self, organization_id: &str, amount: f64) -> Result<()> {
        let mut balances = self.balances.lock();
        let entry = balances.entry(organization_id.to_string()).or_default();
        *entry -= amount;
        tracing::debug!(organization_id, amount, remaining = *entry, "credits deducted");
        Ok(())
    }
}
