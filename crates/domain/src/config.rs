//! Engine configuration.
//!
//! All fields have serde defaults so a partial TOML file (or none at all)
//! yields a working config.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Model name passed to the gateway, e.g. "gpt-4o".
    #[serde(default = "d_model")]
    pub model: String,
    /// Hard bound on model-call rounds per workflow run.
    #[serde(default = "d_20")]
    pub max_rounds: u32,
    /// Output tokens assumed by the pre-round balance check.
    #[serde(default = "d_1024")]
    pub assumed_output_tokens: u32,
    /// Byte cap on a single tool observation fed back to the model.
    #[serde(default = "d_10000")]
    pub max_observe: usize,
    /// How long a run waits for client tool results before failing them.
    #[serde(default = "d_300000u")]
    pub client_tool_timeout_ms: u64,
    /// Retries for the model call inside a round before giving up.
    #[serde(default = "d_2")]
    pub max_model_retries: u32,
    /// Identical assistant replies tolerated before the stuck-state nudge.
    #[serde(default = "d_2")]
    pub stuck_threshold: u32,
    /// Per-model pricing for cost estimation (key = model name).
    #[serde(default)]
    pub pricing: HashMap<String, ModelPricing>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            model: d_model(),
            max_rounds: 20,
            assumed_output_tokens: 1024,
            max_observe: 10_000,
            client_tool_timeout_ms: 300_000,
            max_model_retries: 2,
            stuck_threshold: 2,
            pricing: HashMap::new(),
        }
    }
}

impl EngineConfig {
    /// Pricing entry for a model, if one is registered. Callers pass the
    /// model actually running the round, which may differ from the
    /// configured default.
    pub fn model_pricing(&self, model: &str) -> Option<ModelPricing> {
        self.pricing.get(model).copied()
    }
}

/// Pricing per million tokens for a specific model.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ModelPricing {
    /// Dollars per 1 million input (prompt) tokens.
    pub input_per_1m: f64,
    /// Dollars per 1 million output (completion) tokens.
    pub output_per_1m: f64,
}

impl ModelPricing {
    /// Estimated cost in USD for the given token counts.
    pub fn estimate_cost(&self, input_tokens: u32, output_tokens: u32) -> f64 {
        (input_tokens as f64 * self.input_per_1m + output_tokens as f64 * self.output_per_1m)
            / 1_000_000.0
    }
}

fn d_model() -> String {
    "gpt-4o".to_string()
}

fn d_20() -> u32 {
    20
}

fn d_1024() -> u32 {
    1024
}

fn d_10000() -> usize {
    10_000
}

fn d_300000u() -> u64 {
    300_000
}

fn d_2() -> u32 {
    2
}
