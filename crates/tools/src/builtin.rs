//! Built-in tools.

use async_trait::async_trait;
use serde_json::json;

use relay_domain::agent::ToolSpec;
use relay_domain::Result;

use crate::registry::ToolExecutor;

/// Name of the termination tool. The engine treats a call to it as an
/// explicit request to end the run after this round.
pub const TERMINATE_TOOL: &str = "terminate";

/// Lets the model end the interaction deliberately instead of running until
/// the round bound.
pub struct Terminate;

#[async_trait]
impl ToolExecutor for Terminate {
    fn spec(&self) -> ToolSpec {
        ToolSpec::server(
            TERMINATE_TOOL,
            "Terminate the interaction when the request is fulfilled or when you cannot proceed further.",
            json!({
                "type": "object",
                "properties": {
                    "status": {
                        "type": "string",
                        "description": "The finish status of the interaction.",
                        "enum": ["success", "failure"]
                    }
                },
                "required": ["status"]
            }),
        )
    }

    async fn execute(&self, args: serde_json::Value) -> Result<serde_json::Value> {
        let status = args["status"].as_str().unwrap_or("success");
        Ok(json!({ "terminated": status }))
    }
}
