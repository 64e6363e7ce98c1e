//! Agent definitions and tool specs.
//!
//! An agent definition is pure data: an ordered list of system-prompt blocks
//! plus the tool specs the model is allowed to call. Execution lives in the
//! tools crate; this module only describes what exists and where it runs.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// Where a tool executes. Server tools run inside the engine; client tools
/// are shipped to the caller and the run suspends until results come back.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ToolRuntime {
    Server,
    Client,
}

/// Declarative description of one tool, in the shape model gateways expect:
/// name, description, JSON Schema parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolSpec {
    pub name: String,
    pub description: String,
    /// JSON Schema object for the arguments.
    pub parameters: serde_json::Value,
    #[serde(default = "d_runtime")]
    pub runtime: ToolRuntime,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
}

fn d_runtime() -> ToolRuntime {
    ToolRuntime::Server
}

impl ToolSpec {
    pub fn server(name: impl Into<String>, description: impl Into<String>, parameters: serde_json::Value) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            parameters,
            runtime: ToolRuntime::Server,
            category: None,
        }
    }

    pub fn client(name: impl Into<String>, description: impl Into<String>, parameters: serde_json::Value) -> Self {
        Self {
            runtime: ToolRuntime::Client,
            ..Self::server(name, description, parameters)
        }
    }

    /// Property names listed as required by the parameter schema.
    pub fn required_params(&self) -> Vec<&str> {
        self.parameters
            .get("required")
            .and_then(|r| r.as_array())
            .map(|a| a.iter().filter_map(|v| v.as_str()).collect())
            .unwrap_or_default()
    }
}

/// One agent the engine can run a session as.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentDefinition {
    pub id: String,
    /// Ordered blocks joined with blank lines to form the system message.
    pub system_prompt_blocks: Vec<String>,
    pub tools: Vec<ToolSpec>,
    /// Appended after tool observations to prompt the next round.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observation_prompt: Option<String>,
}

impl AgentDefinition {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            system_prompt_blocks: Vec::new(),
            tools: Vec::new(),
            observation_prompt: None,
        }
    }

    pub fn system_prompt(&self) -> String {
        self.system_prompt_blocks.join("\n\n")
    }

    pub fn tool(&self, name: &str) -> Option<&ToolSpec> {
        self.tools.iter().find(|t| t.name == name)
    }

    pub fn server_tools(&self) -> impl Iterator<Item = &ToolSpec> {
        self.tools.iter().filter(|t| t.runtime == ToolRuntime::Server)
    }

    pub fn client_tools(&self) -> impl Iterator<Item = &ToolSpec> {
        self.tools.iter().filter(|t| t.runtime == ToolRuntime::Client)
    }
}

/// Lookup table of agent definitions with a designated default.
#[derive(Debug, Clone)]
pub struct AgentRegistry {
    agents: HashMap<String, AgentDefinition>,
    default_id: String,
}

impl AgentRegistry {
    pub fn new(default_agent: AgentDefinition) -> Self {
        let default_id = default_agent.id.clone();
        let mut agents = HashMap::new();
        agents.insert(default_id.clone(), default_agent);
        Self { agents, default_id }
    }

    pub fn register(&mut self, agent: AgentDefinition) {
        self.agents.insert(agent.id.clone(), agent);
    }

    /// Resolve an agent id, falling back to the default when the id is
    /// unknown or absent.
    pub fn resolve(&self, id: Option<&str>) -> &AgentDefinition {
        id.and_then(|id| self.agents.get(id))
            .unwrap_or_else(|| &self.agents[&self.default_id])
    }

    pub fn default_agent(&self) -> &AgentDefinition {
        &self.agents[&self.default_id]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn weather_tool() -> ToolSpec {
        ToolSpec::server(
            "get_current_weather",
            "Look up current weather for a city",
            json!({
                "type": "object",
                "properties": { "city": { "type": "string" } },
                "required": ["city"]
            }),
        )
    }

    #[test]
    fn registry_falls_back_to_default() {
        let mut def = AgentDefinition::new("assistant");
        def.system_prompt_blocks.push("You are helpful.".into());
        let reg = AgentRegistry::new(def);
        assert_eq!(reg.resolve(None).id, "assistant");
        assert_eq!(reg.resolve(Some("missing")).id, "assistant");
    }

    #[test]
    fn system_prompt_joins_blocks() {
        let mut def = AgentDefinition::new("a");
        def.system_prompt_blocks = vec!["one".into(), "two".into()];
        assert_eq!(def.system_prompt(), "one\n\ntwo");
    }

    #[test]
    fn runtime_partition() {
        let mut def = AgentDefinition::new("a");
        def.tools = vec![
            weather_tool(),
            ToolSpec::client("pick_file", "Ask the user to pick a file", json!({"type": "object"})),
        ];
        assert_eq!(def.server_tools().count(), 1);
        assert_eq!(def.client_tools().count(), 1);
    }

    #[test]
    fn required_params_from_schema() {
        assert_eq!(weather_tool().required_params(), vec!["city"]);
    }

    #[test]
    fn spec_runtime_defaults_to_server_in_json() {
        let spec: ToolSpec = serde_json::from_value(json!({
            "name": "t",
            "description": "d",
            "parameters": { "type": "object" }
        }))
        .unwrap();
        assert_eq!(spec.runtime, ToolRuntime::Server);
    }
}
