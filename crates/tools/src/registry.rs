//! Registry and dispatcher.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;

use relay_domain::agent::ToolSpec;
use relay_domain::message::{ToolCall, ToolResult};
use relay_domain::Result;

/// One server-side tool implementation.
#[async_trait]
pub trait ToolExecutor: Send + Sync {
    fn spec(&self) -> ToolSpec;

    /// `args` is the already-parsed JSON argument object.
    async fn execute(&self, args: serde_json::Value) -> Result<serde_json::Value>;
}

/// Holds server executors plus the fixed set of client tool names. The
/// dispatcher never executes a client tool; it only recognizes the name so
/// the engine can route those calls to the suspend/resume path.
#[derive(Default)]
pub struct ToolRegistry {
    executors: HashMap<String, Arc<dyn ToolExecutor>>,
    client_tools: HashSet<String>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, executor: Arc<dyn ToolExecutor>) {
        self.executors.insert(executor.spec().name, executor);
    }

    /// Declare a client-executed tool name. Client tools have no executor.
    pub fn register_client(&mut self, name: impl Into<String>) {
        self.client_tools.insert(name.into());
    }

    pub fn is_client_tool(&self, name: &str) -> bool {
        self.client_tools.contains(name)
    }

    pub fn has_executor(&self, name: &str) -> bool {
        self.executors.contains_key(name)
    }

    fn registered_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .executors
            .keys()
            .chain(self.client_tools.iter())
            .cloned()
            .collect();
        names.sort();
        names
    }

    /// Split one round's calls into (server, client) in original call order.
    pub fn partition<'a>(&self, calls: &'a [ToolCall]) -> (Vec<&'a ToolCall>, Vec<&'a ToolCall>) {
        calls.iter().partition(|c| !self.is_client_tool(&c.name))
    }

    /// Execute one server-side call. Never returns Err for tool-level
    /// problems; those become `success:false` results the model can react
    /// to. Infrastructure failures inside executors are also folded into
    /// the result since the call boundary is the error domain here.
    pub async fn dispatch(&self, call: &ToolCall) -> ToolResult {
        if self.is_client_tool(&call.name) {
            return ToolResult::err(
                call,
                format!("tool '{}' requires client context and cannot run server-side", call.name),
            );
        }

        let Some(executor) = self.executors.get(&call.name) else {
            return ToolResult::err(
                call,
                format!(
                    "unknown tool '{}'; registered tools: {}",
                    call.name,
                    self.registered_names().join(", ")
                ),
            );
        };

        let args: serde_json::Value = if call.arguments.trim().is_empty() {
            serde_json::Value::Object(Default::default())
        } else {
            match serde_json::from_str(&call.arguments) {
                Ok(v) => v,
                Err(e) => {
                    return ToolResult::err(call, format!("invalid JSON arguments: {e}"));
                }
            }
        };

        let spec = executor.spec();
        for required in spec.required_params() {
            if args.get(required).is_none() {
                return ToolResult::err(
                    call,
                    format!("missing required argument '{required}' for tool '{}'", call.name),
                );
            }
        }

        tracing::debug!(tool = %call.name, call_id = %call.id, "executing tool");
        match executor.execute(args).await {
            Ok(data) => ToolResult::ok(call, data),
            Err(e) => {
                tracing::warn!(tool = %call.name, call_id = %call.id, error = %e, "tool failed");
                ToolResult::err(call, e.to_string())
            }
        }
    }

    /// Execute several calls strictly in order. Later tools may depend on
    /// earlier side effects, so parallel dispatch is not an option.
    pub async fn dispatch_all(&self, calls: &[&ToolCall]) -> Vec<ToolResult> {
        let mut results = Vec::with_capacity(calls.len());
        for call in calls {
            results.push(self.dispatch(call).await);
        }
        results
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use serde_json::json;

    struct Echo;

    #[async_trait]
    impl ToolExecutor for Echo {
        fn spec(&self) -> ToolSpec {
            ToolSpec::server(
                "echo",
                "Echo the input back",
                json!({
                    "type": "object",
                    "properties": { "text": { "type": "string" } },
                    "required": ["text"]
                }),
            )
        }

        async fn execute(&self, args: serde_json::Value) -> Result<serde_json::Value> {
            Ok(json!({ "echoed": args["text"] }))
        }
    }

    struct Recorder {
        log: Arc<Mutex<Vec<String>>>,
        name: &'static str,
    }

    #[async_trait]
    impl ToolExecutor for Recorder {
        fn spec(&self) -> ToolSpec {
            ToolSpec::server(self.name, "Record invocation order", json!({"type": "object"}))
        }

        async fn execute(&self, _args: serde_json::Value) -> Result<serde_json::Value> {
            self.log.lock().push(self.name.to_string());
            Ok(json!(null))
        }
    }

    fn call(id: &str, name: &str, args: &str) -> ToolCall {
        ToolCall {
            id: id.into(),
            name: name.into(),
            arguments: args.into(),
        }
    }

    fn registry() -> ToolRegistry {
        let mut r = ToolRegistry::new();
        r.register(Arc::new(Echo));
        r.register_client("pick_file");
        r
    }

    #[tokio::test]
    async fn dispatch_happy_path() {
        let r = registry();
        let res = r.dispatch(&call("c1", "echo", r#"{"text":"hi"}"#)).await;
        assert!(res.success);
        assert_eq!(res.data.unwrap()["echoed"], "hi");
        assert_eq!(res.tool_call_id, "c1");
    }

    #[tokio::test]
    async fn malformed_json_becomes_failed_result() {
        let r = registry();
        let res = r.dispatch(&call("c1", "echo", "{not json")).await;
        assert!(!res.success);
        assert!(res.error.unwrap().contains("invalid JSON"));
    }

    #[tokio::test]
    async fn unknown_tool_lists_registered_names() {
        let r = registry();
        let res = r.dispatch(&call("c1", "nope", "{}")).await;
        assert!(!res.success);
        let err = res.error.unwrap();
        assert!(err.contains("echo"));
        assert!(err.contains("pick_file"));
    }

    #[tokio::test]
    async fn client_tool_rejected_locally() {
        let r = registry();
        let res = r.dispatch(&call("c1", "pick_file", "{}")).await;
        assert!(!res.success);
        assert!(res.error.unwrap().contains("requires client context"));
    }

    #[tokio::test]
    async fn missing_required_argument_fails() {
        let r = registry();
        let res = r.dispatch(&call("c1", "echo", r#"{"other":1}"#)).await;
        assert!(!res.success);
        assert!(res.error.unwrap().contains("missing required argument 'text'"));
    }

    #[tokio::test]
    async fn dispatch_all_runs_in_call_order() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut r = ToolRegistry::new();
        r.register(Arc::new(Recorder { log: log.clone(), name: "first" }));
        r.register(Arc::new(Recorder { log: log.clone(), name: "second" }));

        let a = call("c1", "first", "{}");
        let b = call("c2", "second", "{}");
        let results = r.dispatch_all(&[&a, &b]).await;
        assert_eq!(results.len(), 2);
        assert_eq!(*log.lock(), vec!["first".to_string(), "second".to_string()]);
    }

    #[tokio::test]
    async fn partition_preserves_call_order() {
        let r = registry();
        let calls = vec![
            call("c1", "echo", "{}"),
            call("c2", "pick_file", "{}"),
            call("c3", "echo", "{}"),
        ];
        let (server, client) = r.partition(&calls);
        assert_eq!(server.iter().map(|c| c.id.as_str()).collect::<Vec<_>>(), ["c1", "c3"]);
        assert_eq!(client.iter().map(|c| c.id.as_str()).collect::<Vec<_>>(), ["c2"]);
    }

    #[tokio::test]
    async fn empty_arguments_parse_as_empty_object() {
        let mut r = ToolRegistry::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        r.register(Arc::new(Recorder { log, name: "first" }));
        let res = r.dispatch(&call("c1", "first", "")).await;
        assert!(res.success);
    }
}
