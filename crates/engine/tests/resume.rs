//! Crash-and-resume: a run that dies while suspended on a client tool is
//! picked up by a fresh engine instance sharing the same JSONL step log.
//! Completed steps replay as no-ops and the run continues from the wait.

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;

use relay_domain::agent::{AgentDefinition, AgentRegistry, ToolSpec};
use relay_domain::config::EngineConfig;
use relay_domain::message::{Message, Session, SessionStatus};
use relay_engine::{Engine, MemoryLedger, RunRequest, RunStatus};
use relay_provider::mock::{Script, ScriptedGateway};
use relay_steps::JsonlStepLog;
use relay_store::{MemoryStore, MessageStore};
use relay_tools::ToolRegistry;

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "relay_engine=debug,relay_steps=debug".into()),
        )
        .with_test_writer()
        .try_init();
}

fn canvas_agent() -> AgentDefinition {
    let mut a = AgentDefinition::new("assistant");
    a.system_prompt_blocks = vec!["You are a helpful assistant.".into()];
    a.tools = vec![ToolSpec::client(
        "get_canvas_state",
        "Read the current canvas state from the client",
        json!({"type": "object"}),
    )];
    a
}

fn engine_with(
    store: Arc<MemoryStore>,
    gateway: Arc<ScriptedGateway>,
    log_path: &std::path::Path,
) -> Arc<Engine> {
    let mut tools = ToolRegistry::new();
    tools.register_client("get_canvas_state");
    let engine = Engine::new(
        store,
        gateway,
        AgentRegistry::new(canvas_agent()),
        Arc::new(tools),
        Arc::new(MemoryLedger::new()),
        EngineConfig::default(),
    )
    .with_step_log(Arc::new(JsonlStepLog::open(log_path).unwrap()));
    Arc::new(engine)
}

#[tokio::test]
async fn suspended_run_resumes_on_a_fresh_engine() {
    init_tracing();

    let dir = tempfile::tempdir().unwrap();
    let log_path = dir.path().join("steps.jsonl");

    let store = Arc::new(MemoryStore::new());
    store.insert_session(Session::new("s1", "org1"));
    let user = Message::user("s1", "how wide is my canvas?");
    let user_id = user.id.clone();
    store.insert_message(user).await.unwrap();
    let req = RunRequest {
        organization_id: "org1".into(),
        session_id: "s1".into(),
        user_message_id: user_id,
        model_id: None,
        agent_id: None,
    };

    // First engine: round 0 requests the client tool, then the process dies
    // while suspended.
    let gateway1 = Arc::new(ScriptedGateway::new([Script::calls_tool(
        "c1",
        "get_canvas_state",
        "{}",
    )]));
    let engine1 = engine_with(store.clone(), gateway1.clone(), &log_path);

    let e = engine1.clone();
    let r = req.clone();
    let doomed = tokio::spawn(async move { e.run(r).await });

    // Let it reach the suspension point, then kill it.
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            let messages = store.messages("s1").await.unwrap();
            if messages.iter().any(|m| m.flag("awaiting_client_tools")) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("first run suspended");
    doomed.abort();
    let _ = doomed.await;

    // The crashed run never released the session.
    assert_eq!(
        store.session("s1").await.unwrap().status,
        SessionStatus::Processing
    );

    // Second engine, same store and step log. The client result arrives
    // before the replayed run reaches its wait; the bus buffers it.
    let gateway2 = Arc::new(ScriptedGateway::new([Script::answer(
        "The canvas is 800 pixels wide.",
    )]));
    let engine2 = engine_with(store.clone(), gateway2.clone(), &log_path);

    let waiting = store
        .messages("s1")
        .await
        .unwrap()
        .into_iter()
        .find(|m| m.flag("awaiting_client_tools"))
        .unwrap();
    let event = Engine::resume_event_name("s1", &waiting.id);
    engine2.notify(&event, json!({ "c1": { "width": 800 } }));

    let outcome = engine2.run(req).await.unwrap();
    assert_eq!(outcome.status, RunStatus::Completed);
    assert_eq!(outcome.rounds, 2);

    // Round 0 replayed from the log: the second gateway saw only round 1.
    assert_eq!(gateway1.calls_made(), 1);
    assert_eq!(gateway2.calls_made(), 1);

    let round1 = store.message(&waiting.id).await.unwrap();
    assert!(round1.tool_results_paired());
    assert_eq!(
        round1.tool_results.unwrap()[0].data.as_ref().unwrap()["width"],
        800
    );
    assert_eq!(store.session("s1").await.unwrap().status, SessionStatus::Idle);
}
