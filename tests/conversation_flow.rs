mod common;

use common::{
    EventCollector, MockConnector, MockProvider, MockServer, ToolScript, text_response, tool_call,
    tool_call_response,
};
use mcpweave::agent::Agent;
use mcpweave::agent::message::{Part, Role};
use mcpweave::cache::CapabilityCache;
use mcpweave::config::{AgentSettings, ContextSettings, FallbackSettings, ServerConfig};
use mcpweave::errors::WeaveError;
use mcpweave::events::{EventBus, TraceContext};
use mcpweave::federation::Federation;
use mcpweave::llm::invoker::{Invoker, ModelTarget};
use mcpweave::llm::{LlmResponse, ProviderError};
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

fn stdio_config(command: &str) -> ServerConfig {
    ServerConfig {
        command: Some(command.to_string()),
        ..Default::default()
    }
}

fn test_settings() -> AgentSettings {
    AgentSettings {
        max_turns: 5,
        tool_timeout_secs: 5,
        llm_timeout_secs: 5,
        conversation_deadline_secs: 0,
        max_tokens: 1024,
        temperature: 0.0,
        streaming: false,
        context: ContextSettings {
            editing_enabled: false,
            summarization_enabled: false,
            ..Default::default()
        },
    }
}

fn fast_fallback() -> FallbackSettings {
    FallbackSettings {
        max_retries: 0,
        initial_backoff_ms: 1,
        max_backoff_ms: 2,
        ..Default::default()
    }
}

struct Harness {
    agent: Agent,
    collector: Arc<EventCollector>,
    _tmp: TempDir,
}

async fn build_agent(
    servers: Vec<Arc<MockServer>>,
    requested: &[&str],
    provider: Arc<MockProvider>,
    settings: AgentSettings,
) -> Harness {
    let tmp = TempDir::new().unwrap();
    let configs: HashMap<String, ServerConfig> = servers
        .iter()
        .map(|s| (s.name.clone(), stdio_config(&format!("{}-bin", s.name))))
        .collect();
    let connector = MockConnector::new(servers);
    let cache = Arc::new(CapabilityCache::new(tmp.path().to_path_buf(), 60));
    let bus = Arc::new(EventBus::new());
    let collector = EventCollector::new();
    bus.subscribe(collector.clone());

    let federation = Arc::new(Federation::new(
        configs,
        connector,
        Some(cache),
        bus.clone(),
    ));
    let invoker = Arc::new(Invoker::new(
        ModelTarget::new(provider, "mock-model"),
        &fast_fallback(),
    ));
    let requested: Vec<String> = requested.iter().map(|s| (*s).to_string()).collect();
    let agent = Agent::new(
        federation,
        &requested,
        invoker,
        bus.clone(),
        settings,
        TraceContext::new(),
    )
    .await
    .unwrap();

    Harness {
        agent,
        collector,
        _tmp: tmp,
    }
}

#[tokio::test]
async fn pure_llm_run_with_none_sentinel() {
    let provider = MockProvider::with_responses(vec![text_response("42 is the answer")]);
    let mut harness = build_agent(vec![], &["none"], provider.clone(), test_settings()).await;

    let cancel = CancellationToken::new();
    let answer = harness.agent.ask("what is the answer?", &cancel).await.unwrap();

    assert_eq!(answer, "42 is the answer");
    // A single LLM call, with no tool declarations and no dispatch.
    assert_eq!(provider.call_count(), 1);
    assert_eq!(provider.calls.lock().unwrap()[0].tool_count, 0);
    assert_eq!(harness.collector.count_of("tool_call_start"), 0);
    assert_eq!(harness.collector.count_of("conversation_end"), 1);
}

#[tokio::test]
async fn tool_responses_reassembled_in_call_order() {
    let alpha = MockServer::with_tools("alpha", &["slow", "fast", "medium"]);
    // Completion order differs from call order; reassembly must not.
    alpha.script_tool("slow", vec![ToolScript::Ok("slow result".into())]);
    alpha.script_tool("fast", vec![ToolScript::Ok("fast result".into())]);
    alpha.script_tool("medium", vec![ToolScript::Ok("medium result".into())]);

    let provider = MockProvider::with_responses(vec![
        tool_call_response(vec![
            tool_call("t1", "slow", json!({"query": "a"})),
            tool_call("t2", "fast", json!({"query": "b"})),
            tool_call("t3", "medium", json!({"query": "c"})),
        ]),
        text_response("combined"),
    ]);

    let mut harness =
        build_agent(vec![alpha], &["alpha"], provider.clone(), test_settings()).await;
    let cancel = CancellationToken::new();
    let answer = harness.agent.ask("run all three", &cancel).await.unwrap();
    assert_eq!(answer, "combined");

    // History: user, assistant with 3 calls, tool message with 3 responses.
    let history = harness.agent.history();
    let tool_message = history
        .iter()
        .find(|m| m.role == Role::Tool)
        .expect("tool message present");
    let ids: Vec<&str> = tool_message.tool_response_ids();
    assert_eq!(ids, vec!["t1", "t2", "t3"], "i-th response matches i-th call");

    let contents: Vec<String> = tool_message
        .parts
        .iter()
        .filter_map(|p| match p {
            Part::ToolResponse { content, .. } => Some(content.clone()),
            _ => None,
        })
        .collect();
    assert_eq!(contents, vec!["slow result", "fast result", "medium result"]);

    // The second LLM call saw the results in the same order.
    let calls = provider.calls.lock().unwrap();
    let tool_messages: Vec<&str> = calls[1]
        .messages
        .iter()
        .filter(|m| m.role == "tool")
        .map(|m| m.content.as_str())
        .collect();
    assert_eq!(tool_messages, vec!["slow result", "fast result", "medium result"]);
}

#[tokio::test]
async fn duplicate_tool_dispatches_to_primary_owner() {
    let a = MockServer::with_tools("a", &["search"]);
    let b = MockServer::with_tools("b", &["search"]);
    a.script_tool("search", vec![ToolScript::Ok("from a".into())]);

    let provider = MockProvider::with_responses(vec![
        tool_call_response(vec![tool_call("t1", "search", json!({"query": "x"}))]),
        text_response("done"),
    ]);

    let mut harness = build_agent(
        vec![a.clone(), b.clone()],
        &["a", "b"],
        provider,
        test_settings(),
    )
    .await;
    let cancel = CancellationToken::new();
    harness.agent.ask("search please", &cancel).await.unwrap();

    assert_eq!(a.calls().len(), 1, "primary owner got the call");
    assert!(b.calls().is_empty(), "duplicate owner never dispatched");
}

#[tokio::test]
async fn broken_pipe_triggers_reconnect_and_retry() {
    let alpha = MockServer::with_tools("alpha", &["read"]);
    alpha.script_tool(
        "read",
        vec![
            ToolScript::BrokenPipe,
            ToolScript::Ok("recovered content".into()),
        ],
    );

    let provider = MockProvider::with_responses(vec![
        tool_call_response(vec![tool_call("t1", "read", json!({"query": "file"}))]),
        text_response("all good"),
    ]);

    let mut harness = build_agent(
        vec![alpha.clone()],
        &["alpha"],
        provider,
        test_settings(),
    )
    .await;

    let cancel = CancellationToken::new();
    let answer = harness.agent.ask("read the file", &cancel).await.unwrap();
    assert_eq!(answer, "all good");

    // Initial connect plus one fresh connection.
    assert_eq!(
        alpha.connect_count.load(std::sync::atomic::Ordering::SeqCst),
        2
    );

    // Exactly one start, one retry, one reconnect, one end; the turn
    // completed normally with no user-visible failure.
    assert_eq!(harness.collector.count_of("tool_call_start"), 1);
    assert_eq!(harness.collector.count_of("tool_retry"), 1);
    assert_eq!(harness.collector.count_of("mcp_reconnect"), 1);
    assert_eq!(harness.collector.count_of("tool_call_end"), 1);
    assert_eq!(harness.collector.count_of("tool_call_error"), 0);

    let history = harness.agent.history();
    let tool_message = history.iter().find(|m| m.role == Role::Tool).unwrap();
    let Part::ToolResponse { content, is_error, .. } = &tool_message.parts[0] else {
        panic!("expected tool response");
    };
    assert_eq!(content, "recovered content");
    assert!(!*is_error);
}

#[tokio::test]
async fn tool_error_surfaced_to_model_not_fatal() {
    let alpha = MockServer::with_tools("alpha", &["flaky"]);
    alpha.script_tool("flaky", vec![ToolScript::Error("backend down".into())]);

    let provider = MockProvider::with_responses(vec![
        tool_call_response(vec![tool_call("t1", "flaky", json!({}))]),
        text_response("I could not use the tool, but here is what I know."),
    ]);

    let mut harness = build_agent(vec![alpha], &["alpha"], provider, test_settings()).await;
    let cancel = CancellationToken::new();
    let answer = harness.agent.ask("try the tool", &cancel).await.unwrap();
    assert!(answer.contains("here is what I know"));

    // The error became a tool response, so the model got to recover.
    let history = harness.agent.history();
    let tool_message = history.iter().find(|m| m.role == Role::Tool).unwrap();
    let Part::ToolResponse { is_error, content, .. } = &tool_message.parts[0] else {
        panic!("expected tool response");
    };
    assert!(*is_error);
    assert!(content.contains("backend down"));
    assert_eq!(harness.collector.count_of("tool_call_error"), 1);
    assert_eq!(harness.collector.count_of("conversation_error"), 0);
}

#[tokio::test]
async fn cancellation_before_llm_call() {
    let provider = MockProvider::with_responses(vec![text_response("never used")]);
    let mut harness = build_agent(vec![], &["none"], provider.clone(), test_settings()).await;

    let cancel = CancellationToken::new();
    cancel.cancel();
    let err = harness.agent.ask("anything", &cancel).await.unwrap_err();

    assert!(matches!(err, WeaveError::Cancelled));
    // The next observable transition is ContextCancelled; no LLM call and
    // no tool call was initiated.
    assert_eq!(harness.collector.count_of("context_cancelled"), 1);
    assert_eq!(provider.call_count(), 0);
    assert_eq!(harness.collector.count_of("llm_call_start"), 0);
    assert_eq!(harness.collector.count_of("tool_call_start"), 0);
}

#[tokio::test]
async fn max_turns_forces_final_answer() {
    let alpha = MockServer::with_tools("alpha", &["loop"]);

    let mut settings = test_settings();
    settings.max_turns = 2;

    // The model keeps asking for tools; after two turns the engine forces
    // a final answer with the tool list withheld.
    let provider = MockProvider::with_responses(vec![
        tool_call_response(vec![tool_call("t1", "loop", json!({}))]),
        tool_call_response(vec![tool_call("t2", "loop", json!({}))]),
        text_response("forced final answer"),
    ]);

    let mut harness = build_agent(vec![alpha], &["alpha"], provider.clone(), settings).await;
    let cancel = CancellationToken::new();
    let answer = harness.agent.ask("loop forever", &cancel).await.unwrap();
    assert_eq!(answer, "forced final answer");

    let calls = provider.calls.lock().unwrap();
    assert_eq!(calls.len(), 3);
    assert!(calls[0].tool_count > 0);
    assert!(calls[1].tool_count > 0);
    // The forced turn withholds tools and appends the instruction.
    assert_eq!(calls[2].tool_count, 0);
    let last_content = &calls[2].messages.last().unwrap().content;
    assert!(last_content.contains("final answer now"));
}

#[tokio::test]
async fn context_editing_compacts_old_tool_responses() {
    let alpha = MockServer::with_tools("alpha", &["dump"]);
    alpha.script_tool("dump", vec![ToolScript::Ok("x".repeat(4000))]);

    let mut settings = test_settings();
    settings.context = ContextSettings {
        editing_enabled: true,
        edit_token_threshold: 100,
        edit_turn_threshold: 1,
        summarization_enabled: false,
        ..Default::default()
    };

    let provider = MockProvider::with_responses(vec![
        tool_call_response(vec![tool_call("t1", "dump", json!({}))]),
        text_response("got the dump"),
        text_response("second answer"),
    ]);

    let mut harness = build_agent(vec![alpha], &["alpha"], provider.clone(), settings).await;
    let cancel = CancellationToken::new();
    harness.agent.ask("dump it", &cancel).await.unwrap();
    // Second question: editing runs at turn start and compacts the old
    // response before the LLM sees the history.
    harness.agent.ask("follow up", &cancel).await.unwrap();

    assert!(harness.collector.count_of("context_editing_completed") > 0);
    let history = harness.agent.history();
    let tool_message = history.iter().find(|m| m.role == Role::Tool).unwrap();
    let Part::ToolResponse { content, was_compacted, .. } = &tool_message.parts[0] else {
        panic!("expected tool response");
    };
    assert!(*was_compacted);
    assert!(content.contains("tokens elided"));

    // The provider's last call saw the placeholder, not 4000 chars.
    let calls = provider.calls.lock().unwrap();
    let last_tool_content: Vec<&str> = calls
        .last()
        .unwrap()
        .messages
        .iter()
        .filter(|m| m.role == "tool")
        .map(|m| m.content.as_str())
        .collect();
    assert!(last_tool_content[0].contains("tokens elided"));
}

#[tokio::test]
async fn end_events_pair_with_start_events() {
    let alpha = MockServer::with_tools("alpha", &["probe"]);
    let provider = MockProvider::with_responses(vec![
        tool_call_response(vec![tool_call("t1", "probe", json!({}))]),
        text_response("done"),
    ]);

    let mut harness = build_agent(vec![alpha], &["alpha"], provider, test_settings()).await;
    let cancel = CancellationToken::new();
    harness.agent.ask("probe", &cancel).await.unwrap();

    // Every end event carries the correlation id of an earlier start event
    // of the matching type within the same trace.
    let events = harness.collector.snapshot();
    let pairs = [
        ("conversation_start", "conversation_end"),
        ("llm_call_start", "llm_call_end"),
        ("tool_call_start", "tool_call_end"),
        ("mcp_connect_start", "mcp_connect_end"),
    ];
    for (start_type, end_type) in pairs {
        for (idx, event) in events.iter().enumerate() {
            if event.event_type() != end_type {
                continue;
            }
            let matched = events[..idx].iter().any(|earlier| {
                earlier.event_type() == start_type
                    && earlier.correlation_id() == event.correlation_id()
                    && earlier.trace_id() == event.trace_id()
            });
            assert!(matched, "{} without earlier {}", end_type, start_type);
        }
    }
}

#[tokio::test]
async fn llm_error_other_is_terminal() {
    let provider = MockProvider::with_responses(vec![Err(ProviderError::Api {
        status: 401,
        message: "bad key".into(),
    })]);
    let mut harness = build_agent(vec![], &["none"], provider, test_settings()).await;

    let cancel = CancellationToken::new();
    let err = harness.agent.ask("anything", &cancel).await.unwrap_err();
    assert!(matches!(err, WeaveError::Llm(_)));
    assert_eq!(harness.collector.count_of("conversation_error"), 1);
    assert_eq!(harness.collector.count_of("all_fallbacks_failed"), 1);
}

#[tokio::test]
async fn empty_then_content_response_recovers() {
    let mut fallback = fast_fallback();
    fallback.max_retries = 1;

    // Empty content is retried on the same model.
    let provider = MockProvider::with_responses(vec![
        Ok(LlmResponse::default()),
        text_response("recovered"),
    ]);

    let tmp = TempDir::new().unwrap();
    let bus = Arc::new(EventBus::new());
    let federation = Arc::new(Federation::new(
        HashMap::new(),
        MockConnector::new(vec![]),
        Some(Arc::new(CapabilityCache::new(tmp.path().to_path_buf(), 60))),
        bus.clone(),
    ));
    let invoker = Arc::new(Invoker::new(
        ModelTarget::new(provider.clone(), "mock-model"),
        &fallback,
    ));
    let mut agent = Agent::new(
        federation,
        &["none".to_string()],
        invoker,
        bus,
        test_settings(),
        TraceContext::new(),
    )
    .await
    .unwrap();

    let cancel = CancellationToken::new();
    let answer = agent.ask("hello", &cancel).await.unwrap();
    assert_eq!(answer, "recovered");
    assert_eq!(provider.call_count(), 2);
}
