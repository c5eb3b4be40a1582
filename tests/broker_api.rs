mod common;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use common::{MockConnector, MockServer, ToolScript};
use mcpweave::broker::{BrokerState, BrokeredTool, ExecuteResponse, build_router};
use mcpweave::cache::CapabilityCache;
use mcpweave::config::ServerConfig;
use mcpweave::events::{EventBus, TraceContext};
use mcpweave::federation::Federation;
use serde_json::{Value, json};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tower::ServiceExt;

struct EchoTool;

#[async_trait::async_trait]
impl BrokeredTool for EchoTool {
    fn name(&self) -> &str {
        "echo"
    }

    async fn execute(&self, args: Value) -> anyhow::Result<String> {
        Ok(format!("echo: {}", args))
    }
}

struct FailingTool;

#[async_trait::async_trait]
impl BrokeredTool for FailingTool {
    fn name(&self) -> &str {
        "fail"
    }

    async fn execute(&self, _args: Value) -> anyhow::Result<String> {
        anyhow::bail!("handler blew up")
    }
}

async fn build_state(
    servers: Vec<Arc<MockServer>>,
    requested: &[&str],
    api_token: Option<String>,
) -> (BrokerState, TempDir) {
    let tmp = TempDir::new().unwrap();
    let configs: HashMap<String, ServerConfig> = servers
        .iter()
        .map(|s| {
            (
                s.name.clone(),
                ServerConfig {
                    command: Some(format!("{}-bin", s.name)),
                    ..Default::default()
                },
            )
        })
        .collect();
    let bus = Arc::new(EventBus::new());
    let federation = Arc::new(Federation::new(
        configs,
        MockConnector::new(servers),
        Some(Arc::new(CapabilityCache::new(tmp.path().to_path_buf(), 60))),
        bus.clone(),
    ));
    let trace = TraceContext::new();
    let requested: Vec<String> = requested.iter().map(|s| (*s).to_string()).collect();
    let view = federation.federate(&requested, &trace).await.unwrap();
    let state = BrokerState::new(
        federation,
        view,
        bus,
        trace,
        api_token,
        Duration::from_secs(5),
    );
    (state, tmp)
}

async fn post_json(
    router: axum::Router,
    uri: &str,
    body: Value,
    bearer: Option<&str>,
) -> (StatusCode, ExecuteResponse) {
    let mut request = Request::builder()
        .method("POST")
        .uri(uri)
        .header("content-type", "application/json");
    if let Some(token) = bearer {
        request = request.header("Authorization", format!("Bearer {}", token));
    }
    let request = request.body(Body::from(body.to_string())).unwrap();

    let response = router.oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let parsed: ExecuteResponse = serde_json::from_slice(&bytes).unwrap();
    (status, parsed)
}

#[tokio::test]
async fn mcp_execute_dispatches_through_federated_map() {
    let alpha = MockServer::with_tools("alpha", &["search"]);
    alpha.script_tool("search", vec![ToolScript::Ok("search hit".into())]);

    let (state, _tmp) = build_state(vec![alpha.clone()], &["alpha"], None).await;
    let router = build_router(state);

    let (status, response) = post_json(
        router,
        "/api/mcp/execute",
        json!({"server": "alpha", "tool": "search", "args": {"query": "x"}}),
        None,
    )
    .await;

    assert_eq!(status, StatusCode::OK);
    assert!(response.success);
    assert_eq!(response.result, "search hit");
    assert!(response.error.is_empty());
    assert_eq!(alpha.calls().len(), 1);
}

#[tokio::test]
async fn mcp_execute_resolves_server_from_tool_map() {
    let alpha = MockServer::with_tools("alpha", &["lookup"]);
    alpha.script_tool("lookup", vec![ToolScript::Ok("resolved".into())]);

    let (state, _tmp) = build_state(vec![alpha], &["alpha"], None).await;
    let router = build_router(state);

    // No explicit server: the broker consults the tool→server map.
    let (status, response) = post_json(
        router,
        "/api/mcp/execute",
        json!({"tool": "lookup", "args": {}}),
        None,
    )
    .await;

    assert_eq!(status, StatusCode::OK);
    assert!(response.success);
    assert_eq!(response.result, "resolved");
}

#[tokio::test]
async fn unknown_server_and_tool_errors() {
    let alpha = MockServer::with_tools("alpha", &["search"]);
    let (state, _tmp) = build_state(vec![alpha], &["alpha"], None).await;
    let router = build_router(state);

    let (status, response) = post_json(
        router.clone(),
        "/api/mcp/execute",
        json!({"server": "ghost", "tool": "search", "args": {}}),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK, "execute errors still answer 200");
    assert!(!response.success);
    assert!(response.error.contains("server not found"));

    let (status, response) = post_json(
        router,
        "/api/mcp/execute",
        json!({"tool": "nonexistent", "args": {}}),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert!(!response.success);
    assert!(response.error.contains("tool not found"));
}

#[tokio::test]
async fn tool_failure_becomes_error_envelope() {
    let alpha = MockServer::with_tools("alpha", &["search"]);
    alpha.script_tool("search", vec![ToolScript::Error("index offline".into())]);

    let (state, _tmp) = build_state(vec![alpha], &["alpha"], None).await;
    let router = build_router(state);

    let (status, response) = post_json(
        router,
        "/api/mcp/execute",
        json!({"server": "alpha", "tool": "search", "args": {}}),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert!(!response.success);
    assert!(response.error.contains("index offline"));
}

#[tokio::test]
async fn custom_tools_are_caller_registered() {
    let (state, _tmp) = build_state(vec![], &["none"], None).await;
    state.register_custom(Arc::new(EchoTool)).await;
    state.register_custom(Arc::new(FailingTool)).await;
    let router = build_router(state);

    let (status, response) = post_json(
        router.clone(),
        "/api/custom/execute",
        json!({"tool": "echo", "args": {"k": 1}}),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert!(response.success);
    assert!(response.result.contains("echo:"));

    let (_, response) = post_json(
        router.clone(),
        "/api/custom/execute",
        json!({"tool": "fail", "args": {}}),
        None,
    )
    .await;
    assert!(!response.success);
    assert!(response.error.contains("handler blew up"));

    let (_, response) = post_json(
        router,
        "/api/custom/execute",
        json!({"tool": "missing", "args": {}}),
        None,
    )
    .await;
    assert!(!response.success);
    assert!(response.error.contains("tool not found"));
}

#[tokio::test]
async fn virtual_registry_is_separate_from_custom() {
    let (state, _tmp) = build_state(vec![], &["none"], None).await;
    state.register_virtual(Arc::new(EchoTool)).await;
    let router = build_router(state);

    let (_, response) = post_json(
        router.clone(),
        "/api/virtual/execute",
        json!({"tool": "echo", "args": {}}),
        None,
    )
    .await;
    assert!(response.success);

    // The same name is not visible through the custom endpoint.
    let (_, response) = post_json(
        router,
        "/api/custom/execute",
        json!({"tool": "echo", "args": {}}),
        None,
    )
    .await;
    assert!(!response.success);
}

#[tokio::test]
async fn bearer_token_enforced_when_configured() {
    let alpha = MockServer::with_tools("alpha", &["search"]);
    alpha.script_tool("search", vec![ToolScript::Ok("authorized hit".into())]);

    let (state, _tmp) = build_state(vec![alpha], &["alpha"], Some("sekrit".into())).await;
    let router = build_router(state);

    let (status, _) = post_json(
        router.clone(),
        "/api/mcp/execute",
        json!({"server": "alpha", "tool": "search", "args": {}}),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let (status, _) = post_json(
        router.clone(),
        "/api/mcp/execute",
        json!({"server": "alpha", "tool": "search", "args": {}}),
        Some("wrong"),
    )
    .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let (status, response) = post_json(
        router,
        "/api/mcp/execute",
        json!({"server": "alpha", "tool": "search", "args": {}}),
        Some("sekrit"),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert!(response.success);
}
