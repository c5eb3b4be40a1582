//! Code-exec broker.
//!
//! HTTP surface that lets generated code call tools through a local API
//! instead of issuing tool-call messages: `/api/mcp/execute` for federated
//! MCP tools, `/api/custom/execute` for caller-registered handlers, and
//! `/api/virtual/execute` for tools discovered via generated code. Every
//! execute endpoint answers 200 with a `{success, result, error}`
//! envelope; only authentication failures use an HTTP error status. The
//! broker is stateless with respect to conversation state.

use crate::errors::{ToolErrorKind, WeaveError};
use crate::events::{BrokerPayload, Event, EventBus, EventKind, TraceContext};
use crate::federation::{FederatedView, Federation};
use crate::mcp::McpConnection;
use async_trait::async_trait;
use axum::Json;
use axum::Router;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[derive(Debug, Deserialize)]
pub struct ExecuteRequest {
    #[serde(default)]
    pub server: String,
    pub tool: String,
    #[serde(default)]
    pub args: Value,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ExecuteResponse {
    pub success: bool,
    pub result: String,
    pub error: String,
}

impl ExecuteResponse {
    fn ok(result: String) -> Self {
        Self {
            success: true,
            result,
            error: String::new(),
        }
    }

    fn err(error: impl Into<String>) -> Self {
        Self {
            success: false,
            result: String::new(),
            error: error.into(),
        }
    }
}

/// A caller-registered tool reachable through the custom/virtual execute
/// endpoints.
#[async_trait]
pub trait BrokeredTool: Send + Sync {
    fn name(&self) -> &str;
    async fn execute(&self, args: Value) -> anyhow::Result<String>;
}

type ToolRegistry = Arc<RwLock<HashMap<String, Arc<dyn BrokeredTool>>>>;

#[derive(Clone)]
pub struct BrokerState {
    federation: Arc<Federation>,
    clients: Arc<RwLock<HashMap<String, Arc<dyn McpConnection>>>>,
    tool_to_server: Arc<HashMap<String, String>>,
    custom_tools: ToolRegistry,
    virtual_tools: ToolRegistry,
    api_token: Option<String>,
    bus: Arc<EventBus>,
    trace: TraceContext,
    tool_timeout: Duration,
}

impl BrokerState {
    pub fn new(
        federation: Arc<Federation>,
        mut view: FederatedView,
        bus: Arc<EventBus>,
        trace: TraceContext,
        api_token: Option<String>,
        tool_timeout: Duration,
    ) -> Self {
        Self {
            federation,
            clients: Arc::new(RwLock::new(std::mem::take(&mut view.clients))),
            tool_to_server: Arc::new(view.tool_to_server.clone()),
            custom_tools: Arc::new(RwLock::new(HashMap::new())),
            virtual_tools: Arc::new(RwLock::new(HashMap::new())),
            api_token,
            bus,
            trace,
            tool_timeout,
        }
    }

    pub async fn register_custom(&self, tool: Arc<dyn BrokeredTool>) {
        let mut tools = self.custom_tools.write().await;
        tools.insert(tool.name().to_string(), tool);
    }

    pub async fn register_virtual(&self, tool: Arc<dyn BrokeredTool>) {
        let mut tools = self.virtual_tools.write().await;
        tools.insert(tool.name().to_string(), tool);
    }

    fn authorized(&self, headers: &HeaderMap) -> bool {
        let Some(expected) = &self.api_token else {
            return true;
        };
        headers
            .get("Authorization")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.strip_prefix("Bearer "))
            .is_some_and(|token| token == expected)
    }

    /// Dispatch one MCP tool call exactly as the conversation engine's
    /// per-turn dispatch does: resolve the owning server through the
    /// federated map, call with the per-tool timeout, reconnect once on a
    /// dead transport.
    async fn execute_mcp(&self, request: &ExecuteRequest) -> ExecuteResponse {
        let server = if request.server.is_empty() {
            match self.tool_to_server.get(&request.tool) {
                Some(server) => server.clone(),
                None => return ExecuteResponse::err(format!("tool not found: {}", request.tool)),
            }
        } else {
            request.server.clone()
        };

        let client = {
            let clients = self.clients.read().await;
            clients.get(&server).cloned()
        };
        let Some(client) = client else {
            return ExecuteResponse::err(format!("server not found: {}", server));
        };

        if !request.server.is_empty()
            && self
                .tool_to_server
                .get(&request.tool)
                .is_some_and(|owner| owner != &server)
        {
            debug!(
                tool = %request.tool,
                requested = %server,
                "Execute request targets a non-primary server for this tool"
            );
        }

        match self.call_with_recovery(&server, client, request).await {
            Ok(result) => ExecuteResponse::ok(result),
            Err(e) => {
                let message = match &e {
                    WeaveError::Tool {
                        kind: ToolErrorKind::Timeout,
                        ..
                    } => format!("timeout: {}", e),
                    WeaveError::Transport { .. }
                    | WeaveError::Tool {
                        kind: ToolErrorKind::BrokenPipe,
                        ..
                    } => format!("transport: {}", e),
                    _ => e.to_string(),
                };
                ExecuteResponse::err(message)
            }
        }
    }

    async fn call_with_recovery(
        &self,
        server: &str,
        client: Arc<dyn McpConnection>,
        request: &ExecuteRequest,
    ) -> Result<String, WeaveError> {
        let cancel = CancellationToken::new();
        let first = self.call_once(&client, request, &cancel).await;
        match &first {
            Err(e) if e.is_broken_pipe() => {}
            _ => return first,
        }

        warn!(server = %server, tool = %request.tool, "Broken pipe on broker dispatch; reconnecting");
        let fresh = self
            .federation
            .get_fresh_connection(server, &self.trace)
            .await?;
        {
            let mut clients = self.clients.write().await;
            clients.insert(server.to_string(), fresh.clone());
        }
        self.call_once(&fresh, request, &cancel).await
    }

    async fn call_once(
        &self,
        client: &Arc<dyn McpConnection>,
        request: &ExecuteRequest,
        cancel: &CancellationToken,
    ) -> Result<String, WeaveError> {
        match tokio::time::timeout(
            self.tool_timeout,
            client.call_tool(&request.tool, request.args.clone(), cancel),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(WeaveError::tool(
                &request.tool,
                ToolErrorKind::Timeout,
                format!("timed out after {}s", self.tool_timeout.as_secs()),
            )),
        }
    }

    async fn execute_registered(
        &self,
        registry: &ToolRegistry,
        request: &ExecuteRequest,
    ) -> ExecuteResponse {
        let tool = {
            let tools = registry.read().await;
            tools.get(&request.tool).cloned()
        };
        let Some(tool) = tool else {
            return ExecuteResponse::err(format!("tool not found: {}", request.tool));
        };
        match tool.execute(request.args.clone()).await {
            Ok(result) => ExecuteResponse::ok(result),
            Err(e) => ExecuteResponse::err(e.to_string()),
        }
    }

    fn emit_request(&self, endpoint: &str, request: &ExecuteRequest) {
        self.bus.emit(Event::point(
            EventKind::BrokerRequest(BrokerPayload {
                endpoint: endpoint.to_string(),
                server: request.server.clone(),
                tool: request.tool.clone(),
                error: None,
            }),
            &self.trace,
            1,
            None,
        ));
    }

    fn emit_response(&self, endpoint: &str, request: &ExecuteRequest, response: &ExecuteResponse) {
        let kind = if response.success {
            EventKind::BrokerResponse(BrokerPayload {
                endpoint: endpoint.to_string(),
                server: request.server.clone(),
                tool: request.tool.clone(),
                error: None,
            })
        } else {
            EventKind::BrokerError(BrokerPayload {
                endpoint: endpoint.to_string(),
                server: request.server.clone(),
                tool: request.tool.clone(),
                error: Some(response.error.clone()),
            })
        };
        self.bus.emit(Event::point(kind, &self.trace, 1, None));
    }
}

pub fn build_router(state: BrokerState) -> Router {
    Router::new()
        .route("/api/mcp/execute", post(mcp_execute_handler))
        .route("/api/custom/execute", post(custom_execute_handler))
        .route("/api/virtual/execute", post(virtual_execute_handler))
        .route("/api/health", get(health_handler))
        .with_state(state)
}

async fn health_handler() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "version": crate::VERSION,
    }))
}

async fn mcp_execute_handler(
    State(state): State<BrokerState>,
    headers: HeaderMap,
    Json(request): Json<ExecuteRequest>,
) -> impl IntoResponse {
    if !state.authorized(&headers) {
        return (StatusCode::UNAUTHORIZED, Json(ExecuteResponse::err("unauthorized")));
    }
    state.emit_request("/api/mcp/execute", &request);
    let response = state.execute_mcp(&request).await;
    state.emit_response("/api/mcp/execute", &request, &response);
    (StatusCode::OK, Json(response))
}

async fn custom_execute_handler(
    State(state): State<BrokerState>,
    headers: HeaderMap,
    Json(request): Json<ExecuteRequest>,
) -> impl IntoResponse {
    if !state.authorized(&headers) {
        return (StatusCode::UNAUTHORIZED, Json(ExecuteResponse::err("unauthorized")));
    }
    state.emit_request("/api/custom/execute", &request);
    let response = state.execute_registered(&state.custom_tools, &request).await;
    state.emit_response("/api/custom/execute", &request, &response);
    (StatusCode::OK, Json(response))
}

async fn virtual_execute_handler(
    State(state): State<BrokerState>,
    headers: HeaderMap,
    Json(request): Json<ExecuteRequest>,
) -> impl IntoResponse {
    if !state.authorized(&headers) {
        return (StatusCode::UNAUTHORIZED, Json(ExecuteResponse::err("unauthorized")));
    }
    state.emit_request("/api/virtual/execute", &request);
    let response = state
        .execute_registered(&state.virtual_tools, &request)
        .await;
    state.emit_response("/api/virtual/execute", &request, &response);
    (StatusCode::OK, Json(response))
}

/// Bind and serve until ctrl-c.
pub async fn serve(state: BrokerState, host: &str, port: u16) -> anyhow::Result<()> {
    let router = build_router(state);
    let addr = format!("{}:{}", host, port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!(addr = %addr, "Code-exec broker listening");
    axum::serve(listener, router)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("Shutting down code-exec broker");
        })
        .await?;
    Ok(())
}
