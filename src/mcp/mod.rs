//! Transport clients for MCP servers.
//!
//! One [`McpConnection`] per server, with a uniform operation set across
//! stdio, SSE and streamable-HTTP wire formats. Connection construction
//! goes through the [`McpConnector`] trait so the federation layer and the
//! test suite share a single seam.

pub mod capability;

use crate::config::{ServerConfig, TransportKind};
use crate::errors::{ToolErrorKind, WeaveError, WeaveResult};
use async_trait::async_trait;
use capability::{PromptSpec, ResourceSpec, ToolSpec};
use rmcp::model::{CallToolRequestParams, ClientInfo, GetPromptRequestParams};
use rmcp::service::{Peer, RoleClient, RunningService};
use rmcp::transport::child_process::TokioChildProcess;
use rmcp::transport::streamable_http_client::{
    StreamableHttpClientTransport, StreamableHttpClientTransportConfig,
};
use serde_json::Value;
use std::process::Stdio;
use std::sync::Arc;
use tokio::process::Command;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Uniform per-server operation set, independent of wire format.
#[async_trait]
pub trait McpConnection: Send + Sync {
    fn server_name(&self) -> &str;
    fn transport_kind(&self) -> TransportKind;

    async fn list_tools(&self) -> WeaveResult<Vec<ToolSpec>>;
    async fn list_prompts(&self) -> WeaveResult<Vec<PromptSpec>>;
    /// Fetch the full rendered content of one prompt.
    async fn get_prompt(&self, name: &str) -> WeaveResult<String>;
    async fn list_resources(&self) -> WeaveResult<Vec<ResourceSpec>>;
    /// Invoke a tool; returns the flattened text payload. Errors carry a
    /// [`ToolErrorKind`] so the conversation engine can pick a recovery.
    async fn call_tool(
        &self,
        name: &str,
        args: Value,
        cancel: &CancellationToken,
    ) -> WeaveResult<String>;
    /// Shut down the connection. Idempotent.
    async fn close(&self) -> WeaveResult<()>;
}

/// Creates connections from server descriptors.
#[async_trait]
pub trait McpConnector: Send + Sync {
    async fn connect(
        &self,
        name: &str,
        config: &ServerConfig,
    ) -> WeaveResult<Arc<dyn McpConnection>>;
}

/// Production connector backed by rmcp transports.
pub struct RmcpConnector;

#[async_trait]
impl McpConnector for RmcpConnector {
    async fn connect(
        &self,
        name: &str,
        config: &ServerConfig,
    ) -> WeaveResult<Arc<dyn McpConnection>> {
        let connection = RmcpConnection::connect(name, config).await?;
        Ok(Arc::new(connection))
    }
}

fn client_info() -> ClientInfo {
    ClientInfo {
        meta: None,
        protocol_version: Default::default(),
        capabilities: Default::default(),
        client_info: rmcp::model::Implementation {
            name: "mcpweave".into(),
            title: Some("mcpweave MCP client".into()),
            version: env!("CARGO_PKG_VERSION").into(),
            icons: None,
            website_url: None,
        },
    }
}

/// Resolve the bearer token for an HTTP/SSE server: an env var named by the
/// descriptor wins, then a stored OAuth token file under
/// `~/.mcpweave/tokens/<server>.json`.
fn resolve_bearer_token(server_name: &str, config: &ServerConfig) -> Option<String> {
    if let Some(env_var) = &config.bearer_token_env_var {
        match std::env::var(env_var) {
            Ok(token) if !token.is_empty() => return Some(token),
            _ => {
                warn!(
                    server = %server_name,
                    env_var = %env_var,
                    "Missing bearer token env var for MCP HTTP server"
                );
            }
        }
    }

    if config.oauth.is_some()
        && let Ok(home) = crate::config::weave_home()
    {
        let token_path = home.join("tokens").join(format!("{}.json", server_name));
        if let Ok(content) = std::fs::read_to_string(&token_path)
            && let Ok(value) = serde_json::from_str::<Value>(&content)
            && let Some(token) = value.get("access_token").and_then(Value::as_str)
        {
            debug!(server = %server_name, "Using stored OAuth token");
            return Some(token.to_string());
        }
    }

    None
}

/// A live rmcp connection. The `RunningService` must stay alive for the
/// duration; dropping it cancels the transport (and kills a stdio child).
pub struct RmcpConnection {
    server_name: String,
    kind: TransportKind,
    peer: Peer<RoleClient>,
    service: Mutex<Option<RunningService<RoleClient, ClientInfo>>>,
}

impl RmcpConnection {
    pub async fn connect(name: &str, config: &ServerConfig) -> WeaveResult<Self> {
        let kind = config
            .transport_kind()
            .map_err(|e| WeaveError::Config(format!("server '{}': {}", name, e)))?;

        let service = match kind {
            TransportKind::Stdio => {
                let command = config.command.as_deref().ok_or_else(|| {
                    WeaveError::Config(format!("stdio server '{}' has no command", name))
                })?;
                let mut cmd = Command::new(command);
                cmd.args(&config.args);
                for (key, value) in &config.env {
                    cmd.env(key, value);
                }
                // Pipe stdin/stdout for MCP framing; inherit stderr for logs.
                cmd.stdin(Stdio::piped())
                    .stdout(Stdio::piped())
                    .stderr(Stdio::inherit());

                let transport = TokioChildProcess::new(cmd).map_err(|e| WeaveError::Transport {
                    server: name.to_string(),
                    message: format!("failed to spawn: {}", e),
                })?;
                rmcp::serve_client(client_info(), transport)
                    .await
                    .map_err(|e| WeaveError::Transport {
                        server: name.to_string(),
                        message: format!("MCP handshake failed: {}", e),
                    })?
            }
            TransportKind::Sse => {
                let url = config.url.as_deref().ok_or_else(|| {
                    WeaveError::Config(format!("sse server '{}' has no url", name))
                })?;
                let transport = StreamableHttpClientTransport::from_uri(Arc::from(url));
                rmcp::serve_client(client_info(), transport)
                    .await
                    .map_err(|e| WeaveError::Transport {
                        server: name.to_string(),
                        message: format!("MCP handshake failed: {}", e),
                    })?
            }
            TransportKind::StreamableHttp => {
                let url = config.url.as_deref().ok_or_else(|| {
                    WeaveError::Config(format!("http server '{}' has no url", name))
                })?;
                let mut transport_config =
                    StreamableHttpClientTransportConfig::with_uri(Arc::from(url));
                if let Some(token) = resolve_bearer_token(name, config) {
                    transport_config = transport_config.auth_header(token);
                }
                let transport = StreamableHttpClientTransport::from_config(transport_config);
                rmcp::serve_client(client_info(), transport)
                    .await
                    .map_err(|e| WeaveError::Transport {
                        server: name.to_string(),
                        message: format!("MCP handshake failed: {}", e),
                    })?
            }
        };

        info!(server = %name, transport = %kind, "Connected to MCP server");

        Ok(Self {
            server_name: name.to_string(),
            kind,
            peer: service.peer().clone(),
            service: Mutex::new(Some(service)),
        })
    }

    fn protocol_error(&self, operation: &str, e: impl std::fmt::Display) -> WeaveError {
        WeaveError::Transport {
            server: self.server_name.clone(),
            message: format!("{} failed: {}", operation, e),
        }
    }
}

/// Classify a tool-call failure from its error text. Dead transports show
/// up as closed-channel/pipe errors; everything else is a protocol error.
fn classify_call_failure(message: &str) -> ToolErrorKind {
    let lower = message.to_ascii_lowercase();
    if lower.contains("broken pipe")
        || lower.contains("channel closed")
        || lower.contains("connection closed")
        || lower.contains("transport closed")
        || lower.contains("connection reset")
    {
        ToolErrorKind::BrokenPipe
    } else {
        ToolErrorKind::Protocol
    }
}

#[async_trait]
impl McpConnection for RmcpConnection {
    fn server_name(&self) -> &str {
        &self.server_name
    }

    fn transport_kind(&self) -> TransportKind {
        self.kind
    }

    async fn list_tools(&self) -> WeaveResult<Vec<ToolSpec>> {
        let tools = self
            .peer
            .list_all_tools()
            .await
            .map_err(|e| self.protocol_error("list_tools", e))?;
        Ok(tools
            .iter()
            .map(|t| capability::tool_from_rmcp(t, &self.server_name))
            .collect())
    }

    async fn list_prompts(&self) -> WeaveResult<Vec<PromptSpec>> {
        let prompts = self
            .peer
            .list_all_prompts()
            .await
            .map_err(|e| self.protocol_error("list_prompts", e))?;
        Ok(prompts
            .into_iter()
            .map(|p| PromptSpec {
                name: p.name.to_string(),
                description: p.description.as_deref().unwrap_or("").to_string(),
                server: self.server_name.clone(),
            })
            .collect())
    }

    async fn get_prompt(&self, name: &str) -> WeaveResult<String> {
        let result = self
            .peer
            .get_prompt(GetPromptRequestParams {
                meta: None,
                name: name.to_string().into(),
                arguments: None,
            })
            .await
            .map_err(|e| self.protocol_error("get_prompt", e))?;
        Ok(capability::prompt_text_from_messages(&result.messages))
    }

    async fn list_resources(&self) -> WeaveResult<Vec<ResourceSpec>> {
        let resources = self
            .peer
            .list_all_resources()
            .await
            .map_err(|e| self.protocol_error("list_resources", e))?;
        Ok(resources
            .into_iter()
            .map(|r| ResourceSpec {
                uri: r.raw.uri.to_string(),
                name: r.raw.name.to_string(),
                description: r.raw.description.clone().unwrap_or_default(),
                mime_type: r.raw.mime_type.clone().unwrap_or_default(),
                server: self.server_name.clone(),
            })
            .collect())
    }

    async fn call_tool(
        &self,
        name: &str,
        args: Value,
        cancel: &CancellationToken,
    ) -> WeaveResult<String> {
        if cancel.is_cancelled() {
            return Err(WeaveError::tool(name, ToolErrorKind::Cancelled, "cancelled"));
        }

        let arguments = match args {
            Value::Object(map) => Some(map),
            Value::Null => None,
            other => {
                // Wrap non-object values so the server still sees a map.
                let mut map = serde_json::Map::new();
                map.insert("input".to_string(), other);
                Some(map)
            }
        };

        let request = CallToolRequestParams {
            meta: None,
            name: name.to_string().into(),
            arguments,
            task: None,
        };

        debug!(server = %self.server_name, tool = %name, "MCP tool call");

        let result = tokio::select! {
            _ = cancel.cancelled() => {
                return Err(WeaveError::tool(name, ToolErrorKind::Cancelled, "cancelled"));
            }
            result = self.peer.call_tool(request) => result,
        };

        let result = match result {
            Ok(r) => r,
            Err(e) => {
                let message = e.to_string();
                let kind = classify_call_failure(&message);
                warn!(server = %self.server_name, tool = %name, error = %message, "MCP tool call failed");
                return Err(WeaveError::tool(name, kind, message));
            }
        };

        let output = capability::text_from_call_result(&result);
        if result.is_error == Some(true) {
            return Err(WeaveError::tool(name, ToolErrorKind::Other, output));
        }
        Ok(output)
    }

    async fn close(&self) -> WeaveResult<()> {
        let service = self.service.lock().await.take();
        if let Some(service) = service {
            if let Err(e) = service.cancel().await {
                warn!(server = %self.server_name, error = %e, "Error shutting down MCP server");
            }
        }
        Ok(())
    }
}
