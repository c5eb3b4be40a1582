use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Descriptor for one MCP server. Lives for the process; the cache key is
/// derived from its canonical JSON form, so descriptor changes invalidate
/// cached capabilities automatically.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ServerConfig {
    /// Executable for stdio servers.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub args: Vec<String>,
    /// Endpoint for SSE / streamable-HTTP servers.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    /// "stdio" | "sse" | "http". Inferred from command/url when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub protocol: Option<String>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub env: HashMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub oauth: Option<OAuthConfig>,
    /// Name of an environment variable holding a bearer token for HTTP servers.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bearer_token_env_var: Option<String>,
    /// When non-empty, only these tools are exposed from this server.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_filter: Vec<String>,
    /// When non-empty, only these prompts are exposed from this server.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub prompt_filter: Vec<String>,
}

/// OAuth client settings for a server descriptor. Token acquisition and
/// refresh are handled outside the runtime; we only read stored tokens.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct OAuthConfig {
    pub client_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_secret: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token_url: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub scopes: Vec<String>,
}

/// Wire protocol used to reach a server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TransportKind {
    Stdio,
    Sse,
    StreamableHttp,
}

impl std::fmt::Display for TransportKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransportKind::Stdio => write!(f, "stdio"),
            TransportKind::Sse => write!(f, "sse"),
            TransportKind::StreamableHttp => write!(f, "streamable-http"),
        }
    }
}

impl ServerConfig {
    /// Resolve the transport kind: explicit `protocol` wins, then the
    /// presence of `command` (stdio) or `url` (streamable HTTP).
    pub fn transport_kind(&self) -> Result<TransportKind, String> {
        match self.protocol.as_deref() {
            Some("stdio") => return Ok(TransportKind::Stdio),
            Some("sse") => return Ok(TransportKind::Sse),
            Some("http") | Some("streamable-http") => return Ok(TransportKind::StreamableHttp),
            Some(other) => return Err(format!("unknown protocol '{}'", other)),
            None => {}
        }
        if self.command.is_some() {
            Ok(TransportKind::Stdio)
        } else if self.url.is_some() {
            Ok(TransportKind::StreamableHttp)
        } else {
            Err("server descriptor has neither command nor url".to_string())
        }
    }
}

/// Settings for the conversation engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AgentSettings {
    /// Maximum reason-act turns before the forced final answer.
    pub max_turns: usize,
    /// Per-tool-call timeout in seconds.
    pub tool_timeout_secs: u64,
    /// Per-LLM-call timeout in seconds.
    pub llm_timeout_secs: u64,
    /// Overall conversation deadline in seconds (0 = none).
    pub conversation_deadline_secs: u64,
    pub max_tokens: u32,
    pub temperature: f32,
    /// Stream content chunks as bus events.
    pub streaming: bool,
    pub context: ContextSettings,
}

impl Default for AgentSettings {
    fn default() -> Self {
        Self {
            max_turns: 25,
            tool_timeout_secs: 300,
            llm_timeout_secs: 180,
            conversation_deadline_secs: 0,
            max_tokens: 8192,
            temperature: 0.7,
            streaming: false,
            context: ContextSettings::default(),
        }
    }
}

/// Context-window management: per-response compaction plus last-resort
/// summarization.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ContextSettings {
    pub editing_enabled: bool,
    /// Tool responses at or above this estimated token count are eligible.
    pub edit_token_threshold: usize,
    /// Tool responses must be at least this many turns old.
    pub edit_turn_threshold: u32,
    pub summarization_enabled: bool,
    /// Projected input tokens above this watermark trigger summarization.
    pub summarize_watermark_tokens: usize,
    /// Number of trailing messages kept verbatim through summarization.
    pub keep_recent: usize,
}

impl Default for ContextSettings {
    fn default() -> Self {
        Self {
            editing_enabled: true,
            edit_token_threshold: 2000,
            edit_turn_threshold: 3,
            summarization_enabled: true,
            summarize_watermark_tokens: 60_000,
            keep_recent: 10,
        }
    }
}

/// One model in a fallback chain.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ModelRef {
    /// "anthropic" | "openai" | "openrouter".
    pub provider: String,
    pub model: String,
}

/// Fallback chain configuration: primary, then same-provider fallbacks,
/// then cross-provider fallbacks.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct FallbackSettings {
    pub primary: Option<ModelRef>,
    pub same_provider: Vec<ModelRef>,
    pub cross_provider: Vec<ModelRef>,
    /// Same-model retries for throttling / empty content.
    pub max_retries: usize,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
}

impl Default for FallbackSettings {
    fn default() -> Self {
        Self {
            primary: None,
            same_provider: vec![],
            cross_provider: vec![],
            max_retries: 3,
            initial_backoff_ms: 1000,
            max_backoff_ms: 10_000,
        }
    }
}

/// Capability cache settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CacheSettings {
    pub enabled: bool,
    /// Default per-entry TTL in minutes.
    pub ttl_minutes: i64,
    /// Cache directory; defaults to `<home>/cache` when empty.
    pub directory: String,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            ttl_minutes: 24 * 60,
            directory: String::new(),
        }
    }
}

/// Code-exec broker settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct BrokerSettings {
    pub host: String,
    pub port: u16,
    /// Bearer token required on execute endpoints when set.
    pub api_token: Option<String>,
}

impl Default for BrokerSettings {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8934,
            api_token: None,
        }
    }
}

/// Tracer backend credentials. Resolved from config or environment.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TracingSettings {
    pub langfuse_public_key: Option<String>,
    pub langfuse_secret_key: Option<String>,
    pub langfuse_base_url: Option<String>,
    pub langsmith_api_key: Option<String>,
    pub langsmith_endpoint: Option<String>,
    pub langsmith_project: Option<String>,
}

/// Provider API keys. Resolved from config or environment.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ProviderSettings {
    pub anthropic_api_key: Option<String>,
    pub openai_api_key: Option<String>,
    pub openrouter_api_key: Option<String>,
}

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Config {
    #[serde(rename = "mcpServers")]
    pub mcp_servers: HashMap<String, ServerConfig>,
    pub agent: AgentSettings,
    pub fallback: FallbackSettings,
    pub cache: CacheSettings,
    pub broker: BrokerSettings,
    pub tracing: TracingSettings,
    pub providers: ProviderSettings,
}
