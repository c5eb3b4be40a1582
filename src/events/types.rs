use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Component a given event type belongs to. Part of the contract for
/// external subscribers grouping events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Component {
    Orchestrator,
    Agent,
    Llm,
    Tool,
    Conversation,
    Cache,
    System,
}

/// Metadata shared by every event. Start/end pairs share `correlation_id`;
/// `parent_id` points at the correlation id of the enclosing span.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventMeta {
    pub timestamp: DateTime<Utc>,
    pub trace_id: String,
    pub session_id: String,
    pub correlation_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<String>,
    /// 0 = root, 1 = child, 2 = grandchild.
    pub hierarchy_level: u8,
}

// ---- Per-variant payloads ----

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AgentPayload {
    pub servers: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConversationPayload {
    pub turn: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub question: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub answer: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GenerationPayload {
    pub model: String,
    pub provider: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub input_tokens: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output_tokens: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total_tokens: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cache_read_tokens: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reasoning_tokens: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ToolCallPayload {
    pub server: String,
    pub tool: String,
    pub turn: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub arguments: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result_chars: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConnectionPayload {
    pub server: String,
    pub transport: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_count: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CachePayload {
    pub server: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ContextEditPayload {
    /// One evaluation per tool response considered.
    pub evaluations: Vec<ContextEditEvaluation>,
    pub tokens_saved: usize,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ContextEditEvaluation {
    pub turn: usize,
    pub tool: String,
    pub tokens: usize,
    pub compacted: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SummarizationPayload {
    pub messages_summarized: usize,
    pub messages_kept: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub summary_chars: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StreamingPayload {
    pub content: String,
    pub index: usize,
}

/// Which phase of the fallback chain an attempt belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FallbackPhase {
    Primary,
    SameProvider,
    CrossProvider,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FallbackPayload {
    pub phase: FallbackPhase,
    pub provider: String,
    pub model: String,
    pub attempt: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RoutingPayload {
    pub chosen_model: String,
    pub reason: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StructuredOutputPayload {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub schema_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BrokerPayload {
    pub endpoint: String,
    pub server: String,
    pub tool: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DebugPayload {
    pub message: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MetricPayload {
    pub name: String,
    pub value: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub unit: Option<String>,
}

/// Closed event taxonomy: one tag enum, per-variant payload structs.
/// Do not model events as an open hierarchy; subscribers rely on being
/// able to match exhaustively.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum EventKind {
    // Agent lifecycle
    AgentStart(AgentPayload),
    AgentEnd(AgentPayload),
    AgentError(AgentPayload),

    // Conversation loop
    ConversationStart(ConversationPayload),
    ConversationTurn(ConversationPayload),
    ConversationEnd(ConversationPayload),
    ConversationError(ConversationPayload),
    ContextCancelled(ConversationPayload),

    // LLM generation
    LlmCallStart(GenerationPayload),
    LlmCallEnd(GenerationPayload),
    LlmCallError(GenerationPayload),
    LlmFirstToken(GenerationPayload),
    TokenUsageRecorded(GenerationPayload),

    // Streaming
    StreamingStart(StreamingPayload),
    StreamingChunk(StreamingPayload),
    StreamingEnd(StreamingPayload),

    // Tool calls
    ToolCallStart(ToolCallPayload),
    ToolCallEnd(ToolCallPayload),
    ToolCallError(ToolCallPayload),
    ToolRetry(ToolCallPayload),

    // MCP connections and discovery
    McpConnectStart(ConnectionPayload),
    McpConnectEnd(ConnectionPayload),
    McpConnectError(ConnectionPayload),
    McpReconnect(ConnectionPayload),
    McpDisconnect(ConnectionPayload),
    McpDiscoveryStart(ConnectionPayload),
    McpDiscoveryEnd(ConnectionPayload),

    // Capability cache
    CacheHit(CachePayload),
    CacheMiss(CachePayload),
    CacheWrite(CachePayload),
    CacheInvalidate(CachePayload),
    CacheExpired(CachePayload),
    CacheCleanup(CachePayload),
    CacheBypass(CachePayload),

    // Context management
    ContextEditingStart(ContextEditPayload),
    ContextEditingCompleted(ContextEditPayload),
    SummarizationStart(SummarizationPayload),
    SummarizationCompleted(SummarizationPayload),
    SummarizationFailed(SummarizationPayload),

    // Fallback and retry
    FallbackAttempt(FallbackPayload),
    AllFallbacksFailed(FallbackPayload),
    RetryAttempt(FallbackPayload),

    // Smart routing
    RoutingDecision(RoutingPayload),
    RoutingFallback(RoutingPayload),

    // Structured output
    StructuredOutputRequested(StructuredOutputPayload),
    StructuredOutputParsed(StructuredOutputPayload),
    StructuredOutputFailed(StructuredOutputPayload),

    // Code-exec broker
    BrokerRequest(BrokerPayload),
    BrokerResponse(BrokerPayload),
    BrokerError(BrokerPayload),

    // Diagnostics
    DebugLog(DebugPayload),
    PerformanceMetric(MetricPayload),
}

impl EventKind {
    /// Stable name of the variant tag (matches the serialized `type` field).
    pub fn type_name(&self) -> &'static str {
        match self {
            EventKind::AgentStart(_) => "agent_start",
            EventKind::AgentEnd(_) => "agent_end",
            EventKind::AgentError(_) => "agent_error",
            EventKind::ConversationStart(_) => "conversation_start",
            EventKind::ConversationTurn(_) => "conversation_turn",
            EventKind::ConversationEnd(_) => "conversation_end",
            EventKind::ConversationError(_) => "conversation_error",
            EventKind::ContextCancelled(_) => "context_cancelled",
            EventKind::LlmCallStart(_) => "llm_call_start",
            EventKind::LlmCallEnd(_) => "llm_call_end",
            EventKind::LlmCallError(_) => "llm_call_error",
            EventKind::LlmFirstToken(_) => "llm_first_token",
            EventKind::TokenUsageRecorded(_) => "token_usage_recorded",
            EventKind::StreamingStart(_) => "streaming_start",
            EventKind::StreamingChunk(_) => "streaming_chunk",
            EventKind::StreamingEnd(_) => "streaming_end",
            EventKind::ToolCallStart(_) => "tool_call_start",
            EventKind::ToolCallEnd(_) => "tool_call_end",
            EventKind::ToolCallError(_) => "tool_call_error",
            EventKind::ToolRetry(_) => "tool_retry",
            EventKind::McpConnectStart(_) => "mcp_connect_start",
            EventKind::McpConnectEnd(_) => "mcp_connect_end",
            EventKind::McpConnectError(_) => "mcp_connect_error",
            EventKind::McpReconnect(_) => "mcp_reconnect",
            EventKind::McpDisconnect(_) => "mcp_disconnect",
            EventKind::McpDiscoveryStart(_) => "mcp_discovery_start",
            EventKind::McpDiscoveryEnd(_) => "mcp_discovery_end",
            EventKind::CacheHit(_) => "cache_hit",
            EventKind::CacheMiss(_) => "cache_miss",
            EventKind::CacheWrite(_) => "cache_write",
            EventKind::CacheInvalidate(_) => "cache_invalidate",
            EventKind::CacheExpired(_) => "cache_expired",
            EventKind::CacheCleanup(_) => "cache_cleanup",
            EventKind::CacheBypass(_) => "cache_bypass",
            EventKind::ContextEditingStart(_) => "context_editing_start",
            EventKind::ContextEditingCompleted(_) => "context_editing_completed",
            EventKind::SummarizationStart(_) => "summarization_start",
            EventKind::SummarizationCompleted(_) => "summarization_completed",
            EventKind::SummarizationFailed(_) => "summarization_failed",
            EventKind::FallbackAttempt(_) => "fallback_attempt",
            EventKind::AllFallbacksFailed(_) => "all_fallbacks_failed",
            EventKind::RetryAttempt(_) => "retry_attempt",
            EventKind::RoutingDecision(_) => "routing_decision",
            EventKind::RoutingFallback(_) => "routing_fallback",
            EventKind::StructuredOutputRequested(_) => "structured_output_requested",
            EventKind::StructuredOutputParsed(_) => "structured_output_parsed",
            EventKind::StructuredOutputFailed(_) => "structured_output_failed",
            EventKind::BrokerRequest(_) => "broker_request",
            EventKind::BrokerResponse(_) => "broker_response",
            EventKind::BrokerError(_) => "broker_error",
            EventKind::DebugLog(_) => "debug_log",
            EventKind::PerformanceMetric(_) => "performance_metric",
        }
    }

    /// Map this event to its owning component.
    pub fn component(&self) -> Component {
        match self {
            EventKind::AgentStart(_) | EventKind::AgentEnd(_) | EventKind::AgentError(_) => {
                Component::Agent
            }
            EventKind::ConversationStart(_)
            | EventKind::ConversationTurn(_)
            | EventKind::ConversationEnd(_)
            | EventKind::ConversationError(_)
            | EventKind::ContextCancelled(_)
            | EventKind::ContextEditingStart(_)
            | EventKind::ContextEditingCompleted(_)
            | EventKind::SummarizationStart(_)
            | EventKind::SummarizationCompleted(_)
            | EventKind::SummarizationFailed(_) => Component::Conversation,
            EventKind::LlmCallStart(_)
            | EventKind::LlmCallEnd(_)
            | EventKind::LlmCallError(_)
            | EventKind::LlmFirstToken(_)
            | EventKind::TokenUsageRecorded(_)
            | EventKind::StreamingStart(_)
            | EventKind::StreamingChunk(_)
            | EventKind::StreamingEnd(_)
            | EventKind::FallbackAttempt(_)
            | EventKind::AllFallbacksFailed(_)
            | EventKind::RetryAttempt(_)
            | EventKind::RoutingDecision(_)
            | EventKind::RoutingFallback(_)
            | EventKind::StructuredOutputRequested(_)
            | EventKind::StructuredOutputParsed(_)
            | EventKind::StructuredOutputFailed(_) => Component::Llm,
            EventKind::ToolCallStart(_)
            | EventKind::ToolCallEnd(_)
            | EventKind::ToolCallError(_)
            | EventKind::ToolRetry(_) => Component::Tool,
            EventKind::McpConnectStart(_)
            | EventKind::McpConnectEnd(_)
            | EventKind::McpConnectError(_)
            | EventKind::McpReconnect(_)
            | EventKind::McpDisconnect(_)
            | EventKind::McpDiscoveryStart(_)
            | EventKind::McpDiscoveryEnd(_) => Component::Orchestrator,
            EventKind::CacheHit(_)
            | EventKind::CacheMiss(_)
            | EventKind::CacheWrite(_)
            | EventKind::CacheInvalidate(_)
            | EventKind::CacheExpired(_)
            | EventKind::CacheCleanup(_)
            | EventKind::CacheBypass(_) => Component::Cache,
            EventKind::BrokerRequest(_)
            | EventKind::BrokerResponse(_)
            | EventKind::BrokerError(_)
            | EventKind::DebugLog(_)
            | EventKind::PerformanceMetric(_) => Component::System,
        }
    }
}

/// A typed event on the bus.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    #[serde(flatten)]
    pub meta: EventMeta,
    #[serde(flatten)]
    pub kind: EventKind,
}

impl Event {
    pub fn event_type(&self) -> &'static str {
        self.kind.type_name()
    }

    pub fn component(&self) -> Component {
        self.kind.component()
    }

    pub fn correlation_id(&self) -> &str {
        &self.meta.correlation_id
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.meta.timestamp
    }

    pub fn trace_id(&self) -> &str {
        &self.meta.trace_id
    }

    pub fn parent_id(&self) -> Option<&str> {
        self.meta.parent_id.as_deref()
    }

    pub fn hierarchy_level(&self) -> u8 {
        self.meta.hierarchy_level
    }
}
