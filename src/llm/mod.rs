//! LLM provider contract and invocation types.
//!
//! Providers implement [`LlmProvider`]; the fallback/retry machinery lives
//! in [`invoker`]. The contract is deliberately narrow: flat chat messages
//! in, a text-and-tool-calls response out, token usage attached when the
//! provider reports it.

pub mod anthropic;
pub mod invoker;
pub mod openai;
pub mod sse;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::sync::Arc;
use thiserror::Error;

/// Classified provider failure. The invoker's retry/fallback policy keys
/// off these kinds, and the conversation engine keys off `MaxTokens`.
#[derive(Debug, Clone, Error)]
pub enum ProviderError {
    #[error("throttled{}", retry_after.map(|s| format!(" (retry after {}s)", s)).unwrap_or_default())]
    Throttled { retry_after: Option<u64> },

    #[error("input exceeds the model's context window")]
    MaxTokens,

    #[error("provider returned empty content")]
    EmptyContent,

    #[error("connection error: {0}")]
    Connection(String),

    #[error("API error ({status}): {message}")]
    Api { status: u16, message: String },

    #[error("{0}")]
    Other(String),
}

impl ProviderError {
    /// Retried on the same model (with backoff) rather than advancing the
    /// fallback chain.
    pub fn retry_same_model(&self) -> bool {
        matches!(
            self,
            ProviderError::Throttled { .. } | ProviderError::EmptyContent
        )
    }
}

/// Token accounting for one generation. Counters are kept separate; absent
/// counters stay `None` rather than being folded into totals.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub input_tokens: Option<u64>,
    pub output_tokens: Option<u64>,
    pub total_tokens: Option<u64>,
    pub cache_read_tokens: Option<u64>,
    pub reasoning_tokens: Option<u64>,
}

impl TokenUsage {
    pub fn is_empty(&self) -> bool {
        self.input_tokens.is_none()
            && self.output_tokens.is_none()
            && self.total_tokens.is_none()
            && self.cache_read_tokens.is_none()
            && self.reasoning_tokens.is_none()
    }
}

/// A tool call proposed by the model.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToolCallRequest {
    pub id: String,
    pub name: String,
    pub arguments: Value,
}

/// One completed generation.
#[derive(Debug, Clone, Default)]
pub struct LlmResponse {
    pub content: Option<String>,
    pub tool_calls: Vec<ToolCallRequest>,
    pub reasoning_content: Option<String>,
    /// Unified usage when the provider reports one.
    pub usage: Option<TokenUsage>,
    /// Provider-specific generation info; consulted for usage only when
    /// the unified field is absent.
    pub generation_info: Map<String, Value>,
}

impl LlmResponse {
    pub fn has_tool_calls(&self) -> bool {
        !self.tool_calls.is_empty()
    }

    pub fn is_empty(&self) -> bool {
        self.content.as_deref().map_or(true, |c| c.trim().is_empty()) && self.tool_calls.is_empty()
    }

    /// Extract token usage: the unified `usage` field wins; otherwise the
    /// provider generation-info map is scanned for well-known keys.
    pub fn token_usage(&self) -> Option<TokenUsage> {
        if let Some(usage) = self.usage {
            return Some(usage);
        }
        let usage = usage_from_generation_info(&self.generation_info);
        if usage.is_empty() { None } else { Some(usage) }
    }
}

fn read_u64(map: &Map<String, Value>, keys: &[&str]) -> Option<u64> {
    keys.iter().find_map(|k| map.get(*k).and_then(Value::as_u64))
}

/// Scan a provider generation-info map for token counters under the names
/// the major providers use.
pub fn usage_from_generation_info(info: &Map<String, Value>) -> TokenUsage {
    TokenUsage {
        input_tokens: read_u64(info, &["input_tokens", "prompt_tokens", "prompt_token_count"]),
        output_tokens: read_u64(
            info,
            &["output_tokens", "completion_tokens", "candidates_token_count"],
        ),
        total_tokens: read_u64(info, &["total_tokens", "total_token_count"]),
        cache_read_tokens: read_u64(
            info,
            &["cache_read_input_tokens", "cached_tokens", "cache_read_tokens"],
        ),
        reasoning_tokens: read_u64(info, &["reasoning_tokens", "thoughts_token_count"]),
    }
}

/// Flat wire-level chat message. The conversation engine's part-structured
/// messages lower into this shape right before a provider call.
#[derive(Debug, Clone, Default)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
    pub tool_calls: Option<Vec<ToolCallRequest>>,
    pub tool_call_id: Option<String>,
    /// For role="tool": whether this result is an error payload.
    pub is_error: bool,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: "system".into(),
            content: content.into(),
            ..Default::default()
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".into(),
            content: content.into(),
            ..Default::default()
        }
    }

    pub fn assistant(content: impl Into<String>, tool_calls: Option<Vec<ToolCallRequest>>) -> Self {
        Self {
            role: "assistant".into(),
            content: content.into(),
            tool_calls,
            ..Default::default()
        }
    }

    pub fn tool_result(
        tool_call_id: impl Into<String>,
        content: impl Into<String>,
        is_error: bool,
    ) -> Self {
        Self {
            role: "tool".into(),
            content: content.into(),
            tool_call_id: Some(tool_call_id.into()),
            is_error,
            ..Default::default()
        }
    }
}

/// Request for a single provider call.
#[derive(Debug, Clone)]
pub struct ChatRequest<'a> {
    pub messages: Vec<ChatMessage>,
    /// Function declarations (`{name, description, parameters}`).
    pub tools: Option<Vec<Value>>,
    pub model: Option<&'a str>,
    pub max_tokens: u32,
    pub temperature: f32,
}

/// Invoked once per streamed content chunk.
pub type StreamCallback = Arc<dyn Fn(&str) + Send + Sync>;

#[async_trait]
pub trait LlmProvider: Send + Sync {
    /// Stable provider name ("anthropic", "openai", "openrouter").
    fn name(&self) -> &str;

    fn default_model(&self) -> &str;

    async fn chat(&self, req: ChatRequest<'_>) -> Result<LlmResponse, ProviderError>;

    /// Streaming variant; content chunks are delivered through `callback`
    /// as they arrive, tool calls only in the final response. Providers
    /// without streaming support fall back to a single blocking call.
    async fn chat_stream(
        &self,
        req: ChatRequest<'_>,
        _callback: StreamCallback,
    ) -> Result<LlmResponse, ProviderError> {
        self.chat(req).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn unified_usage_wins_over_generation_info() {
        let mut info = Map::new();
        info.insert("prompt_tokens".into(), json!(999));
        let response = LlmResponse {
            usage: Some(TokenUsage {
                input_tokens: Some(10),
                output_tokens: Some(5),
                ..Default::default()
            }),
            generation_info: info,
            ..Default::default()
        };
        let usage = response.token_usage().unwrap();
        assert_eq!(usage.input_tokens, Some(10));
    }

    #[test]
    fn generation_info_fallback() {
        let mut info = Map::new();
        info.insert("prompt_tokens".into(), json!(42));
        info.insert("completion_tokens".into(), json!(7));
        info.insert("total_tokens".into(), json!(49));
        info.insert("cached_tokens".into(), json!(12));
        let response = LlmResponse {
            generation_info: info,
            ..Default::default()
        };
        let usage = response.token_usage().unwrap();
        assert_eq!(usage.input_tokens, Some(42));
        assert_eq!(usage.output_tokens, Some(7));
        assert_eq!(usage.total_tokens, Some(49));
        assert_eq!(usage.cache_read_tokens, Some(12));
        assert_eq!(usage.reasoning_tokens, None);
    }

    #[test]
    fn no_usage_anywhere() {
        let response = LlmResponse::default();
        assert!(response.token_usage().is_none());
    }

    #[test]
    fn empty_response_detection() {
        assert!(LlmResponse::default().is_empty());
        assert!(
            LlmResponse {
                content: Some("   ".into()),
                ..Default::default()
            }
            .is_empty()
        );
        assert!(
            !LlmResponse {
                tool_calls: vec![ToolCallRequest {
                    id: "1".into(),
                    name: "search".into(),
                    arguments: json!({}),
                }],
                ..Default::default()
            }
            .is_empty()
        );
    }

    #[test]
    fn retry_classification() {
        assert!(ProviderError::Throttled { retry_after: None }.retry_same_model());
        assert!(ProviderError::EmptyContent.retry_same_model());
        assert!(!ProviderError::MaxTokens.retry_same_model());
        assert!(!ProviderError::Connection("x".into()).retry_same_model());
    }
}
