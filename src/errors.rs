use thiserror::Error;

/// Typed error hierarchy for mcpweave.
///
/// Used at module boundaries (transports, tool calls, LLM invocation, cache,
/// config). Internal/leaf functions can continue using `anyhow::Result` — the
/// `Internal` variant allows seamless conversion via the `?` operator.
///
/// The conversation engine is the only component that decides whether an
/// error is terminal to the conversation or surfaced to the model as a tool
/// response; everything below it returns classified errors.
#[derive(Debug, Error)]
pub enum WeaveError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Transport error for server '{server}': {message}")]
    Transport { server: String, message: String },

    #[error("Tool '{tool}' failed: {kind:?}: {message}")]
    Tool {
        tool: String,
        kind: ToolErrorKind,
        message: String,
    },

    #[error("LLM error: {0}")]
    Llm(#[from] crate::llm::ProviderError),

    #[error("All fallback models failed: {0}")]
    FallbacksExhausted(String),

    #[error("Cache error: {0}")]
    Cache(String),

    #[error("Cancelled")]
    Cancelled,

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

/// Classification of a failed tool call. `BrokenPipe` is distinguished
/// because the conversation engine turns it into a reconnection request,
/// not a user-visible failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ToolErrorKind {
    BrokenPipe,
    Protocol,
    Timeout,
    Cancelled,
    Other,
}

pub type WeaveResult<T> = std::result::Result<T, WeaveError>;

impl WeaveError {
    pub fn tool(tool: impl Into<String>, kind: ToolErrorKind, message: impl Into<String>) -> Self {
        WeaveError::Tool {
            tool: tool.into(),
            kind,
            message: message.into(),
        }
    }

    /// Whether the conversation engine should attempt a fresh connection
    /// and retry this tool call once.
    pub fn is_broken_pipe(&self) -> bool {
        matches!(
            self,
            WeaveError::Tool {
                kind: ToolErrorKind::BrokenPipe,
                ..
            }
        )
    }

    /// Cache errors are never fatal; callers log and proceed uncached.
    pub fn is_cache(&self) -> bool {
        matches!(self, WeaveError::Cache(_))
    }
}
