//! Conversation engine.
//!
//! Drives the reason-act loop for one logical conversation: assemble the
//! message list, call the LLM through the fallback invoker, fan tool calls
//! out to their owning MCP servers, and feed results back until the model
//! produces a final answer. This is the only layer allowed to decide
//! whether a failure is terminal to the conversation or surfaced to the
//! model as a tool response.

pub mod context_edit;
pub mod message;
pub mod summarize;

use crate::config::AgentSettings;
use crate::errors::{ToolErrorKind, WeaveError, WeaveResult};
use crate::events::{
    AgentPayload, ConnectionPayload, ContextEditPayload, ConversationPayload, Event, EventBus,
    EventKind, GenerationPayload, StreamingPayload, SummarizationPayload, ToolCallPayload,
    TraceContext, new_correlation_id,
};
use crate::federation::{FederatedView, Federation};
use crate::llm::invoker::{InvokeOptions, Invoker};
use crate::llm::{ChatMessage, StreamCallback, TokenUsage, ToolCallRequest};
use crate::mcp::McpConnection;
use futures_util::future::join_all;
use message::{Message, Part, estimate_history_tokens, estimate_tokens, lower_to_chat};
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const FORCED_FINAL_INSTRUCTION: &str = "You have reached the maximum number of tool-use turns. \
     Produce your final answer now from the information already gathered. \
     Do not request any more tool calls.";

pub struct Agent {
    federation: Arc<Federation>,
    view: FederatedView,
    /// Live connections, swapped in place on fresh-connection recovery.
    /// Exactly one conversation dispatches on a given client at a time.
    clients: RwLock<HashMap<String, Arc<dyn McpConnection>>>,
    invoker: Arc<Invoker>,
    bus: Arc<EventBus>,
    settings: AgentSettings,
    trace: TraceContext,
    agent_correlation: String,
    history: Vec<Message>,
    turn: usize,
    /// Token accounting per LLM call, in call order.
    turn_usage: Vec<TokenUsage>,
}

impl Agent {
    /// Federate the requested servers and stand up an agent for one
    /// logical conversation.
    pub async fn new(
        federation: Arc<Federation>,
        servers: &[String],
        invoker: Arc<Invoker>,
        bus: Arc<EventBus>,
        settings: AgentSettings,
        trace: TraceContext,
    ) -> WeaveResult<Self> {
        let mut view = federation.federate(servers, &trace).await?;
        let clients = RwLock::new(std::mem::take(&mut view.clients));

        let agent_correlation = new_correlation_id();
        bus.emit(Event::with_correlation(
            EventKind::AgentStart(AgentPayload {
                servers: servers.to_vec(),
                detail: Some(format!("{} tools federated", view.tools.len())),
            }),
            &trace,
            0,
            None,
            agent_correlation.clone(),
        ));

        Ok(Self {
            federation,
            view,
            clients,
            invoker,
            bus,
            settings,
            trace,
            agent_correlation,
            history: Vec::new(),
            turn: 0,
            turn_usage: Vec::new(),
        })
    }

    pub fn history(&self) -> &[Message] {
        &self.history
    }

    /// Seed the conversation with prior history (e.g. a resumed session).
    pub fn set_history(&mut self, history: Vec<Message>) {
        self.history = history;
    }

    pub fn trace(&self) -> &TraceContext {
        &self.trace
    }

    pub fn view(&self) -> &FederatedView {
        &self.view
    }

    pub fn turn_usage(&self) -> &[TokenUsage] {
        &self.turn_usage
    }

    /// Run the reason-act loop for one question until the model produces a
    /// final answer, the turn budget forces one, or the caller cancels.
    pub async fn ask(&mut self, question: &str, cancel: &CancellationToken) -> WeaveResult<String> {
        let conversation = new_correlation_id();
        self.bus.emit(Event::with_correlation(
            EventKind::ConversationStart(ConversationPayload {
                turn: self.turn,
                question: Some(question.to_string()),
                ..Default::default()
            }),
            &self.trace,
            1,
            Some(self.agent_correlation.clone()),
            conversation.clone(),
        ));

        self.history.push(Message::user(question));

        let deadline = (self.settings.conversation_deadline_secs > 0)
            .then(|| Instant::now() + Duration::from_secs(self.settings.conversation_deadline_secs));

        loop {
            if cancel.is_cancelled() {
                return self.cancelled(&conversation);
            }
            if let Some(deadline) = deadline
                && Instant::now() >= deadline
            {
                return self.terminal(
                    &conversation,
                    WeaveError::Internal(anyhow::anyhow!("conversation deadline exceeded")),
                );
            }

            self.turn += 1;
            let forced = self.turn > self.settings.max_turns;

            if self.settings.context.editing_enabled && !forced {
                self.run_context_editing(&conversation);
            }

            if self.settings.context.summarization_enabled
                && estimate_history_tokens(&self.history)
                    > self.settings.context.summarize_watermark_tokens
                && let Err(e) = self.summarize(&conversation, cancel).await
            {
                // Watermark-triggered summarization is best effort; a failed
                // attempt leaves the history as it was.
                warn!(error = %e, "Summarization failed; continuing with full history");
            }

            self.bus.emit(Event::with_correlation(
                EventKind::ConversationTurn(ConversationPayload {
                    turn: self.turn,
                    ..Default::default()
                }),
                &self.trace,
                1,
                Some(self.agent_correlation.clone()),
                conversation.clone(),
            ));

            if cancel.is_cancelled() {
                return self.cancelled(&conversation);
            }

            let response = match self.call_llm(&conversation, forced, cancel).await {
                Ok(response) => response,
                Err(WeaveError::Llm(crate::llm::ProviderError::MaxTokens)) => {
                    // Context overflow: compress and retry once.
                    info!("Context window exceeded; summarizing and retrying");
                    self.summarize(&conversation, cancel).await?;
                    match self.call_llm(&conversation, forced, cancel).await {
                        Ok(response) => response,
                        Err(e) => return self.terminal(&conversation, e),
                    }
                }
                Err(WeaveError::Cancelled) => return self.cancelled(&conversation),
                Err(e) => return self.terminal(&conversation, e),
            };

            if let Some(usage) = response.token_usage() {
                self.turn_usage.push(usage);
                self.bus.emit(Event::with_correlation(
                    EventKind::TokenUsageRecorded(GenerationPayload {
                        model: self.invoker.primary_model().to_string(),
                        input_tokens: usage.input_tokens,
                        output_tokens: usage.output_tokens,
                        total_tokens: usage.total_tokens,
                        cache_read_tokens: usage.cache_read_tokens,
                        reasoning_tokens: usage.reasoning_tokens,
                        ..Default::default()
                    }),
                    &self.trace,
                    1,
                    Some(self.agent_correlation.clone()),
                    conversation.clone(),
                ));
            }

            if !response.has_tool_calls() || forced {
                let answer = response.content.unwrap_or_default();
                self.history.push(Message::assistant(answer.clone()));
                self.bus.emit(Event::with_correlation(
                    EventKind::ConversationEnd(ConversationPayload {
                        turn: self.turn,
                        answer: Some(answer.clone()),
                        ..Default::default()
                    }),
                    &self.trace,
                    1,
                    Some(self.agent_correlation.clone()),
                    conversation,
                ));
                return Ok(answer);
            }

            self.history.push(Message::assistant_with_calls(
                response.content.clone(),
                &response.tool_calls,
            ));

            if cancel.is_cancelled() {
                return self.cancelled(&conversation);
            }

            let parts = self
                .dispatch_tools(&response.tool_calls, &conversation, cancel)
                .await;
            self.history.push(Message::tool_responses(parts));
        }
    }

    /// Close every connection and emit the agent end event.
    pub async fn shutdown(self) {
        let clients = self.clients.read().await;
        for (name, client) in clients.iter() {
            if let Err(e) = client.close().await {
                warn!(server = %name, error = %e, "Error closing MCP connection");
            }
            self.bus.emit(Event::point(
                EventKind::McpDisconnect(ConnectionPayload {
                    server: name.clone(),
                    transport: client.transport_kind().to_string(),
                    ..Default::default()
                }),
                &self.trace,
                1,
                None,
            ));
        }
        self.bus.emit(Event::with_correlation(
            EventKind::AgentEnd(AgentPayload::default()),
            &self.trace,
            0,
            None,
            self.agent_correlation.clone(),
        ));
    }

    fn cancelled(&self, conversation: &str) -> WeaveResult<String> {
        self.bus.emit(Event::with_correlation(
            EventKind::ContextCancelled(ConversationPayload {
                turn: self.turn,
                ..Default::default()
            }),
            &self.trace,
            1,
            Some(self.agent_correlation.clone()),
            conversation.to_string(),
        ));
        Err(WeaveError::Cancelled)
    }

    fn terminal(&self, conversation: &str, error: WeaveError) -> WeaveResult<String> {
        self.bus.emit(Event::with_correlation(
            EventKind::ConversationError(ConversationPayload {
                turn: self.turn,
                error: Some(error.to_string()),
                ..Default::default()
            }),
            &self.trace,
            1,
            Some(self.agent_correlation.clone()),
            conversation.to_string(),
        ));
        Err(error)
    }

    fn run_context_editing(&mut self, conversation: &str) {
        self.bus.emit(Event::with_correlation(
            EventKind::ContextEditingStart(ContextEditPayload::default()),
            &self.trace,
            1,
            Some(self.agent_correlation.clone()),
            conversation.to_string(),
        ));
        let payload =
            context_edit::run_context_editing(&mut self.history, self.turn, &self.settings.context);
        if payload.tokens_saved > 0 {
            debug!(tokens_saved = payload.tokens_saved, "Context editing compacted tool responses");
        }
        self.bus.emit(Event::with_correlation(
            EventKind::ContextEditingCompleted(payload),
            &self.trace,
            1,
            Some(self.agent_correlation.clone()),
            conversation.to_string(),
        ));
    }

    /// Replace the old prefix of the history with a synthetic summary
    /// message, never splitting a tool-call/response pair.
    async fn summarize(
        &mut self,
        conversation: &str,
        cancel: &CancellationToken,
    ) -> WeaveResult<()> {
        let desired = self
            .history
            .len()
            .saturating_sub(self.settings.context.keep_recent);
        let split = summarize::safe_split_index(&self.history, desired);
        if split == 0 {
            debug!("Nothing to summarize at a safe split");
            return Ok(());
        }

        self.bus.emit(Event::with_correlation(
            EventKind::SummarizationStart(SummarizationPayload {
                messages_summarized: split,
                messages_kept: self.history.len() - split,
                ..Default::default()
            }),
            &self.trace,
            1,
            Some(self.agent_correlation.clone()),
            conversation.to_string(),
        ));

        let prompt = summarize::build_summary_prompt(&self.history[..split]);
        let opts = InvokeOptions {
            bus: self.bus.as_ref(),
            trace: &self.trace,
            parent_id: Some(conversation.to_string()),
            cancel,
            stream: None,
        };
        let result = self
            .invoker
            .invoke(
                vec![ChatMessage::user(prompt)],
                None,
                summarize::SUMMARY_MAX_TOKENS,
                summarize::SUMMARY_TEMPERATURE,
                &opts,
            )
            .await;

        let summary = match result {
            Ok(response) => response.content.unwrap_or_default(),
            Err(e) => {
                self.bus.emit(Event::with_correlation(
                    EventKind::SummarizationFailed(SummarizationPayload {
                        messages_summarized: split,
                        messages_kept: self.history.len() - split,
                        error: Some(e.to_string()),
                        ..Default::default()
                    }),
                    &self.trace,
                    1,
                    Some(self.agent_correlation.clone()),
                    conversation.to_string(),
                ));
                return Err(e);
            }
        };

        let mut compressed = vec![summarize::build_summary_message(&summary)];
        compressed.extend_from_slice(&self.history[split..]);
        self.history = compressed;

        self.bus.emit(Event::with_correlation(
            EventKind::SummarizationCompleted(SummarizationPayload {
                messages_summarized: split,
                messages_kept: self.history.len() - 1,
                summary_chars: Some(summary.chars().count()),
                ..Default::default()
            }),
            &self.trace,
            1,
            Some(self.agent_correlation.clone()),
            conversation.to_string(),
        ));
        Ok(())
    }

    async fn call_llm(
        &self,
        conversation: &str,
        forced: bool,
        cancel: &CancellationToken,
    ) -> WeaveResult<crate::llm::LlmResponse> {
        let mut chat = vec![ChatMessage::system(self.view.system_prompt.clone())];
        chat.extend(lower_to_chat(&self.history));

        // The forced final turn withholds the tool list so the model cannot
        // keep calling tools past the budget.
        let tools = if forced || self.view.tools.is_empty() {
            None
        } else {
            Some(self.view.function_schemas())
        };
        if forced {
            chat.push(ChatMessage::user(FORCED_FINAL_INSTRUCTION));
        }

        let stream = self.settings.streaming.then(|| self.stream_callback(conversation));
        if stream.is_some() {
            self.bus.emit(Event::point(
                EventKind::StreamingStart(StreamingPayload::default()),
                &self.trace,
                2,
                Some(conversation.to_string()),
            ));
        }
        let opts = InvokeOptions {
            bus: self.bus.as_ref(),
            trace: &self.trace,
            parent_id: Some(conversation.to_string()),
            cancel,
            stream,
        };

        let result = self
            .invoker
            .invoke(
                chat,
                tools,
                self.settings.max_tokens,
                self.settings.temperature,
                &opts,
            )
            .await;

        if self.settings.streaming && result.is_ok() {
            self.bus.emit(Event::point(
                EventKind::StreamingEnd(StreamingPayload::default()),
                &self.trace,
                2,
                Some(conversation.to_string()),
            ));
        }
        result
    }

    /// Republish content chunks as `StreamingChunk` events on the same bus
    /// as everything else. Tool-call chunks are never streamed; tool calls
    /// are assembled and dispatched after the LLM turn completes.
    fn stream_callback(&self, conversation: &str) -> StreamCallback {
        let bus = self.bus.clone();
        let trace = self.trace.clone();
        let parent = conversation.to_string();
        let counter = Arc::new(AtomicUsize::new(0));
        Arc::new(move |chunk: &str| {
            let index = counter.fetch_add(1, Ordering::SeqCst);
            bus.emit(Event::point(
                EventKind::StreamingChunk(StreamingPayload {
                    content: chunk.to_string(),
                    index,
                }),
                &trace,
                2,
                Some(parent.clone()),
            ));
        })
    }

    /// Fan all tool calls of one turn out in parallel and reassemble the
    /// responses in call order: the i-th response part answers the i-th
    /// call part, regardless of completion order.
    async fn dispatch_tools(
        &self,
        calls: &[ToolCallRequest],
        conversation: &str,
        cancel: &CancellationToken,
    ) -> Vec<Part> {
        join_all(
            calls
                .iter()
                .map(|call| self.dispatch_one(call, conversation, cancel)),
        )
        .await
    }

    async fn dispatch_one(
        &self,
        call: &ToolCallRequest,
        conversation: &str,
        cancel: &CancellationToken,
    ) -> Part {
        // Correlation id: the provider-supplied id when present, otherwise
        // {trace}:{turn}:{tool}. Chosen once, used for start/end/error.
        let correlation = if call.id.is_empty() {
            format!("{}:{}:{}", self.trace.trace_id, self.turn, call.name)
        } else {
            call.id.clone()
        };
        let response_id = correlation.clone();

        self.bus.emit(Event::with_correlation(
            EventKind::ToolCallStart(ToolCallPayload {
                server: self
                    .view
                    .tool_to_server
                    .get(&call.name)
                    .cloned()
                    .unwrap_or_default(),
                tool: call.name.clone(),
                turn: self.turn,
                arguments: Some(call.arguments.clone()),
                ..Default::default()
            }),
            &self.trace,
            2,
            Some(conversation.to_string()),
            correlation.clone(),
        ));

        let outcome = self.execute_tool(call, conversation, cancel).await;

        let (content, is_error) = match outcome {
            Ok(content) => {
                self.bus.emit(Event::with_correlation(
                    EventKind::ToolCallEnd(ToolCallPayload {
                        server: self
                            .view
                            .tool_to_server
                            .get(&call.name)
                            .cloned()
                            .unwrap_or_default(),
                        tool: call.name.clone(),
                        turn: self.turn,
                        result_chars: Some(content.chars().count()),
                        ..Default::default()
                    }),
                    &self.trace,
                    2,
                    Some(conversation.to_string()),
                    correlation,
                ));
                (content, false)
            }
            Err(e) => {
                self.bus.emit(Event::with_correlation(
                    EventKind::ToolCallError(ToolCallPayload {
                        server: self
                            .view
                            .tool_to_server
                            .get(&call.name)
                            .cloned()
                            .unwrap_or_default(),
                        tool: call.name.clone(),
                        turn: self.turn,
                        error: Some(e.to_string()),
                        ..Default::default()
                    }),
                    &self.trace,
                    2,
                    Some(conversation.to_string()),
                    correlation,
                ));
                // Surfaced to the model as an error payload; it gets a
                // chance to recover on the next turn.
                (format!("Error: {}", e), true)
            }
        };

        let tokens = estimate_tokens(&content);
        Part::ToolResponse {
            id: response_id,
            name: call.name.clone(),
            content,
            is_error,
            turn: self.turn,
            tokens,
            was_compacted: false,
        }
    }

    /// Resolve the owning server and run one tool call, with the per-tool
    /// timeout and a single reconnect-and-retry on a dead transport.
    async fn execute_tool(
        &self,
        call: &ToolCallRequest,
        conversation: &str,
        cancel: &CancellationToken,
    ) -> WeaveResult<String> {
        let server = self
            .view
            .tool_to_server
            .get(&call.name)
            .cloned()
            .ok_or_else(|| {
                let available: Vec<&str> =
                    self.view.tools.iter().map(|t| t.name.as_str()).collect();
                WeaveError::tool(
                    &call.name,
                    ToolErrorKind::Other,
                    format!(
                        "tool '{}' does not exist. Available tools: {}",
                        call.name,
                        available.join(", ")
                    ),
                )
            })?;

        let client = {
            let clients = self.clients.read().await;
            clients.get(&server).cloned()
        }
        .ok_or_else(|| WeaveError::Transport {
            server: server.clone(),
            message: "server is not connected".into(),
        })?;

        let timeout = Duration::from_secs(self.settings.tool_timeout_secs);
        let first = self
            .call_with_timeout(&client, call, timeout, cancel)
            .await;

        match &first {
            Err(e) if e.is_broken_pipe() => {}
            _ => return first,
        }

        // Dead transport mid-request: reconnect once and retry. Any
        // further failure is surfaced to the model, not retried again.
        warn!(server = %server, tool = %call.name, "Broken pipe; requesting fresh connection");
        self.bus.emit(Event::point(
            EventKind::ToolRetry(ToolCallPayload {
                server: server.clone(),
                tool: call.name.clone(),
                turn: self.turn,
                error: first.as_ref().err().map(|e| e.to_string()),
                ..Default::default()
            }),
            &self.trace,
            2,
            Some(conversation.to_string()),
        ));

        let fresh = self
            .federation
            .get_fresh_connection(&server, &self.trace)
            .await?;
        {
            let mut clients = self.clients.write().await;
            clients.insert(server.clone(), fresh.clone());
        }

        self.call_with_timeout(&fresh, call, timeout, cancel).await
    }

    async fn call_with_timeout(
        &self,
        client: &Arc<dyn McpConnection>,
        call: &ToolCallRequest,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> WeaveResult<String> {
        match tokio::time::timeout(
            timeout,
            client.call_tool(&call.name, call.arguments.clone(), cancel),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(WeaveError::tool(
                &call.name,
                ToolErrorKind::Timeout,
                format!("timed out after {}s", timeout.as_secs()),
            )),
        }
    }
}
