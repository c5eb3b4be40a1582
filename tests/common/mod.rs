//! Shared mock toolkit for integration tests: a scripted MCP connector, a
//! scripted LLM provider, and an event collector.

#![allow(dead_code)]

use async_trait::async_trait;
use mcpweave::config::{ServerConfig, TransportKind};
use mcpweave::errors::{ToolErrorKind, WeaveError, WeaveResult};
use mcpweave::events::{Event, EventSubscriber};
use mcpweave::llm::{ChatRequest, LlmProvider, LlmResponse, ProviderError, ToolCallRequest};
use mcpweave::mcp::capability::{PromptSpec, ResourceSpec, ToolSpec};
use mcpweave::mcp::{McpConnection, McpConnector};
use serde_json::{Value, json};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio_util::sync::CancellationToken;

// ---- Mock MCP federation ----

/// One scripted result for a tool call.
#[derive(Debug, Clone)]
pub enum ToolScript {
    Ok(String),
    BrokenPipe,
    Error(String),
}

/// Blueprint for a mock server. Scripts and counters are shared across
/// reconnects, so a broken-pipe script step is consumed by the first
/// connection and the retry on the fresh connection sees the next step.
pub struct MockServer {
    pub name: String,
    pub tools: Vec<ToolSpec>,
    pub prompts: Vec<PromptSpec>,
    pub rendered_prompts: HashMap<String, String>,
    pub resources: Vec<ResourceSpec>,
    scripts: Mutex<HashMap<String, VecDeque<ToolScript>>>,
    pub connect_count: AtomicUsize,
    pub call_log: Mutex<Vec<(String, Value)>>,
}

impl MockServer {
    pub fn new(name: &str) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            tools: vec![],
            prompts: vec![],
            rendered_prompts: HashMap::new(),
            resources: vec![],
            scripts: Mutex::new(HashMap::new()),
            connect_count: AtomicUsize::new(0),
            call_log: Mutex::new(Vec::new()),
        })
    }

    pub fn with_tools(name: &str, tool_names: &[&str]) -> Arc<Self> {
        let mut server = Self {
            name: name.to_string(),
            tools: tool_names.iter().map(|t| tool(t, name)).collect(),
            prompts: vec![],
            rendered_prompts: HashMap::new(),
            resources: vec![],
            scripts: Mutex::new(HashMap::new()),
            connect_count: AtomicUsize::new(0),
            call_log: Mutex::new(Vec::new()),
        };
        for t in tool_names {
            server
                .scripts
                .get_mut()
                .unwrap()
                .insert((*t).to_string(), VecDeque::new());
        }
        Arc::new(server)
    }

    pub fn script_tool(&self, tool: &str, results: Vec<ToolScript>) {
        let mut scripts = self.scripts.lock().unwrap();
        scripts.insert(tool.to_string(), results.into());
    }

    fn next_result(&self, tool: &str) -> ToolScript {
        let mut scripts = self.scripts.lock().unwrap();
        scripts
            .get_mut(tool)
            .and_then(VecDeque::pop_front)
            .unwrap_or_else(|| ToolScript::Ok(format!("{} default result", tool)))
    }

    pub fn calls(&self) -> Vec<(String, Value)> {
        self.call_log.lock().unwrap().clone()
    }
}

pub fn tool(name: &str, server: &str) -> ToolSpec {
    ToolSpec {
        name: name.to_string(),
        description: format!("The {} tool", name),
        parameters: json!({
            "type": "object",
            "properties": {"query": {"type": "string"}},
        }),
        server: server.to_string(),
    }
}

pub struct MockConnection {
    server: Arc<MockServer>,
}

#[async_trait]
impl McpConnection for MockConnection {
    fn server_name(&self) -> &str {
        &self.server.name
    }

    fn transport_kind(&self) -> TransportKind {
        TransportKind::Stdio
    }

    async fn list_tools(&self) -> WeaveResult<Vec<ToolSpec>> {
        Ok(self.server.tools.clone())
    }

    async fn list_prompts(&self) -> WeaveResult<Vec<PromptSpec>> {
        Ok(self.server.prompts.clone())
    }

    async fn get_prompt(&self, name: &str) -> WeaveResult<String> {
        Ok(self
            .server
            .rendered_prompts
            .get(name)
            .cloned()
            .unwrap_or_default())
    }

    async fn list_resources(&self) -> WeaveResult<Vec<ResourceSpec>> {
        Ok(self.server.resources.clone())
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
        self.server
            .call_log
            .lock()
            .unwrap()
            .push((name.to_string(), args));
        match self.server.next_result(name) {
            ToolScript::Ok(result) => Ok(result),
            ToolScript::BrokenPipe => Err(WeaveError::tool(
                name,
                ToolErrorKind::BrokenPipe,
                "broken pipe",
            )),
            ToolScript::Error(message) => {
                Err(WeaveError::tool(name, ToolErrorKind::Other, message))
            }
        }
    }

    async fn close(&self) -> WeaveResult<()> {
        Ok(())
    }
}

/// Connector that serves mock connections from registered blueprints.
pub struct MockConnector {
    servers: Mutex<HashMap<String, Arc<MockServer>>>,
}

impl MockConnector {
    pub fn new(servers: Vec<Arc<MockServer>>) -> Arc<Self> {
        Arc::new(Self {
            servers: Mutex::new(
                servers
                    .into_iter()
                    .map(|s| (s.name.clone(), s))
                    .collect(),
            ),
        })
    }

    pub fn connect_count(&self, server: &str) -> usize {
        self.servers
            .lock()
            .unwrap()
            .get(server)
            .map_or(0, |s| s.connect_count.load(Ordering::SeqCst))
    }
}

#[async_trait]
impl McpConnector for MockConnector {
    async fn connect(
        &self,
        name: &str,
        _config: &ServerConfig,
    ) -> WeaveResult<Arc<dyn McpConnection>> {
        let server = {
            let servers = self.servers.lock().unwrap();
            servers.get(name).cloned()
        }
        .ok_or_else(|| WeaveError::Transport {
            server: name.to_string(),
            message: "connection refused".into(),
        })?;
        server.connect_count.fetch_add(1, Ordering::SeqCst);
        Ok(Arc::new(MockConnection { server }))
    }
}

// ---- Mock LLM provider ----

#[derive(Clone)]
pub struct RecordedCall {
    pub messages: Vec<mcpweave::llm::ChatMessage>,
    pub tool_count: usize,
}

pub struct MockProvider {
    name: String,
    script: Mutex<VecDeque<Result<LlmResponse, ProviderError>>>,
    pub calls: Arc<Mutex<Vec<RecordedCall>>>,
}

impl MockProvider {
    pub fn with_responses(script: Vec<Result<LlmResponse, ProviderError>>) -> Arc<Self> {
        Arc::new(Self {
            name: "mock".to_string(),
            script: Mutex::new(script.into()),
            calls: Arc::new(Mutex::new(Vec::new())),
        })
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }
}

#[async_trait]
impl LlmProvider for MockProvider {
    fn name(&self) -> &str {
        &self.name
    }

    fn default_model(&self) -> &str {
        "mock-model"
    }

    async fn chat(&self, req: ChatRequest<'_>) -> Result<LlmResponse, ProviderError> {
        self.calls.lock().unwrap().push(RecordedCall {
            messages: req.messages.clone(),
            tool_count: req.tools.as_ref().map_or(0, Vec::len),
        });
        let mut script = self.script.lock().unwrap();
        script
            .pop_front()
            .unwrap_or_else(|| Err(ProviderError::Other("mock script exhausted".into())))
    }
}

pub fn text_response(text: &str) -> Result<LlmResponse, ProviderError> {
    Ok(LlmResponse {
        content: Some(text.to_string()),
        ..Default::default()
    })
}

pub fn tool_call(id: &str, name: &str, args: Value) -> ToolCallRequest {
    ToolCallRequest {
        id: id.to_string(),
        name: name.to_string(),
        arguments: args,
    }
}

pub fn tool_call_response(calls: Vec<ToolCallRequest>) -> Result<LlmResponse, ProviderError> {
    Ok(LlmResponse {
        content: None,
        tool_calls: calls,
        ..Default::default()
    })
}

// ---- Event collection ----

pub struct EventCollector {
    pub events: Mutex<Vec<Event>>,
}

impl EventCollector {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            events: Mutex::new(Vec::new()),
        })
    }

    pub fn types(&self) -> Vec<String> {
        self.events
            .lock()
            .unwrap()
            .iter()
            .map(|e| e.event_type().to_string())
            .collect()
    }

    pub fn count_of(&self, event_type: &str) -> usize {
        self.types().iter().filter(|t| t.as_str() == event_type).count()
    }

    pub fn snapshot(&self) -> Vec<Event> {
        self.events.lock().unwrap().clone()
    }
}

impl EventSubscriber for EventCollector {
    fn on_event(&self, event: &Event) {
        self.events.lock().unwrap().push(event.clone());
    }
}
