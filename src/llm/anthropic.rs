use crate::llm::sse::parse_sse_chunk;
use crate::llm::{
    ChatMessage, ChatRequest, LlmResponse, ProviderError, StreamCallback, TokenUsage,
    ToolCallRequest,
};
use async_trait::async_trait;
use futures_util::StreamExt;
use reqwest::Client;
use serde_json::{Map, Value, json};
use std::time::Duration;
use tracing::warn;

const API_URL: &str = "https://api.anthropic.com/v1/messages";
const API_VERSION: &str = "2023-06-01";
const CONNECT_TIMEOUT_SECS: u64 = 30;
const REQUEST_TIMEOUT_SECS: u64 = 180;
const STREAM_CHUNK_TIMEOUT_SECS: u64 = 120;

pub struct AnthropicProvider {
    api_key: String,
    default_model: String,
    base_url: String,
    client: Client,
}

impl AnthropicProvider {
    pub fn new(api_key: String, default_model: Option<String>) -> Self {
        Self::with_base_url(api_key, default_model, API_URL.to_string())
    }

    pub fn with_base_url(api_key: String, default_model: Option<String>, base_url: String) -> Self {
        Self {
            api_key,
            default_model: default_model
                .unwrap_or_else(|| "claude-sonnet-4-5-20250929".to_string()),
            base_url,
            client: Client::builder()
                .connect_timeout(Duration::from_secs(CONNECT_TIMEOUT_SECS))
                .build()
                .unwrap_or_else(|_| Client::new()),
        }
    }

    fn build_payload(&self, req: &ChatRequest<'_>, stream: bool) -> Value {
        let (system, messages) = convert_messages(&req.messages);

        let mut payload = json!({
            "model": req.model.unwrap_or(&self.default_model),
            "messages": messages,
            "max_tokens": req.max_tokens,
            "temperature": req.temperature,
        });
        if stream {
            payload["stream"] = json!(true);
        }
        if let Some(system) = system {
            payload["system"] = json!(system);
        }
        if let Some(tools) = &req.tools {
            let anthropic_tools: Vec<Value> = tools
                .iter()
                .map(|t| {
                    json!({
                        "name": t["name"],
                        "description": t["description"],
                        "input_schema": t["parameters"],
                    })
                })
                .collect();
            payload["tools"] = json!(anthropic_tools);
        }
        payload
    }

    async fn check_response(resp: reqwest::Response) -> Result<Value, ProviderError> {
        let status = resp.status().as_u16();
        if status == 429 || status == 529 {
            let retry_after = resp
                .headers()
                .get("retry-after")
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.parse::<u64>().ok());
            return Err(ProviderError::Throttled { retry_after });
        }
        if !(200..300).contains(&status) {
            let text = resp.text().await.unwrap_or_default();
            return Err(classify_api_error(status, &text));
        }
        resp.json::<Value>()
            .await
            .map_err(|e| ProviderError::Connection(format!("reading response body: {}", e)))
    }
}

/// Map a non-2xx Anthropic response to a [`ProviderError`]. Context-window
/// overruns come back as invalid_request with a "prompt is too long" style
/// message; those become `MaxTokens` so the caller can summarize and retry.
fn classify_api_error(status: u16, body: &str) -> ProviderError {
    let message = serde_json::from_str::<Value>(body)
        .ok()
        .and_then(|v| {
            v.get("error")
                .and_then(|e| e.get("message"))
                .and_then(Value::as_str)
                .map(str::to_string)
        })
        .unwrap_or_else(|| body.to_string());

    let lower = message.to_ascii_lowercase();
    if status == 400 && (lower.contains("too long") || lower.contains("context")) {
        return ProviderError::MaxTokens;
    }
    ProviderError::Api { status, message }
}

/// Convert flat chat messages to the Anthropic content-block format.
/// Returns `(system_prompt, messages)`; tool results become `tool_result`
/// blocks on user-role messages, and consecutive user messages are merged
/// (the API rejects consecutive same-role messages).
fn convert_messages(messages: &[ChatMessage]) -> (Option<String>, Vec<Value>) {
    let mut system_parts = Vec::new();
    let mut converted: Vec<Value> = Vec::new();

    for msg in messages {
        match msg.role.as_str() {
            "system" => system_parts.push(msg.content.clone()),
            "user" => {
                converted.push(json!({"role": "user", "content": msg.content}));
            }
            "assistant" => {
                let mut content: Vec<Value> = Vec::new();
                if !msg.content.is_empty() {
                    content.push(json!({"type": "text", "text": msg.content}));
                }
                if let Some(tool_calls) = &msg.tool_calls {
                    for tc in tool_calls {
                        content.push(json!({
                            "type": "tool_use",
                            "id": tc.id,
                            "name": tc.name,
                            "input": tc.arguments,
                        }));
                    }
                }
                converted.push(json!({"role": "assistant", "content": content}));
            }
            "tool" => {
                if let Some(tool_call_id) = &msg.tool_call_id {
                    let mut result = json!({
                        "type": "tool_result",
                        "tool_use_id": tool_call_id,
                        "content": msg.content,
                    });
                    if msg.is_error {
                        result["is_error"] = json!(true);
                    }
                    converted.push(json!({"role": "user", "content": [result]}));
                }
            }
            _ => {}
        }
    }

    let system = if system_parts.is_empty() {
        None
    } else {
        Some(system_parts.join("\n\n"))
    };

    // Merge consecutive user messages (multiple tool results in a row).
    let mut merged: Vec<Value> = Vec::new();
    for msg in converted {
        if let Some(last) = merged.last_mut()
            && last["role"] == "user"
            && msg["role"] == "user"
        {
            let mut combined = to_blocks(&last["content"]);
            combined.extend(to_blocks(&msg["content"]));
            last["content"] = Value::Array(combined);
            continue;
        }
        merged.push(msg);
    }

    (system, merged)
}

fn to_blocks(content: &Value) -> Vec<Value> {
    match content {
        Value::Array(arr) => arr.clone(),
        Value::String(s) => vec![json!({"type": "text", "text": s})],
        other => vec![other.clone()],
    }
}

fn parse_usage(usage: &Value) -> TokenUsage {
    let input = usage.get("input_tokens").and_then(Value::as_u64);
    let output = usage.get("output_tokens").and_then(Value::as_u64);
    TokenUsage {
        input_tokens: input,
        output_tokens: output,
        total_tokens: match (input, output) {
            (Some(i), Some(o)) => Some(i + o),
            _ => None,
        },
        cache_read_tokens: usage.get("cache_read_input_tokens").and_then(Value::as_u64),
        reasoning_tokens: None,
    }
}

fn parse_response(json: &Value) -> LlmResponse {
    let mut content = None;
    let mut reasoning_content = None;
    let mut tool_calls = Vec::new();

    if let Some(blocks) = json["content"].as_array() {
        for block in blocks {
            match block["type"].as_str() {
                Some("text") => {
                    if content.is_none() {
                        content = block["text"].as_str().map(str::to_string);
                    }
                }
                Some("thinking") => {
                    reasoning_content = block["text"].as_str().map(str::to_string);
                }
                Some("tool_use") => {
                    tool_calls.push(ToolCallRequest {
                        id: block["id"].as_str().unwrap_or("").to_string(),
                        name: block["name"].as_str().unwrap_or("").to_string(),
                        arguments: block.get("input").cloned().unwrap_or(json!({})),
                    });
                }
                _ => {}
            }
        }
    }

    let usage = json.get("usage").map(parse_usage).filter(|u| !u.is_empty());
    let generation_info = json
        .get("usage")
        .and_then(Value::as_object)
        .cloned()
        .unwrap_or_else(Map::new);

    LlmResponse {
        content,
        tool_calls,
        reasoning_content,
        usage,
        generation_info,
    }
}

#[async_trait]
impl crate::llm::LlmProvider for AnthropicProvider {
    fn name(&self) -> &str {
        "anthropic"
    }

    fn default_model(&self) -> &str {
        &self.default_model
    }

    async fn chat(&self, req: ChatRequest<'_>) -> Result<LlmResponse, ProviderError> {
        let payload = self.build_payload(&req, false);
        let resp = self
            .client
            .post(&self.base_url)
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", API_VERSION)
            .json(&payload)
            .timeout(Duration::from_secs(REQUEST_TIMEOUT_SECS))
            .send()
            .await
            .map_err(|e| ProviderError::Connection(e.to_string()))?;

        let json = Self::check_response(resp).await?;
        Ok(parse_response(&json))
    }

    async fn chat_stream(
        &self,
        req: ChatRequest<'_>,
        callback: StreamCallback,
    ) -> Result<LlmResponse, ProviderError> {
        let payload = self.build_payload(&req, true);
        let resp = self
            .client
            .post(&self.base_url)
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", API_VERSION)
            .json(&payload)
            .send()
            .await
            .map_err(|e| ProviderError::Connection(e.to_string()))?;

        let status = resp.status().as_u16();
        if status == 429 || status == 529 {
            let retry_after = resp
                .headers()
                .get("retry-after")
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.parse::<u64>().ok());
            return Err(ProviderError::Throttled { retry_after });
        }
        if !(200..300).contains(&status) {
            let text = resp.text().await.unwrap_or_default();
            return Err(classify_api_error(status, &text));
        }

        let mut content = String::new();
        let mut tool_calls: Vec<ToolCallRequest> = Vec::new();
        let mut current_tool_id = String::new();
        let mut current_tool_name = String::new();
        let mut current_tool_json = String::new();
        let mut usage = TokenUsage::default();
        let mut buf = String::new();

        let mut stream = resp.bytes_stream();
        loop {
            let chunk = tokio::time::timeout(
                Duration::from_secs(STREAM_CHUNK_TIMEOUT_SECS),
                stream.next(),
            )
            .await
            .map_err(|_| {
                ProviderError::Connection("stream timed out waiting for next chunk".into())
            })?;

            let Some(chunk) = chunk else { break };
            let chunk = chunk.map_err(|e| ProviderError::Connection(e.to_string()))?;
            buf.push_str(&String::from_utf8_lossy(&chunk));

            // Process complete SSE events; keep trailing partial data.
            let boundary = buf.rfind("\n\n").map(|idx| idx + 2);
            let complete = match boundary {
                Some(idx) => {
                    let complete = buf[..idx].to_string();
                    buf = buf[idx..].to_string();
                    complete
                }
                None => continue,
            };

            for event in parse_sse_chunk(&complete) {
                let Some(data) = event.data else { continue };
                match data["type"].as_str() {
                    Some("content_block_start") => {
                        let block = &data["content_block"];
                        if block["type"] == "tool_use" {
                            current_tool_id = block["id"].as_str().unwrap_or("").to_string();
                            current_tool_name = block["name"].as_str().unwrap_or("").to_string();
                            current_tool_json.clear();
                        }
                    }
                    Some("content_block_delta") => {
                        let delta = &data["delta"];
                        match delta["type"].as_str() {
                            Some("text_delta") => {
                                if let Some(text) = delta["text"].as_str() {
                                    content.push_str(text);
                                    callback(text);
                                }
                            }
                            Some("input_json_delta") => {
                                if let Some(partial) = delta["partial_json"].as_str() {
                                    current_tool_json.push_str(partial);
                                }
                            }
                            _ => {}
                        }
                    }
                    Some("content_block_stop") => {
                        if !current_tool_name.is_empty() {
                            let arguments = if current_tool_json.is_empty() {
                                json!({})
                            } else {
                                serde_json::from_str(&current_tool_json).unwrap_or_else(|e| {
                                    warn!(
                                        tool = %current_tool_name,
                                        error = %e,
                                        "Malformed streamed tool arguments"
                                    );
                                    json!({})
                                })
                            };
                            tool_calls.push(ToolCallRequest {
                                id: std::mem::take(&mut current_tool_id),
                                name: std::mem::take(&mut current_tool_name),
                                arguments,
                            });
                            current_tool_json.clear();
                        }
                    }
                    Some("message_start") => {
                        if let Some(u) = data["message"].get("usage") {
                            usage.input_tokens = u.get("input_tokens").and_then(Value::as_u64);
                            usage.cache_read_tokens =
                                u.get("cache_read_input_tokens").and_then(Value::as_u64);
                        }
                    }
                    Some("message_delta") => {
                        if let Some(u) = data.get("usage") {
                            usage.output_tokens = u.get("output_tokens").and_then(Value::as_u64);
                        }
                    }
                    _ => {}
                }
            }
        }

        if let (Some(i), Some(o)) = (usage.input_tokens, usage.output_tokens) {
            usage.total_tokens = Some(i + o);
        }

        Ok(LlmResponse {
            content: if content.is_empty() { None } else { Some(content) },
            tool_calls,
            reasoning_content: None,
            usage: if usage.is_empty() { None } else { Some(usage) },
            generation_info: Map::new(),
        })
    }
}
