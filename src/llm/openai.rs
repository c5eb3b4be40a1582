use crate::llm::{
    ChatMessage, ChatRequest, LlmResponse, ProviderError, TokenUsage, ToolCallRequest,
};
use async_trait::async_trait;
use reqwest::Client;
use serde_json::{Map, Value, json};
use std::time::Duration;
use tracing::warn;

const OPENAI_API_URL: &str = "https://api.openai.com/v1/chat/completions";
const OPENROUTER_API_URL: &str = "https://openrouter.ai/api/v1/chat/completions";
const CONNECT_TIMEOUT_SECS: u64 = 30;
const REQUEST_TIMEOUT_SECS: u64 = 180;

/// Chat-completions provider. Serves both OpenAI and OpenRouter; the wire
/// format is identical, only the endpoint and key differ.
pub struct OpenAiProvider {
    name: String,
    api_key: String,
    default_model: String,
    base_url: String,
    client: Client,
}

impl OpenAiProvider {
    pub fn openai(api_key: String, default_model: Option<String>) -> Self {
        Self::with_base_url(
            "openai",
            api_key,
            default_model.unwrap_or_else(|| "gpt-4o".to_string()),
            OPENAI_API_URL.to_string(),
        )
    }

    pub fn openrouter(api_key: String, default_model: Option<String>) -> Self {
        Self::with_base_url(
            "openrouter",
            api_key,
            default_model.unwrap_or_else(|| "anthropic/claude-sonnet-4.5".to_string()),
            OPENROUTER_API_URL.to_string(),
        )
    }

    pub fn with_base_url(
        name: &str,
        api_key: String,
        default_model: String,
        base_url: String,
    ) -> Self {
        Self {
            name: name.to_string(),
            api_key,
            default_model,
            base_url,
            client: Client::builder()
                .connect_timeout(Duration::from_secs(CONNECT_TIMEOUT_SECS))
                .build()
                .unwrap_or_else(|_| Client::new()),
        }
    }
}

fn convert_messages(messages: &[ChatMessage]) -> Vec<Value> {
    let mut converted = Vec::new();
    for msg in messages {
        match msg.role.as_str() {
            "tool" => {
                if let Some(tool_call_id) = &msg.tool_call_id {
                    converted.push(json!({
                        "role": "tool",
                        "tool_call_id": tool_call_id,
                        "content": msg.content,
                    }));
                }
            }
            "assistant" => {
                let mut message = json!({"role": "assistant", "content": msg.content});
                if let Some(tool_calls) = &msg.tool_calls
                    && !tool_calls.is_empty()
                {
                    let calls: Vec<Value> = tool_calls
                        .iter()
                        .map(|tc| {
                            json!({
                                "id": tc.id,
                                "type": "function",
                                "function": {
                                    "name": tc.name,
                                    "arguments": tc.arguments.to_string(),
                                },
                            })
                        })
                        .collect();
                    message["tool_calls"] = json!(calls);
                }
                converted.push(message);
            }
            role => {
                converted.push(json!({"role": role, "content": msg.content}));
            }
        }
    }
    converted
}

fn parse_response(json: &Value) -> LlmResponse {
    let message = &json["choices"][0]["message"];
    let content = message["content"].as_str().map(str::to_string);
    let reasoning_content = message["reasoning_content"].as_str().map(str::to_string);

    let mut tool_calls = Vec::new();
    if let Some(calls) = message["tool_calls"].as_array() {
        for call in calls {
            let function = &call["function"];
            let arguments = function["arguments"]
                .as_str()
                .and_then(|raw| serde_json::from_str::<Value>(raw).ok())
                .unwrap_or_else(|| {
                    warn!("Malformed tool call arguments from provider");
                    json!({})
                });
            tool_calls.push(ToolCallRequest {
                id: call["id"].as_str().unwrap_or("").to_string(),
                name: function["name"].as_str().unwrap_or("").to_string(),
                arguments,
            });
        }
    }

    let usage = json.get("usage").and_then(Value::as_object).map(|u| {
        TokenUsage {
            input_tokens: u.get("prompt_tokens").and_then(Value::as_u64),
            output_tokens: u.get("completion_tokens").and_then(Value::as_u64),
            total_tokens: u.get("total_tokens").and_then(Value::as_u64),
            cache_read_tokens: u
                .get("prompt_tokens_details")
                .and_then(|d| d.get("cached_tokens"))
                .and_then(Value::as_u64),
            reasoning_tokens: u
                .get("completion_tokens_details")
                .and_then(|d| d.get("reasoning_tokens"))
                .and_then(Value::as_u64),
        }
    });

    let generation_info = json
        .get("usage")
        .and_then(Value::as_object)
        .cloned()
        .unwrap_or_else(Map::new);

    LlmResponse {
        content: content.filter(|c| !c.is_empty()),
        tool_calls,
        reasoning_content,
        usage: usage.filter(|u| !u.is_empty()),
        generation_info,
    }
}

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
    if status == 400 && (lower.contains("context length") || lower.contains("too long")) {
        return ProviderError::MaxTokens;
    }
    ProviderError::Api { status, message }
}

#[async_trait]
impl crate::llm::LlmProvider for OpenAiProvider {
    fn name(&self) -> &str {
        &self.name
    }

    fn default_model(&self) -> &str {
        &self.default_model
    }

    async fn chat(&self, req: ChatRequest<'_>) -> Result<LlmResponse, ProviderError> {
        let mut payload = json!({
            "model": req.model.unwrap_or(&self.default_model),
            "messages": convert_messages(&req.messages),
            "max_tokens": req.max_tokens,
            "temperature": req.temperature,
        });
        if let Some(tools) = &req.tools {
            let wrapped: Vec<Value> = tools
                .iter()
                .map(|t| json!({"type": "function", "function": t}))
                .collect();
            payload["tools"] = json!(wrapped);
        }

        let resp = self
            .client
            .post(&self.base_url)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .json(&payload)
            .timeout(Duration::from_secs(REQUEST_TIMEOUT_SECS))
            .send()
            .await
            .map_err(|e| ProviderError::Connection(e.to_string()))?;

        let status = resp.status().as_u16();
        if status == 429 {
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

        let json = resp
            .json::<Value>()
            .await
            .map_err(|e| ProviderError::Connection(format!("reading response body: {}", e)))?;
        Ok(parse_response(&json))
    }
}
