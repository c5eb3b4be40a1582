use crate::llm::{ChatMessage, ToolCallRequest};
use serde::{Deserialize, Serialize};
use serde_json::Value;

const CHARS_PER_TOKEN_ESTIMATE: usize = 4;

/// Rough token estimate (chars / 4). Char count rather than byte count so
/// non-ASCII text is not over-counted.
pub fn estimate_tokens(text: &str) -> usize {
    text.chars().count() / CHARS_PER_TOKEN_ESTIMATE
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

/// One ordered part of a message. A `ToolCall` part binds to exactly one
/// `ToolResponse` part through its id; part order within a message is
/// significant and preserved end to end.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Part {
    Text {
        text: String,
    },
    ImageRef {
        uri: String,
    },
    ToolCall {
        id: String,
        name: String,
        arguments: Value,
    },
    ToolResponse {
        id: String,
        name: String,
        content: String,
        is_error: bool,
        /// Turn on which the response was produced; drives compaction
        /// eligibility.
        turn: usize,
        /// Token estimate captured when the response was appended.
        tokens: usize,
        /// Set once the context editor has replaced the content.
        was_compacted: bool,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Message {
    pub role: Role,
    pub parts: Vec<Part>,
}

impl Message {
    pub fn system(text: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            parts: vec![Part::Text { text: text.into() }],
        }
    }

    pub fn user(text: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            parts: vec![Part::Text { text: text.into() }],
        }
    }

    pub fn assistant(text: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            parts: vec![Part::Text { text: text.into() }],
        }
    }

    /// Assistant message carrying tool-call parts after any text.
    pub fn assistant_with_calls(text: Option<String>, calls: &[ToolCallRequest]) -> Self {
        let mut parts = Vec::new();
        if let Some(text) = text
            && !text.is_empty()
        {
            parts.push(Part::Text { text });
        }
        for call in calls {
            parts.push(Part::ToolCall {
                id: call.id.clone(),
                name: call.name.clone(),
                arguments: call.arguments.clone(),
            });
        }
        Self {
            role: Role::Assistant,
            parts,
        }
    }

    pub fn tool_responses(parts: Vec<Part>) -> Self {
        Self {
            role: Role::Tool,
            parts,
        }
    }

    /// All text content joined; tool payloads included for token counting.
    pub fn text(&self) -> String {
        let mut out = String::new();
        for part in &self.parts {
            let fragment = match part {
                Part::Text { text } => text.clone(),
                Part::ImageRef { uri } => format!("[image: {}]", uri),
                Part::ToolCall { name, arguments, .. } => {
                    format!("{}({})", name, arguments)
                }
                Part::ToolResponse { content, .. } => content.clone(),
            };
            if !out.is_empty() {
                out.push('\n');
            }
            out.push_str(&fragment);
        }
        out
    }

    pub fn estimated_tokens(&self) -> usize {
        estimate_tokens(&self.text())
    }

    pub fn tool_call_ids(&self) -> Vec<&str> {
        self.parts
            .iter()
            .filter_map(|p| match p {
                Part::ToolCall { id, .. } => Some(id.as_str()),
                _ => None,
            })
            .collect()
    }

    pub fn tool_response_ids(&self) -> Vec<&str> {
        self.parts
            .iter()
            .filter_map(|p| match p {
                Part::ToolResponse { id, .. } => Some(id.as_str()),
                _ => None,
            })
            .collect()
    }
}

pub fn estimate_history_tokens(messages: &[Message]) -> usize {
    messages.iter().map(Message::estimated_tokens).sum()
}

/// Lower part-structured messages to the flat wire shape providers take.
/// A tool message with `n` response parts becomes `n` wire messages, in
/// part order.
pub fn lower_to_chat(messages: &[Message]) -> Vec<ChatMessage> {
    let mut out = Vec::new();
    for message in messages {
        match message.role {
            Role::System => out.push(ChatMessage::system(message.text())),
            Role::User => out.push(ChatMessage::user(message.text())),
            Role::Assistant => {
                let mut text = String::new();
                let mut calls = Vec::new();
                for part in &message.parts {
                    match part {
                        Part::Text { text: t } => {
                            if !text.is_empty() {
                                text.push('\n');
                            }
                            text.push_str(t);
                        }
                        Part::ImageRef { uri } => {
                            if !text.is_empty() {
                                text.push('\n');
                            }
                            text.push_str(&format!("[image: {}]", uri));
                        }
                        Part::ToolCall { id, name, arguments } => calls.push(ToolCallRequest {
                            id: id.clone(),
                            name: name.clone(),
                            arguments: arguments.clone(),
                        }),
                        Part::ToolResponse { .. } => {}
                    }
                }
                let calls = if calls.is_empty() { None } else { Some(calls) };
                out.push(ChatMessage::assistant(text, calls));
            }
            Role::Tool => {
                for part in &message.parts {
                    if let Part::ToolResponse {
                        id,
                        content,
                        is_error,
                        ..
                    } = part
                    {
                        out.push(ChatMessage::tool_result(id.clone(), content.clone(), *is_error));
                    }
                }
            }
        }
    }
    out
}
