//! Last-resort history compression.
//!
//! When the projected input size crosses the watermark, the old prefix of
//! the history is replaced by a single synthetic system message produced by
//! one LLM call. The split never separates a tool call from its matching
//! tool response.

use crate::agent::message::{Message, Part, Role};

pub const SUMMARIZATION_PROMPT: &str = "Summarize this conversation history concisely while preserving:\n1. The user's question and what has been established so far\n2. Key facts, names, numbers, and tool results\n3. Decisions made and their reasoning\n4. Anything still pending\n\nMessages to summarize:\n{messages}\n\nWrite a concise summary (max 500 words). Do not include preamble - just the summary.";

pub const SUMMARY_MAX_TOKENS: u32 = 2000;
pub const SUMMARY_TEMPERATURE: f32 = 0.3;

/// Largest index `i <= desired` such that splitting `messages` at `i`
/// leaves no tool call in `[0, i)` without its response, and no response
/// without its call. Index 0 is always safe.
pub fn safe_split_index(messages: &[Message], desired: usize) -> usize {
    let desired = desired.min(messages.len());
    let mut open: std::collections::HashSet<&str> = std::collections::HashSet::new();
    let mut best = 0usize;

    for (i, message) in messages.iter().enumerate() {
        if i >= desired && open.is_empty() {
            break;
        }
        if open.is_empty() && i <= desired {
            best = i;
        }
        for id in message.tool_call_ids() {
            open.insert(id);
        }
        for id in message.tool_response_ids() {
            open.remove(id);
        }
        if open.is_empty() && i + 1 <= desired {
            best = i + 1;
        }
    }

    best
}

/// Render the prefix into the text block the summarization prompt embeds.
pub fn format_messages_for_summary(messages: &[Message]) -> String {
    let formatted: Vec<String> = messages
        .iter()
        .map(|m| {
            let role = match m.role {
                Role::System => "system",
                Role::User => "user",
                Role::Assistant => "assistant",
                Role::Tool => "tool",
            };
            format!("{}: {}", role, m.text())
        })
        .collect();
    formatted.join("\n")
}

pub fn build_summary_prompt(messages: &[Message]) -> String {
    SUMMARIZATION_PROMPT.replace("{messages}", &format_messages_for_summary(messages))
}

/// The synthetic message that replaces the summarized prefix.
pub fn build_summary_message(summary: &str) -> Message {
    Message {
        role: Role::System,
        parts: vec![Part::Text {
            text: format!("Summary of the earlier conversation:\n{}", summary),
        }],
    }
}

/// Count tool-call and tool-response parts across a history. Used to check
/// pair integrity after a split.
pub fn count_tool_parts(messages: &[Message]) -> (usize, usize) {
    let mut calls = 0;
    let mut responses = 0;
    for message in messages {
        calls += message.tool_call_ids().len();
        responses += message.tool_response_ids().len();
    }
    (calls, responses)
}
