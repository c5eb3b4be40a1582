//! In-place compaction of large, old tool responses.
//!
//! Bounds context growth without a summarization call: a tool response is
//! replaced by a short placeholder once it is big enough and old enough
//! that the model is unlikely to need the raw payload again.

use crate::agent::message::{Message, Part};
use crate::config::ContextSettings;
use crate::events::{ContextEditEvaluation, ContextEditPayload};

/// Placeholder left behind for a compacted response.
pub fn compaction_placeholder(tokens: usize) -> String {
    format!("[tool response compacted — {} tokens elided]", tokens)
}

/// Evaluate every tool response in `messages` and compact the eligible
/// ones. Eligible means: estimated tokens at or above the threshold, at
/// least `edit_turn_threshold` turns old, and not compacted before.
/// Returns the evaluations and total tokens saved for the
/// `ContextEditingCompleted` event.
pub fn run_context_editing(
    messages: &mut [Message],
    current_turn: usize,
    settings: &ContextSettings,
) -> ContextEditPayload {
    let mut evaluations = Vec::new();
    let mut tokens_saved = 0usize;

    for message in messages.iter_mut() {
        for part in message.parts.iter_mut() {
            let Part::ToolResponse {
                name,
                content,
                turn,
                tokens,
                was_compacted,
                ..
            } = part
            else {
                continue;
            };

            let eligible = *tokens >= settings.edit_token_threshold
                && current_turn.saturating_sub(*turn) >= settings.edit_turn_threshold as usize
                && !*was_compacted;

            if eligible {
                *content = compaction_placeholder(*tokens);
                *was_compacted = true;
                tokens_saved += *tokens;
            }

            evaluations.push(ContextEditEvaluation {
                turn: *turn,
                tool: name.clone(),
                tokens: *tokens,
                compacted: eligible,
            });
        }
    }

    ContextEditPayload {
        evaluations,
        tokens_saved,
    }
}
