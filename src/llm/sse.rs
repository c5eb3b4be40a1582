use serde_json::Value;

/// A parsed Server-Sent Event.
#[derive(Debug)]
pub struct SseEvent {
    pub event_type: Option<String>,
    pub data: Option<Value>,
}

/// Parse a chunk of SSE text into events. Events are separated by double
/// newlines; each has optional `event:` and `data:` fields. A `[DONE]`
/// data sentinel yields an event with no data.
pub fn parse_sse_chunk(chunk: &str) -> Vec<SseEvent> {
    let mut events = Vec::new();
    let mut current_event_type: Option<String> = None;
    let mut current_data = String::new();

    let mut finish = |event_type: Option<String>, data: &mut String| {
        if data.is_empty() {
            return;
        }
        let trimmed = data.trim().to_string();
        let parsed = if trimmed == "[DONE]" {
            None
        } else {
            serde_json::from_str::<Value>(&trimmed).ok()
        };
        events.push(SseEvent {
            event_type,
            data: parsed,
        });
        data.clear();
    };

    for line in chunk.lines() {
        if line.is_empty() {
            finish(current_event_type.take(), &mut current_data);
        } else if let Some(event_type) = line.strip_prefix("event: ") {
            current_event_type = Some(event_type.trim().to_string());
        } else if let Some(data) = line.strip_prefix("data: ") {
            if !current_data.is_empty() {
                current_data.push('\n');
            }
            current_data.push_str(data);
        }
    }

    // Final event when the chunk does not end with an empty line.
    finish(current_event_type, &mut current_data);

    events
}
