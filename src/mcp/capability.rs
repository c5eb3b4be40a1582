use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

/// A tool in the federated view. `server` names the connection that owns
/// dispatch for this tool.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToolSpec {
    pub name: String,
    pub description: String,
    /// JSON Schema for the tool parameters, normalized by
    /// [`normalize_tool_schema`] exactly once, before caching.
    pub parameters: Value,
    pub server: String,
}

/// A prompt in the federated view. The full rendered content is fetched
/// eagerly during discovery and stored in `description`, which makes cache
/// entries self-sufficient for offline system-prompt construction.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PromptSpec {
    pub name: String,
    pub description: String,
    pub server: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ResourceSpec {
    pub uri: String,
    pub name: String,
    pub description: String,
    pub mime_type: String,
    pub server: String,
}

/// Normalize a tool parameter schema in place:
///
/// - every array-typed schema gets a default `items: {}` when missing
///   (recursively, so nested arrays are covered too),
/// - `$schema` is stripped,
/// - the top-level `type` defaults to `object`.
///
/// Runs exactly once, before the schema enters the cache. Readers must not
/// re-normalize: entries are returned as stored.
pub fn normalize_tool_schema(schema: &mut Value) {
    if !schema.is_object() {
        *schema = json!({"type": "object"});
        return;
    }

    if let Some(obj) = schema.as_object_mut() {
        obj.remove("$schema");
        if !obj.contains_key("type") {
            obj.insert("type".to_string(), json!("object"));
        }
    }
    normalize_subschema(schema);
}

fn normalize_subschema(schema: &mut Value) {
    let Some(obj) = schema.as_object_mut() else {
        return;
    };

    if obj.get("type").and_then(Value::as_str) == Some("array") && !obj.contains_key("items") {
        obj.insert("items".to_string(), json!({}));
    }

    if let Some(items) = obj.get_mut("items") {
        normalize_subschema(items);
    }
    if let Some(Value::Object(props)) = obj.get_mut("properties") {
        for prop in props.values_mut() {
            normalize_subschema(prop);
        }
    }
    if let Some(Value::Object(defs)) = obj.get_mut("definitions") {
        for def in defs.values_mut() {
            normalize_subschema(def);
        }
    }
    for key in ["anyOf", "oneOf", "allOf"] {
        if let Some(Value::Array(variants)) = obj.get_mut(key) {
            for variant in variants.iter_mut() {
                normalize_subschema(variant);
            }
        }
    }
}

/// Convert an rmcp tool description into the internal [`ToolSpec`],
/// normalizing the schema on the way.
pub fn tool_from_rmcp(tool: &rmcp::model::Tool, server: &str) -> ToolSpec {
    let mut parameters = Value::Object((*tool.input_schema).clone());
    normalize_tool_schema(&mut parameters);
    ToolSpec {
        name: tool.name.to_string(),
        description: tool.description.as_deref().unwrap_or("").to_string(),
        parameters,
        server: server.to_string(),
    }
}

/// The function-declaration shape providers expect for a tool.
pub fn tool_to_function_schema(tool: &ToolSpec) -> Value {
    json!({
        "name": tool.name,
        "description": tool.description,
        "parameters": tool.parameters,
    })
}

/// Extract the text of a prompt result: all text-bearing message parts,
/// newline-joined.
pub fn prompt_text_from_messages(messages: &[rmcp::model::PromptMessage]) -> String {
    let mut parts = Vec::new();
    for message in messages {
        // Serialize the content rather than matching rmcp's content enum;
        // only the "text" fields matter here.
        if let Ok(value) = serde_json::to_value(&message.content) {
            collect_text_fields(&value, &mut parts);
        }
    }
    parts.join("\n")
}

fn collect_text_fields(value: &Value, out: &mut Vec<String>) {
    match value {
        Value::Object(map) => {
            if let Some(text) = map.get("text").and_then(Value::as_str) {
                out.push(text.to_string());
            } else {
                for v in map.values() {
                    collect_text_fields(v, out);
                }
            }
        }
        Value::Array(arr) => {
            for v in arr {
                collect_text_fields(v, out);
            }
        }
        _ => {}
    }
}

/// Flatten an MCP tool-call result into a single text payload the model
/// can read. Non-text blocks become bracketed placeholders.
pub fn text_from_call_result(result: &rmcp::model::CallToolResult) -> String {
    use rmcp::model::RawContent;
    use std::fmt::Write as _;

    let mut output = String::new();
    for content in &result.content {
        if !output.is_empty() {
            output.push('\n');
        }
        match &content.raw {
            RawContent::Text(text) => output.push_str(&text.text),
            RawContent::Image(img) => {
                let _ = write!(output, "[Image: {} ({} bytes)]", img.mime_type, img.data.len());
            }
            RawContent::Audio(audio) => {
                let _ = write!(
                    output,
                    "[Audio: {} ({} bytes)]",
                    audio.mime_type,
                    audio.data.len()
                );
            }
            _ => output.push_str("[Unsupported MCP content type]"),
        }
    }

    if output.is_empty() {
        output = "(no output)".to_string();
    }
    output
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Capabilities {
    pub tools: Vec<ToolSpec>,
    pub prompts: Vec<PromptSpec>,
    pub resources: Vec<ResourceSpec>,
}
