//! Anthropic ↔ OpenAI schema translation.
//!
//! The fleet's backends all speak the OpenAI chat-completions protocol;
//! `/v1/messages` clients speak the Anthropic Messages protocol. This
//! module converts requests one way and non-streaming responses the other.
//! Streaming conversion lives in [`crate::sse`].
//!
//! # Protocol differences handled here
//!
//! | Concern | Anthropic | OpenAI |
//! |---|---|---|
//! | System prompt | Top-level `system` (string or text blocks) | First message with `role: "system"` |
//! | Content | Typed block array `text \| image \| tool_use \| tool_result` | String content + `tool_calls` |
//! | Tool results | `tool_result` blocks inside a user message | Separate `role: "tool"` messages |
//! | Tool input | `input` object | `function.arguments` JSON string |
//! | Finish reasons | `end_turn`, `max_tokens`, `tool_use` | `stop`, `length`, `tool_calls` |
//! | Usage | `input_tokens` / `output_tokens` | `prompt_tokens` / `completion_tokens` |
//!
//! Image blocks have no counterpart on a text-only llama-server backend and
//! are dropped; this is documented lossy behavior.

use serde_json::{json, Value};

use crate::error::Error;

/// Fresh Anthropic-style message id: `msg_` + 24 hex chars.
pub fn new_message_id() -> String {
    use rand::RngCore;
    let mut bytes = [0u8; 12];
    rand::thread_rng().fill_bytes(&mut bytes);
    format!("msg_{}", hex::encode(bytes))
}

/// The fixed estimator used for `count_tokens` and streamed usage:
/// ceil(total characters / 4).
pub fn estimate_input_tokens(request: &Value) -> u64 {
    let mut chars = 0usize;

    match request.get("system") {
        Some(Value::String(s)) => chars += s.chars().count(),
        Some(Value::Array(blocks)) => {
            for block in blocks {
                if let Some(text) = block["text"].as_str() {
                    chars += text.chars().count();
                }
            }
        }
        _ => {}
    }

    if let Some(messages) = request["messages"].as_array() {
        for message in messages {
            match &message["content"] {
                Value::String(s) => chars += s.chars().count(),
                Value::Array(blocks) => {
                    for block in blocks {
                        if let Some(text) = block["text"].as_str() {
                            chars += text.chars().count();
                        } else if let Some(content) = block.get("content") {
                            // tool_result payloads still consume context.
                            chars += content.to_string().chars().count();
                        }
                    }
                }
                _ => {}
            }
        }
    }

    (chars as u64).div_ceil(4)
}

/// Convert an Anthropic Messages request to the OpenAI chat-completions
/// schema.
pub fn anthropic_to_openai_request(request: &Value) -> Result<Value, Error> {
    let model = request["model"]
        .as_str()
        .ok_or_else(|| Error::Validation("`model` field is required".into()))?;
    let raw_messages = request["messages"]
        .as_array()
        .ok_or_else(|| Error::Validation("`messages` array is required".into()))?;

    let mut messages: Vec<Value> = Vec::with_capacity(raw_messages.len() + 1);

    // Anthropic carries the system prompt as a top-level field; OpenAI as
    // the first message.
    match request.get("system") {
        Some(Value::String(s)) => {
            messages.push(json!({ "role": "system", "content": s }));
        }
        Some(Value::Array(blocks)) => {
            let text: Vec<&str> = blocks
                .iter()
                .filter(|b| b["type"] == "text")
                .filter_map(|b| b["text"].as_str())
                .collect();
            if !text.is_empty() {
                messages.push(json!({ "role": "system", "content": text.join("\n\n") }));
            }
        }
        _ => {}
    }

    for message in raw_messages {
        let role = message["role"].as_str().unwrap_or("user");
        match &message["content"] {
            Value::String(s) => {
                messages.push(json!({ "role": role, "content": s }));
            }
            Value::Array(blocks) => {
                translate_blocks(role, blocks, &mut messages);
            }
            other => {
                return Err(Error::Validation(format!(
                    "message content must be a string or block array, got {other}"
                )));
            }
        }
    }

    let mut out = json!({
        "model": model,
        "messages": messages,
    });

    for key in ["max_tokens", "temperature", "top_p", "stream"] {
        if let Some(value) = request.get(key) {
            out[key] = value.clone();
        }
    }
    if let Some(stop) = request.get("stop_sequences") {
        out["stop"] = stop.clone();
    }

    if let Some(tools) = request["tools"].as_array() {
        out["tools"] = Value::Array(
            tools
                .iter()
                .map(|t| {
                    json!({
                        "type": "function",
                        "function": {
                            "name": t["name"],
                            "description": t["description"],
                            "parameters": t["input_schema"],
                        },
                    })
                })
                .collect(),
        );
    }

    if let Some(choice) = request.get("tool_choice") {
        match choice["type"].as_str() {
            Some("auto") => out["tool_choice"] = json!("auto"),
            Some("none") => out["tool_choice"] = json!("none"),
            Some("any") => out["tool_choice"] = json!("required"),
            Some("tool") => {
                out["tool_choice"] = json!({
                    "type": "function",
                    "function": { "name": choice["name"] },
                });
            }
            _ => {}
        }
    }

    Ok(out)
}

/// Split one Anthropic block-array message into OpenAI messages.
///
/// Text blocks concatenate into a single message. `tool_use` blocks become
/// `tool_calls` on the (assistant) message. `tool_result` blocks each
/// become a separate `role: "tool"` message, emitted before the text.
fn translate_blocks(role: &str, blocks: &[Value], messages: &mut Vec<Value>) {
    let mut text_parts: Vec<&str> = Vec::new();
    let mut tool_calls: Vec<Value> = Vec::new();

    for block in blocks {
        match block["type"].as_str() {
            Some("text") => {
                if let Some(text) = block["text"].as_str() {
                    text_parts.push(text);
                }
            }
            Some("tool_use") => {
                let arguments = serde_json::to_string(&block["input"])
                    .unwrap_or_else(|_| "{}".to_string());
                tool_calls.push(json!({
                    "id": block["id"],
                    "type": "function",
                    "function": {
                        "name": block["name"],
                        "arguments": arguments,
                    },
                }));
            }
            Some("tool_result") => {
                messages.push(json!({
                    "role": "tool",
                    "tool_call_id": block["tool_use_id"],
                    "content": tool_result_text(&block["content"]),
                }));
            }
            Some("image") => {
                tracing::warn!("dropping image block: backends are text-only");
            }
            other => {
                tracing::warn!(block_type = ?other, "skipping unknown content block");
            }
        }
    }

    if !text_parts.is_empty() || !tool_calls.is_empty() {
        let mut message = json!({ "role": role });
        message["content"] = if text_parts.is_empty() {
            Value::Null
        } else {
            Value::String(text_parts.join("\n"))
        };
        if !tool_calls.is_empty() {
            message["tool_calls"] = Value::Array(tool_calls);
        }
        messages.push(message);
    }
}

/// Flatten a `tool_result` content value (string or text-block array) to
/// plain text.
fn tool_result_text(content: &Value) -> String {
    match content {
        Value::String(s) => s.clone(),
        Value::Array(blocks) => blocks
            .iter()
            .filter(|b| b["type"] == "text")
            .filter_map(|b| b["text"].as_str())
            .collect::<Vec<_>>()
            .join("\n"),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

/// Map an OpenAI finish reason onto an Anthropic stop reason. A response
/// that produced tool calls is always `tool_use`, whatever the backend
/// claimed.
pub fn map_stop_reason(finish_reason: Option<&str>, has_tool_calls: bool) -> &'static str {
    if has_tool_calls {
        return "tool_use";
    }
    match finish_reason {
        Some("length") => "max_tokens",
        Some("tool_calls") => "tool_use",
        _ => "end_turn",
    }
}

/// Convert a non-streaming OpenAI chat-completions response to an
/// Anthropic message.
pub fn openai_to_anthropic_response(response: &Value, requested_model: &str) -> Value {
    let message = &response["choices"][0]["message"];
    let mut content: Vec<Value> = Vec::new();

    if let Some(text) = message["content"].as_str() {
        if !text.is_empty() {
            content.push(json!({ "type": "text", "text": text }));
        }
    }

    let tool_calls = message["tool_calls"].as_array();
    if let Some(calls) = tool_calls {
        for call in calls {
            let input = call["function"]["arguments"]
                .as_str()
                .filter(|s| !s.is_empty())
                .and_then(|s| serde_json::from_str::<Value>(s).ok())
                .unwrap_or_else(|| json!({}));
            content.push(json!({
                "type": "tool_use",
                "id": call["id"],
                "name": call["function"]["name"],
                "input": input,
            }));
        }
    }

    let has_tool_calls = tool_calls.is_some_and(|c| !c.is_empty());
    let finish_reason = response["choices"][0]["finish_reason"].as_str();
    let model = response["model"].as_str().unwrap_or(requested_model);

    json!({
        "id": new_message_id(),
        "type": "message",
        "role": "assistant",
        "model": model,
        "content": content,
        "stop_reason": map_stop_reason(finish_reason, has_tool_calls),
        "stop_sequence": null,
        "usage": {
            "input_tokens": response["usage"]["prompt_tokens"].as_u64().unwrap_or(0),
            "output_tokens": response["usage"]["completion_tokens"].as_u64().unwrap_or(0),
        },
    })
}
