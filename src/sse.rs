//! OpenAI → Anthropic streaming conversion.
//!
//! [`StreamConverter`] is a pure state machine: feed it parsed OpenAI
//! chat-completion chunks, get back the Anthropic SSE events they imply.
//! All I/O — reading upstream bytes, splitting SSE frames, writing the
//! response body — lives in the router; the converter owns only the event
//! ordering contract:
//!
//! 1. `message_start` on the first chunk;
//! 2. `content_block_start` before any delta for that block, one
//!    `content_block_stop` per started block, no interleaving;
//! 3. text block closed before the first tool-use block opens;
//! 4. `message_delta` (stop reason + usage) then `message_stop`, exactly
//!    once, even when the upstream closes without a finish reason.

use std::collections::BTreeMap;

use serde_json::{json, Value};

use crate::translate::{map_stop_reason, new_message_id};

/// One Anthropic SSE event, ready for wire framing.
#[derive(Debug, Clone, PartialEq)]
pub struct Event {
    pub event: &'static str,
    pub data: Value,
}

impl Event {
    fn new(event: &'static str, data: Value) -> Self {
        Self { event, data }
    }

    /// `event: <type>\ndata: <json>\n\n`
    pub fn to_wire(&self) -> String {
        format!("event: {}\ndata: {}\n\n", self.event, self.data)
    }
}

#[derive(Debug, Default)]
struct ToolBlock {
    id: Option<String>,
    name: Option<String>,
    /// Arguments accumulated before the block could be opened.
    pending_arguments: String,
    /// Anthropic content-block index once opened.
    block_index: Option<usize>,
}

/// Per-request conversion state.
pub struct StreamConverter {
    model: String,
    message_id: String,
    input_tokens: u64,
    started: bool,
    finished: bool,
    open_text_block: Option<usize>,
    next_block_index: usize,
    /// Keyed by the OpenAI `tool_calls[].index`. Ordered so blocks close
    /// in the order they opened.
    tools: BTreeMap<u64, ToolBlock>,
    output_chars: u64,
    finish_reason: Option<String>,
}

impl StreamConverter {
    pub fn new(model: impl Into<String>, input_tokens: u64) -> Self {
        Self {
            model: model.into(),
            message_id: new_message_id(),
            input_tokens,
            started: false,
            finished: false,
            open_text_block: None,
            next_block_index: 0,
            tools: BTreeMap::new(),
            output_chars: 0,
            finish_reason: None,
        }
    }

    fn output_tokens(&self) -> u64 {
        self.output_chars.div_ceil(4)
    }

    fn message_start(&mut self) -> Event {
        self.started = true;
        Event::new(
            "message_start",
            json!({
                "type": "message_start",
                "message": {
                    "id": self.message_id,
                    "type": "message",
                    "role": "assistant",
                    "model": self.model,
                    "content": [],
                    "stop_reason": null,
                    "stop_sequence": null,
                    "usage": { "input_tokens": self.input_tokens, "output_tokens": 0 },
                },
            }),
        )
    }

    fn close_text_block(&mut self, events: &mut Vec<Event>) {
        if let Some(index) = self.open_text_block.take() {
            events.push(Event::new(
                "content_block_stop",
                json!({ "type": "content_block_stop", "index": index }),
            ));
        }
    }

    /// Feed one parsed OpenAI chunk; returns the events it implies.
    pub fn process(&mut self, chunk: &Value) -> Vec<Event> {
        if self.finished {
            return Vec::new();
        }

        let mut events = Vec::new();
        if !self.started {
            events.push(self.message_start());
        }

        let choice = &chunk["choices"][0];
        let delta = &choice["delta"];

        if let Some(text) = delta["content"].as_str() {
            if !text.is_empty() {
                if self.open_text_block.is_none() {
                    let index = self.next_block_index;
                    self.next_block_index += 1;
                    self.open_text_block = Some(index);
                    events.push(Event::new(
                        "content_block_start",
                        json!({
                            "type": "content_block_start",
                            "index": index,
                            "content_block": { "type": "text", "text": "" },
                        }),
                    ));
                }
                self.output_chars += text.chars().count() as u64;
                events.push(Event::new(
                    "content_block_delta",
                    json!({
                        "type": "content_block_delta",
                        "index": self.open_text_block.expect("text block is open"),
                        "delta": { "type": "text_delta", "text": text },
                    }),
                ));
            }
        }

        if let Some(calls) = delta["tool_calls"].as_array() {
            for call in calls {
                self.process_tool_delta(call, &mut events);
            }
        }

        if let Some(reason) = choice["finish_reason"].as_str() {
            self.finish_reason = Some(reason.to_string());
            events.extend(self.close(Some(reason)));
        }

        events
    }

    fn process_tool_delta(&mut self, call: &Value, events: &mut Vec<Event>) {
        let key = call["index"].as_u64().unwrap_or(0);
        let state = self.tools.entry(key).or_default();

        if let Some(id) = call["id"].as_str() {
            state.id = Some(id.to_string());
        }
        if let Some(name) = call["function"]["name"].as_str() {
            state.name = Some(name.to_string());
        }
        let fragment = call["function"]["arguments"].as_str().unwrap_or("");
        if !fragment.is_empty() {
            state.pending_arguments.push_str(fragment);
            self.output_chars += fragment.chars().count() as u64;
        }

        // The block can only open once both id and name are known.
        if state.block_index.is_none() && state.id.is_some() && state.name.is_some() {
            let (id, name) = (
                state.id.clone().expect("checked"),
                state.name.clone().expect("checked"),
            );
            self.close_text_block(events);
            let index = self.next_block_index;
            self.next_block_index += 1;
            events.push(Event::new(
                "content_block_start",
                json!({
                    "type": "content_block_start",
                    "index": index,
                    "content_block": { "type": "tool_use", "id": id, "name": name, "input": {} },
                }),
            ));
            let state = self.tools.get_mut(&key).expect("just inserted");
            state.block_index = Some(index);
        }

        // Flush whatever arguments are pending (possibly accumulated
        // before the block opened).
        let state = self.tools.get_mut(&key).expect("just inserted");
        if let Some(index) = state.block_index {
            if !state.pending_arguments.is_empty() {
                let partial = std::mem::take(&mut state.pending_arguments);
                events.push(Event::new(
                    "content_block_delta",
                    json!({
                        "type": "content_block_delta",
                        "index": index,
                        "delta": { "type": "input_json_delta", "partial_json": partial },
                    }),
                ));
            }
        }
    }

    /// Closing sequence: stop every open block, then `message_delta` and
    /// `message_stop`.
    fn close(&mut self, finish_reason: Option<&str>) -> Vec<Event> {
        let mut events = Vec::new();
        self.close_text_block(&mut events);

        let mut open_tool_indices: Vec<usize> =
            self.tools.values().filter_map(|t| t.block_index).collect();
        open_tool_indices.sort_unstable();
        for index in open_tool_indices {
            events.push(Event::new(
                "content_block_stop",
                json!({ "type": "content_block_stop", "index": index }),
            ));
        }

        let has_tools = self.tools.values().any(|t| t.block_index.is_some());
        events.push(Event::new(
            "message_delta",
            json!({
                "type": "message_delta",
                "delta": {
                    "stop_reason": map_stop_reason(finish_reason, has_tools),
                    "stop_sequence": null,
                },
                "usage": { "output_tokens": self.output_tokens() },
            }),
        ));
        events.push(Event::new("message_stop", json!({ "type": "message_stop" })));
        self.finished = true;
        events
    }

    /// Upstream ended. Emits the closing sequence if the stream never
    /// carried a finish reason; a no-op otherwise.
    pub fn finish(&mut self) -> Vec<Event> {
        if self.finished {
            return Vec::new();
        }
        let mut events = Vec::new();
        if !self.started {
            events.push(self.message_start());
        }
        let reason = self.finish_reason.clone();
        events.extend(self.close(reason.as_deref()));
        events
    }
}

/// Reassembles SSE `data:` payloads from an arbitrary byte chunking.
///
/// Keeps at most one partial line buffered; complete payloads are returned
/// in arrival order. `[DONE]` sentinels are surfaced like any other
/// payload so the caller can decide to stop.
#[derive(Debug, Default)]
pub struct SseLineBuffer {
    partial: String,
}

impl SseLineBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, bytes: &[u8]) -> Vec<String> {
        self.partial.push_str(&String::from_utf8_lossy(bytes));
        let mut payloads = Vec::new();

        while let Some(newline) = self.partial.find('\n') {
            let line: String = self.partial.drain(..=newline).collect();
            let line = line.trim_end_matches(['\n', '\r']);
            if let Some(data) = line.strip_prefix("data:") {
                payloads.push(data.trim_start().to_string());
            }
        }
        payloads
    }
}
