//! The `openai` built-in: bidirectional mapping between the client dialect
//! (Anthropic `/v1/messages`) and the OpenAI `/chat/completions` dialect.
//! This is the one transformer in a typical chain that actually crosses
//! dialects; siblings like `maxtoken` and `tooluse` only touch fields.
//!
//! Drop policy: Anthropic `thinking` has no OpenAI-chat equivalent and is
//! dropped on the way out; OpenAI has no `cache_control` equivalent and
//! none is synthesized on the way back.

use std::collections::VecDeque;

use futures::stream::{self, StreamExt};
use serde_json::{json, Value};

use crate::sse::{EventStream, SseEvent};
use crate::transformer::Transformer;

#[derive(Default)]
pub struct OpenAiTransformer;

impl Transformer for OpenAiTransformer {
    fn name(&self) -> &str {
        "openai"
    }

    fn request_out(&self, req: Value) -> Result<Value, anyhow::Error> {
        Ok(anthropic_request_to_openai(&req))
    }

    fn response_in(&self, resp: Value) -> Result<Value, anyhow::Error> {
        Ok(openai_response_to_anthropic(&resp))
    }

    fn stream_response_in(&self, events: EventStream) -> EventStream {
        translate_stream(events)
    }

    fn auth_header(&self, api_key: &str) -> Option<(&'static str, String)> {
        Some(("Authorization", format!("Bearer {api_key}")))
    }
}

fn anthropic_request_to_openai(req: &Value) -> Value {
    let mut messages = Vec::new();

    match req.get("system") {
        Some(Value::String(s)) if !s.is_empty() => {
            messages.push(json!({"role": "system", "content": s}));
        }
        Some(Value::Array(parts)) => {
            let text: String = parts
                .iter()
                .filter_map(|p| p.get("text").and_then(Value::as_str))
                .collect::<Vec<_>>()
                .join("\n");
            if !text.is_empty() {
                messages.push(json!({"role": "system", "content": text}));
            }
        }
        _ => {}
    }

    for message in req.get("messages").and_then(Value::as_array).into_iter().flatten() {
        messages.extend(anthropic_message_to_openai(message));
    }

    let mut out = json!({
        "model": req.get("model").cloned().unwrap_or(Value::Null),
        "messages": messages,
        "stream": req.get("stream").and_then(Value::as_bool).unwrap_or(false),
    });

    if let Some(max_tokens) = req.get("max_tokens") {
        out["max_tokens"] = max_tokens.clone();
    }

    if let Some(tools) = req.get("tools").and_then(Value::as_array) {
        if !tools.is_empty() {
            out["tools"] = Value::Array(tools.iter().map(anthropic_tool_to_openai).collect());
        }
    }

    if let Some(tool_choice) = req.get("tool_choice") {
        out["tool_choice"] = anthropic_tool_choice_to_openai(tool_choice);
    }

    out
}

fn anthropic_tool_to_openai(tool: &Value) -> Value {
    json!({
        "type": "function",
        "function": {
            "name": tool.get("name").cloned().unwrap_or(Value::Null),
            "description": tool.get("description").cloned().unwrap_or(Value::String(String::new())),
            "parameters": tool.get("input_schema").cloned().unwrap_or_else(|| json!({"type": "object", "properties": {}})),
        }
    })
}

fn anthropic_tool_choice_to_openai(choice: &Value) -> Value {
    match choice.get("type").and_then(Value::as_str) {
        Some("any") => Value::String("required".to_string()),
        Some("auto") | None => Value::String("auto".to_string()),
        Some("tool") => json!({
            "type": "function",
            "function": {"name": choice.get("name").cloned().unwrap_or(Value::Null)}
        }),
        _ => Value::String("auto".to_string()),
    }
}

fn anthropic_message_to_openai(message: &Value) -> Vec<Value> {
    let role = message.get("role").and_then(Value::as_str).unwrap_or("user");
    let content = message.get("content");

    let Some(content) = content else {
        return vec![json!({"role": role, "content": ""})];
    };

    if let Some(text) = content.as_str() {
        return vec![json!({"role": role, "content": text})];
    }

    let Some(blocks) = content.as_array() else {
        return vec![json!({"role": role, "content": ""})];
    };

    // tool_result blocks become independent "tool" role messages; everything
    // else collapses into one message with joined text + tool_calls.
    let mut out = Vec::new();
    let mut text_parts = Vec::new();
    let mut tool_calls = Vec::new();

    for block in blocks {
        match block.get("type").and_then(Value::as_str) {
            Some("text") => {
                if let Some(t) = block.get("text").and_then(Value::as_str) {
                    text_parts.push(t.to_string());
                }
            }
            Some("tool_use") => {
                tool_calls.push(json!({
                    "id": block.get("id").cloned().unwrap_or(Value::Null),
                    "type": "function",
                    "function": {
                        "name": block.get("name").cloned().unwrap_or(Value::Null),
                        "arguments": serde_json::to_string(block.get("input").unwrap_or(&Value::Null))
                            .unwrap_or_default(),
                    }
                }));
            }
            Some("tool_result") => {
                let content = block.get("content").cloned().unwrap_or(Value::Null);
                let content_str = match content {
                    Value::String(s) => s,
                    other => other.to_string(),
                };
                out.push(json!({
                    "role": "tool",
                    "tool_call_id": block.get("tool_use_id").cloned().unwrap_or(Value::Null),
                    "content": content_str,
                }));
            }
            // thinking blocks have no OpenAI-chat analogue; dropped.
            _ => {}
        }
    }

    if !text_parts.is_empty() || !tool_calls.is_empty() {
        let mut msg = json!({"role": role, "content": text_parts.join("\n")});
        if !tool_calls.is_empty() {
            msg["tool_calls"] = Value::Array(tool_calls);
        }
        out.insert(0, msg);
    }

    if out.is_empty() {
        out.push(json!({"role": role, "content": ""}));
    }

    out
}

fn openai_response_to_anthropic(resp: &Value) -> Value {
    let choice = resp.get("choices").and_then(|c| c.get(0));
    let message = choice.and_then(|c| c.get("message"));

    let mut content = Vec::new();
    if let Some(text) = message.and_then(|m| m.get("content")).and_then(Value::as_str) {
        if !text.is_empty() {
            content.push(json!({"type": "text", "text": text}));
        }
    }
    for call in message
        .and_then(|m| m.get("tool_calls"))
        .and_then(Value::as_array)
        .into_iter()
        .flatten()
    {
        let args_str = call
            .get("function")
            .and_then(|f| f.get("arguments"))
            .and_then(Value::as_str)
            .unwrap_or("{}");
        let input: Value = serde_json::from_str(args_str).unwrap_or(json!({}));
        content.push(json!({
            "type": "tool_use",
            "id": call.get("id").cloned().unwrap_or(Value::Null),
            "name": call.get("function").and_then(|f| f.get("name")).cloned().unwrap_or(Value::Null),
            "input": input,
        }));
    }

    let finish_reason = choice.and_then(|c| c.get("finish_reason")).and_then(Value::as_str);
    let stop_reason = map_finish_reason(finish_reason);

    let usage = resp.get("usage");
    json!({
        "id": resp.get("id").cloned().unwrap_or(Value::Null),
        "type": "message",
        "role": "assistant",
        "content": content,
        "stop_reason": stop_reason,
        "usage": {
            "input_tokens": usage.and_then(|u| u.get("prompt_tokens")).and_then(Value::as_u64).unwrap_or(0),
            "output_tokens": usage.and_then(|u| u.get("completion_tokens")).and_then(Value::as_u64).unwrap_or(0),
        }
    })
}

fn map_finish_reason(reason: Option<&str>) -> &'static str {
    match reason {
        Some("length") => "max_tokens",
        Some("tool_calls") => "tool_use",
        Some("content_filter") => "end_turn",
        _ => "end_turn",
    }
}

/// Translates a stream of OpenAI `chat.completion.chunk` SSE events into
/// Anthropic-shaped streaming events. Tracks per-index tool-call state
/// (accumulated `arguments` string, name, id) since OpenAI streams tool
/// calls as incremental argument fragments keyed by array index, while
/// Anthropic streams them as a single `content_block` with accumulating
/// `partial_json` deltas at the same index.
fn translate_stream(events: EventStream) -> EventStream {
    let state = OpenAiStreamState::default();
    stream::unfold(
        (events, state, VecDeque::new()),
        |(mut inner, mut state, mut outbuf)| async move {
            loop {
                if let Some(ev) = outbuf.pop_front() {
                    return Some((ev, (inner, state, outbuf)));
                }
                match inner.next().await {
                    Some(event) => {
                        let produced = state.handle(event);
                        outbuf.extend(produced);
                    }
                    None => {
                        let produced = state.finish();
                        if produced.is_empty() {
                            return None;
                        }
                        outbuf.extend(produced);
                    }
                }
            }
        },
    )
    .boxed()
}

#[derive(Default)]
struct OpenAiStreamState {
    started: bool,
    text_block_open: bool,
    next_index: u64,
    tool_block_index: std::collections::HashMap<u64, u64>,
}

impl OpenAiStreamState {
    fn handle(&mut self, event: SseEvent) -> Vec<SseEvent> {
        if event.is_done_sentinel() {
            return self.finish();
        }
        let Some(value) = event.json() else { return vec![] };
        let mut out = Vec::new();

        if !self.started {
            self.started = true;
            out.push(SseEvent::new(
                "message_start",
                json!({
                    "type": "message_start",
                    "message": {"id": value.get("id").cloned().unwrap_or(Value::Null),
                                 "type": "message", "role": "assistant", "content": [],
                                 "usage": {"input_tokens": 0, "output_tokens": 0}}
                })
                .to_string(),
            ));
        }

        let Some(delta) = value.get("choices").and_then(|c| c.get(0)).and_then(|c| c.get("delta")) else {
            return out;
        };

        if let Some(text) = delta.get("content").and_then(Value::as_str) {
            if !self.text_block_open {
                self.text_block_open = true;
                out.push(SseEvent::new(
                    "content_block_start",
                    json!({"type":"content_block_start","index":self.next_index,
                           "content_block":{"type":"text","text":""}})
                    .to_string(),
                ));
            }
            out.push(SseEvent::new(
                "content_block_delta",
                json!({"type":"content_block_delta","index":self.next_index,
                       "delta":{"type":"text_delta","text":text}})
                .to_string(),
            ));
        }

        for call in delta.get("tool_calls").and_then(Value::as_array).into_iter().flatten() {
            let call_index = call.get("index").and_then(Value::as_u64).unwrap_or(0);
            let block_index = *self.tool_block_index.entry(call_index).or_insert_with(|| {
                if self.text_block_open {
                    self.text_block_open = false;
                    // the text block at next_index is implicitly closed by
                    // the caller observing a new content_block_start below
                }
                self.next_index += 1;
                self.next_index
            });

            if let Some(id) = call.get("id").and_then(Value::as_str) {
                let name = call.get("function").and_then(|f| f.get("name")).and_then(Value::as_str).unwrap_or("");
                out.push(SseEvent::new(
                    "content_block_start",
                    json!({"type":"content_block_start","index":block_index,
                           "content_block":{"type":"tool_use","id":id,"name":name,"input":{}}})
                    .to_string(),
                ));
            }

            if let Some(fragment) = call.get("function").and_then(|f| f.get("arguments")).and_then(Value::as_str) {
                out.push(SseEvent::new(
                    "content_block_delta",
                    json!({"type":"content_block_delta","index":block_index,
                           "delta":{"type":"input_json_delta","partial_json":fragment}})
                    .to_string(),
                ));
            }
        }

        if let Some(finish_reason) = value
            .get("choices")
            .and_then(|c| c.get(0))
            .and_then(|c| c.get("finish_reason"))
            .and_then(Value::as_str)
        {
            out.extend(self.close_out(finish_reason, value.get("usage")));
        }

        out
    }

    fn close_out(&mut self, finish_reason: &str, usage: Option<&Value>) -> Vec<SseEvent> {
        let mut out = Vec::new();
        for index in self.open_indices() {
            out.push(SseEvent::new(
                "content_block_stop",
                json!({"type":"content_block_stop","index":index}).to_string(),
            ));
        }
        self.text_block_open = false;
        self.tool_block_index.clear();

        out.push(SseEvent::new(
            "message_delta",
            json!({"type":"message_delta",
                   "delta":{"stop_reason": map_finish_reason(Some(finish_reason))},
                   "usage": {
                       "output_tokens": usage.and_then(|u| u.get("completion_tokens")).and_then(Value::as_u64).unwrap_or(0)
                   }})
            .to_string(),
        ));
        out.push(SseEvent::new("message_stop", json!({"type":"message_stop"}).to_string()));
        out
    }

    fn open_indices(&self) -> Vec<u64> {
        let mut indices: Vec<u64> = self.tool_block_index.values().copied().collect();
        if self.text_block_open {
            indices.push(0);
        }
        indices
    }

    /// Called on stream end without an explicit `finish_reason` (provider
    /// disconnect) — still emits exactly one terminal event.
    fn finish(&mut self) -> Vec<SseEvent> {
        if !self.started {
            return vec![];
        }
        self.started = false;
        self.close_out("stop", None)
    }
}
