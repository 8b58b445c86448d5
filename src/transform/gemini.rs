//! The `gemini` built-in: bidirectional mapping to Google Gemini's
//! `generateContent`/`streamGenerateContent` shape, including the
//! schema-property restrictions Gemini's function-calling
//! API imposes and the lack of provider-assigned tool-call IDs (Gemini
//! `functionCall` parts carry no ID at all, so one is synthesized here and
//! threaded through so a later `functionResponse` can be matched back up).

use std::collections::VecDeque;

use futures::stream::{self, StreamExt};
use serde_json::{json, Map, Value};
use uuid::Uuid;

use crate::sse::{EventStream, SseEvent};
use crate::transformer::Transformer;

/// JSON Schema keywords Gemini's `functionDeclarations.parameters` rejects.
/// Anything else is passed through as-is.
const UNSUPPORTED_SCHEMA_KEYS: &[&str] = &["additionalProperties", "$schema", "exclusiveMinimum", "exclusiveMaximum"];

#[derive(Default)]
pub struct GeminiTransformer;

impl Transformer for GeminiTransformer {
    fn name(&self) -> &str {
        "gemini"
    }

    fn request_out(&self, req: Value) -> Result<Value, anyhow::Error> {
        Ok(anthropic_request_to_gemini(&req))
    }

    fn response_in(&self, resp: Value) -> Result<Value, anyhow::Error> {
        Ok(gemini_response_to_anthropic(&resp))
    }

    fn stream_response_in(&self, events: EventStream) -> EventStream {
        translate_stream(events)
    }

    fn auth_header(&self, api_key: &str) -> Option<(&'static str, String)> {
        Some(("x-goog-api-key", api_key.to_string()))
    }
}

fn sanitize_schema(schema: &Value) -> Value {
    match schema {
        Value::Object(map) => {
            let mut out = Map::new();
            for (k, v) in map {
                if UNSUPPORTED_SCHEMA_KEYS.contains(&k.as_str()) {
                    continue;
                }
                out.insert(k.clone(), sanitize_schema(v));
            }
            Value::Object(out)
        }
        Value::Array(items) => Value::Array(items.iter().map(sanitize_schema).collect()),
        other => other.clone(),
    }
}

fn anthropic_request_to_gemini(req: &Value) -> Value {
    let mut contents = Vec::new();

    for message in req.get("messages").and_then(Value::as_array).into_iter().flatten() {
        let role = match message.get("role").and_then(Value::as_str) {
            Some("assistant") => "model",
            _ => "user",
        };
        contents.push(json!({"role": role, "parts": anthropic_content_to_gemini_parts(message.get("content"))}));
    }

    let mut out = json!({"contents": contents});

    match req.get("system") {
        Some(Value::String(s)) if !s.is_empty() => {
            out["systemInstruction"] = json!({"parts": [{"text": s}]});
        }
        Some(Value::Array(parts)) => {
            let text: String = parts
                .iter()
                .filter_map(|p| p.get("text").and_then(Value::as_str))
                .collect::<Vec<_>>()
                .join("\n");
            if !text.is_empty() {
                out["systemInstruction"] = json!({"parts": [{"text": text}]});
            }
        }
        _ => {}
    }

    if let Some(tools) = req.get("tools").and_then(Value::as_array) {
        if !tools.is_empty() {
            let declarations: Vec<Value> = tools
                .iter()
                .map(|tool| {
                    json!({
                        "name": tool.get("name").cloned().unwrap_or(Value::Null),
                        "description": tool.get("description").cloned().unwrap_or(Value::String(String::new())),
                        "parameters": sanitize_schema(tool.get("input_schema").unwrap_or(&json!({"type": "object"}))),
                    })
                })
                .collect();
            out["tools"] = json!([{"functionDeclarations": declarations}]);
        }
    }

    if let Some(choice) = req.get("tool_choice") {
        let mode = match choice.get("type").and_then(Value::as_str) {
            Some("any") => "ANY",
            Some("auto") | None => "AUTO",
            _ => "AUTO",
        };
        out["toolConfig"] = json!({"functionCallingConfig": {"mode": mode}});
    }

    let mut generation_config = Map::new();
    if let Some(max_tokens) = req.get("max_tokens") {
        generation_config.insert("maxOutputTokens".to_string(), max_tokens.clone());
    }
    if !generation_config.is_empty() {
        out["generationConfig"] = Value::Object(generation_config);
    }

    out
}

fn anthropic_content_to_gemini_parts(content: Option<&Value>) -> Vec<Value> {
    let Some(content) = content else { return vec![json!({"text": ""})] };

    if let Some(text) = content.as_str() {
        return vec![json!({"text": text})];
    }

    let mut parts = Vec::new();
    for block in content.as_array().into_iter().flatten() {
        match block.get("type").and_then(Value::as_str) {
            Some("text") => {
                if let Some(t) = block.get("text").and_then(Value::as_str) {
                    parts.push(json!({"text": t}));
                }
            }
            Some("tool_use") => {
                parts.push(json!({"functionCall": {
                    "name": block.get("name").cloned().unwrap_or(Value::Null),
                    "args": block.get("input").cloned().unwrap_or(json!({})),
                }}));
            }
            Some("tool_result") => {
                let response = match block.get("content") {
                    Some(Value::String(s)) => json!({"content": s}),
                    Some(other) => other.clone(),
                    None => json!({}),
                };
                parts.push(json!({"functionResponse": {
                    "name": block.get("tool_use_id").and_then(Value::as_str).unwrap_or(""),
                    "response": response,
                }}));
            }
            _ => {}
        }
    }
    if parts.is_empty() {
        parts.push(json!({"text": ""}));
    }
    parts
}

fn gemini_response_to_anthropic(resp: &Value) -> Value {
    let candidate = resp.get("candidates").and_then(|c| c.get(0));
    let parts = candidate
        .and_then(|c| c.get("content"))
        .and_then(|c| c.get("parts"))
        .and_then(Value::as_array);

    let mut content = Vec::new();
    let mut saw_function_call = false;

    for part in parts.into_iter().flatten() {
        if let Some(text) = part.get("text").and_then(Value::as_str) {
            content.push(json!({"type": "text", "text": text}));
        } else if let Some(call) = part.get("functionCall") {
            saw_function_call = true;
            content.push(json!({
                "type": "tool_use",
                "id": format!("toolu_{}", Uuid::new_v4().simple()),
                "name": call.get("name").cloned().unwrap_or(Value::Null),
                "input": call.get("args").cloned().unwrap_or(json!({})),
            }));
        }
    }

    let finish_reason = candidate.and_then(|c| c.get("finishReason")).and_then(Value::as_str);
    let stop_reason = if saw_function_call {
        "tool_use"
    } else {
        match finish_reason {
            Some("MAX_TOKENS") => "max_tokens",
            _ => "end_turn",
        }
    };

    let usage = resp.get("usageMetadata");
    json!({
        "type": "message",
        "role": "assistant",
        "content": content,
        "stop_reason": stop_reason,
        "usage": {
            "input_tokens": usage.and_then(|u| u.get("promptTokenCount")).and_then(Value::as_u64).unwrap_or(0),
            "output_tokens": usage.and_then(|u| u.get("candidatesTokenCount")).and_then(Value::as_u64).unwrap_or(0),
        }
    })
}

/// Each streamed chunk from `streamGenerateContent` carries a cumulative
/// candidate, not an incremental delta the way OpenAI chunks do; this
/// buffers only the previously-seen text length per part index so it can
/// emit the *new* suffix as an Anthropic text delta.
fn translate_stream(events: EventStream) -> EventStream {
    let state = GeminiStreamState::default();
    stream::unfold(
        (events, state, VecDeque::new()),
        |(mut inner, mut state, mut outbuf)| async move {
            loop {
                if let Some(ev) = outbuf.pop_front() {
                    return Some((ev, (inner, state, outbuf)));
                }
                let event = inner.next().await?;
                let produced = state.handle(event);
                outbuf.extend(produced);
            }
        },
    )
    .boxed()
}

#[derive(Default)]
struct GeminiStreamState {
    started: bool,
    text_emitted_len: usize,
}

impl GeminiStreamState {
    fn handle(&mut self, event: SseEvent) -> Vec<SseEvent> {
        let Some(value) = event.json() else { return vec![] };
        let mut out = Vec::new();

        if !self.started {
            self.started = true;
            out.push(SseEvent::new(
                "message_start",
                json!({"type":"message_start","message":{"type":"message","role":"assistant","content":[],
                       "usage":{"input_tokens":0,"output_tokens":0}}})
                .to_string(),
            ));
            out.push(SseEvent::new(
                "content_block_start",
                json!({"type":"content_block_start","index":0,"content_block":{"type":"text","text":""}}).to_string(),
            ));
        }

        let full = gemini_response_to_anthropic(&value);
        let full_text: String = full
            .get("content")
            .and_then(Value::as_array)
            .into_iter()
            .flatten()
            .filter_map(|b| b.get("text").and_then(Value::as_str))
            .collect();

        if full_text.len() > self.text_emitted_len {
            let delta = &full_text[self.text_emitted_len..];
            out.push(SseEvent::new(
                "content_block_delta",
                json!({"type":"content_block_delta","index":0,"delta":{"type":"text_delta","text":delta}}).to_string(),
            ));
            self.text_emitted_len = full_text.len();
        }

        let finished = value
            .get("candidates")
            .and_then(|c| c.get(0))
            .and_then(|c| c.get("finishReason"))
            .and_then(Value::as_str)
            .is_some();

        if finished {
            out.push(SseEvent::new(
                "content_block_stop",
                json!({"type":"content_block_stop","index":0}).to_string(),
            ));
            out.push(SseEvent::new(
                "message_delta",
                json!({"type":"message_delta","delta":{"stop_reason": full["stop_reason"]}, "usage": full["usage"]})
                    .to_string(),
            ));
            out.push(SseEvent::new("message_stop", json!({"type":"message_stop"}).to_string()));
            self.started = false;
        }

        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strips_unsupported_schema_keys() {
        let schema = json!({"type": "object", "additionalProperties": false, "properties": {"a": {"type": "string"}}});
        let cleaned = sanitize_schema(&schema);
        assert!(cleaned.get("additionalProperties").is_none());
        assert_eq!(cleaned["properties"]["a"]["type"], "string");
    }

    #[test]
    fn request_out_maps_assistant_role_to_model() {
        let t = GeminiTransformer;
        let req = json!({"messages": [{"role": "assistant", "content": "hi"}]});
        let out = t.request_out(req).unwrap();
        assert_eq!(out["contents"][0]["role"], "model");
    }

    #[test]
    fn response_in_synthesizes_tool_use_id() {
        let t = GeminiTransformer;
        let resp = json!({"candidates": [{"content": {"parts": [{"functionCall": {"name": "search", "args": {}}}]}, "finishReason": "STOP"}]});
        let out = t.response_in(resp).unwrap();
        assert_eq!(out["stop_reason"], "tool_use");
        assert!(out["content"][0]["id"].as_str().unwrap().starts_with("toolu_"));
    }
}
