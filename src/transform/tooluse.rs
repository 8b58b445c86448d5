//! The `tooluse` built-in: forces a proactive tool call via a synthetic
//! `ExitTool` sentinel, then unwraps it again so the client only ever sees
//! ordinary assistant text.
//!
//! The streaming half buffers only the `ExitTool` tool-call's `input_json`
//! delta fragments — everything else passes through untouched. That is the
//! full aggregation window this transformer holds open.

use std::collections::VecDeque;

use futures::stream::{self, StreamExt};
use serde_json::{json, Value};

use crate::sse::{EventStream, SseEvent};
use crate::transformer::Transformer;

const EXIT_TOOL_NAME: &str = "ExitTool";

#[derive(Default)]
pub struct ToolUseTransformer;

impl Transformer for ToolUseTransformer {
    fn name(&self) -> &str {
        "tooluse"
    }

    fn request_in(&self, mut req: Value) -> Result<Value, anyhow::Error> {
        let has_tools = req
            .get("tools")
            .and_then(Value::as_array)
            .is_some_and(|t| !t.is_empty());
        if !has_tools {
            return Ok(req);
        }

        let obj = req.as_object_mut().ok_or_else(|| anyhow::anyhow!("request body is not an object"))?;

        let tools = obj.entry("tools").or_insert_with(|| Value::Array(Vec::new()));
        tools.as_array_mut().unwrap().insert(
            0,
            json!({
                "name": EXIT_TOOL_NAME,
                "description": "Call this when you are ready to give your final answer to the user.",
                "input_schema": {
                    "type": "object",
                    "properties": {"response": {"type": "string", "description": "the final free-text reply"}},
                    "required": ["response"]
                }
            }),
        );

        obj.insert("tool_choice".to_string(), json!({"type": "any"}));

        let nudge = "You have tools available. Call a tool to make progress, or call \
                     `ExitTool` with your final answer once you are done.";
        match obj.get_mut("system") {
            Some(Value::String(existing)) => {
                existing.push_str("\n\n");
                existing.push_str(nudge);
            }
            Some(Value::Array(parts)) => {
                parts.push(json!({"type": "text", "text": nudge}));
            }
            _ => {
                obj.insert("system".to_string(), Value::String(nudge.to_string()));
            }
        }

        Ok(req)
    }

    fn response_out(&self, mut resp: Value) -> Result<Value, anyhow::Error> {
        let Some(content) = resp.get_mut("content").and_then(Value::as_array_mut) else {
            return Ok(resp);
        };

        for block in content.iter_mut() {
            let is_exit_tool = block.get("type").and_then(Value::as_str) == Some("tool_use")
                && block.get("name").and_then(Value::as_str) == Some(EXIT_TOOL_NAME);
            if !is_exit_tool {
                continue;
            }
            let text = block
                .get("input")
                .and_then(|i| i.get("response"))
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string();
            *block = json!({"type": "text", "text": text});
        }

        if let Some(stop_reason) = resp.get_mut("stop_reason") {
            if stop_reason.as_str() == Some("tool_use") {
                *stop_reason = Value::String("end_turn".to_string());
            }
        }

        Ok(resp)
    }

    fn stream_response_out(&self, events: EventStream) -> EventStream {
        let state = ExitToolState::default();
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
}

#[derive(Default)]
struct ExitToolState {
    buffering_index: Option<i64>,
    partial_json: String,
}

impl ExitToolState {
    fn handle(&mut self, event: SseEvent) -> Vec<SseEvent> {
        let Some(value) = event.json() else {
            return vec![event];
        };
        let event_type = value.get("type").and_then(Value::as_str).unwrap_or_default();

        match event_type {
            "content_block_start" => {
                let is_exit_tool = value
                    .get("content_block")
                    .and_then(|b| b.get("name"))
                    .and_then(Value::as_str)
                    == Some(EXIT_TOOL_NAME);
                if is_exit_tool {
                    self.buffering_index = value.get("index").and_then(Value::as_i64);
                    self.partial_json.clear();
                    return vec![];
                }
                vec![event]
            }
            "content_block_delta" if self.is_buffering(&value) => {
                if let Some(fragment) = value
                    .get("delta")
                    .and_then(|d| d.get("partial_json"))
                    .and_then(Value::as_str)
                {
                    self.partial_json.push_str(fragment);
                }
                vec![]
            }
            "content_block_stop" if self.is_buffering(&value) => {
                let index = self.buffering_index.take().unwrap_or_default();
                let response_text = serde_json::from_str::<Value>(&self.partial_json)
                    .ok()
                    .and_then(|v| v.get("response").and_then(Value::as_str).map(str::to_string))
                    .unwrap_or_default();
                self.partial_json.clear();

                vec![
                    SseEvent::new(
                        "content_block_start",
                        json!({"type":"content_block_start","index":index,
                               "content_block":{"type":"text","text":""}})
                        .to_string(),
                    ),
                    SseEvent::new(
                        "content_block_delta",
                        json!({"type":"content_block_delta","index":index,
                               "delta":{"type":"text_delta","text":response_text}})
                        .to_string(),
                    ),
                    SseEvent::new(
                        "content_block_stop",
                        json!({"type":"content_block_stop","index":index}).to_string(),
                    ),
                ]
            }
            _ => vec![event],
        }
    }

    fn is_buffering(&self, value: &Value) -> bool {
        self.buffering_index.is_some() && value.get("index").and_then(Value::as_i64) == self.buffering_index
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::stream::{self as fstream, StreamExt};
    use serde_json::json;

    #[test]
    fn request_in_is_noop_without_tools() {
        let t = ToolUseTransformer::default();
        let input = json!({"messages": []});
        let out = t.request_in(input.clone()).unwrap();
        assert_eq!(out, input);
    }

    #[test]
    fn request_in_injects_exit_tool_and_forces_choice() {
        let t = ToolUseTransformer::default();
        let input = json!({"tools": [{"name": "search"}]});
        let out = t.request_in(input).unwrap();
        let tools = out["tools"].as_array().unwrap();
        assert_eq!(tools[0]["name"], EXIT_TOOL_NAME);
        assert_eq!(out["tool_choice"]["type"], "any");
    }

    #[test]
    fn response_out_unwraps_buffered_exit_tool_call() {
        let t = ToolUseTransformer::default();
        let resp = json!({
            "content": [{"type": "tool_use", "name": "ExitTool", "input": {"response": "hello"}}],
            "stop_reason": "tool_use"
        });
        let out = t.response_out(resp).unwrap();
        assert_eq!(out["content"][0]["type"], "text");
        assert_eq!(out["content"][0]["text"], "hello");
        assert_eq!(out["stop_reason"], "end_turn");
    }

    #[tokio::test]
    async fn stream_response_out_unwraps_exit_tool_deltas() {
        let t = ToolUseTransformer::default();
        let input_events = vec![
            SseEvent::new(
                "content_block_start",
                json!({"index": 0, "content_block": {"type": "tool_use", "name": "ExitTool"}}).to_string(),
            ),
            SseEvent::new(
                "content_block_delta",
                json!({"index": 0, "delta": {"type": "input_json_delta", "partial_json": "{\"respon"}}).to_string(),
            ),
            SseEvent::new(
                "content_block_delta",
                json!({"index": 0, "delta": {"type": "input_json_delta", "partial_json": "se\":\"hello\"}"}}).to_string(),
            ),
            SseEvent::new("content_block_stop", json!({"index": 0}).to_string()),
        ];
        let in_stream: EventStream = fstream::iter(input_events).boxed();
        let out: Vec<SseEvent> = t.stream_response_out(in_stream).collect().await;
        assert_eq!(out.len(), 3);
        assert_eq!(out[1].json().unwrap()["delta"]["text"], "hello");
    }
}
