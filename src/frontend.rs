//! Native (non-Anthropic-dialect) inbound endpoints: each installs a
//! dedicated inbound/outbound adapter ahead of the router so a client that
//! speaks a provider's native wire shape directly still flows through the
//! same classification-and-transform pipeline as an Anthropic client.

use serde_json::{json, Value};

use crate::types::AnthropicRequest;

/// Adapts one native wire dialect to/from the internal client dialect so
/// the router/chain/forwarder pipeline never has to know a request did not
/// originate as an Anthropic `/v1/messages` call.
pub trait Frontend: Send + Sync {
    fn name(&self) -> &str;

    /// Maps a native request body into the internal Anthropic-shaped
    /// request the rest of the pipeline understands.
    fn parse_request(&self, body: Value, model: &str) -> anyhow::Result<AnthropicRequest>;

    /// Maps the pipeline's final Anthropic-shaped response back to the
    /// native reply shape this frontend's clients expect.
    fn serialize_response(&self, response: Value) -> anyhow::Result<Value>;
}

/// `POST /v1beta/models/:model::action` — accepts Gemini
/// `generateContent`-shaped bodies directly, for clients that speak the
/// Gemini dialect natively rather than Anthropic's.
pub struct GeminiFrontend;

impl Frontend for GeminiFrontend {
    fn name(&self) -> &str {
        "gemini-native"
    }

    fn parse_request(&self, body: Value, model: &str) -> anyhow::Result<AnthropicRequest> {
        let mut messages = Vec::new();
        for content in body.get("contents").and_then(Value::as_array).into_iter().flatten() {
            let role = match content.get("role").and_then(Value::as_str) {
                Some("model") => "assistant",
                _ => "user",
            };
            let text: String = content
                .get("parts")
                .and_then(Value::as_array)
                .into_iter()
                .flatten()
                .filter_map(|p| p.get("text").and_then(Value::as_str))
                .collect::<Vec<_>>()
                .join("\n");
            messages.push(json!({"role": role, "content": text}));
        }

        let system = body
            .get("systemInstruction")
            .and_then(|s| s.get("parts"))
            .and_then(Value::as_array)
            .map(|parts| {
                parts
                    .iter()
                    .filter_map(|p| p.get("text").and_then(Value::as_str))
                    .collect::<Vec<_>>()
                    .join("\n")
            });

        let mut request_value = json!({
            "model": model,
            "messages": messages,
            "stream": false,
        });
        if let Some(system) = system {
            request_value["system"] = Value::String(system);
        }
        if let Some(max_tokens) = body.get("generationConfig").and_then(|g| g.get("maxOutputTokens")) {
            request_value["max_tokens"] = max_tokens.clone();
        }

        Ok(serde_json::from_value(request_value)?)
    }

    fn serialize_response(&self, response: Value) -> anyhow::Result<Value> {
        let parts: Vec<Value> = response
            .get("content")
            .and_then(Value::as_array)
            .into_iter()
            .flatten()
            .filter_map(|block| match block.get("type").and_then(Value::as_str) {
                Some("text") => Some(json!({"text": block.get("text").cloned().unwrap_or(Value::Null)})),
                Some("tool_use") => Some(json!({"functionCall": {
                    "name": block.get("name").cloned().unwrap_or(Value::Null),
                    "args": block.get("input").cloned().unwrap_or(json!({})),
                }})),
                _ => None,
            })
            .collect();

        let finish_reason = match response.get("stop_reason").and_then(Value::as_str) {
            Some("max_tokens") => "MAX_TOKENS",
            _ => "STOP",
        };

        Ok(json!({
            "candidates": [{
                "content": {"role": "model", "parts": parts},
                "finishReason": finish_reason,
            }],
            "usageMetadata": {
                "promptTokenCount": response.get("usage").and_then(|u| u.get("input_tokens")).cloned().unwrap_or(json!(0)),
                "candidatesTokenCount": response.get("usage").and_then(|u| u.get("output_tokens")).cloned().unwrap_or(json!(0)),
            }
        }))
    }
}
