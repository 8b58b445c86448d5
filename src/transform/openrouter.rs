//! The `openrouter` built-in: OpenAI-family tweaks for OpenRouter — primarily
//! inserting prompt-caching hints OpenRouter understands on the final
//! message, which meaningfully cuts cost on long-running coding-assistant
//! sessions.

use serde_json::{json, Value};

use crate::transformer::Transformer;

#[derive(Default)]
pub struct OpenRouterTransformer;

impl Transformer for OpenRouterTransformer {
    fn name(&self) -> &str {
        "openrouter"
    }

    fn request_out(&self, mut req: Value) -> Result<Value, anyhow::Error> {
        if let Some(messages) = req.get_mut("messages").and_then(Value::as_array_mut) {
            if let Some(last) = messages.last_mut() {
                mark_cacheable(last);
            }
        }
        Ok(req)
    }
}

/// Rewrites a plain string `content` into OpenRouter's multi-part content
/// shape with a `cache_control` hint on the final part; leaves an already
/// multi-part message's own parts untouched beyond tagging the last one.
fn mark_cacheable(message: &mut Value) {
    let Some(content) = message.get("content") else { return };

    if let Some(text) = content.as_str() {
        message["content"] = json!([{
            "type": "text",
            "text": text,
            "cache_control": {"type": "ephemeral"},
        }]);
        return;
    }

    if let Some(parts) = message.get_mut("content").and_then(Value::as_array_mut) {
        if let Some(last) = parts.last_mut() {
            last["cache_control"] = json!({"type": "ephemeral"});
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tags_final_string_message_with_cache_control() {
        let t = OpenRouterTransformer;
        let out = t
            .request_out(json!({"messages": [{"role": "user", "content": "hello"}]}))
            .unwrap();
        assert_eq!(out["messages"][0]["content"][0]["cache_control"]["type"], "ephemeral");
    }

    #[test]
    fn leaves_other_messages_untouched() {
        let t = OpenRouterTransformer;
        let out = t
            .request_out(json!({"messages": [
                {"role": "system", "content": "sys"},
                {"role": "user", "content": "hi"}
            ]}))
            .unwrap();
        assert_eq!(out["messages"][0]["content"], "sys");
    }
}
