//! The `deepseek` built-in: OpenAI-family tweaks specific to DeepSeek's
//! `/chat/completions` endpoint. Expects to run after `openai` in the
//! chain, so `request_out` receives an already OpenAI-shaped body and
//! only adjusts DeepSeek-specific parameters.

use serde_json::{json, Value};

use crate::transformer::Transformer;

/// DeepSeek rejects `temperature` above 2.0 and ignores `tool_choice:
/// "required"` (documented as unsupported); both are clamped/mapped here
/// rather than left for the provider to reject outright.
#[derive(Default)]
pub struct DeepSeekTransformer;

impl Transformer for DeepSeekTransformer {
    fn name(&self) -> &str {
        "deepseek"
    }

    fn request_out(&self, mut req: Value) -> Result<Value, anyhow::Error> {
        if let Some(temp) = req.get("temperature").and_then(Value::as_f64) {
            req["temperature"] = json!(temp.min(2.0));
        }
        if req.get("tool_choice").and_then(Value::as_str) == Some("required") {
            req["tool_choice"] = Value::String("auto".to_string());
        }
        // DeepSeek reports usage only when explicitly asked, during streaming.
        if req.get("stream").and_then(Value::as_bool) == Some(true) {
            req["stream_options"] = json!({"include_usage": true});
        }
        Ok(req)
    }
}
