//! The `groq` built-in: OpenAI-family tweaks for Groq.
//! Groq's LPU-backed endpoint rejects `frequency_penalty`/`presence_penalty`
//! outside `[-2, 2]` and caps `max_tokens` below the ceilings vendors like
//! OpenAI allow; both are enforced here rather than left to surface as a
//! raw `400` from the provider.

use serde_json::{json, Value};

use crate::transformer::Transformer;

const GROQ_MAX_TOKENS_CEILING: u64 = 8192;

#[derive(Default)]
pub struct GroqTransformer;

impl Transformer for GroqTransformer {
    fn name(&self) -> &str {
        "groq"
    }

    fn request_out(&self, mut req: Value) -> Result<Value, anyhow::Error> {
        for key in ["frequency_penalty", "presence_penalty"] {
            if let Some(v) = req.get(key).and_then(Value::as_f64) {
                req[key] = json!(v.clamp(-2.0, 2.0));
            }
        }
        if let Some(max_tokens) = req.get("max_tokens").and_then(Value::as_u64) {
            req["max_tokens"] = json!(max_tokens.min(GROQ_MAX_TOKENS_CEILING));
        }
        Ok(req)
    }
}
