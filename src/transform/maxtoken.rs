//! The `maxtoken` built-in: clamps `max_tokens` to a configured ceiling
//! regardless of upstream dialect, since the clamp happens in
//! `request_in`, before any dialect-specific serialization.

use serde_json::Value;

use crate::transformer::Transformer;

pub struct MaxTokenTransformer {
    max_tokens: u64,
    name: String,
}

impl MaxTokenTransformer {
    pub fn new(max_tokens: u64) -> Self {
        MaxTokenTransformer {
            max_tokens,
            name: format!("maxtoken({max_tokens})"),
        }
    }
}

impl Default for MaxTokenTransformer {
    fn default() -> Self {
        Self::new(4096)
    }
}

impl Transformer for MaxTokenTransformer {
    fn name(&self) -> &str {
        &self.name
    }

    fn request_in(&self, mut req: Value) -> Result<Value, anyhow::Error> {
        let existing = req.get("max_tokens").and_then(Value::as_u64);
        let clamped = match existing {
            Some(existing) => existing.min(self.max_tokens),
            None => self.max_tokens,
        };
        req["max_tokens"] = Value::from(clamped);
        Ok(req)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn clamps_existing_value_above_ceiling() {
        let t = MaxTokenTransformer::new(16384);
        let out = t.request_in(json!({"max_tokens": 100_000})).unwrap();
        assert_eq!(out["max_tokens"], 16384);
    }

    #[test]
    fn leaves_value_below_ceiling_untouched() {
        let t = MaxTokenTransformer::new(16384);
        let out = t.request_in(json!({"max_tokens": 512})).unwrap();
        assert_eq!(out["max_tokens"], 512);
    }

    #[test]
    fn fills_in_missing_value_with_ceiling() {
        let t = MaxTokenTransformer::new(16384);
        let out = t.request_in(json!({})).unwrap();
        assert_eq!(out["max_tokens"], 16384);
    }
}
