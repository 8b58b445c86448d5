//! The `anthropic` built-in: used when inbound and outbound dialect already
//! match the client dialect, so every pass is a no-op.

use crate::transformer::Transformer;

pub struct IdentityTransformer;

impl Transformer for IdentityTransformer {
    fn name(&self) -> &str {
        "anthropic"
    }

    fn is_passthrough(&self) -> bool {
        true
    }

    fn auth_header(&self, api_key: &str) -> Option<(&'static str, String)> {
        Some(("x-api-key", api_key.to_string()))
    }
}
