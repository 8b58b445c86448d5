//! Token estimation over an inbound payload, using the `cl100k_base` BPE
//! vocabulary.
//!
//! The encoder itself never fails after the lazily-initialized static table
//! is built, but we keep `TokenCountError` on the signature so callers have
//! a real failure path to fall back on rather than an implicit `unwrap`.

use std::sync::OnceLock;
use tiktoken_rs::CoreBPE;

use crate::error::TokenCountError;
use crate::types::{AnthropicRequest, ContentBlock, TextOrBlocks};

static ENCODER: OnceLock<Result<CoreBPE, String>> = OnceLock::new();

fn encoder() -> Result<&'static CoreBPE, TokenCountError> {
    let cell = ENCODER.get_or_init(|| tiktoken_rs::cl100k_base().map_err(|e| e.to_string()));
    cell.as_ref().map_err(|e| TokenCountError::VocabInit(e.clone()))
}

fn count_str(bpe: &CoreBPE, s: &str) -> u64 {
    bpe.encode_with_special_tokens(s).len() as u64
}

/// Sums encoded tokens across every message, the system prompt, and every
/// tool declaration. Content part types this module does not recognise
/// contribute zero rather than erroring — only vocabulary initialization
/// failure is a hard error.
pub fn count_tokens(req: &AnthropicRequest) -> Result<u64, TokenCountError> {
    let bpe = encoder()?;
    let mut total = 0u64;

    for message in &req.messages {
        total += count_content(bpe, &message.content);
    }

    if let Some(system) = &req.system {
        total += count_content(bpe, system);
    }

    for tool in &req.tools {
        total += count_str(bpe, &tool.name);
        total += count_str(bpe, &tool.description);
        if let Ok(schema_json) = serde_json::to_string(&tool.input_schema) {
            total += count_str(bpe, &schema_json);
        }
    }

    Ok(total)
}

fn count_content(bpe: &CoreBPE, content: &TextOrBlocks) -> u64 {
    match content {
        TextOrBlocks::Text(text) => count_str(bpe, text),
        TextOrBlocks::Blocks(blocks) => blocks.iter().map(|b| count_block(bpe, b)).sum(),
    }
}

fn count_block(bpe: &CoreBPE, block: &ContentBlock) -> u64 {
    match block {
        ContentBlock::Text { text } => count_str(bpe, text),
        ContentBlock::ToolUse { input, .. } => serde_json::to_string(input)
            .map(|s| count_str(bpe, &s))
            .unwrap_or(0),
        ContentBlock::ToolResult { content, .. } => serde_json::to_string(content)
            .map(|s| count_str(bpe, &s))
            .unwrap_or(0),
        ContentBlock::Thinking { thinking, .. } => count_str(bpe, thinking),
        // Image parts have no text representation; unrecognised part types
        // contribute zero.
        ContentBlock::Image { .. } => 0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Message;

    fn req_with_text(text: &str) -> AnthropicRequest {
        AnthropicRequest {
            model: "m".to_string(),
            messages: vec![Message {
                role: "user".to_string(),
                content: TextOrBlocks::Text(text.to_string()),
            }],
            system: None,
            tools: vec![],
            thinking: None,
            stream: false,
            max_tokens: None,
            extra: serde_json::json!({}),
        }
    }

    #[test]
    fn counts_plain_text_message() {
        let req = req_with_text("hello world");
        let n = count_tokens(&req).unwrap();
        assert!(n > 0 && n < 10);
    }

    #[test]
    fn empty_message_counts_zero() {
        let req = req_with_text("");
        let n = count_tokens(&req).unwrap();
        assert_eq!(n, 0);
    }

    #[test]
    fn tool_schema_contributes_tokens() {
        let mut req = req_with_text("hi");
        req.tools.push(crate::types::Tool {
            name: "search".to_string(),
            description: "search the web".to_string(),
            input_schema: serde_json::json!({"type": "object", "properties": {"q": {"type": "string"}}}),
        });
        let with_tool = count_tokens(&req).unwrap();
        req.tools.clear();
        let without_tool = count_tokens(&req).unwrap();
        assert!(with_tool > without_tool);
    }
}
