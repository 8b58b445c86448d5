//! Client-dialect (Anthropic `/v1/messages`) wire types, and the normalized
//! request/response views the router and transformer chain operate over.
//!
//! Mirrors `frontend::{Message, ContentBlock, Tool, Usage}`
//! shapes, generalized slightly: types are the *output* of a
//! dialect-specific parser; here they double as the canonical client
//! dialect that every provider transformer maps to and from.

use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentBlock {
    Text {
        text: String,
    },
    Image {
        source: ImageSource,
    },
    ToolUse {
        id: String,
        name: String,
        input: Value,
    },
    ToolResult {
        tool_use_id: String,
        #[serde(default)]
        content: Value,
        #[serde(default, rename = "is_error")]
        is_error: bool,
    },
    Thinking {
        thinking: String,
        #[serde(default)]
        signature: Option<String>,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ImageSource {
    Base64 {
        media_type: String,
        data: String,
    },
    Url {
        url: String,
    },
}

/// Either a bare string or a list of content blocks — both are legal for
/// `system` and for a message's `content` in the client dialect.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum TextOrBlocks {
    Text(String),
    Blocks(Vec<ContentBlock>),
}

impl TextOrBlocks {
    pub fn as_plain_text(&self) -> String {
        match self {
            TextOrBlocks::Text(t) => t.clone(),
            TextOrBlocks::Blocks(blocks) => blocks
                .iter()
                .filter_map(|b| match b {
                    ContentBlock::Text { text } => Some(text.as_str()),
                    _ => None,
                })
                .collect::<Vec<_>>()
                .join("\n"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub role: String,
    pub content: TextOrBlocks,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Tool {
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub input_schema: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Usage {
    #[serde(default)]
    pub input_tokens: u64,
    #[serde(default)]
    pub output_tokens: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Thinking {
    #[serde(rename = "type", default)]
    pub kind: String,
    #[serde(default)]
    pub budget_tokens: Option<u64>,
}

impl Thinking {
    pub fn is_enabled(&self) -> bool {
        self.kind == "enabled"
    }
}

/// The inbound `/v1/messages` payload. Kept close to `serde_json::Value` at
/// the edges so unrecognised fields survive the round trip undamaged — the
/// transformer chain reads/writes through typed accessors where it matters
/// and otherwise treats the body as a `Value` tree.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AnthropicRequest {
    pub model: String,
    pub messages: Vec<Message>,
    #[serde(default)]
    pub system: Option<TextOrBlocks>,
    #[serde(default)]
    pub tools: Vec<Tool>,
    #[serde(default)]
    pub thinking: Option<Thinking>,
    #[serde(default)]
    pub stream: bool,
    #[serde(default)]
    pub max_tokens: Option<u64>,
    #[serde(flatten)]
    pub extra: Value,
}

impl AnthropicRequest {
    pub fn has_thinking(&self) -> bool {
        self.thinking.as_ref().is_some_and(Thinking::is_enabled)
    }

    /// Parses the comma-split explicit target out of `model`, if present.
    /// Only the first comma is significant — `model` containing two commas
    /// splits on the first.
    pub fn explicit_target(&self) -> Option<(&str, &str)> {
        self.model.split_once(',')
    }
}
