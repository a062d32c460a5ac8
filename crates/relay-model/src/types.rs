// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::tokens;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

/// A single content block inside a message.
///
/// The wire shape mirrors the Anthropic Messages API so that blocks streamed
/// from the provider can be stored in history without translation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentBlock {
    Text {
        text: String,
    },
    ToolUse {
        id: String,
        name: String,
        input: Value,
    },
    ToolResult {
        tool_use_id: String,
        content: Value,
        #[serde(default)]
        is_error: bool,
    },
    Image {
        media_type: String,
        /// Base64-encoded payload
        data: String,
    },
}

impl ContentBlock {
    pub fn text(text: impl Into<String>) -> Self {
        Self::Text { text: text.into() }
    }

    pub fn tool_use(id: impl Into<String>, name: impl Into<String>, input: Value) -> Self {
        Self::ToolUse {
            id: id.into(),
            name: name.into(),
            input,
        }
    }

    fn approx_tokens(&self) -> usize {
        match self {
            Self::Text { text } => tokens::estimate(text),
            Self::ToolUse { name, input, .. } => {
                tokens::estimate(name) + tokens::estimate_value(input)
            }
            Self::ToolResult { content, .. } => tokens::estimate_value(content),
            // Conservative flat estimate for an image block; the provider
            // charges by resolution which the core cannot know.
            Self::Image { .. } => 765,
        }
    }
}

/// The content of a message: a plain text blob or an ordered block sequence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MessageContent {
    Text(String),
    Blocks(Vec<ContentBlock>),
}

impl MessageContent {
    pub fn is_empty(&self) -> bool {
        match self {
            Self::Text(t) => t.trim().is_empty(),
            Self::Blocks(b) => b.is_empty(),
        }
    }

    /// Flatten to plain text: text blocks joined, non-text blocks summarised.
    pub fn to_text(&self) -> String {
        match self {
            Self::Text(t) => t.clone(),
            Self::Blocks(blocks) => blocks
                .iter()
                .map(|b| match b {
                    ContentBlock::Text { text } => text.clone(),
                    ContentBlock::ToolUse { name, input, .. } => {
                        format!("[tool_use: {name}({input})]")
                    }
                    ContentBlock::ToolResult { content, .. } => {
                        format!("[tool_result: {content}]")
                    }
                    ContentBlock::Image { media_type, .. } => format!("[image: {media_type}]"),
                })
                .collect::<Vec<_>>()
                .join("\n"),
        }
    }
}

fn new_message_id() -> String {
    Uuid::new_v4().to_string()
}

/// A single message in the conversation history.
///
/// `tool_use_id` and `tool_name` are mandatory for `Role::Tool` messages:
/// a tool message answers exactly one prior assistant tool-use block, and
/// results appear in history in the same order as the tool-uses they answer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    #[serde(default = "new_message_id")]
    pub id: String,
    pub role: Role,
    pub content: MessageContent,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_use_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_name: Option<String>,
    #[serde(default = "Utc::now")]
    pub timestamp: DateTime<Utc>,
    /// Cached token estimate; computed at construction, recomputed on demand
    /// when a message arrives from deserialization with no cached value.
    #[serde(default)]
    token_count: usize,
}

impl Message {
    fn build(role: Role, content: MessageContent) -> Self {
        let mut msg = Self {
            id: new_message_id(),
            role,
            content,
            tool_use_id: None,
            tool_name: None,
            timestamp: Utc::now(),
            token_count: 0,
        };
        msg.token_count = msg.estimate_tokens();
        msg
    }

    pub fn system(text: impl Into<String>) -> Self {
        Self::build(Role::System, MessageContent::Text(text.into()))
    }

    pub fn user(text: impl Into<String>) -> Self {
        Self::build(Role::User, MessageContent::Text(text.into()))
    }

    pub fn assistant(text: impl Into<String>) -> Self {
        Self::build(Role::Assistant, MessageContent::Text(text.into()))
    }

    pub fn assistant_blocks(blocks: Vec<ContentBlock>) -> Self {
        Self::build(Role::Assistant, MessageContent::Blocks(blocks))
    }

    pub fn tool_result(
        tool_use_id: impl Into<String>,
        tool_name: impl Into<String>,
        content: Value,
    ) -> Self {
        let tool_use_id = tool_use_id.into();
        let mut msg = Self::build(
            Role::Tool,
            MessageContent::Blocks(vec![ContentBlock::ToolResult {
                tool_use_id: tool_use_id.clone(),
                content,
                is_error: false,
            }]),
        );
        msg.tool_use_id = Some(tool_use_id);
        msg.tool_name = Some(tool_name.into());
        msg
    }

    /// Return the plain text of this message, if its content is a text blob.
    pub fn as_text(&self) -> Option<&str> {
        match &self.content {
            MessageContent::Text(t) => Some(t),
            MessageContent::Blocks(_) => None,
        }
    }

    /// All tool-use blocks in this message, in content order.
    pub fn tool_uses(&self) -> Vec<(&str, &str, &Value)> {
        match &self.content {
            MessageContent::Blocks(blocks) => blocks
                .iter()
                .filter_map(|b| match b {
                    ContentBlock::ToolUse { id, name, input } => {
                        Some((id.as_str(), name.as_str(), input))
                    }
                    _ => None,
                })
                .collect(),
            MessageContent::Text(_) => Vec::new(),
        }
    }

    fn estimate_tokens(&self) -> usize {
        match &self.content {
            MessageContent::Text(t) => tokens::estimate(t),
            MessageContent::Blocks(blocks) => blocks.iter().map(|b| b.approx_tokens()).sum(),
        }
    }

    /// Cached token estimate for this message.
    pub fn token_count(&self) -> usize {
        if self.token_count > 0 {
            self.token_count
        } else {
            self.estimate_tokens()
        }
    }

    /// The API-shape view: role + content (+ tool linkage), internal
    /// bookkeeping fields dropped.
    pub fn to_api_value(&self) -> Value {
        let mut obj = serde_json::Map::new();
        obj.insert("role".into(), serde_json::to_value(self.role).unwrap_or_default());
        obj.insert(
            "content".into(),
            serde_json::to_value(&self.content).unwrap_or_default(),
        );
        if let Some(id) = &self.tool_use_id {
            obj.insert("tool_use_id".into(), Value::String(id.clone()));
        }
        Value::Object(obj)
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    // ── Construction ─────────────────────────────────────────────────────────

    #[test]
    fn user_message_has_role_and_text() {
        let m = Message::user("hello");
        assert_eq!(m.role, Role::User);
        assert_eq!(m.as_text(), Some("hello"));
    }

    #[test]
    fn messages_get_unique_ids() {
        assert_ne!(Message::user("a").id, Message::user("a").id);
    }

    #[test]
    fn tool_result_carries_linkage_fields() {
        let m = Message::tool_result("t1", "read_file", json!({"success": true}));
        assert_eq!(m.role, Role::Tool);
        assert_eq!(m.tool_use_id.as_deref(), Some("t1"));
        assert_eq!(m.tool_name.as_deref(), Some("read_file"));
    }

    #[test]
    fn tool_result_content_is_a_tool_result_block() {
        let m = Message::tool_result("t1", "read_file", json!("OK"));
        match &m.content {
            MessageContent::Blocks(blocks) => match &blocks[0] {
                ContentBlock::ToolResult { tool_use_id, .. } => assert_eq!(tool_use_id, "t1"),
                other => panic!("wrong block variant: {other:?}"),
            },
            _ => panic!("tool result must be block content"),
        }
    }

    // ── Tool-use extraction ───────────────────────────────────────────────────

    #[test]
    fn tool_uses_preserve_content_order() {
        let m = Message::assistant_blocks(vec![
            ContentBlock::text("thinking"),
            ContentBlock::tool_use("a", "first", json!({})),
            ContentBlock::tool_use("b", "second", json!({})),
        ]);
        let uses = m.tool_uses();
        assert_eq!(uses.len(), 2);
        assert_eq!(uses[0].0, "a");
        assert_eq!(uses[1].0, "b");
    }

    #[test]
    fn text_message_has_no_tool_uses() {
        assert!(Message::assistant("plain").tool_uses().is_empty());
    }

    // ── Token accounting ──────────────────────────────────────────────────────

    #[test]
    fn token_count_cached_at_construction() {
        let m = Message::user("12345678");
        assert_eq!(m.token_count(), 2);
    }

    #[test]
    fn image_block_uses_flat_estimate() {
        let m = Message::assistant_blocks(vec![ContentBlock::Image {
            media_type: "image/png".into(),
            data: "QUJD".into(),
        }]);
        assert_eq!(m.token_count(), 765);
    }

    // ── Content helpers ───────────────────────────────────────────────────────

    #[test]
    fn empty_text_content_is_empty() {
        assert!(MessageContent::Text("  ".into()).is_empty());
        assert!(MessageContent::Blocks(vec![]).is_empty());
    }

    #[test]
    fn to_text_flattens_blocks() {
        let c = MessageContent::Blocks(vec![
            ContentBlock::text("let me check"),
            ContentBlock::tool_use("t1", "read_file", json!({"path": "/a"})),
        ]);
        let text = c.to_text();
        assert!(text.contains("let me check"));
        assert!(text.contains("read_file"));
    }

    // ── Serialization ─────────────────────────────────────────────────────────

    #[test]
    fn content_block_uses_anthropic_wire_tags() {
        let b = ContentBlock::tool_use("t1", "grep", json!({"pattern": "x"}));
        let json = serde_json::to_value(&b).unwrap();
        assert_eq!(json["type"], "tool_use");
        assert_eq!(json["id"], "t1");
        assert_eq!(json["name"], "grep");
    }

    #[test]
    fn api_view_drops_internal_fields() {
        let m = Message::user("hi");
        let v = m.to_api_value();
        assert_eq!(v["role"], "user");
        assert!(v.get("id").is_none());
        assert!(v.get("timestamp").is_none());
        assert!(v.get("token_count").is_none());
    }

    #[test]
    fn message_round_trips_through_json() {
        let m = Message::assistant_blocks(vec![ContentBlock::text("hi")]);
        let json = serde_json::to_string(&m).unwrap();
        let back: Message = serde_json::from_str(&json).unwrap();
        assert_eq!(back.role, Role::Assistant);
        assert_eq!(back.content, m.content);
    }
}
