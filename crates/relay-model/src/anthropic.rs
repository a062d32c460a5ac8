// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use anyhow::{bail, Context};
use async_trait::async_trait;
use futures::StreamExt;
use serde_json::{json, Value};
use tracing::debug;

use crate::{
    provider::{BlockDelta, DeltaEvent, DeltaStream, StopReason, UsageDelta},
    CompletionRequest, ContentBlock, Message, MessageContent, Role,
};

/// Streaming driver for the Anthropic Messages API (and compatible proxies).
pub struct AnthropicProvider {
    api_key: String,
    base_url: String,
    client: reqwest::Client,
}

impl AnthropicProvider {
    pub fn new(api_key: impl Into<String>, base_url: Option<String>) -> Self {
        Self {
            api_key: api_key.into(),
            base_url: base_url.unwrap_or_else(|| "https://api.anthropic.com".into()),
            client: reqwest::Client::new(),
        }
    }

    /// Construct from the environment.  This is the only place the process
    /// environment is consulted:
    ///
    /// - `USE_CLAUDE_PROXY=true` selects `CLAUDE_PROXY_API_KEY` and
    ///   `CLAUDE_PROXY_BASE_URL`;
    /// - otherwise `ANTHROPIC_API_KEY` against the official endpoint.
    pub fn from_env() -> anyhow::Result<Self> {
        let use_proxy = std::env::var("USE_CLAUDE_PROXY")
            .map(|v| v.eq_ignore_ascii_case("true"))
            .unwrap_or(false);

        if use_proxy {
            let key = std::env::var("CLAUDE_PROXY_API_KEY")
                .context("USE_CLAUDE_PROXY=true but CLAUDE_PROXY_API_KEY is not set")?;
            let base = std::env::var("CLAUDE_PROXY_BASE_URL").ok();
            debug!("using proxy API key");
            return Ok(Self::new(key, base));
        }

        let key = std::env::var("ANTHROPIC_API_KEY").context(
            "no API key found; set ANTHROPIC_API_KEY, or CLAUDE_PROXY_API_KEY with \
             USE_CLAUDE_PROXY=true",
        )?;
        Ok(Self::new(key, None))
    }
}

#[async_trait]
impl crate::ModelProvider for AnthropicProvider {
    fn name(&self) -> &str {
        "anthropic"
    }

    async fn stream(&self, req: CompletionRequest) -> anyhow::Result<DeltaStream> {
        let (system, messages) = build_wire_messages(&req.messages, req.system.as_deref());

        let mut body = json!({
            "model": req.model,
            "messages": messages,
            "max_tokens": req.max_tokens,
            "stream": true,
        });
        if !system.is_empty() {
            body["system"] = json!(system);
        }
        if !req.tools.is_empty() {
            let tools: Vec<Value> = req
                .tools
                .iter()
                .map(|t| {
                    json!({
                        "name": t.name,
                        "description": t.description,
                        "input_schema": t.input_schema,
                    })
                })
                .collect();
            body["tools"] = json!(tools);
        }

        debug!(model = %req.model, messages = req.messages.len(), "sending anthropic request");

        let resp = self
            .client
            .post(format!("{}/v1/messages", self.base_url))
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", "2023-06-01")
            .json(&body)
            .send()
            .await
            .context("Anthropic request failed")?;

        if !resp.status().is_success() {
            let status = resp.status();
            let text = resp.text().await.unwrap_or_default();
            bail!("Anthropic error {status}: {text}");
        }

        let byte_stream = resp.bytes_stream();
        // SSE lines can be split across TCP chunks, so we carry a remainder
        // buffer forward.  Only complete lines (terminated by '\n') are parsed;
        // anything left over is prepended to the next chunk.
        let event_stream = byte_stream
            .scan(String::new(), |buf, chunk| {
                let text = match chunk {
                    Ok(b) => String::from_utf8_lossy(&b).to_string(),
                    Err(e) => {
                        return futures::future::ready(Some(vec![Err(anyhow::anyhow!(e))]));
                    }
                };
                buf.push_str(&text);
                let mut events = Vec::new();
                while let Some(pos) = buf.find('\n') {
                    let line = buf[..pos].trim_end_matches('\r').to_string();
                    buf.drain(..=pos);
                    if let Some(data) = line.strip_prefix("data: ") {
                        let data = data.trim();
                        if let Ok(v) = serde_json::from_str::<Value>(data) {
                            if let Some(ev) = parse_sse_event(&v) {
                                events.push(Ok(ev));
                            }
                        }
                    }
                }
                futures::future::ready(Some(events))
            })
            .flat_map(futures::stream::iter);

        Ok(Box::pin(event_stream))
    }
}

/// Convert history messages into the Anthropic wire shape.
///
/// - `Role::System` messages are folded into the system string (the API has
///   no system role inside `messages`); the compressor's summary message
///   lands here.
/// - `Role::Tool` messages become `user` turns whose content is the
///   tool_result block array, as the API requires.
fn build_wire_messages(messages: &[Message], system: Option<&str>) -> (String, Vec<Value>) {
    let mut system_parts: Vec<String> = Vec::new();
    if let Some(s) = system {
        if !s.is_empty() {
            system_parts.push(s.to_string());
        }
    }

    let mut wire = Vec::with_capacity(messages.len());
    for msg in messages {
        match msg.role {
            Role::System => system_parts.push(msg.content.to_text()),
            Role::Tool => {
                let content = match &msg.content {
                    MessageContent::Blocks(blocks) => serde_json::to_value(blocks)
                        .unwrap_or_else(|_| json!([])),
                    MessageContent::Text(t) => json!([{
                        "type": "tool_result",
                        "tool_use_id": msg.tool_use_id.clone().unwrap_or_default(),
                        "content": t,
                    }]),
                };
                wire.push(json!({ "role": "user", "content": content }));
            }
            Role::User | Role::Assistant => {
                let role = if msg.role == Role::User { "user" } else { "assistant" };
                let content = match &msg.content {
                    MessageContent::Text(t) => json!(t),
                    MessageContent::Blocks(blocks) => {
                        serde_json::to_value(blocks).unwrap_or_else(|_| json!([]))
                    }
                };
                wire.push(json!({ "role": role, "content": content }));
            }
        }
    }

    (system_parts.join("\n\n"), wire)
}

/// Map one parsed SSE JSON object to a typed delta event.
/// Returns `None` for event types the core does not consume (ping etc.).
fn parse_sse_event(v: &Value) -> Option<DeltaEvent> {
    match v["type"].as_str().unwrap_or("") {
        "message_start" => {
            let msg = &v["message"];
            Some(DeltaEvent::MessageStart {
                id: msg["id"].as_str().unwrap_or_default().to_string(),
                model: msg["model"].as_str().unwrap_or_default().to_string(),
                input_tokens: msg["usage"]["input_tokens"].as_u64().unwrap_or(0),
            })
        }
        "content_block_start" => {
            let index = v["index"].as_u64().unwrap_or(0) as usize;
            let block = parse_content_block(&v["content_block"])?;
            Some(DeltaEvent::ContentBlockStart { index, block })
        }
        "content_block_delta" => {
            let index = v["index"].as_u64().unwrap_or(0) as usize;
            let delta = &v["delta"];
            let delta = match delta["type"].as_str().unwrap_or("") {
                "text_delta" => BlockDelta::TextDelta {
                    text: delta["text"].as_str().unwrap_or("").to_string(),
                },
                "input_json_delta" => BlockDelta::InputJsonDelta {
                    partial_json: delta["partial_json"].as_str().unwrap_or("").to_string(),
                },
                _ => return None,
            };
            Some(DeltaEvent::ContentBlockDelta { index, delta })
        }
        "content_block_stop" => Some(DeltaEvent::ContentBlockStop {
            index: v["index"].as_u64().unwrap_or(0) as usize,
        }),
        "message_delta" => {
            let stop_reason = match v["delta"]["stop_reason"].as_str() {
                Some("end_turn") => Some(StopReason::EndTurn),
                Some("tool_use") => Some(StopReason::ToolUse),
                Some("max_tokens") => Some(StopReason::MaxTokens),
                Some("stop_sequence") => Some(StopReason::StopSequence),
                _ => None,
            };
            Some(DeltaEvent::MessageDelta {
                stop_reason,
                usage: UsageDelta {
                    input_tokens: v["usage"]["input_tokens"].as_u64().unwrap_or(0),
                    output_tokens: v["usage"]["output_tokens"].as_u64().unwrap_or(0),
                },
            })
        }
        "message_stop" => Some(DeltaEvent::MessageStop),
        _ => None,
    }
}

fn parse_content_block(v: &Value) -> Option<ContentBlock> {
    match v["type"].as_str().unwrap_or("") {
        "text" => Some(ContentBlock::Text {
            text: v["text"].as_str().unwrap_or("").to_string(),
        }),
        "tool_use" => Some(ContentBlock::ToolUse {
            id: v["id"].as_str().unwrap_or_default().to_string(),
            name: v["name"].as_str().unwrap_or_default().to_string(),
            input: v["input"].clone(),
        }),
        _ => None,
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    // ── Wire conversion ───────────────────────────────────────────────────────

    #[test]
    fn system_messages_fold_into_system_string() {
        let msgs = vec![Message::system("summary"), Message::user("hi")];
        let (system, wire) = build_wire_messages(&msgs, Some("base"));
        assert!(system.contains("base"));
        assert!(system.contains("summary"));
        assert_eq!(wire.len(), 1);
        assert_eq!(wire[0]["role"], "user");
    }

    #[test]
    fn tool_messages_become_user_tool_result_turns() {
        let msgs = vec![Message::tool_result("t1", "read_file", json!("OK"))];
        let (_, wire) = build_wire_messages(&msgs, None);
        assert_eq!(wire[0]["role"], "user");
        assert_eq!(wire[0]["content"][0]["type"], "tool_result");
        assert_eq!(wire[0]["content"][0]["tool_use_id"], "t1");
    }

    #[test]
    fn assistant_blocks_serialise_as_content_array() {
        let msgs = vec![Message::assistant_blocks(vec![
            ContentBlock::text("let me check"),
            ContentBlock::tool_use("t1", "read_file", json!({"path": "/a"})),
        ])];
        let (_, wire) = build_wire_messages(&msgs, None);
        assert_eq!(wire[0]["role"], "assistant");
        assert_eq!(wire[0]["content"][1]["type"], "tool_use");
    }

    // ── SSE parsing ───────────────────────────────────────────────────────────

    #[test]
    fn parses_message_start_with_usage() {
        let v = json!({
            "type": "message_start",
            "message": {"id": "msg_1", "model": "m", "usage": {"input_tokens": 42}}
        });
        match parse_sse_event(&v) {
            Some(DeltaEvent::MessageStart { input_tokens, .. }) => assert_eq!(input_tokens, 42),
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn parses_text_delta() {
        let v = json!({
            "type": "content_block_delta",
            "index": 0,
            "delta": {"type": "text_delta", "text": "hi"}
        });
        match parse_sse_event(&v) {
            Some(DeltaEvent::ContentBlockDelta {
                delta: BlockDelta::TextDelta { text },
                ..
            }) => assert_eq!(text, "hi"),
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn parses_input_json_delta() {
        let v = json!({
            "type": "content_block_delta",
            "index": 1,
            "delta": {"type": "input_json_delta", "partial_json": "{\"pa"}
        });
        match parse_sse_event(&v) {
            Some(DeltaEvent::ContentBlockDelta {
                index,
                delta: BlockDelta::InputJsonDelta { partial_json },
            }) => {
                assert_eq!(index, 1);
                assert_eq!(partial_json, "{\"pa");
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn parses_message_delta_stop_reason() {
        let v = json!({
            "type": "message_delta",
            "delta": {"stop_reason": "tool_use"},
            "usage": {"output_tokens": 7}
        });
        match parse_sse_event(&v) {
            Some(DeltaEvent::MessageDelta { stop_reason, usage }) => {
                assert_eq!(stop_reason, Some(StopReason::ToolUse));
                assert_eq!(usage.output_tokens, 7);
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn ping_events_are_skipped() {
        assert!(parse_sse_event(&json!({"type": "ping"})).is_none());
    }
}
