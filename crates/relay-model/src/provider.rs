// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::pin::Pin;

use async_trait::async_trait;
use futures::Stream;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{ContentBlock, Message};

/// A tool schema handed to the model alongside a completion request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolSchema {
    pub name: String,
    pub description: String,
    /// JSON Schema of the input object
    pub input_schema: Value,
}

/// Request sent to a model provider.
#[derive(Debug, Clone)]
pub struct CompletionRequest {
    pub model: String,
    pub messages: Vec<Message>,
    pub system: Option<String>,
    pub tools: Vec<ToolSchema>,
    pub max_tokens: u32,
    pub stream: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    EndTurn,
    ToolUse,
    MaxTokens,
    StopSequence,
}

/// Incremental usage attached to `message_delta` events.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct UsageDelta {
    #[serde(default)]
    pub input_tokens: u64,
    #[serde(default)]
    pub output_tokens: u64,
}

/// A partial update to one content block.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BlockDelta {
    TextDelta { text: String },
    InputJsonDelta { partial_json: String },
}

/// One typed delta event from the provider's stream.
///
/// The taxonomy mirrors the Anthropic streaming wire format; every provider
/// (including mocks) speaks it so the pipeline assembles messages uniformly.
#[derive(Debug, Clone)]
pub enum DeltaEvent {
    MessageStart {
        id: String,
        model: String,
        input_tokens: u64,
    },
    ContentBlockStart {
        index: usize,
        block: ContentBlock,
    },
    ContentBlockDelta {
        index: usize,
        delta: BlockDelta,
    },
    ContentBlockStop {
        index: usize,
    },
    MessageDelta {
        stop_reason: Option<StopReason>,
        usage: UsageDelta,
    },
    MessageStop,
}

pub type DeltaStream = Pin<Box<dyn Stream<Item = anyhow::Result<DeltaEvent>> + Send>>;

/// An LLM endpoint capable of streaming completions.
///
/// Implementations are constructed once (environment variables are read only
/// at that boundary) and shared behind an `Arc`; the model name travels in
/// each request so a single instance serves the whole fallback chain.
#[async_trait]
pub trait ModelProvider: Send + Sync {
    /// Provider identifier for status display and logs.
    fn name(&self) -> &str;

    /// Begin a streaming completion.  The returned stream yields delta
    /// events in wire order and ends after `MessageStop` (or an error item).
    async fn stream(&self, req: CompletionRequest) -> anyhow::Result<DeltaStream>;
}
