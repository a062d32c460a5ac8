// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
pub mod tokens;

mod anthropic;
mod mock;
mod provider;
mod types;

pub use anthropic::AnthropicProvider;
pub use mock::{text_turn, tool_turn, MockProvider, ScriptedMockProvider};
pub use provider::{
    BlockDelta, CompletionRequest, DeltaEvent, DeltaStream, ModelProvider, StopReason,
    ToolSchema, UsageDelta,
};
pub use types::{ContentBlock, Message, MessageContent, Role};

use std::sync::Arc;

use relay_config::ModelConfig;

/// Construct a shared [`ModelProvider`] from configuration.
///
/// The `mock` provider needs no credentials and is intended for tests and
/// offline runs; `anthropic` reads its key from config or the environment
/// (this call is the environment boundary).
pub fn from_config(cfg: &ModelConfig) -> anyhow::Result<Arc<dyn ModelProvider>> {
    match cfg.provider.as_str() {
        "anthropic" => {
            let provider = match explicit_api_key(cfg) {
                Some(key) => AnthropicProvider::new(key, cfg.base_url.clone()),
                None => AnthropicProvider::from_env()?,
            };
            Ok(Arc::new(provider))
        }
        "mock" => Ok(Arc::new(MockProvider)),
        other => anyhow::bail!("unknown model provider: {other:?} (expected anthropic | mock)"),
    }
}

fn explicit_api_key(cfg: &ModelConfig) -> Option<String> {
    if let Some(k) = &cfg.api_key {
        return Some(k.clone());
    }
    if let Some(env) = &cfg.api_key_env {
        return std::env::var(env).ok();
    }
    None
}
