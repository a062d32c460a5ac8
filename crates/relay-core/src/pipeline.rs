// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use futures::StreamExt;
use serde::Serialize;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use relay_config::ModelConfig;
use relay_model::{
    BlockDelta, CompletionRequest, ContentBlock, DeltaEvent, Message, ModelProvider, StopReason,
    ToolSchema,
};

use crate::{
    context::ExecutionContext,
    error::AgentError,
    events::{emit, EventGenerator, EventType, StreamEvent},
};

/// The assembled result of one streamed assistant turn.
#[derive(Debug)]
pub struct TurnOutcome {
    pub message: Message,
    pub stop_reason: Option<StopReason>,
    pub input_tokens: u64,
    pub output_tokens: u64,
}

#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct PipelineStats {
    pub requests: u64,
    pub successful: u64,
    pub failed: u64,
    pub fallback_used: u64,
}

/// Streaming request/response pipeline with an ordered fallback-model chain.
///
/// One provider instance serves every chain entry; the model name travels in
/// the request.  A failed attempt is never retried on the same model: the
/// chain is walked strictly forward from the failed entry, and a successful
/// fallback becomes the context's new model floor.
pub struct LlmPipeline {
    provider: Arc<dyn ModelProvider>,
    default_model: String,
    fallback_chain: Vec<String>,
    enable_fallback: bool,
    max_tokens: u32,
    stats: Mutex<PipelineStats>,
}

impl LlmPipeline {
    pub fn new(provider: Arc<dyn ModelProvider>, cfg: &ModelConfig) -> Self {
        info!(
            provider = provider.name(),
            model = %cfg.name,
            fallback = cfg.enable_fallback,
            "llm pipeline initialized"
        );
        Self {
            provider,
            default_model: cfg.name.clone(),
            fallback_chain: cfg.fallback_chain.clone(),
            enable_fallback: cfg.enable_fallback,
            max_tokens: cfg.max_output_tokens,
            stats: Mutex::new(PipelineStats::default()),
        }
    }

    /// Stream one assistant turn, forwarding conversation events through
    /// `tx` and returning the assembled final message.
    ///
    /// Target selection: `model_override` ?? the context's current model ??
    /// the configured default.
    pub async fn run_turn(
        &self,
        messages: &[Message],
        ctx: &mut ExecutionContext,
        system: Option<&str>,
        tools: &[ToolSchema],
        model_override: Option<&str>,
        gen: &mut EventGenerator,
        tx: &mpsc::Sender<StreamEvent>,
    ) -> Result<TurnOutcome, AgentError> {
        let target = model_override
            .map(str::to_string)
            .or_else(|| (!ctx.model.is_empty()).then(|| ctx.model.clone()))
            .unwrap_or_else(|| self.default_model.clone());

        self.stats.lock().expect("stats lock").requests += 1;

        match self
            .attempt(&target, messages, system, tools, ctx, gen, tx)
            .await
        {
            Ok(outcome) => {
                self.stats.lock().expect("stats lock").successful += 1;
                Ok(outcome)
            }
            Err(first_error) => {
                warn!(model = %target, error = %first_error, "model request failed");
                let chain_pos = self
                    .enable_fallback
                    .then(|| self.fallback_chain.iter().position(|m| m == &target))
                    .flatten();
                let Some(pos) = chain_pos else {
                    self.stats.lock().expect("stats lock").failed += 1;
                    return Err(AgentError::LlmUnavailable(first_error.to_string()));
                };

                for fallback in &self.fallback_chain[pos + 1..] {
                    info!(from = %target, to = %fallback, "falling back to next model");
                    match self
                        .attempt(fallback, messages, system, tools, ctx, gen, tx)
                        .await
                    {
                        Ok(outcome) => {
                            // Later calls start from the new floor.
                            ctx.model = fallback.clone();
                            let mut stats = self.stats.lock().expect("stats lock");
                            stats.fallback_used += 1;
                            stats.successful += 1;
                            return Ok(outcome);
                        }
                        Err(e) => {
                            warn!(model = %fallback, error = %e, "fallback model failed");
                        }
                    }
                }

                self.stats.lock().expect("stats lock").failed += 1;
                Err(AgentError::LlmUnavailable(format!(
                    "chain {:?} exhausted after {first_error}",
                    self.fallback_chain
                )))
            }
        }
    }

    /// Send a single user message and return the final assistant message,
    /// draining the event stream internally.
    pub async fn single_message(
        &self,
        message: &str,
        ctx: &mut ExecutionContext,
        system: Option<&str>,
        tools: &[ToolSchema],
    ) -> Result<Message, AgentError> {
        let messages = vec![Message::user(message)];
        let mut gen = EventGenerator::new(ctx.session_id());
        // Nobody listens; emits become no-ops once the receiver is dropped.
        let (tx, _rx) = mpsc::channel(64);
        let outcome = self
            .run_turn(&messages, ctx, system, tools, None, &mut gen, &tx)
            .await?;
        Ok(outcome.message)
    }

    pub fn stats(&self) -> PipelineStats {
        *self.stats.lock().expect("stats lock")
    }

    /// One streaming attempt against one model.  Events are forwarded live;
    /// a mid-stream failure aborts the attempt and surfaces as an error so
    /// the caller can walk the fallback chain.
    async fn attempt(
        &self,
        model: &str,
        messages: &[Message],
        system: Option<&str>,
        tools: &[ToolSchema],
        ctx: &mut ExecutionContext,
        gen: &mut EventGenerator,
        tx: &mpsc::Sender<StreamEvent>,
    ) -> anyhow::Result<TurnOutcome> {
        debug!(model, messages = messages.len(), tools = tools.len(), "starting model attempt");
        let req = CompletionRequest {
            model: model.to_string(),
            messages: messages.to_vec(),
            system: system.map(str::to_string),
            tools: tools.to_vec(),
            max_tokens: self.max_tokens,
            stream: true,
        };

        let mut stream = self.provider.stream(req).await?;

        let mut builders: BTreeMap<usize, BlockBuilder> = BTreeMap::new();
        let mut stop_reason = None;
        let mut message_id = String::new();
        let mut input_tokens = 0u64;
        let mut output_tokens = 0u64;

        while let Some(event) = stream.next().await {
            match event? {
                DeltaEvent::MessageStart {
                    id,
                    model,
                    input_tokens: input,
                } => {
                    message_id = id.clone();
                    input_tokens = input;
                    emit(
                        gen,
                        tx,
                        EventType::MessageStart,
                        json!({ "message": { "id": id, "model": model } }),
                    )
                    .await;
                }
                DeltaEvent::ContentBlockStart { index, block } => {
                    builders.insert(index, BlockBuilder::start(block));
                }
                DeltaEvent::ContentBlockDelta { index, delta } => match delta {
                    BlockDelta::TextDelta { text } if !text.is_empty() => {
                        builders
                            .entry(index)
                            .or_insert_with(|| BlockBuilder::start(ContentBlock::text("")))
                            .push_text(&text);
                        emit(
                            gen,
                            tx,
                            EventType::TextDelta,
                            json!({ "text": text, "index": index }),
                        )
                        .await;
                    }
                    BlockDelta::TextDelta { .. } => {}
                    BlockDelta::InputJsonDelta { partial_json } => {
                        if let Some(builder) = builders.get_mut(&index) {
                            builder.push_json(&partial_json);
                        }
                    }
                },
                DeltaEvent::ContentBlockStop { .. } => {}
                DeltaEvent::MessageDelta {
                    stop_reason: reason,
                    usage,
                } => {
                    if reason.is_some() {
                        stop_reason = reason;
                    }
                    output_tokens += usage.output_tokens;
                    // The usage-update path: the pipeline is the only
                    // component besides the orchestrator mutating the
                    // context.
                    ctx.update_token_usage(0, usage.output_tokens);
                }
                DeltaEvent::MessageStop => break,
            }
        }

        let blocks: Vec<ContentBlock> = builders.into_values().map(BlockBuilder::finish).collect();
        let message = Message::assistant_blocks(blocks);

        emit(
            gen,
            tx,
            EventType::MessageComplete,
            json!({
                "message": {
                    "id": message_id,
                    "role": "assistant",
                    "content": serde_json::to_value(&message.content).unwrap_or(Value::Null),
                    "model": model,
                    "stop_reason": stop_reason,
                },
                "usage": { "input_tokens": input_tokens, "output_tokens": output_tokens },
            }),
        )
        .await;

        Ok(TurnOutcome {
            message,
            stop_reason,
            input_tokens,
            output_tokens,
        })
    }
}

/// Accumulates one content block across its start/delta events.
enum BlockBuilder {
    Text(String),
    ToolUse {
        id: String,
        name: String,
        initial_input: Value,
        args_buf: String,
    },
    Other(ContentBlock),
}

impl BlockBuilder {
    fn start(block: ContentBlock) -> Self {
        match block {
            ContentBlock::Text { text } => Self::Text(text),
            ContentBlock::ToolUse { id, name, input } => Self::ToolUse {
                id,
                name,
                initial_input: input,
                args_buf: String::new(),
            },
            other => Self::Other(other),
        }
    }

    fn push_text(&mut self, delta: &str) {
        if let Self::Text(buf) = self {
            buf.push_str(delta);
        }
    }

    fn push_json(&mut self, delta: &str) {
        if let Self::ToolUse { args_buf, .. } = self {
            args_buf.push_str(delta);
        }
    }

    fn finish(self) -> ContentBlock {
        match self {
            Self::Text(text) => ContentBlock::Text { text },
            Self::ToolUse {
                id,
                name,
                initial_input,
                args_buf,
            } => {
                // Tool input must always resolve to a JSON object: the
                // accumulated argument deltas when present, the block-start
                // input otherwise, an empty object as the last resort.
                let input = if args_buf.is_empty() {
                    if initial_input.is_object() {
                        initial_input
                    } else {
                        Value::Object(Default::default())
                    }
                } else {
                    match serde_json::from_str(&args_buf) {
                        Ok(v) => v,
                        Err(e) => {
                            warn!(tool = %name, error = %e, "invalid tool arguments from model");
                            Value::Object(Default::default())
                        }
                    }
                };
                ContentBlock::ToolUse { id, name, input }
            }
            Self::Other(block) => block,
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use relay_config::AgentConfig;
    use relay_model::{text_turn, tool_turn, ScriptedMockProvider};

    fn model_cfg(name: &str, chain: &[&str]) -> ModelConfig {
        ModelConfig {
            provider: "mock".into(),
            name: name.into(),
            fallback_chain: chain.iter().map(|s| s.to_string()).collect(),
            ..ModelConfig::default()
        }
    }

    fn ctx(model: &str) -> ExecutionContext {
        ExecutionContext::new(model, &AgentConfig::default())
    }

    async fn run(
        pipeline: &LlmPipeline,
        ctx: &mut ExecutionContext,
    ) -> (Result<TurnOutcome, AgentError>, Vec<StreamEvent>) {
        let mut gen = EventGenerator::new("sess");
        let (tx, mut rx) = mpsc::channel(256);
        let messages = vec![Message::user("hello")];
        let outcome = pipeline
            .run_turn(&messages, ctx, None, &[], None, &mut gen, &tx)
            .await;
        drop(tx);
        let mut events = Vec::new();
        while let Some(e) = rx.recv().await {
            events.push(e);
        }
        (outcome, events)
    }

    // ── Assembly ──────────────────────────────────────────────────────────────

    #[tokio::test]
    async fn text_turn_assembles_final_message() {
        let provider = Arc::new(ScriptedMockProvider::new(vec![text_turn("a", "hi")]));
        let pipeline = LlmPipeline::new(provider, &model_cfg("a", &[]));
        let mut ctx = ctx("a");
        let (outcome, events) = run(&pipeline, &mut ctx).await;
        let outcome = outcome.unwrap();
        assert_eq!(outcome.message.content.to_text(), "hi");
        assert_eq!(outcome.stop_reason, Some(StopReason::EndTurn));

        let types: Vec<EventType> = events.iter().map(|e| e.event_type).collect();
        assert_eq!(
            types,
            vec![
                EventType::MessageStart,
                EventType::TextDelta,
                EventType::MessageComplete
            ]
        );
    }

    #[tokio::test]
    async fn tool_use_arguments_accumulate_across_deltas() {
        let script = tool_turn("a", "let me check", &[(
            "t1",
            "read_file",
            json!({"path": "/a"}),
        )]);
        let provider = Arc::new(ScriptedMockProvider::new(vec![script]));
        let pipeline = LlmPipeline::new(provider, &model_cfg("a", &[]));
        let mut ctx = ctx("a");
        let (outcome, _) = run(&pipeline, &mut ctx).await;
        let message = outcome.unwrap().message;
        let uses = message.tool_uses();
        assert_eq!(uses.len(), 1);
        assert_eq!(uses[0].0, "t1");
        assert_eq!(uses[0].1, "read_file");
        assert_eq!(*uses[0].2, json!({"path": "/a"}));
    }

    #[tokio::test]
    async fn usage_updates_context_output_tokens() {
        let provider = Arc::new(ScriptedMockProvider::new(vec![text_turn("a", "hi")]));
        let pipeline = LlmPipeline::new(provider, &model_cfg("a", &[]));
        let mut ctx = ctx("a");
        let before = ctx.token_usage().total;
        run(&pipeline, &mut ctx).await.0.unwrap();
        assert!(ctx.token_usage().output > 0);
        assert!(ctx.token_usage().total > before);
    }

    // ── Fallback chain ────────────────────────────────────────────────────────

    #[tokio::test]
    async fn fallback_walks_chain_forward_once_per_model() {
        let provider = Arc::new(
            ScriptedMockProvider::new(vec![text_turn("b", "rescued")]).fail_model("a"),
        );
        let attempted = Arc::clone(&provider.attempted_models);
        let pipeline = LlmPipeline::new(provider, &model_cfg("a", &["a", "b", "c"]));
        let mut ctx = ctx("a");
        let (outcome, events) = run(&pipeline, &mut ctx).await;
        assert_eq!(outcome.unwrap().message.content.to_text(), "rescued");
        // a failed, b succeeded, c never tried.
        assert_eq!(*attempted.lock().unwrap(), vec!["a", "b"]);
        // The run's events are exactly those produced by b.
        assert_eq!(events.len(), 3);
        // ctx.model moved to the new floor.
        assert_eq!(ctx.model, "b");
        assert_eq!(pipeline.stats().fallback_used, 1);
    }

    #[tokio::test]
    async fn exhausted_chain_is_llm_unavailable() {
        let provider = Arc::new(
            ScriptedMockProvider::new(vec![])
                .fail_model("a")
                .fail_model("b"),
        );
        let pipeline = LlmPipeline::new(provider, &model_cfg("a", &["a", "b"]));
        let mut ctx = ctx("a");
        let (outcome, _) = run(&pipeline, &mut ctx).await;
        assert!(matches!(outcome, Err(AgentError::LlmUnavailable(_))));
        assert_eq!(pipeline.stats().failed, 1);
    }

    #[tokio::test]
    async fn model_outside_chain_fails_without_fallback() {
        let provider = Arc::new(ScriptedMockProvider::new(vec![]).fail_model("rogue"));
        let attempted = Arc::clone(&provider.attempted_models);
        let pipeline = LlmPipeline::new(provider, &model_cfg("rogue", &["a", "b"]));
        let mut ctx = ctx("rogue");
        let (outcome, _) = run(&pipeline, &mut ctx).await;
        assert!(matches!(outcome, Err(AgentError::LlmUnavailable(_))));
        assert_eq!(*attempted.lock().unwrap(), vec!["rogue"]);
    }

    #[tokio::test]
    async fn fallback_disabled_fails_immediately() {
        let provider = Arc::new(ScriptedMockProvider::new(vec![]).fail_model("a"));
        let attempted = Arc::clone(&provider.attempted_models);
        let mut cfg = model_cfg("a", &["a", "b"]);
        cfg.enable_fallback = false;
        let pipeline = LlmPipeline::new(provider, &cfg);
        let mut ctx = ctx("a");
        let (outcome, _) = run(&pipeline, &mut ctx).await;
        assert!(matches!(outcome, Err(AgentError::LlmUnavailable(_))));
        assert_eq!(*attempted.lock().unwrap(), vec!["a"]);
    }

    // ── single_message ────────────────────────────────────────────────────────

    #[tokio::test]
    async fn single_message_returns_final_message() {
        let provider = Arc::new(ScriptedMockProvider::always_text("short answer"));
        let pipeline = LlmPipeline::new(provider, &model_cfg("m", &[]));
        let mut ctx = ctx("m");
        let msg = pipeline
            .single_message("question", &mut ctx, None, &[])
            .await
            .unwrap();
        assert_eq!(msg.content.to_text(), "short answer");
    }
}
