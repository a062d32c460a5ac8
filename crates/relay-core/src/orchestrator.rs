// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! The main orchestration loop.
//!
//! Each iteration runs six stages: preprocess messages, compression check,
//! system-prompt generation, conversation streaming, tool execution, result
//! collection.  The loop ends on a tool-less assistant turn, an abort, or
//! the iteration cap; consumers always see a terminal `loop_complete`
//! (or `error` when the model becomes unavailable).

use std::sync::{Arc, Mutex};

use serde::Serialize;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use relay_config::{Config, SchedulerConfig};
use relay_model::{Message, MessageContent, ModelProvider, ToolSchema};
use relay_scheduler::{MessageQueue, Scheduler, TaskPriority};
use relay_tools::{PermissionPolicy, ToolRegistry};

use crate::{
    compress::Compressor,
    context::ExecutionContext,
    error::AgentError,
    events::{emit, EventGenerator, EventType, StreamEvent},
    executor::{ToolCall, ToolExecutionResult, ToolExecutor},
    pipeline::LlmPipeline,
    prompt::PromptGenerator,
};

const WORKER_REMINDER: &str = "\n\nSYSTEM REMINDER: workers have completed, but the task is \
NOT done yet. You MUST now: (1) wait a few seconds for the environment to settle and pick up \
new files, (2) query the build errors, (3) fix any errors and query again until clean. Do NOT \
restart the dev server - it is already running. Do NOT produce a final response before the \
error check is clean.";

#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct OrchestratorStats {
    pub iterations: u64,
    pub messages_processed: u64,
    pub tools_executed: u64,
    pub compressions: u64,
}

/// What a finished run leaves behind.
#[derive(Debug)]
pub struct RunOutcome {
    /// Full message history including the new user message, assistant turns
    /// and tool results (post-compression when compression ran).
    pub history: Vec<Message>,
    pub iterations: u64,
    pub aborted: bool,
}

/// Composes the pipeline, executor, scheduler, compressor and prompt
/// assembler into the agent loop.  Owns its parts; none of them reference
/// back.
pub struct Orchestrator {
    pipeline: LlmPipeline,
    executor: Arc<ToolExecutor>,
    scheduler: Scheduler,
    /// Fan-in queue for tools and external producers (background
    /// sub-agents).  Not on the per-iteration path; start its worker to
    /// consume.
    queue: MessageQueue,
    compressor: Compressor,
    prompt: PromptGenerator,
    config: relay_config::AgentConfig,
    stats: Mutex<OrchestratorStats>,
}

impl Orchestrator {
    pub fn new(
        provider: Arc<dyn ModelProvider>,
        registry: Arc<ToolRegistry>,
        config: &Config,
    ) -> Self {
        let policy = PermissionPolicy::from_config(&config.tools);
        Self::with_policy(provider, registry, policy, config)
    }

    /// Construct with a caller-supplied permission policy (e.g. one carrying
    /// an async checker).
    pub fn with_policy(
        provider: Arc<dyn ModelProvider>,
        registry: Arc<ToolRegistry>,
        policy: PermissionPolicy,
        config: &Config,
    ) -> Self {
        info!(tools = registry.len(), "orchestrator initialized");
        Self {
            pipeline: LlmPipeline::new(provider, &config.model),
            executor: Arc::new(ToolExecutor::new(registry, policy)),
            scheduler: Scheduler::new(SchedulerConfig {
                max_concurrent: config.agent.max_concurrent_tools,
            }),
            queue: MessageQueue::new(config.queue.clone()),
            compressor: Compressor::new(config.compression.clone()),
            prompt: PromptGenerator::new(&config.agent),
            config: config.agent.clone(),
            stats: Mutex::new(OrchestratorStats::default()),
        }
    }

    /// The prompt assembler, for installing long-term memory context or
    /// custom sections before a run.
    pub fn prompt_mut(&mut self) -> &mut PromptGenerator {
        &mut self.prompt
    }

    pub fn executor(&self) -> &Arc<ToolExecutor> {
        &self.executor
    }

    /// The fan-in message queue.  External producers enqueue; callers that
    /// want asynchronous processing register handlers and `start()` it.
    pub fn queue(&self) -> &MessageQueue {
        &self.queue
    }

    /// Aggregate statistics across the loop and its components.
    pub fn stats(&self) -> Value {
        let own = *self.stats.lock().expect("stats lock");
        json!({
            "iterations": own.iterations,
            "messages_processed": own.messages_processed,
            "tools_executed": own.tools_executed,
            "compressions": own.compressions,
            "pipeline": self.pipeline.stats(),
            "tool_executor": self.executor.stats(),
            "scheduler": self.scheduler.stats(),
            "message_queue": self.queue.stats(),
        })
    }

    /// Run the agent loop for one user message.
    ///
    /// Events stream through `tx` in emission order; the returned outcome
    /// carries the final history.  Within one iteration all conversation
    /// events precede tool events, and each `tool_result` follows its
    /// `tool_executing` with the same call id.
    pub async fn run(
        &self,
        user_message: &str,
        ctx: &mut ExecutionContext,
        history: Vec<Message>,
        tx: &mpsc::Sender<StreamEvent>,
    ) -> Result<RunOutcome, AgentError> {
        let mut gen = EventGenerator::new(ctx.session_id());
        let mut messages = history;
        messages.push(Message::user(user_message));

        let max_iterations = self.config.max_iterations;
        let mut iterations = 0u64;
        let mut aborted = false;

        for iteration in 1..=max_iterations {
            iterations = iteration;
            self.stats.lock().expect("stats lock").iterations += 1;

            if ctx.is_aborted() {
                warn!("abort flag set; stopping before iteration {iteration}");
                emit(
                    &mut gen,
                    tx,
                    EventType::Warning,
                    json!({ "message": "Execution aborted by user" }),
                )
                .await;
                aborted = true;
                break;
            }

            debug!(iteration, "loop iteration starting");
            emit(
                &mut gen,
                tx,
                EventType::Iteration,
                json!({ "iteration": iteration, "max_iterations": max_iterations }),
            )
            .await;

            // Stage 1: preprocess messages
            messages = preprocess_messages(messages);
            self.stats.lock().expect("stats lock").messages_processed += messages.len() as u64;

            // Stage 2: compression check
            if self.compressor.enabled() && ctx.should_compress() {
                emit(
                    &mut gen,
                    tx,
                    EventType::CompressionStart,
                    json!({ "status": "start", "message_count": messages.len() }),
                )
                .await;
                match self.compressor.compress_if_needed(&messages, ctx) {
                    Ok(Some(outcome)) => {
                        self.stats.lock().expect("stats lock").compressions += 1;
                        messages = outcome.messages;
                        emit(
                            &mut gen,
                            tx,
                            EventType::CompressionSuccess,
                            json!({
                                "status": "success",
                                "message_count": messages.len(),
                                "original_count": outcome.record.original_count,
                                "compressed_count": outcome.record.compressed_count,
                                "tokens_saved": outcome.record.tokens_saved,
                            }),
                        )
                        .await;
                    }
                    Ok(None) => {}
                    Err(e) => {
                        // History stays untouched; the loop continues.
                        warn!(error = %e, "compression failed");
                        emit(
                            &mut gen,
                            tx,
                            EventType::CompressionFailed,
                            json!({ "status": "failed", "error": e.to_string() }),
                        )
                        .await;
                    }
                }
            }

            // Stage 3: system prompt
            let schemas = self.model_schemas();
            let system_prompt = self.prompt.generate(
                ctx,
                &schemas,
                self.config.include_subagent_info,
                ctx.is_compressed,
            );

            // Stage 4: conversation stream
            let turn = match self
                .pipeline
                .run_turn(
                    &messages,
                    ctx,
                    Some(&system_prompt),
                    &schemas,
                    None,
                    &mut gen,
                    tx,
                )
                .await
            {
                Ok(turn) => turn,
                Err(e) => {
                    emit(
                        &mut gen,
                        tx,
                        EventType::Error,
                        json!({ "error": e.to_string(), "error_kind": e.kind(), "recoverable": false }),
                    )
                    .await;
                    return Err(e);
                }
            };
            messages.push(turn.message.clone());

            // Stage 5: tool execution
            let tool_uses: Vec<(String, String, Value)> = turn
                .message
                .tool_uses()
                .into_iter()
                .map(|(id, name, input)| (id.to_string(), name.to_string(), input.clone()))
                .collect();

            if tool_uses.is_empty() {
                info!("tool-less assistant turn; conversation complete");
                emit(
                    &mut gen,
                    tx,
                    EventType::Done,
                    json!({
                        "final_message": turn.message.to_api_value(),
                        "stats": self.stats(),
                    }),
                )
                .await;
                break;
            }

            for (call_id, name, input) in &tool_uses {
                emit(
                    &mut gen,
                    tx,
                    EventType::ToolExecuting,
                    json!({ "tool_name": name, "tool_input": input, "call_id": call_id }),
                )
                .await;
                let call = ToolCall::new(call_id.clone(), name.clone(), input.clone());
                let executor = Arc::clone(&self.executor);
                let abort = ctx.abort_signal();
                self.scheduler.schedule(
                    async move {
                        let result = executor.execute(call, &abort).await;
                        serde_json::to_value(result).map_err(Into::into)
                    },
                    TaskPriority::High,
                    Some(call_id.clone()),
                );
            }

            let results = self.scheduler.execute_pending(None).await;
            self.stats.lock().expect("stats lock").tools_executed += tool_uses.len() as u64;
            // Terminal task bookkeeping is dropped so tool-use ids from a
            // later iteration can never collide with this one's.
            self.scheduler.clear_finished();

            // Stage 6: collect results
            let mut needs_worker_reminder = false;
            for ((call_id, name, _), outcome) in tool_uses.iter().zip(results) {
                let payload = match outcome {
                    Ok(value) => match serde_json::from_value::<ToolExecutionResult>(value) {
                        Ok(execution) => {
                            if execution.success {
                                let result = execution.result.unwrap_or(Value::Null);
                                emit(
                                    &mut gen,
                                    tx,
                                    EventType::ToolResult,
                                    json!({
                                        "tool_name": name,
                                        "call_id": call_id,
                                        "success": true,
                                        "result": result.clone(),
                                    }),
                                )
                                .await;
                                result
                            } else {
                                let error = execution.error.unwrap_or_default();
                                emit(
                                    &mut gen,
                                    tx,
                                    EventType::ToolResult,
                                    json!({
                                        "tool_name": name,
                                        "call_id": call_id,
                                        "success": false,
                                        "error": error.clone(),
                                    }),
                                )
                                .await;
                                json!({
                                    "success": false,
                                    "error": error,
                                    "tool_name": name,
                                    "call_id": call_id,
                                })
                            }
                        }
                        Err(e) => {
                            warn!(error = %e, "malformed tool execution payload");
                            json!({ "success": false, "error": e.to_string() })
                        }
                    },
                    Err(e) => {
                        emit(
                            &mut gen,
                            tx,
                            EventType::ToolResult,
                            json!({
                                "tool_name": name,
                                "call_id": call_id,
                                "success": false,
                                "error": e.to_string(),
                            }),
                        )
                        .await;
                        json!({ "success": false, "error": e.to_string() })
                    }
                };

                if name == "spawn_section_workers"
                    || payload.to_string().contains("WORKERS_COMPLETED")
                    || payload.to_string().contains("is_task_complete")
                {
                    needs_worker_reminder = true;
                }

                messages.push(Message::tool_result(call_id.clone(), name.clone(), payload));
            }

            if needs_worker_reminder && self.config.worker_reminder {
                if let Some(last) = messages.last_mut() {
                    append_reminder(last, WORKER_REMINDER);
                    info!("worker completion sentinel seen; reminder appended");
                }
            }

            if ctx.is_aborted() {
                warn!("abort flag set; stopping after iteration {iteration}");
                emit(
                    &mut gen,
                    tx,
                    EventType::Warning,
                    json!({ "message": "Execution aborted by user" }),
                )
                .await;
                aborted = true;
                break;
            }
        }

        emit(
            &mut gen,
            tx,
            EventType::LoopComplete,
            json!({
                "iterations": iterations,
                "partial": aborted,
                "stats": self.stats(),
            }),
        )
        .await;

        Ok(RunOutcome {
            history: messages,
            iterations,
            aborted,
        })
    }

    fn model_schemas(&self) -> Vec<ToolSchema> {
        self.executor
            .registry()
            .schemas()
            .into_iter()
            .map(|s| ToolSchema {
                name: s.name,
                description: s.description,
                input_schema: s.input_schema,
            })
            .collect()
    }
}

/// Stage 1: drop empty messages, merge adjacent same-role text messages,
/// collapse single-text block content to the plain text shape.
fn preprocess_messages(messages: Vec<Message>) -> Vec<Message> {
    let mut out: Vec<Message> = Vec::with_capacity(messages.len());
    for mut msg in messages {
        if msg.content.is_empty() {
            continue;
        }
        // Canonicalize: a block list holding exactly one text block is the
        // same message in a noisier shape.
        if let MessageContent::Blocks(blocks) = &msg.content {
            if blocks.len() == 1 {
                if let relay_model::ContentBlock::Text { text } = &blocks[0] {
                    msg.content = MessageContent::Text(text.clone());
                }
            }
        }
        // Merge runs of same-role plain-text messages (tool messages are
        // never merged: their identity is their tool_use_id).
        if let (Some(prev), MessageContent::Text(text)) = (out.last_mut(), &msg.content) {
            let mergeable = prev.role == msg.role
                && prev.role != relay_model::Role::Tool
                && matches!(prev.content, MessageContent::Text(_));
            if mergeable {
                if let MessageContent::Text(prev_text) = &mut prev.content {
                    prev_text.push_str("\n\n");
                    prev_text.push_str(text);
                }
                continue;
            }
        }
        out.push(msg);
    }
    out
}

/// Append the reminder into a tool message's result payload.
fn append_reminder(msg: &mut Message, reminder: &str) {
    if let MessageContent::Blocks(blocks) = &mut msg.content {
        for block in blocks {
            if let relay_model::ContentBlock::ToolResult { content, .. } = block {
                match content {
                    Value::String(s) => s.push_str(reminder),
                    Value::Object(map) => {
                        map.insert("system_reminder".into(), json!(reminder));
                    }
                    other => {
                        *other = json!([other.clone(), reminder]);
                    }
                }
                return;
            }
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
