// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! The agent orchestration engine: execution context, structured history
//! compression, prompt assembly, the streaming LLM pipeline with fallback,
//! the staged tool executor, the typed event generator and the six-stage
//! main loop that composes them.

pub mod compress;
pub mod context;
pub mod error;
pub mod events;
pub mod executor;
pub mod orchestrator;
pub mod pipeline;
pub mod prompt;

pub use compress::{CompressionOutcome, CompressionRecord, Compressor};
pub use context::{AbortSignal, ExecutionContext, TokenUsage};
pub use error::AgentError;
pub use events::{EventGenerator, EventStats, EventType, StreamEvent};
pub use executor::{
    ExecutionStage, ExecutorStats, ToolCall, ToolExecutionResult, ToolExecutor,
};
pub use orchestrator::{Orchestrator, OrchestratorStats, RunOutcome};
pub use pipeline::{LlmPipeline, PipelineStats, TurnOutcome};
pub use prompt::PromptGenerator;
