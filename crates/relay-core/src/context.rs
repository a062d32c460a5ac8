// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde::Serialize;
use serde_json::Value;
use uuid::Uuid;

use relay_config::AgentConfig;

use crate::compress::CompressionRecord;

/// Cumulative token tally for one run.  `total` only ever grows.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct TokenUsage {
    pub input: u64,
    pub output: u64,
    pub total: u64,
}

/// Cloneable view of the run's abort flag.
///
/// The flag is monotonic (once set it never clears), so tool payloads and
/// the executor can poll it without coordination.
#[derive(Debug, Clone, Default)]
pub struct AbortSignal(Arc<AtomicBool>);

impl AbortSignal {
    pub fn is_aborted(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    /// Set the shared flag.  The context's `abort()` delegates here; holders
    /// of a clone can also trigger it while the context is exclusively
    /// borrowed by a running loop.
    pub fn abort(&self) {
        self.0.store(true, Ordering::SeqCst);
    }
}

/// Mutable per-run state.
///
/// Created at run start and owned by the orchestrator for exactly one `run`
/// invocation; other components read it or mutate it only through the
/// orchestrator's calls (the LLM pipeline's usage-update path included).
#[derive(Debug)]
pub struct ExecutionContext {
    session_id: String,
    /// Current model; mutated when a fallback model takes over so later
    /// calls start from the new floor.
    pub model: String,
    token_usage: TokenUsage,
    context_window: usize,
    pub is_compressed: bool,
    /// Append-only list of compression records for this run.
    pub compression_history: Vec<CompressionRecord>,
    abort: AbortSignal,
    /// Arbitrary scratch metadata.
    pub metadata: HashMap<String, Value>,
    warn_threshold: f32,
    error_threshold: f32,
    compress_threshold: f32,
}

impl ExecutionContext {
    pub fn new(model: impl Into<String>, cfg: &AgentConfig) -> Self {
        Self {
            session_id: Uuid::new_v4().to_string(),
            model: model.into(),
            token_usage: TokenUsage::default(),
            context_window: cfg.context_window,
            is_compressed: false,
            compression_history: Vec::new(),
            abort: AbortSignal::default(),
            metadata: HashMap::new(),
            warn_threshold: cfg.warn_threshold,
            error_threshold: cfg.error_threshold,
            compress_threshold: cfg.compress_threshold,
        }
    }

    /// Reuse an externally supplied session id (e.g. a transport session).
    pub fn with_session_id(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = session_id.into();
        self
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn token_usage(&self) -> TokenUsage {
        self.token_usage
    }

    pub fn context_window(&self) -> usize {
        self.context_window
    }

    /// Accumulate token usage.  Counts are unsigned so the tally is
    /// non-decreasing by construction.
    pub fn update_token_usage(&mut self, input: u64, output: u64) {
        self.token_usage.input += input;
        self.token_usage.output += output;
        self.token_usage.total += input + output;
    }

    /// Fraction of the context window consumed (0.0–1.0+).
    pub fn usage_rate(&self) -> f32 {
        if self.context_window == 0 {
            return 0.0;
        }
        self.token_usage.total as f32 / self.context_window as f32
    }

    pub fn should_warn(&self) -> bool {
        self.usage_rate() >= self.warn_threshold
    }

    pub fn should_error(&self) -> bool {
        self.usage_rate() >= self.error_threshold
    }

    pub fn should_compress(&self) -> bool {
        self.usage_rate() >= self.compress_threshold
    }

    /// Set the abort flag.  Monotonic: false → true only.
    pub fn abort(&self) {
        self.abort.abort();
    }

    pub fn is_aborted(&self) -> bool {
        self.abort.is_aborted()
    }

    /// Cloneable handle for components that outlive a borrow of the context
    /// (tool payloads, the executor's abort-check stage).
    pub fn abort_signal(&self) -> AbortSignal {
        self.abort.clone()
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
