// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use serde::{Deserialize, Serialize};

/// Serde default helper — returns `true`.
///
/// Used for config fields that should be enabled unless the user explicitly
/// sets them to `false`.  `#[serde(default)]` on a `bool` always falls back
/// to `bool::default()` (i.e. `false`), so a named function is required.
fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub model: ModelConfig,
    #[serde(default)]
    pub agent: AgentConfig,
    #[serde(default)]
    pub compression: CompressionConfig,
    #[serde(default)]
    pub queue: QueueConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub memory: MemoryConfig,
    #[serde(default)]
    pub tools: ToolsConfig,
}

// ─── Model ────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    /// Provider identifier: "anthropic" | "mock"
    pub provider: String,
    /// Default model name forwarded to the provider API
    pub name: String,
    /// Explicit API key; prefer the environment in version-controlled files
    pub api_key: Option<String>,
    /// Environment variable that holds the API key (read at driver construction)
    pub api_key_env: Option<String>,
    /// Base URL override for proxies and gateways
    pub base_url: Option<String>,
    /// Maximum tokens to request in a single completion
    #[serde(default = "default_max_output_tokens")]
    pub max_output_tokens: u32,
    /// Ordered fallback chain tried in sequence when a request fails.
    /// Each entry is attempted at most once per call; there is no retry with
    /// the same model.
    #[serde(default)]
    pub fallback_chain: Vec<String>,
    /// Whether the fallback chain is consulted at all
    #[serde(default = "default_true")]
    pub enable_fallback: bool,
}

fn default_max_output_tokens() -> u32 {
    16_384
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            provider: "anthropic".into(),
            name: "claude-sonnet-4-5".into(),
            api_key: None,
            api_key_env: None,
            base_url: None,
            max_output_tokens: 16_384,
            fallback_chain: vec![
                "claude-sonnet-4-5".into(),
                "claude-haiku-4-5".into(),
            ],
            enable_fallback: true,
        }
    }
}

// ─── Agent loop ───────────────────────────────────────────────────────────────

fn default_warn_threshold() -> f32 {
    0.60
}
fn default_error_threshold() -> f32 {
    0.80
}
fn default_compress_threshold() -> f32 {
    0.92
}
fn default_max_concurrent_tools() -> usize {
    10
}
fn default_max_iterations() -> u64 {
    // Effectively unbounded: the agent works until the task is complete.
    999_999
}
fn default_context_window() -> usize {
    200_000
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    /// Token usage fraction at which a usage warning is injected into the
    /// system prompt
    #[serde(default = "default_warn_threshold")]
    pub warn_threshold: f32,
    /// Token usage fraction at which the usage alert escalates to critical
    #[serde(default = "default_error_threshold")]
    pub error_threshold: f32,
    /// Token usage fraction at which history compression triggers
    #[serde(default = "default_compress_threshold")]
    pub compress_threshold: f32,
    /// Upper bound on tool payloads in flight at any moment
    #[serde(default = "default_max_concurrent_tools")]
    pub max_concurrent_tools: usize,
    /// Maximum orchestrator iterations per run
    #[serde(default = "default_max_iterations")]
    pub max_iterations: u64,
    /// Context window used when the model is not in the static table
    #[serde(default = "default_context_window")]
    pub context_window: usize,
    /// Append a verification reminder to the last tool result when a worker
    /// completion sentinel (`WORKERS_COMPLETED` / `is_task_complete`) is seen
    #[serde(default = "default_true")]
    pub worker_reminder: bool,
    /// Include the sub-agent capability section in generated system prompts
    #[serde(default = "default_true")]
    pub include_subagent_info: bool,
    /// Full base-prompt override for the prompt assembler
    pub base_prompt: Option<String>,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            warn_threshold: default_warn_threshold(),
            error_threshold: default_error_threshold(),
            compress_threshold: default_compress_threshold(),
            max_concurrent_tools: default_max_concurrent_tools(),
            max_iterations: default_max_iterations(),
            context_window: default_context_window(),
            worker_reminder: true,
            include_subagent_info: true,
            base_prompt: None,
        }
    }
}

// ─── Compression ──────────────────────────────────────────────────────────────

fn default_keep_recent() -> usize {
    10
}
fn default_max_fragment_len() -> usize {
    150
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompressionConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Number of most-recent non-system messages preserved verbatim
    #[serde(default = "default_keep_recent")]
    pub keep_recent: usize,
    /// Per-fragment character cap inside summary segments
    #[serde(default = "default_max_fragment_len")]
    pub max_fragment_len: usize,
}

impl Default for CompressionConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            keep_recent: default_keep_recent(),
            max_fragment_len: default_max_fragment_len(),
        }
    }
}

// ─── Queue / scheduler ────────────────────────────────────────────────────────

fn default_queue_max_size() -> usize {
    1000
}
fn default_batch_size() -> usize {
    10
}
fn default_batch_timeout_ms() -> u64 {
    100
}
fn default_max_retries() -> u32 {
    3
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueConfig {
    /// Capacity of each priority band
    #[serde(default = "default_queue_max_size")]
    pub max_size: usize,
    /// Default batch size for the background worker
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    /// Default batch drain deadline in milliseconds
    #[serde(default = "default_batch_timeout_ms")]
    pub batch_timeout_ms: u64,
    /// Handler failures tolerated before a message is dropped
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_size: default_queue_max_size(),
            batch_size: default_batch_size(),
            batch_timeout_ms: default_batch_timeout_ms(),
            max_retries: default_max_retries(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Counting-semaphore capacity for the task pool
    #[serde(default = "default_max_concurrent_tools")]
    pub max_concurrent: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_concurrent: default_max_concurrent_tools(),
        }
    }
}

// ─── Memory ───────────────────────────────────────────────────────────────────

fn default_max_messages() -> usize {
    1000
}
fn default_max_compression_history() -> usize {
    10
}
fn default_max_files() -> usize {
    20
}
fn default_max_tokens_per_file() -> usize {
    8192
}
fn default_max_total_tokens() -> usize {
    32_768
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryConfig {
    /// Short-term store capacity (oldest-first eviction beyond this)
    #[serde(default = "default_max_messages")]
    pub max_messages: usize,
    /// Ring size of retained compression records
    #[serde(default = "default_max_compression_history")]
    pub max_compression_history: usize,
    /// File-context injector: maximum number of injected files
    #[serde(default = "default_max_files")]
    pub max_files: usize,
    /// File-context injector: per-file token cap (oversize is truncated)
    #[serde(default = "default_max_tokens_per_file")]
    pub max_tokens_per_file: usize,
    /// File-context injector: total token budget across all files
    #[serde(default = "default_max_total_tokens")]
    pub max_total_tokens: usize,
    #[serde(default = "default_true")]
    pub enable_long_term: bool,
    #[serde(default = "default_true")]
    pub enable_context_injection: bool,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            max_messages: default_max_messages(),
            max_compression_history: default_max_compression_history(),
            max_files: default_max_files(),
            max_tokens_per_file: default_max_tokens_per_file(),
            max_total_tokens: default_max_total_tokens(),
            enable_long_term: true,
            enable_context_injection: true,
        }
    }
}

// ─── Tools ────────────────────────────────────────────────────────────────────

fn default_permission() -> String {
    "allow".into()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolsConfig {
    /// Default permission decision when no per-tool override applies:
    /// "allow" | "deny" | "ask"
    #[serde(default = "default_permission")]
    pub default_permission: String,
    /// Per-tool permission overrides, tool name → decision
    #[serde(default)]
    pub permissions: std::collections::HashMap<String, String>,
}

impl Default for ToolsConfig {
    fn default() -> Self {
        Self {
            default_permission: default_permission(),
            permissions: Default::default(),
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_thresholds_match_documented_constants() {
        let cfg = AgentConfig::default();
        assert_eq!(cfg.warn_threshold, 0.60);
        assert_eq!(cfg.error_threshold, 0.80);
        assert_eq!(cfg.compress_threshold, 0.92);
        assert_eq!(cfg.max_concurrent_tools, 10);
    }

    #[test]
    fn default_model_caps_output_at_16384() {
        assert_eq!(ModelConfig::default().max_output_tokens, 16_384);
    }

    #[test]
    fn default_queue_band_capacity_is_1000() {
        assert_eq!(QueueConfig::default().max_size, 1000);
    }

    #[test]
    fn default_memory_bounds() {
        let m = MemoryConfig::default();
        assert_eq!(m.max_messages, 1000);
        assert_eq!(m.max_files, 20);
        assert_eq!(m.max_tokens_per_file, 8192);
        assert_eq!(m.max_total_tokens, 32_768);
    }

    #[test]
    fn compression_keeps_ten_recent_by_default() {
        assert_eq!(CompressionConfig::default().keep_recent, 10);
    }

    #[test]
    fn partial_yaml_fills_in_defaults() {
        let cfg: Config = serde_yaml::from_str("agent:\n  warn_threshold: 0.5").unwrap();
        assert_eq!(cfg.agent.warn_threshold, 0.5);
        assert_eq!(cfg.agent.compress_threshold, 0.92);
        assert_eq!(cfg.queue.max_size, 1000);
    }

    #[test]
    fn fallback_chain_round_trips_through_yaml() {
        let yaml = "model:\n  provider: mock\n  name: a\n  fallback_chain: [a, b, c]";
        let cfg: Config = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(cfg.model.fallback_chain, vec!["a", "b", "c"]);
        assert!(cfg.model.enable_fallback);
    }

    #[test]
    fn tools_default_permission_is_allow() {
        assert_eq!(ToolsConfig::default().default_permission, "allow");
    }
}
