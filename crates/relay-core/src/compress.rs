// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Structured history compression.
//!
//! When token usage crosses the compression threshold the older part of the
//! conversation is replaced by a single system message containing eight
//! labeled segments extracted with keyword heuristics.  System messages and
//! the most recent `keep_recent` non-system messages survive verbatim.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use uuid::Uuid;

use relay_config::CompressionConfig;
use relay_model::{Message, Role};

use crate::{context::ExecutionContext, error::AgentError};

/// Accounting for one completed compression.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompressionRecord {
    pub id: String,
    pub timestamp: DateTime<Utc>,
    pub original_count: usize,
    pub compressed_count: usize,
    pub original_tokens: usize,
    pub compressed_tokens: usize,
    /// compressed / original token ratio (0.0 when original is empty)
    pub ratio: f64,
    pub tokens_saved: usize,
    /// Segment title → extracted content
    pub segments: BTreeMap<String, String>,
}

/// The rewritten history plus its accounting record.
#[derive(Debug)]
pub struct CompressionOutcome {
    pub messages: Vec<Message>,
    pub record: CompressionRecord,
}

/// Eight-segment structured compressor.
#[derive(Debug, Clone)]
pub struct Compressor {
    config: CompressionConfig,
}

impl Compressor {
    pub fn new(config: CompressionConfig) -> Self {
        Self { config }
    }

    pub fn enabled(&self) -> bool {
        self.config.enabled
    }

    /// Compress when the context says so.  Returns `Ok(None)` when disabled,
    /// below the threshold, or when the conversation is too short to split.
    ///
    /// On success the context records the compression and flips
    /// `is_compressed`; on failure the caller keeps the original history and
    /// messages are never lost.
    pub fn compress_if_needed(
        &self,
        messages: &[Message],
        ctx: &mut ExecutionContext,
    ) -> Result<Option<CompressionOutcome>, AgentError> {
        if !self.config.enabled || !ctx.should_compress() {
            return Ok(None);
        }
        info!(
            usage_rate = ctx.usage_rate(),
            messages = messages.len(),
            "token usage crossed compression threshold"
        );
        self.run(messages, ctx)
    }

    /// Compress regardless of the threshold (still a no-op for short
    /// conversations).
    pub fn force_compress(
        &self,
        messages: &[Message],
        ctx: &mut ExecutionContext,
    ) -> Result<Option<CompressionOutcome>, AgentError> {
        self.run(messages, ctx)
    }

    fn run(
        &self,
        messages: &[Message],
        ctx: &mut ExecutionContext,
    ) -> Result<Option<CompressionOutcome>, AgentError> {
        let (systems, conversation): (Vec<&Message>, Vec<&Message>) =
            messages.iter().partition(|m| m.role == Role::System);

        if conversation.len() <= self.config.keep_recent {
            return Ok(None);
        }

        let split = conversation.len() - self.config.keep_recent;
        let to_compress: Vec<&Message> = conversation[..split].to_vec();
        let recent: Vec<&Message> = conversation[split..].to_vec();

        let cap = self.config.max_fragment_len;
        let mut segments = BTreeMap::new();
        let extractors: [(&str, fn(&[&Message], usize) -> Option<String>); 8] = [
            ("Background Context", extract_background_context),
            ("Key Decisions", extract_key_decisions),
            ("Tool Usage Records", extract_tool_usage_records),
            ("User Intent Evolution", extract_user_intent_evolution),
            ("Execution Results", extract_execution_results),
            ("Error Handling", extract_error_handling),
            ("Open Issues", extract_open_issues),
            ("Future Plans", extract_future_plans),
        ];
        for (title, extract) in extractors {
            if let Some(content) = extract(&to_compress, cap) {
                segments.insert(title.to_string(), content);
            }
        }

        let summary_text = format_summary(&segments);
        let summary = Message::system(summary_text);

        let original_tokens: usize = messages.iter().map(|m| m.token_count()).sum();
        let mut rewritten: Vec<Message> = Vec::with_capacity(systems.len() + 1 + recent.len());
        rewritten.extend(systems.iter().map(|m| (*m).clone()));
        rewritten.push(summary);
        rewritten.extend(recent.iter().map(|m| (*m).clone()));
        let compressed_tokens: usize = rewritten.iter().map(|m| m.token_count()).sum();

        let compressed_segment_tokens: usize = to_compress.iter().map(|m| m.token_count()).sum();
        if compressed_tokens >= original_tokens {
            // The record still stands; flag it for operators.
            warn!(
                original_tokens,
                compressed_tokens, "compression did not shrink the history"
            );
        }

        let record = CompressionRecord {
            id: format!("compress_{}", Uuid::new_v4()),
            timestamp: Utc::now(),
            original_count: messages.len(),
            compressed_count: rewritten.len(),
            original_tokens,
            compressed_tokens,
            ratio: if original_tokens > 0 {
                compressed_tokens as f64 / original_tokens as f64
            } else {
                0.0
            },
            tokens_saved: original_tokens.saturating_sub(compressed_tokens),
            segments,
        };

        info!(
            from = record.original_count,
            to = record.compressed_count,
            saved = record.tokens_saved,
            segment_tokens = compressed_segment_tokens,
            "history compressed"
        );

        ctx.compression_history.push(record.clone());
        ctx.is_compressed = true;

        Ok(Some(CompressionOutcome {
            messages: rewritten,
            record,
        }))
    }
}

// ─── Segment extractors ───────────────────────────────────────────────────────

/// Truncate to `cap` characters on a char boundary.
fn fragment(text: &str, cap: usize) -> String {
    text.chars().take(cap).collect()
}

fn message_text(msg: &Message) -> String {
    msg.content.to_text()
}

fn contains_any(text: &str, keywords: &[&str]) -> bool {
    keywords.iter().any(|k| text.contains(k))
}

/// System framing plus the first user goal, from the first five messages.
fn extract_background_context(messages: &[&Message], cap: usize) -> Option<String> {
    let mut background = Vec::new();
    for msg in messages.iter().take(5) {
        match msg.role {
            Role::System => {
                background.push(format!("System: {}", fragment(&message_text(msg), cap)))
            }
            Role::User => {
                background.push(format!(
                    "Initial Goal: {}",
                    fragment(&message_text(msg), cap)
                ));
                break;
            }
            _ => {}
        }
    }
    (!background.is_empty()).then(|| background.join("\n"))
}

const DECISION_KEYWORDS: &[&str] = &[
    "decided",
    "choose",
    "selected",
    "approach",
    "strategy",
    "plan",
    "will implement",
    "going to",
    "decided to",
];

fn extract_key_decisions(messages: &[&Message], cap: usize) -> Option<String> {
    let decisions: Vec<String> = messages
        .iter()
        .filter(|m| m.role == Role::Assistant)
        .filter_map(|m| {
            let text = message_text(m);
            contains_any(&text.to_lowercase(), DECISION_KEYWORDS).then(|| fragment(&text, cap))
        })
        .take(5)
        .collect();
    (!decisions.is_empty()).then(|| format!("Key decisions:\n- {}", decisions.join("\n- ")))
}

fn extract_tool_usage_records(messages: &[&Message], cap: usize) -> Option<String> {
    let usage: Vec<String> = messages
        .iter()
        .filter(|m| m.role == Role::Tool)
        .map(|m| fragment(&message_text(m), cap.min(100)))
        .collect();
    if usage.is_empty() {
        return None;
    }
    let recent: Vec<&str> = usage
        .iter()
        .rev()
        .take(10)
        .rev()
        .map(String::as_str)
        .collect();
    Some(format!(
        "Tools used ({} times):\n- {}",
        usage.len(),
        recent.join("\n- ")
    ))
}

fn extract_user_intent_evolution(messages: &[&Message], cap: usize) -> Option<String> {
    let requests: Vec<String> = messages
        .iter()
        .filter(|m| m.role == Role::User)
        .map(|m| fragment(&message_text(m), cap))
        .collect();
    match requests.len() {
        0 => None,
        1 => Some(format!("User request: {}", requests[0])),
        n => Some(format!(
            "User intent evolution ({n} requests):\n1. Initial: {}\n2. Latest: {}",
            requests[0],
            requests[n - 1]
        )),
    }
}

const RESULT_KEYWORDS: &[&str] = &[
    "completed",
    "finished",
    "done",
    "success",
    "created",
    "updated",
    "modified",
    "implemented",
];

fn extract_execution_results(messages: &[&Message], cap: usize) -> Option<String> {
    let results: Vec<String> = messages
        .iter()
        .filter(|m| m.role == Role::Assistant)
        .filter_map(|m| {
            let text = message_text(m);
            contains_any(&text.to_lowercase(), RESULT_KEYWORDS).then(|| fragment(&text, cap))
        })
        .collect();
    if results.is_empty() {
        return None;
    }
    let recent: Vec<&str> = results
        .iter()
        .rev()
        .take(5)
        .rev()
        .map(String::as_str)
        .collect();
    Some(format!("Execution results:\n- {}", recent.join("\n- ")))
}

const ERROR_KEYWORDS: &[&str] = &["error", "failed", "exception", "bug", "issue"];

fn extract_error_handling(messages: &[&Message], cap: usize) -> Option<String> {
    let errors: Vec<String> = messages
        .iter()
        .filter_map(|m| {
            let text = message_text(m);
            contains_any(&text.to_lowercase(), ERROR_KEYWORDS).then(|| fragment(&text, cap))
        })
        .collect();
    if errors.is_empty() {
        return None;
    }
    let recent: Vec<&str> = errors
        .iter()
        .rev()
        .take(3)
        .rev()
        .map(String::as_str)
        .collect();
    Some(format!(
        "Errors encountered ({} times):\n- {}",
        errors.len(),
        recent.join("\n- ")
    ))
}

const ISSUE_KEYWORDS: &[&str] = &[
    "todo",
    "need to",
    "should",
    "pending",
    "waiting",
    "incomplete",
    "not yet",
    "still need",
];

/// Only the most recent 20 messages are scanned: older open issues have
/// usually been resolved or restated by now.
fn extract_open_issues(messages: &[&Message], cap: usize) -> Option<String> {
    let start = messages.len().saturating_sub(20);
    let issues: Vec<String> = messages[start..]
        .iter()
        .filter_map(|m| {
            let text = message_text(m);
            contains_any(&text.to_lowercase(), ISSUE_KEYWORDS).then(|| fragment(&text, cap))
        })
        .take(5)
        .collect();
    (!issues.is_empty()).then(|| format!("Open issues:\n- {}", issues.join("\n- ")))
}

const PLAN_KEYWORDS: &[&str] = &[
    "next",
    "will",
    "going to",
    "plan to",
    "intend to",
    "future",
    "later",
    "upcoming",
];

fn extract_future_plans(messages: &[&Message], cap: usize) -> Option<String> {
    let start = messages.len().saturating_sub(10);
    let plans: Vec<String> = messages[start..]
        .iter()
        .filter(|m| m.role == Role::Assistant)
        .filter_map(|m| {
            let text = message_text(m);
            contains_any(&text.to_lowercase(), PLAN_KEYWORDS).then(|| fragment(&text, cap))
        })
        .collect();
    if plans.is_empty() {
        return None;
    }
    let recent: Vec<&str> = plans
        .iter()
        .rev()
        .take(3)
        .rev()
        .map(String::as_str)
        .collect();
    Some(format!("Future plans:\n- {}", recent.join("\n- ")))
}

/// Fixed segment order for the summary document.
const SEGMENT_ORDER: [&str; 8] = [
    "Background Context",
    "Key Decisions",
    "Tool Usage Records",
    "User Intent Evolution",
    "Execution Results",
    "Error Handling",
    "Open Issues",
    "Future Plans",
];

fn format_summary(segments: &BTreeMap<String, String>) -> String {
    let mut parts = vec!["## Compressed Conversation History".to_string()];
    for title in SEGMENT_ORDER {
        if let Some(content) = segments.get(title) {
            parts.push(format!("\n### {title}\n{content}"));
        }
    }
    parts.join("\n")
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
