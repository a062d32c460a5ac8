// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! File-context injection with hard capacity bounds.
//!
//! Invariants held at every moment: file count ≤ `max_files`, per-file
//! tokens ≤ `max_tokens_per_file` (oversize content is truncated with a
//! trailer), total tokens ≤ `max_total_tokens` (lowest-priority entries are
//! evicted until the bound holds).  Paths must stay inside the project root
//! (or a platform temp directory) and must not match sensitive patterns.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use regex::RegexSet;
use serde::Serialize;
use serde_json::json;
use tracing::{debug, info, warn};

use relay_config::MemoryConfig;
use relay_model::tokens;

#[derive(Debug, thiserror::Error)]
pub enum InjectorError {
    #[error("path escapes the project root: {0}")]
    InvalidPath(PathBuf),
    #[error("path matches a sensitive pattern: {0}")]
    SensitivePath(PathBuf),
    #[error("file not found or unreadable: {0}")]
    NotFound(PathBuf),
    #[error("file exceeds the per-file token cap ({tokens} tokens): {path}")]
    OversizeFile { path: PathBuf, tokens: usize },
    #[error("file alone exceeds the total token budget: {0}")]
    CapacityExceeded(PathBuf),
}

/// One injected file.
#[derive(Debug, Clone, Serialize)]
pub struct FileContext {
    pub path: PathBuf,
    pub content: String,
    pub token_count: usize,
    pub file_size: u64,
    pub file_type: String,
    pub added_at: DateTime<Utc>,
    /// 0–10; higher survives eviction longer
    pub priority: u8,
    /// 0.0–1.0 task relevance
    pub relevance: f32,
}

impl FileContext {
    /// Render for prompt injection: a metadata header plus a fenced block.
    pub fn to_formatted_content(&self, show_line_numbers: bool) -> String {
        let mut lines = vec![
            format!("## File: {}", self.path.display()),
            String::new(),
            format!("**Type:** {}", self.file_type),
            format!("**Size:** {} bytes", self.file_size),
            format!("**Tokens:** {}", self.token_count),
            String::new(),
            format!("```{}", self.file_type),
        ];
        if show_line_numbers {
            for (i, line) in self.content.lines().enumerate() {
                lines.push(format!("{:4} {line}", i + 1));
            }
        } else {
            lines.push(self.content.clone());
        }
        lines.push("```".to_string());
        lines.join("\n")
    }
}

const SENSITIVE_PATTERNS: [&str; 6] = [
    r"\.env",
    r"\.git",
    r"id_rsa",
    r"credentials",
    r"secret",
    r"password",
];

#[derive(Debug, Clone, Serialize)]
pub struct InjectorStats {
    pub total_files: usize,
    pub total_tokens: usize,
    pub max_files: usize,
    pub max_tokens_per_file: usize,
    pub max_total_tokens: usize,
    pub capacity_usage: f64,
}

/// Table of injected file contexts, keyed by path.
pub struct ContextInjector {
    project_root: PathBuf,
    max_files: usize,
    max_tokens_per_file: usize,
    max_total_tokens: usize,
    files: HashMap<PathBuf, FileContext>,
    total_tokens: usize,
    sensitive: RegexSet,
}

impl ContextInjector {
    pub fn new(project_root: impl Into<PathBuf>, cfg: &MemoryConfig) -> Self {
        let sensitive = RegexSet::new(SENSITIVE_PATTERNS.iter().map(|p| format!("(?i){p}")))
            .expect("sensitive patterns are valid regexes");
        Self {
            project_root: project_root.into(),
            max_files: cfg.max_files,
            max_tokens_per_file: cfg.max_tokens_per_file,
            max_total_tokens: cfg.max_total_tokens,
            files: HashMap::new(),
            total_tokens: 0,
            sensitive,
        }
    }

    /// Add a file to the injection table.
    ///
    /// With `auto_truncate`, content past the per-file cap is cut (with a
    /// trailer); without it an oversize file is rejected.  Returns the path
    /// key of the stored context.
    pub fn add_file(
        &mut self,
        path: impl AsRef<Path>,
        priority: u8,
        auto_truncate: bool,
    ) -> Result<&FileContext, InjectorError> {
        let path = path.as_ref();
        let resolved = self.security_check(path)?;

        if let Some(existing) = self.files.get(&resolved) {
            debug!(path = %resolved.display(), "file already injected");
            // Borrow checker gymnastics: re-fetch under the map's lifetime.
            let key = existing.path.clone();
            return Ok(&self.files[&key]);
        }

        let metadata =
            std::fs::metadata(&resolved).map_err(|_| InjectorError::NotFound(resolved.clone()))?;
        let content = std::fs::read_to_string(&resolved)
            .map_err(|_| InjectorError::NotFound(resolved.clone()))?;

        let mut token_count = tokens::estimate(&content);
        let mut content = content;
        if token_count > self.max_tokens_per_file {
            if !auto_truncate {
                return Err(InjectorError::OversizeFile {
                    path: resolved,
                    tokens: token_count,
                });
            }
            warn!(
                path = %resolved.display(),
                tokens = token_count,
                cap = self.max_tokens_per_file,
                "truncating oversize file"
            );
            content = truncate_to_tokens(&content, self.max_tokens_per_file);
            token_count = tokens::estimate(&content);
        }

        if token_count > self.max_total_tokens {
            return Err(InjectorError::CapacityExceeded(resolved));
        }

        // Capacity: evict the lowest-priority entries until both the file
        // count and total token bounds hold with the new entry included.
        while self.files.len() >= self.max_files
            || self.total_tokens + token_count > self.max_total_tokens
        {
            if !self.evict_lowest_priority() {
                break;
            }
        }

        let context = FileContext {
            path: resolved.clone(),
            content,
            token_count,
            file_size: metadata.len(),
            file_type: resolved
                .extension()
                .map(|e| e.to_string_lossy().into_owned())
                .unwrap_or_else(|| "unknown".into()),
            added_at: Utc::now(),
            priority: priority.min(10),
            relevance: 0.5,
        };

        info!(
            path = %resolved.display(),
            tokens = token_count,
            priority = context.priority,
            "file injected"
        );
        self.total_tokens += token_count;
        Ok(self.files.entry(resolved).or_insert(context))
    }

    /// Batch insert; files failing checks are skipped with a warning.
    pub fn add_files(
        &mut self,
        paths: impl IntoIterator<Item = PathBuf>,
        priority: u8,
    ) -> usize {
        let mut added = 0;
        for path in paths {
            match self.add_file(&path, priority, true) {
                Ok(_) => added += 1,
                Err(e) => warn!(path = %path.display(), error = %e, "skipping file"),
            }
        }
        added
    }

    pub fn remove_file(&mut self, path: impl AsRef<Path>) -> bool {
        let key = match self.resolve(path.as_ref()) {
            Some(key) => key,
            None => return false,
        };
        match self.files.remove(&key) {
            Some(context) => {
                self.total_tokens -= context.token_count;
                info!(path = %key.display(), "file removed from context");
                true
            }
            None => false,
        }
    }

    pub fn get(&self, path: impl AsRef<Path>) -> Option<&FileContext> {
        let key = self.resolve(path.as_ref())?;
        self.files.get(&key)
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    pub fn total_tokens(&self) -> usize {
        self.total_tokens
    }

    pub fn clear(&mut self) {
        self.files.clear();
        self.total_tokens = 0;
    }

    /// The formatted section suitable for prompt injection: files sorted by
    /// priority descending, with a totals footer.
    pub fn injected_content(&self, show_line_numbers: bool) -> String {
        if self.files.is_empty() {
            return String::new();
        }
        let mut contexts: Vec<&FileContext> = self.files.values().collect();
        contexts.sort_by(|a, b| {
            b.priority
                .cmp(&a.priority)
                .then_with(|| a.path.cmp(&b.path))
        });

        let mut sections = vec!["# Injected File Contexts".to_string()];
        for context in &contexts {
            sections.push(context.to_formatted_content(show_line_numbers));
        }
        sections.push(format!(
            "**Total Files:** {}\n**Total Tokens:** {}",
            contexts.len(),
            self.total_tokens
        ));
        sections.join("\n\n")
    }

    pub fn stats(&self) -> InjectorStats {
        InjectorStats {
            total_files: self.files.len(),
            total_tokens: self.total_tokens,
            max_files: self.max_files,
            max_tokens_per_file: self.max_tokens_per_file,
            max_total_tokens: self.max_total_tokens,
            capacity_usage: self.total_tokens as f64 / self.max_total_tokens as f64,
        }
    }

    pub fn files_summary(&self) -> serde_json::Value {
        let files: Vec<_> = self
            .files
            .values()
            .map(|c| {
                json!({
                    "path": c.path.display().to_string(),
                    "tokens": c.token_count,
                    "priority": c.priority,
                })
            })
            .collect();
        json!(files)
    }

    /// Resolve to the canonical key used in the table.
    fn resolve(&self, path: &Path) -> Option<PathBuf> {
        path.canonicalize().ok()
    }

    /// Reject escapes from the project root (temp directories excepted) and
    /// sensitive path patterns.
    fn security_check(&self, path: &Path) -> Result<PathBuf, InjectorError> {
        if self.sensitive.is_match(&path.to_string_lossy()) {
            warn!(path = %path.display(), "sensitive path rejected");
            return Err(InjectorError::SensitivePath(path.to_path_buf()));
        }

        let resolved = path
            .canonicalize()
            .map_err(|_| InjectorError::NotFound(path.to_path_buf()))?;

        let root = self
            .project_root
            .canonicalize()
            .unwrap_or_else(|_| self.project_root.clone());
        let in_root = resolved.starts_with(&root);
        let temp_root = std::env::temp_dir()
            .canonicalize()
            .unwrap_or_else(|_| std::env::temp_dir());
        let in_temp = resolved.starts_with(&temp_root);

        if !in_root && !in_temp {
            warn!(path = %resolved.display(), "path outside project root rejected");
            return Err(InjectorError::InvalidPath(resolved));
        }

        if self.sensitive.is_match(&resolved.to_string_lossy()) {
            warn!(path = %resolved.display(), "sensitive path rejected");
            return Err(InjectorError::SensitivePath(resolved));
        }

        Ok(resolved)
    }

    /// Remove the lowest-priority (oldest among ties) entry.
    fn evict_lowest_priority(&mut self) -> bool {
        let victim = self
            .files
            .values()
            .min_by(|a, b| {
                a.priority
                    .cmp(&b.priority)
                    .then_with(|| a.added_at.cmp(&b.added_at))
            })
            .map(|c| c.path.clone());
        match victim {
            Some(path) => {
                info!(path = %path.display(), "evicting lowest-priority file");
                if let Some(context) = self.files.remove(&path) {
                    self.total_tokens -= context.token_count;
                }
                true
            }
            None => false,
        }
    }
}

/// Keep the head of `content` within the token cap, with a trailer marking
/// the cut.
fn truncate_to_tokens(content: &str, max_tokens: usize) -> String {
    const TRAILER: &str = "\n\n... (content truncated)";
    let budget_chars = max_tokens.saturating_mul(4).saturating_sub(TRAILER.len());
    let kept: String = content.chars().take(budget_chars).collect();
    // Cut at a line boundary when one is reasonably close.
    let kept = match kept.rfind('\n') {
        Some(pos) if pos > budget_chars / 2 => kept[..pos].to_string(),
        _ => kept,
    };
    format!("{kept}{TRAILER}")
}

impl std::fmt::Debug for ContextInjector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ContextInjector")
            .field("files", &self.files.len())
            .field("total_tokens", &self.total_tokens)
            .field("max_files", &self.max_files)
            .field("max_total_tokens", &self.max_total_tokens)
            .finish()
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
