// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::path::{Path, PathBuf};

use serde_json::{json, Value};
use tracing::{debug, info};

use relay_config::{CompressionConfig, MemoryConfig};
use relay_core::{AgentError, ExecutionContext};
use relay_model::Message;

use crate::{
    injector::{ContextInjector, FileContext, InjectorError},
    long_term::LongTermMemory,
    mid_term::MidTermMemory,
    short_term::ShortTermMemory,
};

/// Unified access to the four memory stores: the short-term message log,
/// the mid-term compression layer, the long-term project facts and the
/// file-context injector.
///
/// All mutations of the stores go through this manager; it owns them
/// exclusively.
#[derive(Debug)]
pub struct MemoryManager {
    project_root: PathBuf,
    pub short_term: ShortTermMemory,
    pub mid_term: MidTermMemory,
    long_term: Option<LongTermMemory>,
    injector: Option<ContextInjector>,
}

impl MemoryManager {
    pub fn new(
        project_root: impl Into<PathBuf>,
        memory_cfg: &MemoryConfig,
        compression_cfg: CompressionConfig,
    ) -> Self {
        let project_root = project_root.into();

        let long_term = memory_cfg.enable_long_term.then(|| {
            let mut memory = LongTermMemory::new(&project_root);
            memory.load();
            memory
        });
        let injector = memory_cfg
            .enable_context_injection
            .then(|| ContextInjector::new(&project_root, memory_cfg));

        info!(
            root = %project_root.display(),
            long_term = long_term.is_some(),
            context_injection = injector.is_some(),
            "memory manager initialized"
        );

        Self {
            project_root,
            short_term: ShortTermMemory::new(memory_cfg.max_messages),
            mid_term: MidTermMemory::new(compression_cfg, memory_cfg.max_compression_history),
            long_term,
            injector,
        }
    }

    pub fn project_root(&self) -> &Path {
        &self.project_root
    }

    // ── Message intake ────────────────────────────────────────────────────────

    pub fn add_user_message(&mut self, content: impl Into<String>) -> String {
        self.short_term.add_user(content)
    }

    pub fn add_assistant_message(&mut self, message: Message) -> String {
        self.short_term.add_assistant(message)
    }

    pub fn add_tool_result(
        &mut self,
        tool_use_id: impl Into<String>,
        tool_name: impl Into<String>,
        content: Value,
    ) -> String {
        self.short_term.add_tool_result(tool_use_id, tool_name, content)
    }

    /// Messages ready for an API call: compression applied when the context
    /// demands it, injected file contexts prepended as a system message.
    pub fn get_messages_for_api(
        &mut self,
        ctx: &mut ExecutionContext,
    ) -> Result<Vec<Message>, AgentError> {
        let mut messages = self.short_term.messages().to_vec();

        if let Some(compressed) = self.mid_term.compress_if_needed(&messages, ctx)? {
            debug!(
                from = messages.len(),
                to = compressed.len(),
                "history compressed for api call"
            );
            self.short_term.replace(compressed.clone());
            messages = compressed;
        }

        if let Some(injector) = &self.injector {
            if !injector.is_empty() {
                let content = injector.injected_content(true);
                messages.insert(
                    0,
                    Message::system(format!("## File Contexts\n\n{content}")),
                );
                debug!(
                    files = injector.len(),
                    tokens = injector.total_tokens(),
                    "file contexts injected"
                );
            }
        }

        Ok(messages)
    }

    // ── File-context injection ────────────────────────────────────────────────

    pub fn inject_file(
        &mut self,
        path: impl AsRef<Path>,
        priority: u8,
    ) -> Result<Option<&FileContext>, InjectorError> {
        match &mut self.injector {
            Some(injector) => injector.add_file(path, priority, true).map(Some),
            None => Ok(None),
        }
    }

    pub fn remove_injected_file(&mut self, path: impl AsRef<Path>) -> bool {
        self.injector
            .as_mut()
            .map(|i| i.remove_file(path))
            .unwrap_or(false)
    }

    pub fn injector(&self) -> Option<&ContextInjector> {
        self.injector.as_ref()
    }

    // ── Long-term facts ───────────────────────────────────────────────────────

    /// Compact long-term snippet for the system prompt; empty when the
    /// long-term store is disabled.
    pub fn long_term_context(&self) -> String {
        self.long_term
            .as_ref()
            .map(|m| m.context_snippet())
            .unwrap_or_default()
    }

    pub fn long_term(&self) -> Option<&LongTermMemory> {
        self.long_term.as_ref()
    }

    /// Update long-term facts and persist them.
    pub fn update_long_term(
        &mut self,
        project_name: Option<&str>,
        description: Option<&str>,
        tech_stack: Option<Vec<String>>,
        custom_instruction: Option<&str>,
    ) -> anyhow::Result<()> {
        let Some(memory) = &mut self.long_term else {
            anyhow::bail!("long-term memory is disabled");
        };
        memory.update_project_info(project_name, description, tech_stack);
        if let Some(instruction) = custom_instruction {
            memory.add_custom_instruction(instruction);
        }
        memory.save()
    }

    // ── Clearing & stats ──────────────────────────────────────────────────────

    pub fn clear_short_term(&mut self) {
        self.short_term.clear();
    }

    pub fn clear_injected_files(&mut self) {
        if let Some(injector) = &mut self.injector {
            injector.clear();
        }
    }

    pub fn clear_all(&mut self) {
        self.clear_short_term();
        self.mid_term.clear_history();
        self.clear_injected_files();
        info!("all memory stores cleared");
    }

    pub fn stats(&self) -> Value {
        json!({
            "short_term": self.short_term.stats(),
            "mid_term": self.mid_term.stats(),
            "long_term": self.long_term.as_ref().map(|m| m.stats()),
            "context_injection": self.injector.as_ref().map(|i| i.stats()),
        })
    }

    /// Markdown overview of all stores.
    pub fn summary(&self) -> String {
        let mut lines = vec!["# Memory System Summary".to_string(), String::new()];

        let short = self.short_term.stats();
        lines.push("## Short-Term Memory".to_string());
        lines.push(format!("- **Messages:** {}", short.total_messages));
        lines.push(format!("- **Tokens:** {}", short.total_tokens));
        lines.push(format!("- **User Messages:** {}", short.user_messages));
        lines.push(format!(
            "- **Assistant Messages:** {}",
            short.assistant_messages
        ));
        lines.push(String::new());

        let mid = self.mid_term.stats();
        lines.push("## Mid-Term Memory".to_string());
        lines.push(format!(
            "- **Total Compressions:** {}",
            mid.total_compressions
        ));
        lines.push(format!("- **Tokens Saved:** {}", mid.total_tokens_saved));
        lines.push(format!(
            "- **Avg Compression Ratio:** {:.1}%",
            mid.avg_compression_ratio * 100.0
        ));

        if let Some(long_term) = &self.long_term {
            let stats = long_term.stats();
            lines.push(String::new());
            lines.push("## Long-Term Memory".to_string());
            lines.push(format!("- **Memory File Exists:** {}", stats.file_exists));
            lines.push(format!(
                "- **Project:** {}",
                stats.project_name.as_deref().unwrap_or("N/A")
            ));
            lines.push(format!("- **Tech Stack Items:** {}", stats.tech_stack_count));
        }

        if let Some(injector) = &self.injector {
            let stats = injector.stats();
            lines.push(String::new());
            lines.push("## Context Injection".to_string());
            lines.push(format!(
                "- **Injected Files:** {}/{}",
                stats.total_files, stats.max_files
            ));
            lines.push(format!(
                "- **Tokens:** {}/{}",
                stats.total_tokens, stats.max_total_tokens
            ));
            lines.push(format!(
                "- **Capacity Usage:** {:.1}%",
                stats.capacity_usage * 100.0
            ));
        }

        lines.join("\n")
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
