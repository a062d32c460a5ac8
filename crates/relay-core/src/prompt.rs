// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use chrono::Utc;
use tracing::debug;

use relay_config::AgentConfig;
use relay_model::ToolSchema;

use crate::context::ExecutionContext;

const DEFAULT_BASE_PROMPT: &str = "\
You are an autonomous software engineering agent.

You are an expert in:
- Full-stack development
- System architecture design
- Code analysis and debugging
- Best practices and design patterns

Your capabilities:
- Understand and analyze codebases
- Plan and implement features
- Debug and fix issues
- Work autonomously on complex tasks

Core principles:
- Write clean, modular, well-documented code
- Think carefully before acting
- Ask for clarification when requirements are unclear";

/// Assembles the system prompt from the execution context, the tool catalog
/// and optional memory context.  Deterministic given equal inputs (modulo
/// the embedded clock reading).
#[derive(Debug, Clone)]
pub struct PromptGenerator {
    base_prompt: String,
    long_term_context: Option<String>,
    custom_sections: Vec<(String, String)>,
}

impl PromptGenerator {
    pub fn new(cfg: &AgentConfig) -> Self {
        Self {
            base_prompt: cfg
                .base_prompt
                .clone()
                .unwrap_or_else(|| DEFAULT_BASE_PROMPT.to_string()),
            long_term_context: None,
            custom_sections: Vec::new(),
        }
    }

    /// Replace the base role instructions.
    pub fn set_base_prompt(&mut self, base: impl Into<String>) {
        self.base_prompt = base.into();
    }

    /// Project-level memory snippet included right after the base prompt.
    pub fn set_long_term_context(&mut self, context: Option<String>) {
        self.long_term_context = context.filter(|c| !c.trim().is_empty());
    }

    /// Append a custom titled section at the end of the prompt.
    pub fn add_custom_section(&mut self, title: impl Into<String>, content: impl Into<String>) {
        self.custom_sections.push((title.into(), content.into()));
    }

    /// Build the full system prompt.  Section order is fixed: base, project
    /// memory, environment, tools, sub-agent capabilities, compression
    /// notice, token alert, custom sections.
    pub fn generate(
        &self,
        ctx: &ExecutionContext,
        tools: &[ToolSchema],
        include_subagent_info: bool,
        include_compression_info: bool,
    ) -> String {
        let mut sections = vec![self.base_prompt.clone()];

        if let Some(long_term) = &self.long_term_context {
            sections.push(format!("## Project Memory\n\n{long_term}"));
        }

        sections.push(environment_section(ctx));

        if !tools.is_empty() {
            sections.push(tools_section(tools));
        }

        if include_subagent_info {
            sections.push(SUBAGENT_SECTION.to_string());
        }

        if include_compression_info && ctx.is_compressed {
            sections.push(compression_section(ctx));
        }

        if let Some(alert) = token_alert_section(ctx) {
            sections.push(alert);
        }

        for (title, content) in &self.custom_sections {
            sections.push(format!("## {title}\n\n{content}"));
        }

        let prompt = sections.join("\n\n");
        debug!(chars = prompt.len(), "system prompt generated");
        prompt
    }
}

fn environment_section(ctx: &ExecutionContext) -> String {
    let cwd = std::env::current_dir()
        .map(|p| p.display().to_string())
        .unwrap_or_else(|_| "<unknown>".into());
    let usage = ctx.token_usage();
    format!(
        "## Current Environment\n\n\
         - **Session ID**: {}\n\
         - **Model**: {}\n\
         - **Working Directory**: {}\n\
         - **Timestamp**: {}\n\n\
         ### Token Usage\n\
         - **Input**: {}\n\
         - **Output**: {}\n\
         - **Total**: {}\n\
         - **Usage Rate**: {:.1}%",
        ctx.session_id(),
        ctx.model,
        cwd,
        Utc::now().to_rfc3339(),
        usage.input,
        usage.output,
        usage.total,
        ctx.usage_rate() * 100.0,
    )
}

/// Coarse tool category inferred from name keywords.
fn categorize(name: &str) -> &'static str {
    let name = name.to_lowercase();
    let has = |kws: &[&str]| kws.iter().any(|k| name.contains(k));
    if has(&["file", "read", "write", "edit"]) {
        "File Operations"
    } else if has(&["search", "analyze", "grep", "glob"]) {
        "Code Analysis"
    } else if name.contains("subagent") {
        "Sub-agents"
    } else if has(&["run", "command", "bash", "shell"]) {
        "System Operations"
    } else {
        "Other"
    }
}

const CATEGORY_ORDER: [&str; 5] = [
    "File Operations",
    "Code Analysis",
    "Sub-agents",
    "System Operations",
    "Other",
];

/// At most five tools are listed per category, with a `+N more` trailer.
const MAX_TOOLS_PER_CATEGORY: usize = 5;

fn tools_section(tools: &[ToolSchema]) -> String {
    let mut lines = vec![
        "## Available Tools".to_string(),
        String::new(),
        format!("You have access to {} tools:", tools.len()),
    ];

    for category in CATEGORY_ORDER {
        let members: Vec<&ToolSchema> = tools
            .iter()
            .filter(|t| categorize(&t.name) == category)
            .collect();
        if members.is_empty() {
            continue;
        }
        lines.push(String::new());
        lines.push(format!("### {category}"));
        for tool in members.iter().take(MAX_TOOLS_PER_CATEGORY) {
            let description: String = tool.description.chars().take(100).collect();
            lines.push(format!("- **{}**: {}", tool.name, description));
        }
        if members.len() > MAX_TOOLS_PER_CATEGORY {
            lines.push(format!(
                "- ... and {} more",
                members.len() - MAX_TOOLS_PER_CATEGORY
            ));
        }
    }

    lines.join("\n")
}

const SUBAGENT_SECTION: &str = "\
## Sub-agent Capabilities

You can launch specialized sub-agents to handle complex tasks autonomously:

- **Explore** (`agent_type=\"explore\"`): fast read-only codebase exploration.
- **Plan** (`agent_type=\"plan\"`): implementation planning and design analysis.
- **Debug** (`agent_type=\"debug-specialist\"`): bug investigation and diagnosis.
- **General** (`agent_type=\"general-purpose\"`): full autonomy with all tools.

Launch with the `launch_subagent` tool; sub-agents run until their task
completes. At most 10 sub-agents run concurrently.";

fn compression_section(ctx: &ExecutionContext) -> String {
    let last = match ctx.compression_history.last() {
        Some(record) => record,
        None => return String::new(),
    };
    format!(
        "## Conversation Compression Notice\n\n\
         The conversation history has been compressed to manage token usage.\n\n\
         - **Compression Count**: {}\n\
         - **Last Compression**: {}\n\
         - **Original Messages**: {}\n\
         - **Compressed To**: {}\n\n\
         The compressed history is a structured summary (background, decisions, \
         tool usage, user intent, results, errors, open issues, plans). \
         Recent messages are preserved in full.",
        ctx.compression_history.len(),
        last.timestamp.to_rfc3339(),
        last.original_count,
        last.compressed_count,
    )
}

fn token_alert_section(ctx: &ExecutionContext) -> Option<String> {
    let (level, message) = if ctx.should_error() {
        (
            "CRITICAL",
            "Token usage is very high. Compression will trigger soon.",
        )
    } else if ctx.should_warn() {
        (
            "WARNING",
            "Token usage is elevated. Consider being more concise.",
        )
    } else {
        return None;
    };
    Some(format!(
        "## Token Usage Alert\n\n\
         {level}: {message}\n\n\
         - **Current Usage**: {:.1}%\n\
         - **Total Tokens**: {}\n\
         - **Context Window**: {}",
        ctx.usage_rate() * 100.0,
        ctx.token_usage().total,
        ctx.context_window(),
    ))
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
