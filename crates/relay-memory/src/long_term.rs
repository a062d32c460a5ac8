// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Long-term project memory persisted as a single Markdown file (`AGENT.md`
//! at the project root).  Loading is best-effort: unknown content is skipped,
//! never fatal.  Saving is deterministic given equal facts.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::Context;
use serde::Serialize;
use tracing::{info, warn};

/// Structured project-level facts.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ProjectFacts {
    pub project_name: String,
    pub description: String,
    pub tech_stack: Vec<String>,
    pub language_preference: String,
    pub code_style: BTreeMap<String, String>,
    pub working_directory: String,
    pub environment: BTreeMap<String, String>,
    pub workflow: Vec<String>,
    pub security_notes: Vec<String>,
    pub custom_instructions: Vec<String>,
}

impl ProjectFacts {
    /// Deterministic Markdown serialization with stable section headings.
    pub fn to_markdown(&self) -> String {
        let mut sections = vec!["# Project Instructions".to_string()];

        if !self.project_name.is_empty() || !self.description.is_empty() {
            let mut s = vec!["## Project Information".to_string()];
            if !self.project_name.is_empty() {
                s.push(format!("**Project Name:** {}", self.project_name));
            }
            if !self.description.is_empty() {
                s.push(format!("**Description:** {}", self.description));
            }
            if !self.tech_stack.is_empty() {
                s.push("**Tech Stack:**".to_string());
                for tech in &self.tech_stack {
                    s.push(format!("- {tech}"));
                }
            }
            sections.push(s.join("\n"));
        }

        let mut prefs = vec!["## User Preferences".to_string()];
        let language = if self.language_preference.is_empty() {
            "English"
        } else {
            &self.language_preference
        };
        prefs.push(format!("- **Language:** {language}"));
        for (key, value) in &self.code_style {
            prefs.push(format!("- **{key}:** {value}"));
        }
        sections.push(prefs.join("\n"));

        if !self.working_directory.is_empty() || !self.environment.is_empty() {
            let mut s = vec!["## Development Environment".to_string()];
            if !self.working_directory.is_empty() {
                s.push(format!("**Working Directory:** `{}`", self.working_directory));
            }
            for (key, value) in &self.environment {
                s.push(format!("**{key}:** {value}"));
            }
            sections.push(s.join("\n"));
        }

        if !self.workflow.is_empty() {
            let mut s = vec!["## Development Workflow".to_string()];
            for step in &self.workflow {
                s.push(format!("- {step}"));
            }
            sections.push(s.join("\n"));
        }

        if !self.security_notes.is_empty() {
            let mut s = vec!["## Security Guidelines".to_string()];
            for note in &self.security_notes {
                s.push(format!("- {note}"));
            }
            sections.push(s.join("\n"));
        }

        if !self.custom_instructions.is_empty() {
            let mut s = vec!["## Custom Instructions".to_string()];
            for instruction in &self.custom_instructions {
                s.push(format!("- {instruction}"));
            }
            sections.push(s.join("\n"));
        }

        sections.join("\n\n") + "\n"
    }

    /// Best-effort Markdown parse.  Unrecognised lines are ignored.
    pub fn from_markdown(content: &str) -> Self {
        let mut facts = Self::default();
        let mut section = "";

        for line in content.lines() {
            let line = line.trim();
            if let Some(heading) = line.strip_prefix("## ") {
                section = match heading {
                    "Project Information" => "project",
                    "User Preferences" => "preferences",
                    "Development Environment" => "environment",
                    "Development Workflow" => "workflow",
                    "Security Guidelines" => "security",
                    "Custom Instructions" => "custom",
                    _ => "",
                };
                continue;
            }

            match section {
                "project" => {
                    if let Some(v) = bold_field(line, "Project Name") {
                        facts.project_name = v;
                    } else if let Some(v) = bold_field(line, "Description") {
                        facts.description = v;
                    } else if let Some(item) = line.strip_prefix("- ") {
                        facts.tech_stack.push(item.to_string());
                    }
                }
                "preferences" => {
                    if let Some(rest) = line.strip_prefix("- **") {
                        if let Some((key, value)) = rest.split_once(":** ") {
                            if key == "Language" {
                                facts.language_preference = value.to_string();
                            } else {
                                facts.code_style.insert(key.to_string(), value.to_string());
                            }
                        }
                    }
                }
                "environment" => {
                    if let Some(v) = bold_field(line, "Working Directory") {
                        facts.working_directory = v.trim_matches('`').to_string();
                    } else if let Some(rest) = line.strip_prefix("**") {
                        if let Some((key, value)) = rest.split_once(":** ") {
                            facts.environment.insert(key.to_string(), value.to_string());
                        }
                    }
                }
                "workflow" => {
                    if let Some(item) = line.strip_prefix("- ") {
                        facts.workflow.push(item.to_string());
                    }
                }
                "security" => {
                    if let Some(item) = line.strip_prefix("- ") {
                        facts.security_notes.push(item.to_string());
                    }
                }
                "custom" => {
                    if let Some(item) = line.strip_prefix("- ") {
                        facts.custom_instructions.push(item.to_string());
                    }
                }
                _ => {}
            }
        }

        facts
    }
}

fn bold_field(line: &str, name: &str) -> Option<String> {
    line.strip_prefix(&format!("**{name}:** "))
        .map(str::to_string)
}

#[derive(Debug, Clone, Serialize)]
pub struct LongTermStats {
    pub file_exists: bool,
    pub path: String,
    pub loaded: bool,
    pub project_name: Option<String>,
    pub tech_stack_count: usize,
    pub custom_instructions_count: usize,
}

/// Persistence wrapper around [`ProjectFacts`].
#[derive(Debug)]
pub struct LongTermMemory {
    path: PathBuf,
    facts: ProjectFacts,
    loaded: bool,
}

pub const MEMORY_FILE_NAME: &str = "AGENT.md";

impl LongTermMemory {
    pub fn new(project_root: &Path) -> Self {
        Self {
            path: project_root.join(MEMORY_FILE_NAME),
            facts: ProjectFacts::default(),
            loaded: false,
        }
    }

    /// Load the memory file.  A missing or unparsable file yields defaults.
    pub fn load(&mut self) -> &ProjectFacts {
        match std::fs::read_to_string(&self.path) {
            Ok(content) => {
                self.facts = ProjectFacts::from_markdown(&content);
                self.loaded = true;
                info!(path = %self.path.display(), "long-term memory loaded");
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                info!(path = %self.path.display(), "no memory file; starting fresh");
            }
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "failed to read memory file");
            }
        }
        &self.facts
    }

    pub fn save(&self) -> anyhow::Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("creating {}", parent.display()))?;
        }
        std::fs::write(&self.path, self.facts.to_markdown())
            .with_context(|| format!("writing {}", self.path.display()))?;
        info!(path = %self.path.display(), "long-term memory saved");
        Ok(())
    }

    pub fn facts(&self) -> &ProjectFacts {
        &self.facts
    }

    pub fn facts_mut(&mut self) -> &mut ProjectFacts {
        &mut self.facts
    }

    pub fn update_project_info(
        &mut self,
        name: Option<&str>,
        description: Option<&str>,
        tech_stack: Option<Vec<String>>,
    ) {
        if let Some(name) = name {
            self.facts.project_name = name.to_string();
        }
        if let Some(description) = description {
            self.facts.description = description.to_string();
        }
        if let Some(tech_stack) = tech_stack {
            self.facts.tech_stack = tech_stack;
        }
    }

    /// Idempotent: an instruction already present is not duplicated.
    pub fn add_custom_instruction(&mut self, instruction: impl Into<String>) {
        let instruction = instruction.into();
        if !self.facts.custom_instructions.contains(&instruction) {
            self.facts.custom_instructions.push(instruction);
        }
    }

    /// Compact snippet for inclusion in system prompts.
    pub fn context_snippet(&self) -> String {
        let facts = &self.facts;
        let mut lines = Vec::new();
        if !facts.project_name.is_empty() {
            lines.push(format!("**Project:** {}", facts.project_name));
        }
        if !facts.tech_stack.is_empty() {
            lines.push(format!("**Tech Stack:** {}", facts.tech_stack.join(", ")));
        }
        if !facts.language_preference.is_empty() {
            lines.push(format!(
                "**Language Preference:** {}",
                facts.language_preference
            ));
        }
        if !facts.code_style.is_empty() {
            let items: Vec<String> = facts
                .code_style
                .iter()
                .map(|(k, v)| format!("{k}: {v}"))
                .collect();
            lines.push(format!("**Code Style:** {}", items.join(", ")));
        }
        if !facts.custom_instructions.is_empty() {
            lines.push("\n**Custom Instructions:**".to_string());
            for instruction in &facts.custom_instructions {
                lines.push(format!("- {instruction}"));
            }
        }
        lines.join("\n")
    }

    pub fn stats(&self) -> LongTermStats {
        LongTermStats {
            file_exists: self.path.exists(),
            path: self.path.display().to_string(),
            loaded: self.loaded,
            project_name: (!self.facts.project_name.is_empty())
                .then(|| self.facts.project_name.clone()),
            tech_stack_count: self.facts.tech_stack.len(),
            custom_instructions_count: self.facts.custom_instructions.len(),
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
