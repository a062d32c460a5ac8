// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
/// Error taxonomy of the agent runtime.
///
/// Tool-stage errors never escape the executor as `Err`; they are folded
/// into structured tool results so the loop continues.  The variants that do
/// propagate out of [`run`] are `LlmUnavailable` (fallback chain exhausted)
/// and `InvalidState` (caller misuse).
///
/// [`run`]: crate::Orchestrator::run
#[derive(Debug, thiserror::Error)]
pub enum AgentError {
    #[error("Unknown tool: {0}")]
    UnknownTool(String),
    #[error("Missing required parameter: {parameter} for tool {tool}")]
    InvalidInput { tool: String, parameter: String },
    #[error("Permission denied")]
    PermissionDenied,
    #[error("Execution aborted")]
    Aborted,
    #[error("Tool {tool} failed: {message}")]
    ToolFailure { tool: String, message: String },
    #[error("all models failed; fallback chain exhausted: {0}")]
    LlmUnavailable(String),
    #[error("compression failed: {0}")]
    CompressionFailed(String),
    #[error("operation timed out")]
    Timeout,
    #[error("invalid state: {0}")]
    InvalidState(String),
}

impl AgentError {
    /// Stable machine-readable kind, used in event payloads.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::UnknownTool(_) => "unknown_tool",
            Self::InvalidInput { .. } => "invalid_input",
            Self::PermissionDenied => "permission_denied",
            Self::Aborted => "aborted",
            Self::ToolFailure { .. } => "tool_failure",
            Self::LlmUnavailable(_) => "llm_unavailable",
            Self::CompressionFailed(_) => "compression_failed",
            Self::Timeout => "timeout",
            Self::InvalidState(_) => "invalid_state",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn permission_denied_renders_expected_message() {
        assert_eq!(AgentError::PermissionDenied.to_string(), "Permission denied");
    }

    #[test]
    fn unknown_tool_names_the_tool() {
        let e = AgentError::UnknownTool("frobnicate".into());
        assert_eq!(e.to_string(), "Unknown tool: frobnicate");
        assert_eq!(e.kind(), "unknown_tool");
    }

    #[test]
    fn invalid_input_names_parameter_and_tool() {
        let e = AgentError::InvalidInput {
            tool: "read_file".into(),
            parameter: "path".into(),
        };
        assert!(e.to_string().contains("path"));
        assert!(e.to_string().contains("read_file"));
    }
}
