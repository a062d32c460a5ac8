// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use async_trait::async_trait;
use serde_json::Value;

use crate::policy::PermissionDecision;

/// Trait that every tool must implement.
///
/// Tool bodies are opaque to the runtime: they receive the validated input
/// map and return a value (any JSON shape) or an error.  A returned object
/// that already carries a `success` key is forwarded to the model unchanged;
/// any other shape is wrapped by the executor's formatting stage.
#[async_trait]
pub trait Tool: Send + Sync {
    fn name(&self) -> &str;
    fn description(&self) -> &str;
    /// JSON Schema of the input object.  The executor's validation stage
    /// checks the schema's `required` list against the call input.
    fn input_schema(&self) -> Value;
    /// Permission used when no per-tool override is configured.
    fn default_permission(&self) -> PermissionDecision {
        PermissionDecision::Allow
    }
    /// Execute the tool.  An `Err` becomes a structured tool failure; it
    /// never aborts the agent loop.
    async fn execute(&self, input: &Value) -> anyhow::Result<Value>;
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    struct MinimalTool;

    #[async_trait]
    impl Tool for MinimalTool {
        fn name(&self) -> &str {
            "minimal"
        }
        fn description(&self) -> &str {
            "a minimal tool"
        }
        fn input_schema(&self) -> Value {
            json!({ "type": "object" })
        }
        async fn execute(&self, _input: &Value) -> anyhow::Result<Value> {
            Ok(json!("ok"))
        }
    }

    #[test]
    fn default_permission_is_allow() {
        assert_eq!(MinimalTool.default_permission(), PermissionDecision::Allow);
    }

    #[tokio::test]
    async fn execute_returns_value() {
        let out = MinimalTool.execute(&json!({})).await.unwrap();
        assert_eq!(out, json!("ok"));
    }
}
