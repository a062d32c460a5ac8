// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! The staged tool-execution pipeline.
//!
//! Every call moves through six stages in order (discovery, validation,
//! permission, abort-check, execution, formatting) and terminates on the
//! first stage that produces an error.  Failures never escape as `Err`:
//! they become structured results so the agent loop continues.

use std::sync::{Arc, Mutex};
use std::time::Instant;

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use tracing::{debug, warn};

use relay_tools::{PermissionDecision, PermissionPolicy, ToolRegistry};

use crate::{context::AbortSignal, error::AgentError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStage {
    Discovery,
    Validation,
    Permission,
    AbortCheck,
    Execution,
    Formatting,
}

/// One tool invocation as requested by the model.
///
/// `stage` progresses monotonically; the call is terminal at the first stage
/// that sets a result or error on the surrounding [`ToolExecutionResult`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCall {
    pub call_id: String,
    pub name: String,
    pub input: Value,
    pub stage: ExecutionStage,
    /// Resolved permission decision, once stage 3 has run.
    pub permission: Option<String>,
    pub aborted: bool,
    #[serde(default)]
    pub metadata: Map<String, Value>,
}

impl ToolCall {
    pub fn new(call_id: impl Into<String>, name: impl Into<String>, input: Value) -> Self {
        Self {
            call_id: call_id.into(),
            name: name.into(),
            input,
            stage: ExecutionStage::Discovery,
            permission: None,
            aborted: false,
            metadata: Map::new(),
        }
    }
}

/// The observable outcome of one staged execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolExecutionResult {
    pub tool_call: ToolCall,
    pub success: bool,
    pub result: Option<Value>,
    pub error: Option<String>,
    pub error_kind: Option<String>,
    pub execution_time_ms: u64,
    pub stages_completed: Vec<ExecutionStage>,
}

#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct ExecutorStats {
    pub executed: u64,
    pub successful: u64,
    pub failed: u64,
    pub aborted: u64,
}

/// Six-stage tool executor over a shared registry and permission policy.
pub struct ToolExecutor {
    registry: Arc<ToolRegistry>,
    policy: PermissionPolicy,
    stats: Mutex<ExecutorStats>,
}

impl ToolExecutor {
    pub fn new(registry: Arc<ToolRegistry>, policy: PermissionPolicy) -> Self {
        Self {
            registry,
            policy,
            stats: Mutex::new(ExecutorStats::default()),
        }
    }

    pub fn registry(&self) -> &Arc<ToolRegistry> {
        &self.registry
    }

    pub fn stats(&self) -> ExecutorStats {
        *self.stats.lock().expect("stats lock")
    }

    /// Run one call through the pipeline.  Always returns a result; the
    /// `stages_completed` list tells diagnostics how far the call got.
    pub async fn execute(&self, mut call: ToolCall, abort: &AbortSignal) -> ToolExecutionResult {
        let start = Instant::now();
        let mut stages = Vec::with_capacity(6);

        // Stage 1: Discovery
        call.stage = ExecutionStage::Discovery;
        let tool = match self.registry.get(&call.name) {
            Some(tool) => tool,
            None => {
                let err = AgentError::UnknownTool(call.name.clone());
                return self.fail(call, err, start, stages);
            }
        };
        stages.push(ExecutionStage::Discovery);

        // Stage 2: Validation
        call.stage = ExecutionStage::Validation;
        if let Err(err) = validate_input(&call, tool.input_schema()) {
            return self.fail(call, err, start, stages);
        }
        stages.push(ExecutionStage::Validation);

        // Stage 3: Permission
        call.stage = ExecutionStage::Permission;
        let decision = self
            .policy
            .resolve(&call.name, &call.input, Some(tool.default_permission()))
            .await;
        call.permission = Some(
            match decision {
                PermissionDecision::Allow => "allow",
                PermissionDecision::Ask => "ask",
                PermissionDecision::Deny => "deny",
            }
            .to_string(),
        );
        stages.push(ExecutionStage::Permission);
        match decision {
            PermissionDecision::Allow => {}
            PermissionDecision::Ask => {
                // No interactive surface here: treated as allow, loudly.
                warn!(tool = %call.name, "permission is 'ask'; auto-allowing");
            }
            PermissionDecision::Deny => {
                return self.fail(call, AgentError::PermissionDenied, start, stages);
            }
        }

        // Stage 4: AbortCheck
        call.stage = ExecutionStage::AbortCheck;
        if abort.is_aborted() {
            call.aborted = true;
            self.stats.lock().expect("stats lock").aborted += 1;
            let elapsed = start.elapsed().as_millis() as u64;
            return ToolExecutionResult {
                success: false,
                result: None,
                error: Some(AgentError::Aborted.to_string()),
                error_kind: Some(AgentError::Aborted.kind().to_string()),
                execution_time_ms: elapsed,
                stages_completed: stages,
                tool_call: call,
            };
        }
        stages.push(ExecutionStage::AbortCheck);

        // Stage 5: Execution
        call.stage = ExecutionStage::Execution;
        debug!(tool = %call.name, call_id = %call.call_id, "executing tool");
        let raw = match tool.execute(&call.input).await {
            Ok(value) => value,
            Err(e) => {
                let err = AgentError::ToolFailure {
                    tool: call.name.clone(),
                    message: e.to_string(),
                };
                return self.fail(call, err, start, stages);
            }
        };
        stages.push(ExecutionStage::Execution);

        // Stage 6: Formatting
        call.stage = ExecutionStage::Formatting;
        let formatted = format_result(&call, raw);
        stages.push(ExecutionStage::Formatting);

        {
            let mut stats = self.stats.lock().expect("stats lock");
            stats.executed += 1;
            stats.successful += 1;
        }
        let elapsed = start.elapsed().as_millis() as u64;
        debug!(tool = %call.name, elapsed_ms = elapsed, "tool execution succeeded");

        ToolExecutionResult {
            success: true,
            result: Some(formatted),
            error: None,
            error_kind: None,
            execution_time_ms: elapsed,
            stages_completed: stages,
            tool_call: call,
        }
    }

    fn fail(
        &self,
        call: ToolCall,
        err: AgentError,
        start: Instant,
        stages: Vec<ExecutionStage>,
    ) -> ToolExecutionResult {
        warn!(tool = %call.name, stage = ?call.stage, error = %err, "tool call failed");
        {
            let mut stats = self.stats.lock().expect("stats lock");
            stats.executed += 1;
            stats.failed += 1;
        }
        // Tool failures surface the tool's own message, matching what the
        // tool body raised; stage errors use the taxonomy's message.
        let message = match &err {
            AgentError::ToolFailure { message, .. } => message.clone(),
            other => other.to_string(),
        };
        ToolExecutionResult {
            success: false,
            result: None,
            error: Some(message),
            error_kind: Some(err.kind().to_string()),
            execution_time_ms: start.elapsed().as_millis() as u64,
            stages_completed: stages,
            tool_call: call,
        }
    }
}

/// Check the schema's `required` list against the call input.
fn validate_input(call: &ToolCall, schema: Value) -> Result<(), AgentError> {
    let required = match schema.get("required").and_then(Value::as_array) {
        Some(required) => required,
        None => return Ok(()),
    };
    for param in required {
        let Some(param) = param.as_str() else { continue };
        if call.input.get(param).is_none() {
            return Err(AgentError::InvalidInput {
                tool: call.name.clone(),
                parameter: param.to_string(),
            });
        }
    }
    Ok(())
}

/// A map already carrying a `success` key passes through unchanged; any
/// other shape is wrapped in the standard envelope.
fn format_result(call: &ToolCall, raw: Value) -> Value {
    match &raw {
        Value::Object(map) if map.contains_key("success") => raw,
        _ => json!({
            "success": true,
            "result": raw,
            "tool_name": call.name,
            "call_id": call.call_id,
        }),
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
