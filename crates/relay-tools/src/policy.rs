// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::collections::HashMap;
use std::sync::Arc;

use futures::future::BoxFuture;
use serde_json::Value;
use tracing::warn;

use relay_config::ToolsConfig;

/// Per-tool permission decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PermissionDecision {
    /// Always run without asking
    Allow,
    /// Ask before each invocation.  Without an interactive surface this is
    /// treated as allow-with-warning; a custom checker may escalate instead.
    Ask,
    /// Never run; the call fails with a permission error
    Deny,
}

impl PermissionDecision {
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "allow" => Some(Self::Allow),
            "ask" => Some(Self::Ask),
            "deny" => Some(Self::Deny),
            _ => None,
        }
    }
}

/// Async hook consulted after static resolution; gets the final say.
pub type PermissionChecker =
    Arc<dyn Fn(&str, &Value) -> BoxFuture<'static, PermissionDecision> + Send + Sync>;

/// Policy engine mapping a tool call to a permission decision.
///
/// Resolution order: explicit per-tool override → the tool's declared
/// default → the configured fallback; a registered async checker then
/// overrides whatever static resolution produced.
#[derive(Clone)]
pub struct PermissionPolicy {
    default: PermissionDecision,
    overrides: HashMap<String, PermissionDecision>,
    checker: Option<PermissionChecker>,
}

impl PermissionPolicy {
    pub fn new(default: PermissionDecision) -> Self {
        Self {
            default,
            overrides: HashMap::new(),
            checker: None,
        }
    }

    pub fn from_config(cfg: &ToolsConfig) -> Self {
        let default = PermissionDecision::parse(&cfg.default_permission).unwrap_or_else(|| {
            warn!(
                value = %cfg.default_permission,
                "unknown default permission in config; falling back to allow"
            );
            PermissionDecision::Allow
        });
        let mut policy = Self::new(default);
        for (tool, decision) in &cfg.permissions {
            match PermissionDecision::parse(decision) {
                Some(d) => {
                    policy.overrides.insert(tool.clone(), d);
                }
                None => warn!(tool = %tool, value = %decision, "ignoring unknown permission"),
            }
        }
        policy
    }

    /// Set or replace the per-tool override.
    pub fn set(&mut self, tool: impl Into<String>, decision: PermissionDecision) {
        self.overrides.insert(tool.into(), decision);
    }

    /// Install the async checker consulted on every call.
    pub fn set_checker(&mut self, checker: PermissionChecker) {
        self.checker = Some(checker);
    }

    /// Resolve the decision for one call.
    pub async fn resolve(
        &self,
        tool: &str,
        input: &Value,
        tool_default: Option<PermissionDecision>,
    ) -> PermissionDecision {
        let static_decision = self
            .overrides
            .get(tool)
            .copied()
            .or(tool_default)
            .unwrap_or(self.default);

        match &self.checker {
            Some(checker) => checker(tool, input).await,
            None => static_decision,
        }
    }
}

impl std::fmt::Debug for PermissionPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PermissionPolicy")
            .field("default", &self.default)
            .field("overrides", &self.overrides)
            .field("checker", &self.checker.is_some())
            .finish()
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    // ── Static resolution ─────────────────────────────────────────────────────

    #[tokio::test]
    async fn default_applies_when_nothing_else_set() {
        let p = PermissionPolicy::new(PermissionDecision::Allow);
        let d = p.resolve("anything", &json!({}), None).await;
        assert_eq!(d, PermissionDecision::Allow);
    }

    #[tokio::test]
    async fn override_beats_default() {
        let mut p = PermissionPolicy::new(PermissionDecision::Allow);
        p.set("dangerous", PermissionDecision::Deny);
        let d = p.resolve("dangerous", &json!({}), None).await;
        assert_eq!(d, PermissionDecision::Deny);
    }

    #[tokio::test]
    async fn tool_default_beats_configured_fallback() {
        let p = PermissionPolicy::new(PermissionDecision::Allow);
        let d = p
            .resolve("t", &json!({}), Some(PermissionDecision::Ask))
            .await;
        assert_eq!(d, PermissionDecision::Ask);
    }

    #[tokio::test]
    async fn override_beats_tool_default() {
        let mut p = PermissionPolicy::new(PermissionDecision::Allow);
        p.set("t", PermissionDecision::Deny);
        let d = p
            .resolve("t", &json!({}), Some(PermissionDecision::Allow))
            .await;
        assert_eq!(d, PermissionDecision::Deny);
    }

    // ── Async checker ─────────────────────────────────────────────────────────

    #[tokio::test]
    async fn checker_gets_final_say() {
        let mut p = PermissionPolicy::new(PermissionDecision::Allow);
        p.set_checker(Arc::new(|name: &str, _input: &Value| {
            let deny = name == "blocked";
            Box::pin(async move {
                if deny {
                    PermissionDecision::Deny
                } else {
                    PermissionDecision::Allow
                }
            })
        }));
        assert_eq!(
            p.resolve("blocked", &json!({}), None).await,
            PermissionDecision::Deny
        );
        assert_eq!(
            p.resolve("fine", &json!({}), None).await,
            PermissionDecision::Allow
        );
    }

    // ── Config parsing ────────────────────────────────────────────────────────

    #[tokio::test]
    async fn from_config_reads_overrides() {
        let mut cfg = ToolsConfig::default();
        cfg.permissions.insert("rm".into(), "deny".into());
        let p = PermissionPolicy::from_config(&cfg);
        assert_eq!(
            p.resolve("rm", &json!({}), None).await,
            PermissionDecision::Deny
        );
    }

    #[test]
    fn parse_accepts_known_values_case_insensitively() {
        assert_eq!(
            PermissionDecision::parse("ALLOW"),
            Some(PermissionDecision::Allow)
        );
        assert_eq!(
            PermissionDecision::parse("Ask"),
            Some(PermissionDecision::Ask)
        );
        assert_eq!(PermissionDecision::parse("bogus"), None);
    }

    #[test]
    fn unknown_default_falls_back_to_allow() {
        let cfg = ToolsConfig {
            default_permission: "whatever".into(),
            ..ToolsConfig::default()
        };
        let p = PermissionPolicy::from_config(&cfg);
        assert_eq!(p.default, PermissionDecision::Allow);
    }
}
