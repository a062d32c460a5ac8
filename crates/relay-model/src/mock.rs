// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use futures::stream;
use serde_json::Value;

use crate::{
    provider::{BlockDelta, DeltaEvent, DeltaStream, StopReason, UsageDelta},
    CompletionRequest, ContentBlock, Role,
};

/// Deterministic mock provider for tests.  Echoes the last user message back
/// as the assistant response.
#[derive(Default)]
pub struct MockProvider;

#[async_trait]
impl crate::ModelProvider for MockProvider {
    fn name(&self) -> &str {
        "mock"
    }

    async fn stream(&self, req: CompletionRequest) -> anyhow::Result<DeltaStream> {
        let reply = req
            .messages
            .iter()
            .rev()
            .find(|m| m.role == Role::User)
            .map(|m| m.content.to_text())
            .unwrap_or_else(|| "[no input]".into());

        let events = text_turn(&req.model, &format!("MOCK: {reply}"));
        let wrapped: Vec<anyhow::Result<DeltaEvent>> = events.into_iter().map(Ok).collect();
        Ok(Box::pin(stream::iter(wrapped)))
    }
}

/// Build the delta sequence of a plain text assistant turn.
pub fn text_turn(model: &str, text: &str) -> Vec<DeltaEvent> {
    vec![
        DeltaEvent::MessageStart {
            id: "msg_mock".into(),
            model: model.to_string(),
            input_tokens: 10,
        },
        DeltaEvent::ContentBlockStart {
            index: 0,
            block: ContentBlock::text(""),
        },
        DeltaEvent::ContentBlockDelta {
            index: 0,
            delta: BlockDelta::TextDelta {
                text: text.to_string(),
            },
        },
        DeltaEvent::ContentBlockStop { index: 0 },
        DeltaEvent::MessageDelta {
            stop_reason: Some(StopReason::EndTurn),
            usage: UsageDelta {
                input_tokens: 10,
                output_tokens: 10,
            },
        },
        DeltaEvent::MessageStop,
    ]
}

/// Build the delta sequence of a turn that emits leading text followed by
/// tool-use blocks.  Each `(id, name, input)` becomes one block whose input
/// JSON arrives via `input_json_delta` chunks, as the live wire does.
pub fn tool_turn(model: &str, text: &str, tools: &[(&str, &str, Value)]) -> Vec<DeltaEvent> {
    let mut events = vec![DeltaEvent::MessageStart {
        id: "msg_mock".into(),
        model: model.to_string(),
        input_tokens: 10,
    }];

    let mut index = 0;
    if !text.is_empty() {
        events.push(DeltaEvent::ContentBlockStart {
            index,
            block: ContentBlock::text(""),
        });
        events.push(DeltaEvent::ContentBlockDelta {
            index,
            delta: BlockDelta::TextDelta {
                text: text.to_string(),
            },
        });
        events.push(DeltaEvent::ContentBlockStop { index });
        index += 1;
    }

    for (id, name, input) in tools {
        events.push(DeltaEvent::ContentBlockStart {
            index,
            block: ContentBlock::ToolUse {
                id: id.to_string(),
                name: name.to_string(),
                input: Value::Object(Default::default()),
            },
        });
        let json = input.to_string();
        // Split the argument JSON across two deltas to exercise accumulation.
        let mid = json.len() / 2;
        // Valid because serde_json output is ASCII unless inputs contain
        // non-ASCII strings; test inputs are ASCII.
        events.push(DeltaEvent::ContentBlockDelta {
            index,
            delta: BlockDelta::InputJsonDelta {
                partial_json: json[..mid].to_string(),
            },
        });
        events.push(DeltaEvent::ContentBlockDelta {
            index,
            delta: BlockDelta::InputJsonDelta {
                partial_json: json[mid..].to_string(),
            },
        });
        events.push(DeltaEvent::ContentBlockStop { index });
        index += 1;
    }

    events.push(DeltaEvent::MessageDelta {
        stop_reason: Some(StopReason::ToolUse),
        usage: UsageDelta {
            input_tokens: 10,
            output_tokens: 20,
        },
    });
    events.push(DeltaEvent::MessageStop);
    events
}

/// A pre-scripted mock provider.  Each successful call to `stream` pops the
/// next event script from the front of the queue, which lets tests specify
/// exact streams, tool calls included, without network access.
///
/// Models listed via [`fail_model`] error at request time instead of
/// consuming a script, which is how fallback-chain tests simulate an outage
/// of one chain entry.
pub struct ScriptedMockProvider {
    scripts: Arc<Mutex<Vec<Vec<DeltaEvent>>>>,
    fail_models: HashSet<String>,
    /// The last `CompletionRequest` seen by this provider.
    /// Written on each `stream()` call so tests can inspect what was sent.
    pub last_request: Arc<Mutex<Option<CompletionRequest>>>,
    /// Every model name attempted, in call order (failures included).
    pub attempted_models: Arc<Mutex<Vec<String>>>,
}

impl ScriptedMockProvider {
    /// Build a provider from a list of response scripts.  The outer `Vec` is
    /// the ordered list of calls; the inner `Vec` is the event sequence
    /// emitted for that call.
    pub fn new(scripts: Vec<Vec<DeltaEvent>>) -> Self {
        Self {
            scripts: Arc::new(Mutex::new(scripts)),
            fail_models: HashSet::new(),
            last_request: Arc::new(Mutex::new(None)),
            attempted_models: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Declare that requests targeting `model` fail at request time.
    pub fn fail_model(mut self, model: impl Into<String>) -> Self {
        self.fail_models.insert(model.into());
        self
    }

    /// Convenience: provider that always returns a single text reply.
    pub fn always_text(reply: impl Into<String>) -> Self {
        Self::new(vec![text_turn("scripted-mock-model", &reply.into())])
    }
}

#[async_trait]
impl crate::ModelProvider for ScriptedMockProvider {
    fn name(&self) -> &str {
        "scripted-mock"
    }

    async fn stream(&self, req: CompletionRequest) -> anyhow::Result<DeltaStream> {
        self.attempted_models
            .lock()
            .expect("attempt log lock")
            .push(req.model.clone());
        if self.fail_models.contains(&req.model) {
            anyhow::bail!("scripted failure for model {}", req.model);
        }
        *self.last_request.lock().expect("request lock") = Some(req);

        let events = {
            let mut scripts = self.scripts.lock().expect("script lock");
            if scripts.is_empty() {
                // Default fallback when all scripts are consumed
                text_turn("scripted-mock-model", "[no more scripts]")
            } else {
                scripts.remove(0)
            }
        };
        let wrapped: Vec<anyhow::Result<DeltaEvent>> = events.into_iter().map(Ok).collect();
        Ok(Box::pin(stream::iter(wrapped)))
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use futures::StreamExt;
    use serde_json::json;

    use super::*;
    use crate::{Message, ModelProvider};

    fn req(model: &str) -> CompletionRequest {
        CompletionRequest {
            model: model.into(),
            messages: vec![Message::user("hi")],
            system: None,
            tools: vec![],
            max_tokens: 256,
            stream: true,
        }
    }

    async fn drain(mut s: DeltaStream) -> Vec<DeltaEvent> {
        let mut events = Vec::new();
        while let Some(ev) = s.next().await {
            events.push(ev.unwrap());
        }
        events
    }

    #[tokio::test]
    async fn mock_echoes_last_user_message() {
        let events = drain(MockProvider.stream(req("m")).await.unwrap()).await;
        let has_echo = events.iter().any(|e| {
            matches!(e, DeltaEvent::ContentBlockDelta {
                delta: BlockDelta::TextDelta { text }, ..
            } if text.contains("MOCK: hi"))
        });
        assert!(has_echo);
    }

    #[tokio::test]
    async fn mock_stream_ends_with_message_stop() {
        let events = drain(MockProvider.stream(req("m")).await.unwrap()).await;
        assert!(matches!(events.last(), Some(DeltaEvent::MessageStop)));
    }

    #[tokio::test]
    async fn scripted_pops_scripts_in_order() {
        let p = ScriptedMockProvider::new(vec![
            text_turn("m", "first"),
            text_turn("m", "second"),
        ]);
        let first = drain(p.stream(req("m")).await.unwrap()).await;
        let second = drain(p.stream(req("m")).await.unwrap()).await;
        let text_of = |events: &[DeltaEvent]| {
            events
                .iter()
                .find_map(|e| match e {
                    DeltaEvent::ContentBlockDelta {
                        delta: BlockDelta::TextDelta { text },
                        ..
                    } => Some(text.clone()),
                    _ => None,
                })
                .unwrap()
        };
        assert_eq!(text_of(&first), "first");
        assert_eq!(text_of(&second), "second");
    }

    #[tokio::test]
    async fn scripted_fails_for_listed_model_without_consuming_script() {
        let p = ScriptedMockProvider::new(vec![text_turn("b", "ok")]).fail_model("a");
        assert!(p.stream(req("a")).await.is_err());
        // The script is still there for the next model.
        let events = drain(p.stream(req("b")).await.unwrap()).await;
        assert!(!events.is_empty());
        assert_eq!(*p.attempted_models.lock().unwrap(), vec!["a", "b"]);
    }

    #[tokio::test]
    async fn tool_turn_splits_input_json_across_deltas() {
        let events = tool_turn("m", "", &[("t1", "read_file", json!({"path": "/a"}))]);
        let json_deltas = events
            .iter()
            .filter(|e| {
                matches!(
                    e,
                    DeltaEvent::ContentBlockDelta {
                        delta: BlockDelta::InputJsonDelta { .. },
                        ..
                    }
                )
            })
            .count();
        assert_eq!(json_deltas, 2);
    }
}
