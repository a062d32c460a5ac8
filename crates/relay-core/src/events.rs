// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

/// The fixed event vocabulary of the runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    Iteration,
    TextDelta,
    ToolExecuting,
    ToolResult,
    MessageStart,
    MessageComplete,
    CompressionStart,
    CompressionSuccess,
    CompressionFailed,
    TokenUsage,
    SubagentStart,
    SubagentComplete,
    Warning,
    Error,
    Done,
    LoopComplete,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Iteration => "iteration",
            Self::TextDelta => "text_delta",
            Self::ToolExecuting => "tool_executing",
            Self::ToolResult => "tool_result",
            Self::MessageStart => "message_start",
            Self::MessageComplete => "message_complete",
            Self::CompressionStart => "compression_start",
            Self::CompressionSuccess => "compression_success",
            Self::CompressionFailed => "compression_failed",
            Self::TokenUsage => "token_usage",
            Self::SubagentStart => "subagent_start",
            Self::SubagentComplete => "subagent_complete",
            Self::Warning => "warning",
            Self::Error => "error",
            Self::Done => "done",
            Self::LoopComplete => "loop_complete",
        }
    }
}

impl std::fmt::Display for EventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A typed event with a per-session monotone sequence id.
#[derive(Debug, Clone, Serialize)]
pub struct StreamEvent {
    pub event_type: EventType,
    pub seq: u64,
    /// Present unless the producer opted out of session stamping.
    pub session_id: Option<String>,
    pub timestamp: DateTime<Utc>,
    pub data: Value,
    /// Optional client retry hint (milliseconds) for the SSE framing.
    pub retry: Option<u64>,
}

impl StreamEvent {
    /// `<session>_<seq>`: the `id:` line of the SSE framing.
    pub fn event_id(&self) -> String {
        match &self.session_id {
            Some(s) => format!("{s}_{}", self.seq),
            None => format!("{}", self.seq),
        }
    }

    /// Line-framed text form: `id:` / optional `retry:` / `event:` /
    /// `data:` lines followed by a blank line.
    pub fn to_sse(&self) -> String {
        let mut lines = Vec::with_capacity(5);
        lines.push(format!("id: {}", self.event_id()));
        if let Some(retry) = self.retry {
            lines.push(format!("retry: {retry}"));
        }
        lines.push(format!("event: {}", self.event_type));
        let mut data = self.data.clone();
        if let Value::Object(ref mut map) = data {
            map.insert("timestamp".into(), json!(self.timestamp.to_rfc3339()));
        }
        lines.push(format!("data: {data}"));
        lines.push(String::new());
        lines.join("\n") + "\n"
    }

    /// One JSON object per line: `{"type","data","event_id","timestamp"}`.
    pub fn to_json_line(&self) -> String {
        let obj = json!({
            "type": self.event_type,
            "data": self.data,
            "event_id": self.event_id(),
            "timestamp": self.timestamp.to_rfc3339(),
        });
        format!("{obj}\n")
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct EventStats {
    pub events_generated: u64,
    pub bytes_emitted: u64,
}

/// Stamps events with a per-session monotonically increasing sequence id.
/// Event order seen by a consumer equals production order.
#[derive(Debug)]
pub struct EventGenerator {
    session_id: String,
    counter: u64,
    stats: EventStats,
}

impl EventGenerator {
    pub fn new(session_id: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            counter: 0,
            stats: EventStats::default(),
        }
    }

    /// Produce the next event in sequence.  `include_session` controls
    /// whether the session id is stamped into the event (and its payload).
    pub fn generate(
        &mut self,
        event_type: EventType,
        data: Value,
        include_session: bool,
    ) -> StreamEvent {
        let mut data = data;
        if include_session {
            if let Value::Object(ref mut map) = data {
                map.insert("session_id".into(), json!(self.session_id));
            }
        }
        let event = StreamEvent {
            event_type,
            seq: self.counter,
            session_id: include_session.then(|| self.session_id.clone()),
            timestamp: Utc::now(),
            data,
            retry: None,
        };
        self.counter += 1;
        self.stats.events_generated += 1;
        event
    }

    /// Frame an event for the wire and account the bytes.
    pub fn frame(&mut self, event: &StreamEvent, sse: bool) -> String {
        let framed = if sse {
            event.to_sse()
        } else {
            event.to_json_line()
        };
        self.stats.bytes_emitted += framed.len() as u64;
        framed
    }

    pub fn stats(&self) -> EventStats {
        self.stats
    }
}

/// Generate the next event and push it to the consumer.  A dropped receiver
/// makes emission a no-op; producers never fail because nobody listens.
pub(crate) async fn emit(
    gen: &mut EventGenerator,
    tx: &tokio::sync::mpsc::Sender<StreamEvent>,
    event_type: EventType,
    data: Value,
) {
    let event = gen.generate(event_type, data, true);
    let _ = tx.send(event).await;
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn generator() -> EventGenerator {
        EventGenerator::new("sess")
    }

    // ── Sequencing ────────────────────────────────────────────────────────────

    #[test]
    fn sequence_ids_are_monotone() {
        let mut g = generator();
        let a = g.generate(EventType::Iteration, json!({}), true);
        let b = g.generate(EventType::TextDelta, json!({}), true);
        let c = g.generate(EventType::Done, json!({}), true);
        assert_eq!(a.seq, 0);
        assert_eq!(b.seq, 1);
        assert_eq!(c.seq, 2);
    }

    #[test]
    fn event_id_combines_session_and_seq() {
        let mut g = generator();
        let e = g.generate(EventType::Done, json!({}), true);
        assert_eq!(e.event_id(), "sess_0");
    }

    #[test]
    fn session_can_be_omitted() {
        let mut g = generator();
        let e = g.generate(EventType::Done, json!({}), false);
        assert!(e.session_id.is_none());
        assert!(e.data.get("session_id").is_none());
    }

    #[test]
    fn session_is_stamped_into_payload() {
        let mut g = generator();
        let e = g.generate(EventType::Warning, json!({"message": "hi"}), true);
        assert_eq!(e.data["session_id"], "sess");
        assert_eq!(e.data["message"], "hi");
    }

    // ── Framing ───────────────────────────────────────────────────────────────

    #[test]
    fn sse_frame_has_id_event_data_and_blank_line() {
        let mut g = generator();
        let e = g.generate(EventType::TextDelta, json!({"text": "x"}), true);
        let framed = e.to_sse();
        let lines: Vec<&str> = framed.lines().collect();
        assert_eq!(lines[0], "id: sess_0");
        assert_eq!(lines[1], "event: text_delta");
        assert!(lines[2].starts_with("data: "));
        assert!(framed.ends_with("\n\n"), "SSE frames end with a blank line");
    }

    #[test]
    fn sse_frame_includes_retry_when_set() {
        let mut g = generator();
        let mut e = g.generate(EventType::Error, json!({}), true);
        e.retry = Some(3000);
        let framed = e.to_sse();
        assert!(framed.contains("retry: 3000"));
    }

    #[test]
    fn sse_data_carries_timestamp() {
        let mut g = generator();
        let e = g.generate(EventType::Done, json!({}), true);
        let data_line = e
            .to_sse()
            .lines()
            .find(|l| l.starts_with("data: "))
            .unwrap()
            .to_string();
        let payload: Value = serde_json::from_str(&data_line["data: ".len()..]).unwrap();
        assert!(payload.get("timestamp").is_some());
    }

    #[test]
    fn json_line_form_has_fixed_keys() {
        let mut g = generator();
        let e = g.generate(EventType::Iteration, json!({"iteration": 1}), true);
        let line = e.to_json_line();
        let parsed: Value = serde_json::from_str(line.trim()).unwrap();
        assert_eq!(parsed["type"], "iteration");
        assert_eq!(parsed["event_id"], "sess_0");
        assert_eq!(parsed["data"]["iteration"], 1);
        assert!(parsed.get("timestamp").is_some());
    }

    #[test]
    fn frame_accounts_bytes() {
        let mut g = generator();
        let e = g.generate(EventType::Done, json!({}), true);
        let framed = g.frame(&e, true);
        assert_eq!(g.stats().bytes_emitted, framed.len() as u64);
        assert_eq!(g.stats().events_generated, 1);
    }

    #[test]
    fn event_type_serialises_snake_case() {
        assert_eq!(
            serde_json::to_value(EventType::LoopComplete).unwrap(),
            json!("loop_complete")
        );
        assert_eq!(EventType::ToolExecuting.to_string(), "tool_executing");
    }
}
