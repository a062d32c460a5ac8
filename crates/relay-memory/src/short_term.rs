// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::collections::HashMap;

use serde::Serialize;
use serde_json::Value;
use tracing::debug;

use relay_model::{Message, Role};

#[derive(Debug, Clone, Serialize)]
pub struct ShortTermStats {
    pub total_messages: usize,
    pub total_tokens: usize,
    pub user_messages: usize,
    pub assistant_messages: usize,
    pub tool_messages: usize,
    pub system_messages: usize,
}

/// Append-only session log, bounded by `max_messages` with oldest-first
/// eviction.  Lookup by message id is O(1).
#[derive(Debug)]
pub struct ShortTermMemory {
    max_messages: usize,
    messages: Vec<Message>,
    /// id → copy of the message, for constant-time retrieval.
    index: HashMap<String, Message>,
    role_counts: [usize; 4],
    total_tokens: usize,
}

fn role_slot(role: Role) -> usize {
    match role {
        Role::System => 0,
        Role::User => 1,
        Role::Assistant => 2,
        Role::Tool => 3,
    }
}

impl ShortTermMemory {
    pub fn new(max_messages: usize) -> Self {
        Self {
            max_messages,
            messages: Vec::new(),
            index: HashMap::new(),
            role_counts: [0; 4],
            total_tokens: 0,
        }
    }

    /// Append a message, evicting the oldest entry when at capacity.
    /// Returns the stored message's id.
    pub fn add(&mut self, message: Message) -> String {
        if self.messages.len() >= self.max_messages {
            self.evict_oldest();
        }
        let id = message.id.clone();
        self.role_counts[role_slot(message.role)] += 1;
        self.total_tokens += message.token_count();
        self.index.insert(id.clone(), message.clone());
        self.messages.push(message);
        debug!(total = self.messages.len(), "message stored");
        id
    }

    pub fn add_user(&mut self, content: impl Into<String>) -> String {
        self.add(Message::user(content))
    }

    pub fn add_assistant(&mut self, message: Message) -> String {
        debug_assert_eq!(message.role, Role::Assistant);
        self.add(message)
    }

    pub fn add_tool_result(
        &mut self,
        tool_use_id: impl Into<String>,
        tool_name: impl Into<String>,
        content: Value,
    ) -> String {
        self.add(Message::tool_result(tool_use_id, tool_name, content))
    }

    /// O(1) lookup by message id.
    pub fn get(&self, id: &str) -> Option<&Message> {
        self.index.get(id)
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    /// All messages of one role, oldest first.
    pub fn by_role(&self, role: Role) -> Vec<&Message> {
        self.messages.iter().filter(|m| m.role == role).collect()
    }

    pub fn recent(&self, count: usize) -> &[Message] {
        let start = self.messages.len().saturating_sub(count);
        &self.messages[start..]
    }

    /// API-shape views (role + content, internal fields dropped).
    pub fn to_api_messages(&self) -> Vec<Value> {
        self.messages.iter().map(Message::to_api_value).collect()
    }

    /// Replace the whole log (used after compression rewrote the history).
    pub fn replace(&mut self, messages: Vec<Message>) {
        self.messages.clear();
        self.index.clear();
        self.role_counts = [0; 4];
        self.total_tokens = 0;
        for message in messages {
            self.add(message);
        }
    }

    pub fn clear(&mut self) {
        self.messages.clear();
        self.index.clear();
        self.role_counts = [0; 4];
        self.total_tokens = 0;
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn total_tokens(&self) -> usize {
        self.total_tokens
    }

    pub fn stats(&self) -> ShortTermStats {
        ShortTermStats {
            total_messages: self.messages.len(),
            total_tokens: self.total_tokens,
            system_messages: self.role_counts[0],
            user_messages: self.role_counts[1],
            assistant_messages: self.role_counts[2],
            tool_messages: self.role_counts[3],
        }
    }

    fn evict_oldest(&mut self) {
        if self.messages.is_empty() {
            return;
        }
        let oldest = self.messages.remove(0);
        self.index.remove(&oldest.id);
        self.role_counts[role_slot(oldest.role)] -= 1;
        self.total_tokens -= oldest.token_count();
        debug!(id = %oldest.id, "oldest message evicted");
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    // ── Adding & lookup ───────────────────────────────────────────────────────

    #[test]
    fn add_returns_retrievable_id() {
        let mut m = ShortTermMemory::new(10);
        let id = m.add_user("hello");
        assert_eq!(m.get(&id).unwrap().as_text(), Some("hello"));
    }

    #[test]
    fn unknown_id_returns_none() {
        let m = ShortTermMemory::new(10);
        assert!(m.get("nope").is_none());
    }

    #[test]
    fn role_counts_track_additions() {
        let mut m = ShortTermMemory::new(10);
        m.add_user("q");
        m.add_assistant(Message::assistant("a"));
        m.add_tool_result("t1", "shell", json!("out"));
        let stats = m.stats();
        assert_eq!(stats.user_messages, 1);
        assert_eq!(stats.assistant_messages, 1);
        assert_eq!(stats.tool_messages, 1);
        assert_eq!(stats.total_messages, 3);
    }

    #[test]
    fn token_totals_accumulate() {
        let mut m = ShortTermMemory::new(10);
        m.add_user("12345678"); // 2 tokens
        m.add_user("abcd"); // 1 token
        assert_eq!(m.total_tokens(), 3);
    }

    // ── Eviction ──────────────────────────────────────────────────────────────

    #[test]
    fn capacity_evicts_oldest_first() {
        let mut m = ShortTermMemory::new(3);
        let first = m.add_user("one");
        m.add_user("two");
        m.add_user("three");
        m.add_user("four");
        assert_eq!(m.len(), 3);
        assert!(m.get(&first).is_none(), "oldest must be evicted");
        assert_eq!(m.messages()[0].as_text(), Some("two"));
    }

    #[test]
    fn eviction_updates_counters() {
        let mut m = ShortTermMemory::new(2);
        m.add_user("12345678"); // 2 tokens
        m.add_user("abcd");
        m.add_user("efgh");
        assert_eq!(m.stats().user_messages, 2);
        assert_eq!(m.total_tokens(), 2);
    }

    // ── Views ─────────────────────────────────────────────────────────────────

    #[test]
    fn by_role_filters_in_order() {
        let mut m = ShortTermMemory::new(10);
        m.add_user("q1");
        m.add_assistant(Message::assistant("a1"));
        m.add_user("q2");
        let users = m.by_role(Role::User);
        assert_eq!(users.len(), 2);
        assert_eq!(users[0].as_text(), Some("q1"));
        assert_eq!(users[1].as_text(), Some("q2"));
    }

    #[test]
    fn recent_returns_tail() {
        let mut m = ShortTermMemory::new(10);
        for i in 0..5 {
            m.add_user(format!("m{i}"));
        }
        let recent = m.recent(2);
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[0].as_text(), Some("m3"));
    }

    #[test]
    fn api_view_drops_internal_fields() {
        let mut m = ShortTermMemory::new(10);
        m.add_user("hello");
        let api = m.to_api_messages();
        assert_eq!(api[0]["role"], "user");
        assert!(api[0].get("timestamp").is_none());
    }

    #[test]
    fn replace_resets_counters() {
        let mut m = ShortTermMemory::new(10);
        m.add_user("old");
        m.replace(vec![Message::system("sys"), Message::user("new")]);
        assert_eq!(m.len(), 2);
        assert_eq!(m.stats().system_messages, 1);
        assert_eq!(m.stats().user_messages, 1);
    }

    #[test]
    fn clear_empties_everything() {
        let mut m = ShortTermMemory::new(10);
        let id = m.add_user("x");
        m.clear();
        assert!(m.is_empty());
        assert!(m.get(&id).is_none());
        assert_eq!(m.total_tokens(), 0);
    }
}
