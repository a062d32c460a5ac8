// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Deterministic token estimation.
//!
//! The estimator is intentionally loose: a conservative upper bound of
//! ⌈chars/4⌉ for UTF-8 text, monotone in character count.  Exact counts are
//! the provider's business; this estimate only drives threshold checks and
//! capacity bounds, which tolerate slack in either direction.

use serde_json::Value;

/// Estimate the token count of a text fragment (⌈chars/4⌉, minimum 0).
pub fn estimate(text: &str) -> usize {
    let chars = text.chars().count();
    (chars + 3) / 4
}

/// Estimate the token count of an arbitrary JSON value by serialising it.
pub fn estimate_value(value: &Value) -> usize {
    match value {
        Value::String(s) => estimate(s),
        other => estimate(&other.to_string()),
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_text_is_zero_tokens() {
        assert_eq!(estimate(""), 0);
    }

    #[test]
    fn four_chars_is_one_token() {
        assert_eq!(estimate("abcd"), 1);
    }

    #[test]
    fn five_chars_rounds_up() {
        assert_eq!(estimate("abcde"), 2);
    }

    #[test]
    fn counts_characters_not_bytes() {
        // Four multi-byte characters are still one token.
        assert_eq!(estimate("日本語字"), 1);
    }

    #[test]
    fn estimate_is_monotone_in_length() {
        let mut prev = 0;
        for n in 0..64 {
            let s = "x".repeat(n);
            let t = estimate(&s);
            assert!(t >= prev, "estimate must never shrink as text grows");
            prev = t;
        }
    }

    #[test]
    fn json_string_estimated_as_raw_text() {
        assert_eq!(estimate_value(&Value::String("abcd".into())), 1);
    }

    #[test]
    fn json_object_estimated_from_serialisation() {
        let v = serde_json::json!({"a": 1});
        assert!(estimate_value(&v) >= 1);
    }
}
