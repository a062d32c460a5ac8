// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::collections::VecDeque;

use serde::Serialize;
use tracing::info;

use relay_config::CompressionConfig;
use relay_core::{AgentError, CompressionRecord, Compressor, ExecutionContext};
use relay_model::Message;

#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct MidTermStats {
    pub total_compressions: u64,
    pub total_tokens_saved: u64,
    pub avg_compression_ratio: f64,
    pub records_retained: usize,
}

/// The compressor plus a bounded ring of its records.
#[derive(Debug)]
pub struct MidTermMemory {
    compressor: Compressor,
    records: VecDeque<CompressionRecord>,
    max_records: usize,
    total_compressions: u64,
    total_tokens_saved: u64,
}

impl MidTermMemory {
    pub fn new(config: CompressionConfig, max_records: usize) -> Self {
        Self {
            compressor: Compressor::new(config),
            records: VecDeque::new(),
            max_records,
            total_compressions: 0,
            total_tokens_saved: 0,
        }
    }

    /// Threshold-gated compression; see [`Compressor::compress_if_needed`].
    pub fn compress_if_needed(
        &mut self,
        messages: &[Message],
        ctx: &mut ExecutionContext,
    ) -> Result<Option<Vec<Message>>, AgentError> {
        let outcome = self.compressor.compress_if_needed(messages, ctx)?;
        Ok(outcome.map(|o| {
            self.record(o.record);
            o.messages
        }))
    }

    /// Compress regardless of the threshold.
    pub fn force_compress(
        &mut self,
        messages: &[Message],
        ctx: &mut ExecutionContext,
    ) -> Result<Option<Vec<Message>>, AgentError> {
        let outcome = self.compressor.force_compress(messages, ctx)?;
        Ok(outcome.map(|o| {
            self.record(o.record);
            o.messages
        }))
    }

    fn record(&mut self, record: CompressionRecord) {
        info!(
            from = record.original_count,
            to = record.compressed_count,
            saved = record.tokens_saved,
            "compression recorded"
        );
        self.total_compressions += 1;
        self.total_tokens_saved += record.tokens_saved as u64;
        self.records.push_back(record);
        while self.records.len() > self.max_records {
            self.records.pop_front();
        }
    }

    pub fn history(&self) -> impl Iterator<Item = &CompressionRecord> {
        self.records.iter()
    }

    pub fn latest(&self) -> Option<&CompressionRecord> {
        self.records.back()
    }

    pub fn clear_history(&mut self) {
        self.records.clear();
    }

    pub fn stats(&self) -> MidTermStats {
        let avg = if self.records.is_empty() {
            0.0
        } else {
            self.records.iter().map(|r| r.ratio).sum::<f64>() / self.records.len() as f64
        };
        MidTermStats {
            total_compressions: self.total_compressions,
            total_tokens_saved: self.total_tokens_saved,
            avg_compression_ratio: avg,
            records_retained: self.records.len(),
        }
    }

    /// Human-readable compression history.
    pub fn summary(&self) -> String {
        if self.records.is_empty() {
            return "No compression history available.".into();
        }
        let mut lines = vec!["## Compression History".to_string(), String::new()];
        for (i, record) in self.records.iter().enumerate() {
            lines.push(format!(
                "{}. [{}] {} -> {} messages, saved {} tokens ({:.1}%)",
                i + 1,
                record.timestamp.format("%Y-%m-%d %H:%M:%S"),
                record.original_count,
                record.compressed_count,
                record.tokens_saved,
                record.ratio * 100.0,
            ));
        }
        let stats = self.stats();
        lines.push(String::new());
        lines.push(format!(
            "**Total Compressions:** {}",
            stats.total_compressions
        ));
        lines.push(format!(
            "**Total Tokens Saved:** {}",
            stats.total_tokens_saved
        ));
        lines.push(format!(
            "**Avg Compression Ratio:** {:.1}%",
            stats.avg_compression_ratio * 100.0
        ));
        lines.join("\n")
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
