use serde::Serialize;

use crate::models::ChatMessage;

/// Outcome of a compression pass
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CompressionResult {
    /// Messages that survive, in original order
    pub kept_messages: Vec<ChatMessage>,

    /// Text standing in for the dropped prefix. Empty when nothing was dropped.
    pub summary: String,

    pub was_compressed: bool,

    pub original_token_count: usize,

    /// tokens(kept) + tokens(summary)
    pub final_token_count: usize,

    /// original - final. Negative when the summary costs more than it saved.
    pub tokens_removed: i64,

    /// removed / original when something was removed, else 0
    pub compression_ratio: f64,
}

impl CompressionResult {
    pub(crate) fn unchanged(messages: Vec<ChatMessage>, total_tokens: usize) -> Self {
        Self {
            kept_messages: messages,
            summary: String::new(),
            was_compressed: false,
            original_token_count: total_tokens,
            final_token_count: total_tokens,
            tokens_removed: 0,
            compression_ratio: 0.0,
        }
    }

    pub fn dropped_count(&self, original_len: usize) -> usize {
        original_len.saturating_sub(self.kept_messages.len())
    }
}

/// Token report for a message list, without changing it
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ContextAnalysis {
    pub total_tokens: usize,
    pub user_tokens: usize,
    pub assistant_tokens: usize,
    pub message_count: usize,
    pub average_tokens_per_message: f64,
    pub needs_compression: bool,
    /// Tokens a compression down to the target would save
    pub potential_savings: usize,
    pub recommendation: String,
}
