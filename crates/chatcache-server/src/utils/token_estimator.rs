//! Word-based token estimation.
//!
//! This is an approximation, not a real tokenizer: ~1.3 tokens per word plus
//! one token per punctuation mark. Compression decisions depend on these
//! constants staying the same everywhere, so every caller goes through here.

use once_cell::sync::Lazy;
use regex::Regex;

use crate::models::{ChatMessage, MessageRole};

static WORD_PATTERN: Lazy<Regex> = Lazy::new(|| Regex::new(r"\b\w+\b").expect("valid word regex"));
static PUNCTUATION_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"[.,!?;:"'()\[\]{}]"#).expect("valid punctuation regex"));

const TOKENS_PER_WORD: f64 = 1.3;
const TOKENS_PER_PUNCTUATION: usize = 1;

/// Fixed overhead for the role marker of every message
pub const ROLE_OVERHEAD_TOKENS: usize = 3;

/// Estimate tokens for raw text. 0 for blank input, otherwise at least 1.
pub fn estimate_tokens(text: &str) -> usize {
    let text = text.trim();
    if text.is_empty() {
        return 0;
    }

    let words = WORD_PATTERN.find_iter(text).count();
    let punctuation = PUNCTUATION_PATTERN.find_iter(text).count();

    let estimate = (words as f64 * TOKENS_PER_WORD).ceil() as usize + punctuation * TOKENS_PER_PUNCTUATION;
    estimate.max(1)
}

pub fn estimate_message_tokens(message: &ChatMessage) -> usize {
    estimate_tokens(&message.content) + ROLE_OVERHEAD_TOKENS
}

pub fn estimate_messages_tokens(messages: &[ChatMessage]) -> usize {
    messages.iter().map(estimate_message_tokens).sum()
}

/// Check if adding text would exceed limit
pub fn would_exceed_limit(current_tokens: usize, new_text: &str, max_tokens: usize) -> bool {
    current_tokens + estimate_tokens(new_text) > max_tokens
}

/// Per-role token breakdown of a message list
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TokenSummary {
    pub total_tokens: usize,
    pub user_tokens: usize,
    pub assistant_tokens: usize,
    pub message_count: usize,
    pub average_tokens_per_message: f64,
}

pub fn summarize(messages: &[ChatMessage]) -> TokenSummary {
    let mut summary = TokenSummary {
        message_count: messages.len(),
        ..TokenSummary::default()
    };

    for message in messages {
        let tokens = estimate_message_tokens(message);
        summary.total_tokens += tokens;
        match message.role {
            MessageRole::User => summary.user_tokens += tokens,
            MessageRole::Assistant => summary.assistant_tokens += tokens,
            MessageRole::System => {}
        }
    }

    if summary.message_count > 0 {
        summary.average_tokens_per_message = summary.total_tokens as f64 / summary.message_count as f64;
    }
    summary
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_token_estimation() {
        // 7 words -> ceil(9.1) = 10
        let text = "Ini adalah dokumen test yang berisi informasi";
        assert_eq!(estimate_tokens(text), 10);
    }

    #[test]
    fn test_punctuation_counts_separately() {
        // 2 words -> 3, plus "," and "!"
        assert_eq!(estimate_tokens("Hello, world!"), 5);
    }

    #[test]
    fn test_empty_string() {
        assert_eq!(estimate_tokens(""), 0);
        assert_eq!(estimate_tokens("   \n\t"), 0);
    }

    #[test]
    fn test_non_empty_is_at_least_one() {
        assert_eq!(estimate_tokens("-"), 1);
        assert!(estimate_tokens("a") >= 1);
    }

    #[test]
    fn test_message_adds_role_overhead() {
        let message = ChatMessage::user("Hello, world!");
        assert_eq!(estimate_message_tokens(&message), 5 + ROLE_OVERHEAD_TOKENS);
    }

    #[test]
    fn test_message_list_sums() {
        let messages = vec![
            ChatMessage::user("What is RAG?"),
            ChatMessage::assistant("RAG is Retrieval-Augmented Generation"),
        ];
        let expected: usize = messages.iter().map(estimate_message_tokens).sum();
        assert_eq!(estimate_messages_tokens(&messages), expected);
        assert_eq!(estimate_messages_tokens(&[]), 0);
    }

    #[test]
    fn test_would_exceed() {
        let current = 1000;
        // 500 words = 650 tokens
        let text = "word ".repeat(500);
        assert!(would_exceed_limit(current, &text, 1500));
        assert!(!would_exceed_limit(current, &text, 2000));
    }

    #[test]
    fn test_summary_splits_by_role() {
        let messages = vec![
            ChatMessage::user("one two"),
            ChatMessage::assistant("three"),
            ChatMessage::system("four"),
        ];
        let summary = summarize(&messages);
        assert_eq!(summary.message_count, 3);
        assert_eq!(summary.user_tokens, 3 + ROLE_OVERHEAD_TOKENS);
        assert_eq!(summary.assistant_tokens, 2 + ROLE_OVERHEAD_TOKENS);
        assert_eq!(summary.total_tokens, 3 * ROLE_OVERHEAD_TOKENS + 3 + 2 + 2);
        assert!((summary.average_tokens_per_message - summary.total_tokens as f64 / 3.0).abs() < 1e-9);
    }
}
