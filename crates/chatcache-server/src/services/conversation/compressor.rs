use tracing::debug;

use super::summary::summarize_dropped;
use super::types::{CompressionResult, ContextAnalysis};
use crate::config::CompressionConfig;
use crate::models::ChatMessage;
use crate::utils::token_estimator::{self, estimate_message_tokens, estimate_tokens};

const SMALL_CONTEXT_TOKENS: usize = 1000;
const MODERATE_CONTEXT_TOKENS: usize = 2000;

/// Token-budget-aware conversation compressor.
///
/// Keeps the newest messages verbatim and replaces the older prefix with a
/// short textual summary once the estimated cost exceeds the budget.
#[derive(Debug, Clone)]
pub struct ContextCompressor {
    config: CompressionConfig,
}

impl Default for ContextCompressor {
    fn default() -> Self {
        Self::new(CompressionConfig::default())
    }
}

impl ContextCompressor {
    pub fn new(config: CompressionConfig) -> Self {
        Self { config }
    }

    /// Compress against the configured default window
    pub fn compress_default(&self, messages: Vec<ChatMessage>) -> CompressionResult {
        self.compress(messages, self.config.context_window)
    }

    pub fn compress(&self, messages: Vec<ChatMessage>, budget: usize) -> CompressionResult {
        if messages.is_empty() {
            return CompressionResult::unchanged(messages, 0);
        }

        let costs: Vec<usize> = messages.iter().map(estimate_message_tokens).collect();
        let total_tokens: usize = costs.iter().sum();

        if total_tokens <= budget {
            return CompressionResult::unchanged(messages, total_tokens);
        }

        let target_tokens = self
            .config
            .target_tokens
            .min(budget.saturating_sub(self.config.summary_reserve));

        let keep_from = self.keep_from(&costs, target_tokens);
        let original_len = messages.len();

        let mut kept_messages = messages;
        let dropped: Vec<ChatMessage> = kept_messages.drain(..keep_from).collect();

        let summary = summarize_dropped(&dropped);
        let kept_tokens: usize = costs[keep_from..].iter().sum();
        let final_token_count = kept_tokens + estimate_tokens(&summary);
        let tokens_removed = total_tokens as i64 - final_token_count as i64;
        let compression_ratio = if tokens_removed > 0 {
            tokens_removed as f64 / total_tokens as f64
        } else {
            0.0
        };

        let result = CompressionResult {
            kept_messages,
            summary,
            was_compressed: true,
            original_token_count: total_tokens,
            final_token_count,
            tokens_removed,
            compression_ratio,
        };

        debug!(
            "Compressed context: {} -> {} tokens, dropped {} of {} messages",
            total_tokens,
            final_token_count,
            result.dropped_count(original_len),
            original_len
        );

        result
    }

    /// Index of the oldest kept message. The newest `min_recent_messages`
    /// are always kept; older ones only while the total stays within target.
    fn keep_from(&self, costs: &[usize], target_tokens: usize) -> usize {
        let guaranteed = self.config.min_recent_messages.min(costs.len());
        let mut start = costs.len() - guaranteed;
        let mut kept_tokens: usize = costs[start..].iter().sum();

        while start > 0 {
            let cost = costs[start - 1];
            if kept_tokens + cost > target_tokens {
                break;
            }
            kept_tokens += cost;
            start -= 1;
        }
        start
    }

    pub fn analyze(&self, messages: &[ChatMessage]) -> ContextAnalysis {
        if messages.is_empty() {
            return ContextAnalysis::default();
        }

        let tokens = token_estimator::summarize(messages);
        let needs_compression = tokens.total_tokens > self.config.context_window;
        let potential_savings = if needs_compression {
            tokens.total_tokens.saturating_sub(self.config.target_tokens)
        } else {
            0
        };

        ContextAnalysis {
            total_tokens: tokens.total_tokens,
            user_tokens: tokens.user_tokens,
            assistant_tokens: tokens.assistant_tokens,
            message_count: tokens.message_count,
            average_tokens_per_message: tokens.average_tokens_per_message,
            needs_compression,
            potential_savings,
            recommendation: recommendation(tokens.total_tokens, needs_compression).to_string(),
        }
    }
}

fn recommendation(total_tokens: usize, needs_compression: bool) -> &'static str {
    if total_tokens < SMALL_CONTEXT_TOKENS {
        "Context is small, no optimization needed."
    } else if total_tokens < MODERATE_CONTEXT_TOKENS {
        "Context size is moderate, monitoring recommended."
    } else if needs_compression {
        "Context size is large, compression recommended to improve performance."
    } else {
        "Context size is approaching limits, consider compression soon."
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::MessageRole;

    /// 15 words + 1 period = ceil(19.5) + 1 = 21, plus role overhead = 24
    fn sized_message(role: MessageRole, i: usize) -> ChatMessage {
        let content = format!("message {} talks about caching layers and redis sessions in a fairly long sentence ok.", i);
        ChatMessage::new("s1", role, content)
    }

    fn conversation(len: usize) -> Vec<ChatMessage> {
        (0..len)
            .map(|i| {
                let role = if i % 2 == 0 { MessageRole::User } else { MessageRole::Assistant };
                sized_message(role, i)
            })
            .collect()
    }

    #[test]
    fn test_under_budget_is_unchanged() {
        let messages = conversation(4);
        let result = ContextCompressor::default().compress(messages.clone(), 10_000);
        assert!(!result.was_compressed);
        assert_eq!(result.kept_messages, messages);
        assert_eq!(result.summary, "");
        assert_eq!(result.tokens_removed, 0);
        assert_eq!(result.compression_ratio, 0.0);
    }

    #[test]
    fn test_empty_input_is_noop() {
        let result = ContextCompressor::default().compress(Vec::new(), 0);
        assert!(!result.was_compressed);
        assert!(result.kept_messages.is_empty());
        assert_eq!(result.final_token_count, 0);
    }

    #[test]
    fn test_always_keeps_newest_ten() {
        let messages = conversation(25);
        let result = ContextCompressor::default().compress(messages.clone(), 50);

        assert!(result.was_compressed);
        assert_eq!(result.kept_messages.len(), 10);
        assert_eq!(result.kept_messages[..], messages[15..]);
        assert!(result.summary.contains("(15 messages)"));
        assert_eq!(
            result.tokens_removed + result.final_token_count as i64,
            result.original_token_count as i64
        );
    }

    #[test]
    fn test_keeps_older_messages_within_target() {
        let messages = conversation(40);
        let per_message = estimate_message_tokens(&messages[0]);
        let config = CompressionConfig {
            target_tokens: per_message * 14,
            ..CompressionConfig::default()
        };
        let budget = per_message * 14 + 500;
        let result = ContextCompressor::new(config).compress(messages.clone(), budget);

        assert!(result.was_compressed);
        assert_eq!(result.kept_messages.len(), 14);
        assert_eq!(result.kept_messages[..], messages[26..]);
    }

    #[test]
    fn test_short_over_budget_list_keeps_everything() {
        let messages = conversation(6);
        let result = ContextCompressor::default().compress(messages.clone(), 10);

        assert!(result.was_compressed);
        assert_eq!(result.kept_messages, messages);
        assert_eq!(result.summary, "");
        assert_eq!(result.tokens_removed, 0);
        assert_eq!(result.compression_ratio, 0.0);
    }

    #[test]
    fn test_ratio_is_removed_over_original() {
        let result = ContextCompressor::default().compress(conversation(30), 50);
        let expected = result.tokens_removed as f64 / result.original_token_count as f64;
        assert!(result.tokens_removed > 0);
        assert!((result.compression_ratio - expected).abs() < f64::EPSILON);
    }

    #[test]
    fn test_analyze_recommendations() {
        let compressor = ContextCompressor::default();
        assert_eq!(compressor.analyze(&[]).recommendation, "");

        let small = compressor.analyze(&conversation(3));
        assert!(!small.needs_compression);
        assert_eq!(small.potential_savings, 0);
        assert_eq!(small.recommendation, "Context is small, no optimization needed.");

        let large = compressor.analyze(&conversation(200));
        assert!(large.needs_compression);
        assert_eq!(large.potential_savings, large.total_tokens - 2000);
        assert!(large.recommendation.contains("compression recommended"));
    }
}
