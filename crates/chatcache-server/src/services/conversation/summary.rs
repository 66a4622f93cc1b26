use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::{HashMap, HashSet};
use std::fmt::Write;

use crate::models::{ChatMessage, MessageRole};

const MAX_TOPICS: usize = 3;
const MAX_KEY_EXCHANGES: usize = 5;
const EXCHANGE_PREVIEW_CHARS: usize = 50;
const LONG_MESSAGE_CHARS: usize = 100;
const MIN_TOPIC_CHARS: usize = 4;

const PRIORITY_WORDS: [&str; 7] = ["how", "what", "why", "important", "problem", "error", "issue"];

static NON_ALNUM: Lazy<Regex> = Lazy::new(|| Regex::new(r"[^a-z0-9\s]").expect("valid topic filter regex"));

static STOP_WORDS: Lazy<HashSet<&'static str>> = Lazy::new(|| {
    [
        "the", "a", "an", "and", "or", "but", "in", "on", "at", "to", "for", "of", "with", "by", "is", "are", "was",
        "were", "been", "be", "have", "has", "had", "do", "does", "did", "will", "would", "could", "should", "may",
        "might", "can", "i", "you", "he", "she", "it", "we", "they", "me", "him", "her", "us", "them", "my", "your",
        "his", "its", "our", "their", "this", "that", "these", "those",
    ]
    .into_iter()
    .collect()
});

/// Summarize the dropped prefix of a conversation.
///
/// ```text
/// Previous conversation summary (N messages):
/// - U user messages, A assistant messages
/// - Main topics: a, b, c
/// - Key exchanges:
///   User: ...
/// ```
pub(crate) fn summarize_dropped(messages: &[ChatMessage]) -> String {
    if messages.is_empty() {
        return String::new();
    }

    let mut topic_counts: HashMap<String, usize> = HashMap::new();
    let mut key_exchanges = Vec::new();
    let mut user_messages = 0;
    let mut assistant_messages = 0;

    for message in messages {
        let prefix = match message.role {
            MessageRole::User => {
                user_messages += 1;
                count_topics(&message.content, &mut topic_counts);
                "User"
            }
            MessageRole::Assistant => {
                assistant_messages += 1;
                "Assistant"
            }
            MessageRole::System => continue,
        };

        if is_important(&message.content) {
            key_exchanges.push(format!("{}: {}", prefix, truncate(&message.content, EXCHANGE_PREVIEW_CHARS)));
        }
    }

    let mut summary = String::new();
    let _ = writeln!(summary, "Previous conversation summary ({} messages):", messages.len());
    let _ = writeln!(
        summary,
        "- {} user messages, {} assistant messages",
        user_messages, assistant_messages
    );

    let topics = top_topics(topic_counts);
    if !topics.is_empty() {
        let _ = writeln!(summary, "- Main topics: {}", topics.join(", "));
    }

    if !key_exchanges.is_empty() {
        summary.push_str("- Key exchanges:\n");
        for exchange in key_exchanges.iter().take(MAX_KEY_EXCHANGES) {
            let _ = writeln!(summary, "  {}", exchange);
        }
    }

    summary
}

fn count_topics(content: &str, counts: &mut HashMap<String, usize>) {
    let lowered = content.to_lowercase();
    let cleaned = NON_ALNUM.replace_all(&lowered, "");
    for word in cleaned.split_whitespace() {
        if word.chars().count() >= MIN_TOPIC_CHARS && !STOP_WORDS.contains(word) {
            *counts.entry(word.to_string()).or_insert(0) += 1;
        }
    }
}

/// Most frequent first; ties alphabetical
fn top_topics(counts: HashMap<String, usize>) -> Vec<String> {
    let mut ranked: Vec<(String, usize)> = counts.into_iter().collect();
    ranked.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
    ranked.into_iter().take(MAX_TOPICS).map(|(word, _)| word).collect()
}

fn is_important(content: &str) -> bool {
    let lowered = content.to_lowercase();
    lowered.contains('?')
        || PRIORITY_WORDS.iter().any(|w| lowered.contains(w))
        || content.chars().count() > LONG_MESSAGE_CHARS
}

fn truncate(content: &str, max_chars: usize) -> String {
    if content.chars().count() <= max_chars {
        return content.to_string();
    }
    let mut cut: String = content.chars().take(max_chars).collect();
    cut.push_str("...");
    cut
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_summary_counts_roles_and_topics() {
        let messages = vec![
            ChatMessage::user("Tell me about rust ownership"),
            ChatMessage::assistant("Ownership moves values"),
            ChatMessage::user("And rust borrowing rules"),
        ];
        let summary = summarize_dropped(&messages);

        assert!(summary.starts_with("Previous conversation summary (3 messages):\n"));
        assert!(summary.contains("- 2 user messages, 1 assistant messages\n"));
        assert!(summary.contains("- Main topics: rust, "));
        assert!(!summary.contains("Key exchanges"));
    }

    #[test]
    fn test_key_exchanges_are_capped_and_truncated() {
        let long = "x".repeat(120);
        let messages: Vec<ChatMessage> = (0..7).map(|_| ChatMessage::user(long.clone())).collect();
        let summary = summarize_dropped(&messages);

        let exchanges: Vec<&str> = summary.lines().filter(|l| l.starts_with("  User: ")).collect();
        assert_eq!(exchanges.len(), 5);
        assert_eq!(exchanges[0], format!("  User: {}...", "x".repeat(50)));
    }

    #[test]
    fn test_priority_words_mark_important() {
        assert!(is_important("Why is this slow"));
        assert!(is_important("is it fine?"));
        assert!(is_important("An ERROR occurred"));
        assert!(!is_important("thanks a lot"));
    }

    #[test]
    fn test_topics_skip_stop_words_and_short_words() {
        let mut counts = HashMap::new();
        count_topics("These caches, those caches! and the cat", &mut counts);
        assert_eq!(counts.get("caches"), Some(&2));
        assert!(!counts.contains_key("these"));
        assert!(!counts.contains_key("cat"));
    }

    #[test]
    fn test_empty_input_has_no_summary() {
        assert_eq!(summarize_dropped(&[]), "");
    }
}
