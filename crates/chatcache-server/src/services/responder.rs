use async_trait::async_trait;
use once_cell::sync::Lazy;
use rand::seq::IndexedRandom;
use regex::Regex;

use crate::models::ChatMessage;

pub const DEFAULT_MODEL: &str = "mock-llm-v1";

/// Produces a reply for a user input given the recent conversation
#[async_trait]
pub trait ResponseGenerator: Send + Sync {
    fn model(&self) -> &str;

    async fn generate(&self, input: &str, context: &[ChatMessage]) -> String;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InputKind {
    Greeting,
    Goodbye,
    Thanks,
    Help,
    Question,
    Other,
}

/// Checked in order; the first match wins
static PATTERNS: Lazy<Vec<(InputKind, Regex)>> = Lazy::new(|| {
    [
        (
            InputKind::Greeting,
            r"(?i)\b(hello|hi|hey|greetings|good morning|good afternoon|good evening)\b",
        ),
        (
            InputKind::Goodbye,
            r"(?i)\b(goodbye|bye|farewell|see you|talk soon|until next time)\b",
        ),
        (InputKind::Thanks, r"(?i)\b(thank|thanks|appreciate|grateful)\b"),
        (InputKind::Help, r"(?i)\b(help|assist|support|guide)\b"),
        (
            InputKind::Question,
            r"(?i)(\b(what|how|why|when|where|who|which|can you|could you)\b|\?)",
        ),
    ]
    .into_iter()
    .map(|(kind, pattern)| (kind, Regex::new(pattern).expect("valid responder pattern")))
    .collect()
});

pub fn classify(input: &str) -> InputKind {
    PATTERNS
        .iter()
        .find(|(_, pattern)| pattern.is_match(input))
        .map(|(kind, _)| *kind)
        .unwrap_or(InputKind::Other)
}

fn replies(kind: InputKind) -> &'static [&'static str] {
    match kind {
        InputKind::Greeting => &[
            "Hello! How can I help you today?",
            "Hi there! What can I do for you?",
            "Greetings! I'm here to assist you.",
            "Hi! How are you doing today?",
        ],
        InputKind::Goodbye => &[
            "Goodbye! Have a great day!",
            "See you later! Take care!",
            "Goodbye! Feel free to come back anytime.",
        ],
        InputKind::Thanks => &["You're very welcome!", "Happy to help!", "Glad I could assist you!"],
        InputKind::Help => &[
            "I'm here to help! What do you need assistance with?",
            "Of course! How can I assist you?",
            "I'm ready to assist! What would you like to know?",
        ],
        InputKind::Question => &[
            "That's an interesting question. Let me think about that...",
            "Great question! Here's what I think:",
            "I'd be happy to help you with that.",
        ],
        InputKind::Other => &[
            "I understand. Could you tell me more about that?",
            "That's helpful to know. Please continue.",
            "I see. How can I help you with that?",
        ],
    }
}

/// Canned replies picked by input category
pub struct PatternResponder {
    model: String,
}

impl Default for PatternResponder {
    fn default() -> Self {
        Self::new(DEFAULT_MODEL)
    }
}

impl PatternResponder {
    pub fn new(model: impl Into<String>) -> Self {
        Self { model: model.into() }
    }
}

#[async_trait]
impl ResponseGenerator for PatternResponder {
    fn model(&self) -> &str {
        &self.model
    }

    async fn generate(&self, input: &str, context: &[ChatMessage]) -> String {
        let options = replies(classify(input));
        let reply = options.choose(&mut rand::rng()).copied().unwrap_or(options[0]);

        if context.len() > 2 {
            format!("{} (continuing from {} earlier messages)", reply, context.len())
        } else {
            reply.to_string()
        }
    }
}
