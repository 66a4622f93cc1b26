use serde::Serialize;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

use super::activity::ActivityTracker;
use super::atomic::AtomicUpdater;
use super::conversation::{CompressionResult, ContextAnalysis, ContextCompressor};
use super::event_log::EventLog;
use super::message_service::MessageService;
use super::response_cache::ResponseCache;
use super::responder::ResponseGenerator;
use super::session_service::SessionService;
use crate::models::chat::MAX_MESSAGE_CHARS;
use crate::models::{MessageRole, SessionId};
use crate::utils::{ServiceError, ServiceResult};

const CONTEXT_MESSAGES: usize = 10;

#[derive(Debug, Clone)]
pub struct ChatRequest {
    pub session_id: SessionId,
    pub content: String,
    /// Defaults to the generator's model
    pub model: Option<String>,
    pub temperature: Option<f64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ChatReply {
    pub session_id: SessionId,
    pub reply: String,
    pub model: String,
    pub cached: bool,
    pub latency_ms: u64,
}

/// One chat turn: admission, liveness, cache, generation and persistence
pub struct ChatService {
    sessions: Arc<SessionService>,
    messages: Arc<MessageService>,
    activity: Arc<ActivityTracker>,
    atomic: Arc<AtomicUpdater>,
    cache: Arc<ResponseCache>,
    events: Arc<EventLog>,
    compressor: ContextCompressor,
    generator: Arc<dyn ResponseGenerator>,
}

impl ChatService {
    pub fn new(
        sessions: Arc<SessionService>,
        messages: Arc<MessageService>,
        activity: Arc<ActivityTracker>,
        atomic: Arc<AtomicUpdater>,
        cache: Arc<ResponseCache>,
        events: Arc<EventLog>,
        compressor: ContextCompressor,
        generator: Arc<dyn ResponseGenerator>,
    ) -> Self {
        Self {
            sessions,
            messages,
            activity,
            atomic,
            cache,
            events,
            compressor,
            generator,
        }
    }

    pub async fn respond(&self, request: ChatRequest) -> ServiceResult<ChatReply> {
        let start = Instant::now();
        let content = request.content.trim();
        if content.is_empty() {
            return Err(ServiceError::Validation("Message content cannot be null or empty".to_string()));
        }
        if content.chars().count() > MAX_MESSAGE_CHARS {
            return Err(ServiceError::Validation(format!(
                "Message content cannot exceed {} characters",
                MAX_MESSAGE_CHARS
            )));
        }

        self.cache.record_request().await;
        let session = self.sessions.get_session_or_err(&request.session_id).await?;

        if self.atomic.is_session_rate_limited(&session.id).await {
            return Err(ServiceError::RateLimited(format!("Session {} is over its request limit", session.id)));
        }
        if self.atomic.is_user_rate_limited(&session.user_id).await {
            return Err(ServiceError::RateLimited(format!("User {} is over its request limit", session.user_id)));
        }

        if let Err(e) = self.sessions.touch(&session.id).await {
            warn!("Failed to touch session {}: {}", session.id, e);
            self.activity.record_activity(&session.id, &session.user_id).await?;
        }

        let model = request
            .model
            .clone()
            .filter(|m| !m.trim().is_empty())
            .unwrap_or_else(|| self.generator.model().to_string());

        let (reply, cached) = match self.cache.lookup(content, &model, request.temperature).await {
            Some(entry) => (entry.response, true),
            None => {
                let context = self
                    .messages
                    .recent_messages(&session.id, CONTEXT_MESSAGES)
                    .await
                    .unwrap_or_else(|e| {
                        warn!("Loading context for session {} failed: {}", session.id, e);
                        Vec::new()
                    });
                let reply = self.generator.generate(content, &context).await;
                self.cache
                    .store(&session.id, content, &reply, &model, request.temperature)
                    .await?;
                (reply, false)
            }
        };

        for (role, text) in [(MessageRole::User, content), (MessageRole::Assistant, reply.as_str())] {
            match self.messages.add_message(&session.id, role, text).await {
                Ok(message) => self.events.publish_chat_message(&message).await,
                Err(e) => warn!("Failed to persist {} message for session {}: {}", role.as_str(), session.id, e),
            }
        }
        let kind = if cached { "chat_turn_cached" } else { "chat_turn" };
        self.events
            .publish_session_activity(&session.id, &session.user_id, kind)
            .await;

        let latency_ms = u64::try_from(start.elapsed().as_millis()).unwrap_or(u64::MAX);
        info!(
            "Chat turn for session {} served in {}ms (cached: {})",
            session.id, latency_ms, cached
        );

        Ok(ChatReply {
            session_id: session.id,
            reply,
            model,
            cached,
            latency_ms,
        })
    }

    /// Session history trimmed to `budget` estimated tokens
    pub async fn compressed_context(&self, session_id: &str, budget: Option<usize>) -> ServiceResult<CompressionResult> {
        let messages = self.messages.all_messages(session_id).await?;
        let result = match budget {
            Some(budget) => self.compressor.compress(messages, budget),
            None => self.compressor.compress_default(messages),
        };
        if result.was_compressed {
            debug!(
                "Session {} context compressed to {} tokens",
                session_id, result.final_token_count
            );
        }
        Ok(result)
    }

    pub async fn context_analysis(&self, session_id: &str) -> ServiceResult<ContextAnalysis> {
        let messages = self.messages.all_messages(session_id).await?;
        Ok(self.compressor.analyze(&messages))
    }
}
