pub mod activity;
pub mod atomic;
pub mod chat_service;
pub mod conversation;
pub mod event_log;
pub mod health;
pub mod keys;
pub mod message_service;
pub mod responder;
pub mod response_cache;
pub mod session_service;
pub mod sweeper;

pub use activity::ActivityTracker;
pub use atomic::{AtomicUpdater, RateLimitDecision};
pub use chat_service::{ChatReply, ChatRequest, ChatService};
pub use conversation::{CompressionResult, ContextAnalysis, ContextCompressor};
pub use event_log::EventLog;
pub use health::{HealthReport, StoreHealth};
pub use message_service::MessageService;
pub use responder::{PatternResponder, ResponseGenerator};
pub use response_cache::{CacheStats, ResponseCache};
pub use session_service::SessionService;
pub use sweeper::{ActivitySweeper, SweepOutcome};
