pub mod activity;
pub mod chat;
pub mod event;

pub use activity::{ActivityScope, ActivitySummary, RankedEntry, SweepReport};
pub use chat::{CacheEntry, ChatMessage, ChatSession, MessageRole, SessionId, SessionStats};
pub use event::{EventRecord, EventStream};
