use std::sync::Arc;

use crate::config::Settings;
use crate::services::{
    ActivitySweeper, ActivityTracker, AtomicUpdater, ChatService, ContextCompressor, EventLog,
    MessageService, PatternResponder, ResponseCache, ResponseGenerator, SessionService, StoreHealth,
};
use crate::store::KvStore;
use crate::utils::Clock;

/// Every service wired against one store backend and one clock
#[derive(Clone)]
pub struct Services {
    pub store: Arc<dyn KvStore>,
    pub clock: Arc<dyn Clock>,
    pub atomic: Arc<AtomicUpdater>,
    pub activity: Arc<ActivityTracker>,
    pub messages: Arc<MessageService>,
    pub sessions: Arc<SessionService>,
    pub cache: Arc<ResponseCache>,
    pub events: Arc<EventLog>,
    pub chat: Arc<ChatService>,
    pub health: Arc<StoreHealth>,
    pub sweeper: Arc<ActivitySweeper>,
    pub settings: Settings,
}

impl Services {
    /// Build with the canned pattern responder
    pub fn build(settings: Settings, store: Arc<dyn KvStore>, clock: Arc<dyn Clock>) -> Self {
        Self::with_generator(settings, store, clock, Arc::new(PatternResponder::default()))
    }

    pub fn with_generator(
        settings: Settings,
        store: Arc<dyn KvStore>,
        clock: Arc<dyn Clock>,
        generator: Arc<dyn ResponseGenerator>,
    ) -> Self {
        let atomic = Arc::new(AtomicUpdater::new(
            store.clone(),
            clock.clone(),
            settings.session.clone(),
            settings.rate_limit.clone(),
            settings.cleanup.clone(),
        ));
        let activity = Arc::new(ActivityTracker::new(
            store.clone(),
            clock.clone(),
            settings.activity.clone(),
        ));
        let messages = Arc::new(MessageService::new(
            store.clone(),
            clock.clone(),
            atomic.clone(),
            settings.session.clone(),
        ));
        let sessions = Arc::new(SessionService::new(
            store.clone(),
            clock.clone(),
            activity.clone(),
            atomic.clone(),
            messages.clone(),
            settings.session.clone(),
        ));
        let cache = Arc::new(ResponseCache::new(
            store.clone(),
            clock.clone(),
            atomic.clone(),
            activity.clone(),
            settings.cache.clone(),
        ));
        let events = Arc::new(EventLog::new(store.clone(), clock.clone(), settings.events.clone()));
        let chat = Arc::new(ChatService::new(
            sessions.clone(),
            messages.clone(),
            activity.clone(),
            atomic.clone(),
            cache.clone(),
            events.clone(),
            ContextCompressor::new(settings.compression.clone()),
            generator,
        ));
        let health = Arc::new(StoreHealth::new(store.clone()));
        let sweeper = Arc::new(ActivitySweeper::new(
            activity.clone(),
            atomic.clone(),
            events.clone(),
            settings.activity.clone(),
            settings.cleanup.clone(),
        ));

        Self {
            store,
            clock,
            atomic,
            activity,
            messages,
            sessions,
            cache,
            events,
            chat,
            health,
            sweeper,
            settings,
        }
    }
}
