pub mod settings;

pub use settings::{
    ActivityConfig, CacheConfig, CleanupConfig, CompressionConfig, EventLogConfig, LoggingConfig,
    RateLimitConfig, SessionConfig, Settings, StoreBackend, StoreConfig,
};
