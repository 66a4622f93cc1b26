use anyhow::Result;
use config::{Config, Environment, File};
use serde::{Deserialize, Serialize};
use std::time::Duration;

#[derive(Debug, Deserialize, Serialize, Clone, Default)]
#[serde(default)]
pub struct Settings {
    pub store: StoreConfig,
    pub cache: CacheConfig,
    pub activity: ActivityConfig,
    pub session: SessionConfig,
    pub rate_limit: RateLimitConfig,
    pub compression: CompressionConfig,
    pub cleanup: CleanupConfig,
    pub events: EventLogConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Deserialize, Serialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    Redis,
    Memory,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(default)]
pub struct StoreConfig {
    pub backend: StoreBackend,
    pub url: String,
    pub op_timeout_ms: u64,
    pub connect_timeout_ms: u64,
    /// Use the in-memory backend when redis cannot be reached at startup
    pub fallback_to_memory: bool,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: StoreBackend::Redis,
            url: "redis://127.0.0.1:6379".to_string(),
            op_timeout_ms: 500,
            connect_timeout_ms: 2000,
            fallback_to_memory: true,
        }
    }
}

impl StoreConfig {
    pub fn op_timeout(&self) -> Duration {
        Duration::from_millis(self.op_timeout_ms.max(1))
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms.max(1))
    }
}

#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(default)]
pub struct CacheConfig {
    pub response_ttl_secs: u64,
    /// Literal used in the cache key when no temperature is given
    pub default_temperature: String,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            response_ttl_secs: 3600,
            default_temperature: "0.7".to_string(),
        }
    }
}

#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(default)]
pub struct ActivityConfig {
    pub live_window_secs: u64,
    pub recent_window_secs: u64,
    pub today_window_secs: u64,
    pub marker_ttl_secs: u64,
    pub max_sessions_per_user: usize,
    pub stale_after_secs: u64,
    pub sweep_interval_secs: u64,
}

impl Default for ActivityConfig {
    fn default() -> Self {
        Self {
            live_window_secs: 30 * 60,
            recent_window_secs: 60 * 60,
            today_window_secs: 24 * 60 * 60,
            marker_ttl_secs: 30 * 60,
            max_sessions_per_user: 10,
            stale_after_secs: 7 * 24 * 60 * 60,
            sweep_interval_secs: 300,
        }
    }
}

#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(default)]
pub struct SessionConfig {
    pub ttl_secs: u64,
    pub max_messages: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            ttl_secs: 2 * 60 * 60,
            max_messages: 50,
        }
    }
}

#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(default)]
pub struct RateLimitConfig {
    pub window_secs: u64,
    pub user_limit: u64,
    pub session_limit: u64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            window_secs: 60,
            user_limit: 60,
            session_limit: 30,
        }
    }
}

#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(default)]
pub struct CompressionConfig {
    pub context_window: usize,
    pub target_tokens: usize,
    pub summary_reserve: usize,
    pub min_recent_messages: usize,
}

impl Default for CompressionConfig {
    fn default() -> Self {
        Self {
            context_window: 4000,
            target_tokens: 2000,
            summary_reserve: 500,
            min_recent_messages: 10,
        }
    }
}

#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(default)]
pub struct CleanupConfig {
    pub batch_size: usize,
    pub idle_session_secs: u64,
}

impl Default for CleanupConfig {
    fn default() -> Self {
        Self {
            batch_size: 100,
            idle_session_secs: 24 * 60 * 60,
        }
    }
}

/// Entry caps of the append-only event logs
#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(default)]
pub struct EventLogConfig {
    pub chat_stream_cap: usize,
    pub session_activity_cap: usize,
    pub user_activity_cap: usize,
    pub system_events_cap: usize,
    /// Per-session chat streams expire with their session
    pub chat_stream_ttl_secs: u64,
}

impl Default for EventLogConfig {
    fn default() -> Self {
        Self {
            chat_stream_cap: 100,
            session_activity_cap: 1000,
            user_activity_cap: 500,
            system_events_cap: 200,
            chat_stream_ttl_secs: 2 * 60 * 60,
        }
    }
}

#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(default)]
pub struct LoggingConfig {
    /// Daily-rolling JSON log files are written here when set
    pub directory: Option<String>,
    pub file_prefix: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            directory: None,
            file_prefix: "chatcache".to_string(),
        }
    }
}

impl Settings {
    pub fn load() -> Result<Self> {
        dotenvy::dotenv().ok();

        let config = Config::builder()
            .add_source(File::with_name("config/settings").required(false))
            .add_source(
                Environment::with_prefix("APP")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let settings: Settings = config.try_deserialize()?;
        Ok(settings)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_policy_values() {
        let settings = Settings::default();
        assert_eq!(settings.cache.response_ttl_secs, 3600);
        assert_eq!(settings.activity.live_window_secs, 1800);
        assert_eq!(settings.activity.max_sessions_per_user, 10);
        assert_eq!(settings.session.max_messages, 50);
        assert_eq!(settings.compression.context_window, 4000);
        assert_eq!(settings.store.backend, StoreBackend::Redis);
        assert_eq!(settings.events.session_activity_cap, 1000);
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let config = Config::builder()
            .add_source(File::from_str(
                "[store]\nbackend = \"memory\"\n[cache]\nresponse_ttl_secs = 60\n",
                config::FileFormat::Toml,
            ))
            .build()
            .unwrap();
        let settings: Settings = config.try_deserialize().unwrap();

        assert_eq!(settings.store.backend, StoreBackend::Memory);
        assert_eq!(settings.cache.response_ttl_secs, 60);
        assert_eq!(settings.cache.default_temperature, "0.7");
        assert_eq!(settings.rate_limit.window_secs, 60);
    }
}
