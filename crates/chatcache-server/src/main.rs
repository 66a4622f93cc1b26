use anyhow::Result;
use std::sync::Arc;
use tracing::{info, warn};

use chatcache_server::config::Settings;
use chatcache_server::state::Services;
use chatcache_server::store;
use chatcache_server::telemetry::init_telemetry;
use chatcache_server::utils::{Clock, SystemClock};

#[tokio::main]
async fn main() -> Result<()> {
    let settings = Settings::load()?;
    let _log_guard = init_telemetry(&settings.logging);

    info!("Starting chatcache server...");

    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let store = store::connect(&settings.store, clock.clone()).await?;
    info!("Store backend ready: {}", store.backend_name());

    let services = Services::build(settings, store, clock);

    let report = services.health.check().await;
    if report.reachable {
        info!("Store health: {}ms ping via {}", report.latency_ms, report.backend);
    } else {
        warn!("Store health check failed: {:?}", report.error);
    }

    services
        .events
        .publish_system_event(
            "startup",
            &format!("chatcache server started on {}", services.store.backend_name()),
            serde_json::Value::Null,
        )
        .await;

    let sweeper = tokio::spawn(services.sweeper.clone().run());
    info!(
        "Activity sweeper running every {}s",
        services.settings.activity.sweep_interval_secs
    );

    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received");
    sweeper.abort();

    Ok(())
}
