use std::sync::Arc;

use tracing::info;

use evslot::config::Config;
use evslot::engine::Engine;
use evslot::notify::NotifyHub;

/// Open the booking store, replay it, compact it when the log has grown past
/// the threshold, and print one JSON summary line per station.
#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();

    let config = Config::from_env()?;
    std::fs::create_dir_all(&config.data_dir)?;
    let wal_path = config.wal_path();

    let engine = Engine::new(wal_path.clone(), Arc::new(NotifyHub::new()))?;
    info!("evslot store at {}", wal_path.display());
    info!("  replayed events: {}", engine.replayed_events());
    info!("  compact threshold: {}", config.compact_threshold);

    if engine.replayed_events() >= config.compact_threshold && engine.replayed_events() > 0 {
        engine.compact_wal().await?;
    }

    for summary in engine.list_stations().await {
        println!("{}", serde_json::to_string(&summary)?);
    }
    Ok(())
}
