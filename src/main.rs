use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use tracing::info;

use spoolsync::config::{default_config, load_config};
use spoolsync::db::Database;
use spoolsync::drivers::DriverRegistry;
use spoolsync::manager::DriverManager;

const DISPATCH_DRAIN_TIMEOUT: Duration = Duration::from_secs(10);

#[tokio::main]
async fn main() -> Result<()> {
    let config_path = std::env::args()
        .nth(1)
        .or_else(|| std::env::var("SPOOLSYNC_CONFIG").ok())
        .map(PathBuf::from);
    let config = match &config_path {
        Some(path) => load_config(path)?,
        None => default_config(),
    };

    spoolsync::init_tracing(&config.log_filter, &config.log_format);
    if let Some(path) = &config_path {
        info!("Loaded config from {:?}", path);
    }

    let db_path = config.database_path();
    let db = Database::open(&db_path).with_context(|| format!("Failed to open database {:?}", db_path))?;

    let (manager, events) = DriverManager::new(db, DriverRegistry::builtin(), &config);
    let dispatcher = manager.spawn_dispatcher(events);

    let running = manager.start_all().await.context("Failed to start printer drivers")?;
    info!("spoolsync running ({} drivers), press Ctrl-C to stop", running);

    tokio::signal::ctrl_c().await.context("Failed to listen for Ctrl-C")?;
    info!("Shutting down");

    manager.shutdown().await;
    DriverManager::join_dispatcher(dispatcher, DISPATCH_DRAIN_TIMEOUT).await;
    Ok(())
}
