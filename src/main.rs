mod domain;
mod infrastructure;
mod presentation;

use anyhow::Context;
use domain::settings::SettingsService;
use infrastructure::bluetooth::{ConnectionManager, LinkConfig, SerialAdapter};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{error, info};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let settings_service = SettingsService::new()?;
    if !settings_service.path().exists() {
        settings_service.save()?;
    }

    let _logging_guard =
        infrastructure::logging::init_logger(&settings_service.get().log_settings)
            .map_err(|e| eprintln!("Failed to initialize logging: {:#}", e))
            .ok();

    info!("Starting Hydraulic Control");
    info!("Settings: {}", settings_service.path().display());

    let settings = settings_service.get().clone();
    let config = LinkConfig::from_settings(&settings).context("Invalid link settings")?;
    let adapter = Arc::new(SerialAdapter::new(&settings));

    let (event_tx, event_rx) = mpsc::unbounded_channel();
    let (command_tx, command_rx) = mpsc::unbounded_channel();

    let manager = ConnectionManager::new(adapter, config, event_tx);
    let state = manager.subscribe_state();
    let console = tokio::spawn(presentation::console::run(
        settings.motion_threshold,
        command_tx,
        event_rx,
    ));

    let outcome = manager.run(command_rx).await;

    // Let the console print the last events before exiting.
    if tokio::time::timeout(Duration::from_secs(1), console)
        .await
        .is_err()
    {
        info!("Console still draining, exiting anyway");
    }

    info!("Final connection state: {:?}", *state.borrow());

    match outcome {
        Ok(()) => {
            info!("Session closed");
            Ok(())
        }
        Err(e) => {
            error!("Session failed: {}", e);
            Err(e.into())
        }
    }
}
