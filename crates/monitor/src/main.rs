//! Monitor binary that tails a Horizon server for ledger events.

use std::{io, sync::Arc, time::Duration};

use stellar_monitor::{run_monitor, shutdown_channel, MonitorError};
use stellar_monitor_domain::config::BootstrapConfig;
use stellar_monitor_domain::services::telemetry::{init_telemetry, TelemetryConfig};
use stellar_monitor_storage::SeaOrmStorage;
use tracing::{info, warn};

const PURGE_INTERVAL: Duration = Duration::from_secs(600);

#[tokio::main]
async fn main() -> io::Result<()> {
    if let Err(err) = bootstrap().await {
        eprintln!("[monitor] bootstrap failed: {err}");
        return Err(io::Error::other(err.to_string()));
    }

    Ok(())
}

async fn bootstrap() -> Result<(), MonitorError> {
    let config = BootstrapConfig::load_from_env()?;
    let telemetry_config = TelemetryConfig::from_env("MONITOR");
    let _telemetry = init_telemetry(&telemetry_config)?;
    let storage = SeaOrmStorage::connect(config.database_url()).await?;
    let purger = storage.spawn_purger(PURGE_INTERVAL);

    let (trigger, shutdown) = shutdown_channel();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("shutdown requested");
                trigger.trigger();
            }
            Err(err) => {
                warn!(?err, "cannot listen for ctrl-c; stop the process to exit");
                // Dropping the trigger would stop the monitor.
                std::future::pending::<()>().await;
            }
        }
    });

    let result = run_monitor(&config, Arc::new(storage), shutdown).await;
    purger.abort();
    result
}
