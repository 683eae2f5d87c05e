use std::{sync::Arc, time::Duration};

#[cfg(unix)]
use std::{fs, path::Path};

use actix_web::{middleware::Logger, web, App, HttpServer};
use stellar_monitor::{build_monitor, shutdown_channel, MonitorError};
use stellar_monitor_domain::config::{BootstrapConfig, ConfigError, StatusConfig};
use stellar_monitor_domain::services::telemetry::{
    init_telemetry, TelemetryConfig, TelemetryError,
};
use stellar_monitor_storage::SeaOrmStorage;
use thiserror::Error;
use tracing::{info, warn};

use crate::{
    handlers::{health_handler, metrics_handler, resync_handler, status_handler},
    state::AppState,
};

const PURGE_INTERVAL: Duration = Duration::from_secs(600);

pub async fn run() -> Result<(), BootstrapError> {
    // 1. Configuration for the monitor and for the status listener.
    let config = BootstrapConfig::load_from_env()?;
    let status_config = StatusConfig::load_from_env()?;

    // 2. Telemetry, under the `API_` prefix.
    let telemetry_config = TelemetryConfig::from_env("API");
    let telemetry = init_telemetry(&telemetry_config)?;

    // 3. Shared store holding the cursor and dedup markers.
    let storage = SeaOrmStorage::connect(config.database_url()).await?;
    let purger = storage.spawn_purger(PURGE_INTERVAL);

    // 4. The monitor runs on this process's runtime until the server stops.
    let (controller, handle) = build_monitor(&config, Arc::new(storage))?;
    let (trigger, shutdown) = shutdown_channel();
    let monitor = tokio::spawn(controller.run(shutdown));

    let state = AppState::new(handle, telemetry);
    let mut server = HttpServer::new(move || {
        App::new()
            .app_data(web::Data::new(state.clone()))
            .wrap(Logger::default())
            .configure(routes)
    });

    #[cfg(unix)]
    {
        if let Some(socket) = status_config.unix_socket() {
            // A socket file left behind by an unclean exit makes bind fail.
            cleanup_socket(socket)?;
            server = server.bind_uds(socket)?;
        }
    }

    #[cfg(not(unix))]
    {
        if let Some(socket) = status_config.unix_socket() {
            return Err(BootstrapError::Io(std::io::Error::other(format!(
                "unix socket '{socket}' requested but this platform does not support it"
            ))));
        }
    }

    if let Some(address) = status_config.bind_address() {
        server = server.bind(address)?;
    }

    // 5. actix stops the server on ctrl-c; the monitor drains afterwards.
    let served = server.run().await;
    info!("status server stopped; draining monitor");
    trigger.trigger();
    if let Err(err) = monitor.await {
        warn!(?err, "monitor task ended abnormally");
    }
    purger.abort();
    served?;

    Ok(())
}

pub fn routes(cfg: &mut web::ServiceConfig) {
    cfg.route("/healthz", web::get().to(health_handler))
        .route("/status", web::get().to(status_handler))
        .route("/metrics", web::get().to(metrics_handler))
        .route("/admin/resync", web::post().to(resync_handler));
}

#[derive(Debug, Error)]
pub enum BootstrapError {
    #[error("config error: {0}")]
    Config(#[from] ConfigError),
    #[error("telemetry error: {0}")]
    Telemetry(#[from] TelemetryError),
    #[error("storage error: {0}")]
    Storage(#[from] stellar_monitor_domain::storage::StorageError),
    #[error("monitor error: {0}")]
    Monitor(#[from] MonitorError),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

#[cfg(unix)]
fn cleanup_socket(path: &str) -> std::io::Result<()> {
    let socket_path = Path::new(path);
    if socket_path.exists() {
        fs::remove_file(socket_path)?;
    }
    Ok(())
}
