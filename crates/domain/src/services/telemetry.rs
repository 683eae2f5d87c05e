use std::{env, net::SocketAddr, sync::Arc};

use metrics::{describe_counter, describe_gauge, describe_histogram, Unit};
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder, PrometheusHandle};
use once_cell::sync::OnceCell;
use thiserror::Error;
use tracing::warn;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::config::hydrate_env_file;

static SUBSCRIBER_INSTALLED: OnceCell<()> = OnceCell::new();
static METRICS_HANDLE: OnceCell<Arc<PrometheusHandle>> = OnceCell::new();

const BATCH_EVENT_BUCKETS: &[f64] = &[0.0, 1.0, 5.0, 10.0, 25.0, 50.0, 100.0, 200.0];
const BACKOFF_MS_BUCKETS: &[f64] = &[
    250.0, 500.0, 1_000.0, 2_500.0, 5_000.0, 10_000.0, 30_000.0, 60_000.0,
];

/// Observability options for one binary, read from `<PREFIX>_*` variables.
#[derive(Debug, Clone)]
pub struct TelemetryConfig {
    service: String,
    log_filter: String,
    metrics_address: Option<String>,
}

impl TelemetryConfig {
    /// Reads `<PREFIX>_LOG_FILTER` and `<PREFIX>_METRICS_ADDRESS`. The
    /// lowercased prefix doubles as the `service` label on every metric.
    pub fn from_env(prefix: &str) -> Self {
        let _ = hydrate_env_file();
        let upper = prefix.trim().to_ascii_uppercase();

        let log_filter = env::var(format!("{upper}_LOG_FILTER"))
            .ok()
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty())
            .unwrap_or_else(|| "info".to_string());
        let metrics_address = env::var(format!("{upper}_METRICS_ADDRESS"))
            .ok()
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty());

        Self {
            service: upper.to_ascii_lowercase(),
            log_filter,
            metrics_address,
        }
    }

    pub fn service(&self) -> &str {
        &self.service
    }

    pub fn log_filter(&self) -> &str {
        &self.log_filter
    }

    pub fn metrics_address(&self) -> Option<&str> {
        self.metrics_address.as_deref()
    }
}

/// Handle kept by binaries that render metrics themselves (the status API).
#[derive(Clone)]
pub struct TelemetryGuard {
    metrics: Arc<PrometheusHandle>,
}

impl TelemetryGuard {
    pub fn render_metrics(&self) -> String {
        self.metrics.render()
    }
}

/// Installs the tracing subscriber and the Prometheus recorder once per
/// process; later calls reuse what the first one installed.
///
/// When a metrics address is configured the Prometheus HTTP listener is
/// spawned onto the current Tokio runtime.
pub fn init_telemetry(config: &TelemetryConfig) -> Result<TelemetryGuard, TelemetryError> {
    install_tracing(config)?;
    let metrics = install_metrics(config)?;

    Ok(TelemetryGuard { metrics })
}

fn install_tracing(config: &TelemetryConfig) -> Result<(), TelemetryError> {
    if SUBSCRIBER_INSTALLED.get().is_some() {
        return Ok(());
    }

    let env_filter = EnvFilter::try_new(config.log_filter())
        .map_err(|err| TelemetryError::InvalidLogFilter(err.to_string()))?;

    if SUBSCRIBER_INSTALLED.set(()).is_ok() {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer().with_target(true))
            .try_init()
            .map_err(|err| TelemetryError::Tracing(err.to_string()))?;
    }

    Ok(())
}

fn install_metrics(config: &TelemetryConfig) -> Result<Arc<PrometheusHandle>, TelemetryError> {
    METRICS_HANDLE
        .get_or_try_init(|| {
            let builder = recorder_builder(config)?;
            let handle = match config.metrics_address() {
                None => builder
                    .install_recorder()
                    .map_err(|err| TelemetryError::Metrics(err.to_string()))?,
                Some(addr) => {
                    let socket: SocketAddr =
                        addr.parse().map_err(|err: std::net::AddrParseError| {
                            TelemetryError::InvalidMetricsAddress(addr.to_string(), err.to_string())
                        })?;
                    let (recorder, exporter) = builder
                        .with_http_listener(socket)
                        .build()
                        .map_err(|err| TelemetryError::Metrics(err.to_string()))?;
                    let handle = recorder.handle();
                    metrics::set_global_recorder(recorder)
                        .map_err(|err| TelemetryError::Metrics(err.to_string()))?;
                    tokio::spawn(async move {
                        if let Err(err) = exporter.await {
                            warn!(?err, "prometheus exporter stopped");
                        }
                    });
                    handle
                }
            };
            describe_metrics();
            Ok(Arc::new(handle))
        })
        .cloned()
}

fn recorder_builder(config: &TelemetryConfig) -> Result<PrometheusBuilder, TelemetryError> {
    PrometheusBuilder::new()
        .add_global_label("service", config.service())
        .set_buckets_for_metric(
            Matcher::Full("monitor_batch_events".into()),
            BATCH_EVENT_BUCKETS,
        )
        .and_then(|builder| {
            builder.set_buckets_for_metric(
                Matcher::Full("monitor_backoff_ms".into()),
                BACKOFF_MS_BUCKETS,
            )
        })
        .map_err(|err| TelemetryError::Metrics(err.to_string()))
}

fn describe_metrics() {
    describe_counter!("monitor_fetch_total", "Ledger page fetches by result.");
    describe_counter!(
        "monitor_events_total",
        "Events leaving the pipeline, by outcome."
    );
    describe_counter!(
        "monitor_consumer_deliveries_total",
        "Per-consumer delivery outcomes."
    );
    describe_counter!(
        "api_resync_requests_total",
        "Resync commands accepted over HTTP."
    );
    describe_gauge!("monitor_cursor", "Last committed paging token.");
    describe_gauge!("monitor_halted", "1 while the monitor is halted.");
    describe_histogram!("monitor_batch_events", Unit::Count, "Events per fetched page.");
    describe_histogram!(
        "monitor_backoff_ms",
        Unit::Milliseconds,
        "Delay chosen before the next attempt."
    );
}

#[derive(Debug, Error)]
pub enum TelemetryError {
    #[error("invalid log filter: {0}")]
    InvalidLogFilter(String),
    #[error("failed to install tracing subscriber: {0}")]
    Tracing(String),
    #[error("invalid metrics address `{0}`: {1}")]
    InvalidMetricsAddress(String, String),
    #[error("failed to install metrics recorder: {0}")]
    Metrics(String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    static ENV_GUARD: Mutex<()> = Mutex::new(());

    #[test]
    fn defaults_apply_when_unset() {
        let _guard = ENV_GUARD.lock().unwrap();
        env::remove_var("WATCHER_LOG_FILTER");
        env::remove_var("WATCHER_METRICS_ADDRESS");

        let cfg = TelemetryConfig::from_env("watcher");
        assert_eq!(cfg.service(), "watcher");
        assert_eq!(cfg.log_filter(), "info");
        assert_eq!(cfg.metrics_address(), None);
    }

    #[test]
    fn prefixed_variables_are_read() {
        let _guard = ENV_GUARD.lock().unwrap();
        env::set_var("WATCHER_LOG_FILTER", "stellar_monitor=debug");
        env::set_var("WATCHER_METRICS_ADDRESS", "127.0.0.1:9898");
        let cfg = TelemetryConfig::from_env(" Watcher ");
        assert_eq!(cfg.service(), "watcher");
        assert_eq!(cfg.log_filter(), "stellar_monitor=debug");
        assert_eq!(cfg.metrics_address(), Some("127.0.0.1:9898"));
        env::remove_var("WATCHER_LOG_FILTER");
        env::remove_var("WATCHER_METRICS_ADDRESS");
    }

    #[test]
    fn blank_values_fall_back() {
        let _guard = ENV_GUARD.lock().unwrap();
        env::set_var("WATCHER_LOG_FILTER", " ");
        env::set_var("WATCHER_METRICS_ADDRESS", "  ");
        let cfg = TelemetryConfig::from_env("WATCHER");
        assert_eq!(cfg.log_filter(), "info");
        assert_eq!(cfg.metrics_address(), None);
        env::remove_var("WATCHER_LOG_FILTER");
        env::remove_var("WATCHER_METRICS_ADDRESS");
    }

    #[test]
    fn histogram_buckets_are_accepted() {
        let cfg = TelemetryConfig::from_env("BUCKETS");
        assert!(recorder_builder(&cfg).is_ok());
    }
}
