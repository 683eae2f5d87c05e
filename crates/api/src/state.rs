use stellar_monitor::MonitorHandle;
use stellar_monitor_domain::services::telemetry::TelemetryGuard;

#[derive(Clone)]
pub struct AppState {
    monitor: MonitorHandle,
    telemetry: TelemetryGuard,
}

impl AppState {
    pub fn new(monitor: MonitorHandle, telemetry: TelemetryGuard) -> Self {
        Self { monitor, telemetry }
    }

    pub fn monitor(&self) -> &MonitorHandle {
        &self.monitor
    }

    pub fn telemetry(&self) -> &TelemetryGuard {
        &self.telemetry
    }
}
