use actix_web::{web::Data, HttpResponse};
use serde::{Deserialize, Serialize};
use stellar_monitor::MonitorState;

use crate::state::AppState;

#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub state: MonitorState,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub reason: Option<String>,
}

/// 200 while the monitor makes progress or retries, 503 once it has halted.
pub async fn health_handler(state: Data<AppState>) -> HttpResponse {
    let status = state.monitor().status();
    if status.is_halted() {
        return HttpResponse::ServiceUnavailable().json(HealthResponse {
            status: "halted".into(),
            state: status.state,
            reason: status.halted_reason,
        });
    }
    HttpResponse::Ok().json(HealthResponse {
        status: "ok".into(),
        state: status.state,
        reason: None,
    })
}

pub async fn status_handler(state: Data<AppState>) -> HttpResponse {
    HttpResponse::Ok().json(state.monitor().status())
}

pub async fn metrics_handler(state: Data<AppState>) -> HttpResponse {
    let body = state.telemetry().render_metrics();
    HttpResponse::Ok()
        .content_type("text/plain; version=0.0.4")
        .body(body)
}
