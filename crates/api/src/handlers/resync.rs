use actix_web::{
    web::{Data, Json},
    HttpResponse,
};
use metrics::counter;
use serde::{Deserialize, Serialize};
use stellar_monitor_domain::model::InitialCursor;
use tracing::info;

use super::ApiError;
use crate::state::AppState;

#[derive(Debug, Serialize, Deserialize)]
pub struct ResyncRequest {
    /// `now`, `ledger:<sequence>` or a raw paging token.
    pub cursor: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ResyncResponse {
    pub status: String,
    pub cursor: String,
}

/// Queues a cursor reset. The controller applies it between cycles, which
/// also clears a halt.
pub async fn resync_handler(
    state: Data<AppState>,
    payload: Json<ResyncRequest>,
) -> Result<HttpResponse, ApiError> {
    let cursor: InitialCursor = payload.cursor.parse()?;
    state
        .monitor()
        .resync(cursor)
        .await
        .map_err(|_| ApiError::MonitorStopped)?;

    counter!("api_resync_requests_total").increment(1);
    info!(%cursor, "resync requested");
    Ok(HttpResponse::Accepted().json(ResyncResponse {
        status: "accepted".into(),
        cursor: cursor.to_string(),
    }))
}
