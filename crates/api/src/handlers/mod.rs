pub mod resync;
pub mod status;

pub use resync::resync_handler;
pub use status::{health_handler, metrics_handler, status_handler};

use actix_web::{http::StatusCode, HttpResponse, ResponseError};
use serde::Serialize;
use thiserror::Error;

use stellar_monitor_domain::model::CursorParseError;

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("invalid cursor: {0}")]
    InvalidCursor(#[from] CursorParseError),
    #[error("monitor is not running")]
    MonitorStopped,
}

impl ResponseError for ApiError {
    fn status_code(&self) -> StatusCode {
        match self {
            ApiError::InvalidCursor(_) => StatusCode::BAD_REQUEST,
            ApiError::MonitorStopped => StatusCode::SERVICE_UNAVAILABLE,
        }
    }

    fn error_response(&self) -> HttpResponse {
        HttpResponse::build(self.status_code()).json(ErrorBody {
            error: self.to_string(),
        })
    }
}

#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub error: String,
}
