//! Error taxonomy of the monitor pipeline. Fetch and cursor errors decide
//! whether a cycle backs off or halts; normalize and consumer errors stay
//! local to one event or one consumer.

use std::time::Duration;

use stellar_monitor_domain::{
    config::ConfigError,
    model::{ConsumerId, Cursor, CursorParseError},
    services::telemetry::TelemetryError,
    storage::StorageError,
};
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum FetchError {
    /// Network trouble, timeouts, rate limiting or 5xx answers. Retried.
    #[error("transient fetch error: {0}")]
    Transient(String),
    /// The source answered with something we cannot interpret. Never retried.
    #[error("fatal protocol error: {0}")]
    FatalProtocol(String),
    #[error("source rejected cursor `{cursor}`: {reason}")]
    InvalidCursor { cursor: String, reason: String },
}

impl From<reqwest::Error> for FetchError {
    fn from(value: reqwest::Error) -> Self {
        if value.is_decode() {
            Self::FatalProtocol(value.to_string())
        } else {
            Self::Transient(value.to_string())
        }
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum NormalizeError {
    #[error("malformed event at {position}: {reason}")]
    MalformedEvent { position: Cursor, reason: String },
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConsumerError {
    #[error("consumer rejected event: {0}")]
    Rejected(String),
    #[error("consumer timed out after {0:?}")]
    Timeout(Duration),
    #[error("consumer transport failed: {0}")]
    Transport(String),
    #[error("consumer task panicked")]
    Panicked,
}

#[derive(Debug, Error)]
pub enum CursorError {
    #[error("persisted cursor `{value}` is unreadable: {source}")]
    Invalid {
        value: String,
        #[source]
        source: CursorParseError,
    },
    #[error("refusing to move cursor backward from {from} to {to}")]
    Regression { from: Cursor, to: Cursor },
    #[error("cursor storage failed: {0}")]
    Storage(#[from] StorageError),
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RegistrationError {
    #[error("consumer `{0}` is already registered")]
    Duplicate(ConsumerId),
}

#[derive(Debug, Error)]
pub enum MonitorError {
    #[error("config error: {0}")]
    Config(#[from] ConfigError),
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),
    #[error("rpc error: {0}")]
    Rpc(String),
    #[error("telemetry error: {0}")]
    Telemetry(#[from] TelemetryError),
    #[error("fetch error: {0}")]
    Fetch(#[from] FetchError),
    #[error("cursor error: {0}")]
    Cursor(#[from] CursorError),
    #[error("registration error: {0}")]
    Registration(#[from] RegistrationError),
    #[error("resync failed: {0}")]
    Resync(String),
    #[error("monitor is no longer running")]
    Stopped,
}

impl From<reqwest::Error> for MonitorError {
    fn from(value: reqwest::Error) -> Self {
        Self::Rpc(value.to_string())
    }
}
