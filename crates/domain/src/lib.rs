//! Domain-level building blocks shared across the monitor, storage and API
//! crates: configuration loading, the canonical ledger event model, the
//! key-value storage contract and process-wide telemetry wiring.

pub mod config;
pub mod model;
pub mod services;
pub mod storage;

pub use config::*;
pub use model::*;
pub use storage::*;
