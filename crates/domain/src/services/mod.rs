//! Shared service helpers such as the in-memory key-value cache and telemetry
//! wiring.

pub mod cache;
pub mod telemetry;

pub use cache::*;
pub use telemetry::*;
