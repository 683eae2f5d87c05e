//! Library entrypoint for embedding the monitor inside other binaries (e.g.,
//! the status API process). The binary in `main.rs` runs the same controller
//! standalone.

pub mod backoff;
pub mod cursor;
pub mod dedup;
pub mod dispatcher;
pub mod error;
pub mod normalizer;
pub mod rpc;
pub mod shutdown;
pub mod worker;

pub use cursor::{CursorAdvance, CursorStore};
pub use dedup::DedupCache;
pub use dispatcher::{
    ChannelConsumer, DeliveryOutcome, DispatchReport, Dispatcher, EventConsumer, FnConsumer,
    InterestFilter, LogConsumer, WebhookConsumer,
};
pub use error::{ConsumerError, CursorError, FetchError, MonitorError, NormalizeError};
pub use rpc::{FetchedBatch, HorizonSource, LedgerSource};
pub use shutdown::{shutdown_channel, ShutdownSignal, ShutdownTrigger};
pub use worker::{
    build_monitor, run_monitor, ControlCommand, CycleOutcome, MonitorController, MonitorHandle,
    MonitorState, MonitorStatus,
};
