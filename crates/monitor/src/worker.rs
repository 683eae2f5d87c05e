use std::{collections::HashSet, sync::Arc, time::Duration};

use chrono::{DateTime, Utc};
use metrics::{counter, gauge, histogram};
use serde::{Deserialize, Serialize};
use stellar_monitor_domain::{
    config::{BootstrapConfig, DeliveryPolicy, MonitorSettings},
    model::{ConsumerId, Cursor, EventId, InitialCursor, RawLedgerEvent},
    storage::{KeyValueStore, StorageError},
};
use strum_macros::{AsRefStr, Display};
use tokio::{
    sync::{mpsc, watch},
    time::{sleep_until, timeout, Instant},
};
use tracing::{debug, error, info, warn};

use crate::{
    backoff::Backoff,
    cursor::{CursorAdvance, CursorStore},
    dedup::DedupCache,
    dispatcher::{Dispatcher, InterestFilter, LogConsumer, WebhookConsumer},
    error::{CursorError, FetchError, MonitorError},
    normalizer::normalize,
    rpc::{FetchedBatch, HorizonSource, LedgerSource},
    shutdown::ShutdownSignal,
};

const COMMAND_BUFFER: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, AsRefStr)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum MonitorState {
    Idle,
    Fetching,
    Processing,
    Advancing,
    BackingOff,
    Halted,
    Stopped,
}

/// Snapshot published after every state change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MonitorStatus {
    pub state: MonitorState,
    pub cursor: Option<Cursor>,
    pub consecutive_failures: u32,
    pub halted_reason: Option<String>,
    pub last_error: Option<String>,
    pub events_dispatched: u64,
    pub events_skipped: u64,
    pub events_duplicate: u64,
    pub last_cycle_at: Option<DateTime<Utc>>,
}

impl Default for MonitorStatus {
    fn default() -> Self {
        Self {
            state: MonitorState::Idle,
            cursor: None,
            consecutive_failures: 0,
            halted_reason: None,
            last_error: None,
            events_dispatched: 0,
            events_skipped: 0,
            events_duplicate: 0,
            last_cycle_at: None,
        }
    }
}

impl MonitorStatus {
    pub fn is_halted(&self) -> bool {
        self.state == MonitorState::Halted
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlCommand {
    /// Rewinds or forwards the cursor and clears a halt.
    Resync(InitialCursor),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleOutcome {
    /// Caught up; wait for the next poll tick.
    Idle,
    /// The source has more events ready; fetch again right away.
    MoreAvailable,
    BackingOff(Duration),
    Halted,
    Stopped,
}

/// Cheap, cloneable remote control for a running [`MonitorController`].
#[derive(Clone)]
pub struct MonitorHandle {
    status: watch::Receiver<MonitorStatus>,
    commands: mpsc::Sender<ControlCommand>,
    dispatcher: Arc<Dispatcher>,
}

impl MonitorHandle {
    pub fn status(&self) -> MonitorStatus {
        self.status.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<MonitorStatus> {
        self.status.clone()
    }

    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }

    pub async fn resync(&self, cursor: InitialCursor) -> Result<(), MonitorError> {
        self.commands
            .send(ControlCommand::Resync(cursor))
            .await
            .map_err(|_| MonitorError::Stopped)
    }
}

/// Why a cycle failed: transient failures back off and count against the
/// retry budget, fatal ones halt.
#[derive(Debug)]
enum Failure {
    Transient(String),
    Fatal(String),
}

impl From<FetchError> for Failure {
    fn from(err: FetchError) -> Self {
        match err {
            FetchError::Transient(_) => Failure::Transient(err.to_string()),
            FetchError::FatalProtocol(_) | FetchError::InvalidCursor { .. } => {
                Failure::Fatal(err.to_string())
            }
        }
    }
}

impl From<CursorError> for Failure {
    fn from(err: CursorError) -> Self {
        match err {
            CursorError::Storage(_) => Failure::Transient(err.to_string()),
            CursorError::Invalid { .. } | CursorError::Regression { .. } => {
                Failure::Fatal(err.to_string())
            }
        }
    }
}

impl From<StorageError> for Failure {
    fn from(err: StorageError) -> Self {
        Failure::Transient(err.to_string())
    }
}

/// What one pass over a batch achieved before it finished, stalled or was
/// cut short.
struct BatchProgress {
    committed: Cursor,
    blocked: HashSet<ConsumerId>,
    held_at: Option<EventId>,
    dispatched: u64,
    skipped: u64,
    duplicates: u64,
    storage_error: Option<String>,
    interrupted: bool,
}

impl BatchProgress {
    fn new(start: Cursor) -> Self {
        Self {
            committed: start,
            blocked: HashSet::new(),
            held_at: None,
            dispatched: 0,
            skipped: 0,
            duplicates: 0,
            storage_error: None,
            interrupted: false,
        }
    }

    fn stalled(&self) -> bool {
        self.held_at.is_some()
    }

    /// The cursor may only cover a contiguous prefix of settled events.
    fn settle(&mut self, position: Cursor) {
        if !self.stalled() {
            self.committed = position;
        }
    }
}

/// Sequential fetch, normalize, dispatch and advance loop for one instance.
pub struct MonitorController<L> {
    source: L,
    cursors: CursorStore,
    dedup: Arc<DedupCache>,
    dispatcher: Arc<Dispatcher>,
    settings: MonitorSettings,
    backoff: Backoff,
    cursor: Option<Cursor>,
    consecutive_failures: u32,
    halted: Option<String>,
    status: watch::Sender<MonitorStatus>,
    commands: mpsc::Receiver<ControlCommand>,
    commands_open: bool,
}

impl<L> MonitorController<L>
where
    L: LedgerSource,
{
    pub fn new(
        source: L,
        cursors: CursorStore,
        dedup: Arc<DedupCache>,
        dispatcher: Arc<Dispatcher>,
        settings: MonitorSettings,
    ) -> (Self, MonitorHandle) {
        let (status_tx, status_rx) = watch::channel(MonitorStatus::default());
        let (command_tx, command_rx) = mpsc::channel(COMMAND_BUFFER);
        let handle = MonitorHandle {
            status: status_rx,
            commands: command_tx,
            dispatcher: dispatcher.clone(),
        };
        let controller = Self {
            source,
            cursors,
            dedup,
            backoff: Backoff::new(settings.min_backoff, settings.max_backoff),
            dispatcher,
            settings,
            cursor: None,
            consecutive_failures: 0,
            halted: None,
            status: status_tx,
            commands: command_rx,
            commands_open: true,
        };
        (controller, handle)
    }

    pub fn status(&self) -> MonitorStatus {
        self.status.borrow().clone()
    }

    /// Runs until `shutdown` fires. An in-flight event is finished and the
    /// cursor persisted up to the last fully processed event before
    /// returning.
    pub async fn run(mut self, mut shutdown: ShutdownSignal) {
        info!(
            consumers = ?self.dispatcher.consumers(),
            policy = %self.settings.delivery_policy,
            "monitor started"
        );
        loop {
            if shutdown.is_triggered() {
                break;
            }
            let wait = match self.run_cycle(&shutdown).await {
                CycleOutcome::MoreAvailable => continue,
                CycleOutcome::Idle => Some(self.settings.poll_interval),
                CycleOutcome::BackingOff(delay) => Some(delay),
                CycleOutcome::Halted => None,
                CycleOutcome::Stopped => break,
            };
            if !self.pause(wait, &mut shutdown).await {
                break;
            }
        }
        self.set_state(MonitorState::Stopped);
        info!(cursor = ?self.cursor, "monitor stopped");
    }

    /// One fetch, process and advance pass.
    pub async fn run_cycle(&mut self, shutdown: &ShutdownSignal) -> CycleOutcome {
        if self.halted.is_some() {
            return CycleOutcome::Halted;
        }
        self.status
            .send_modify(|status| status.last_cycle_at = Some(Utc::now()));
        match self.try_cycle(shutdown).await {
            Ok(outcome) => outcome,
            Err(Failure::Transient(reason)) => self.fail_transient(reason),
            Err(Failure::Fatal(reason)) => self.halt(reason),
        }
    }

    async fn try_cycle(&mut self, shutdown: &ShutdownSignal) -> Result<CycleOutcome, Failure> {
        let cursor = self.current_cursor().await?;

        self.set_state(MonitorState::Fetching);
        let FetchedBatch {
            mut events,
            next_cursor,
            has_more,
        } = match self.source.fetch_since(cursor, self.settings.batch_size).await {
            Ok(batch) => {
                counter!("monitor_fetch_total", "result" => "ok").increment(1);
                batch
            }
            Err(err) => {
                counter!("monitor_fetch_total", "result" => fetch_label(&err)).increment(1);
                return Err(err.into());
            }
        };
        events.retain(|event| event.position > cursor);
        events.sort_by_key(|event| event.position);
        histogram!("monitor_batch_events").record(events.len() as f64);
        debug!(%cursor, events = events.len(), has_more, "batch fetched");

        self.set_state(MonitorState::Processing);
        let mut progress = BatchProgress::new(cursor);
        let timed_out = timeout(
            self.settings.cycle_timeout,
            self.process_batch(&events, &mut progress, shutdown),
        )
        .await
        .is_err();

        let finished = !timed_out
            && !progress.interrupted
            && !progress.stalled()
            && progress.storage_error.is_none();
        let target = if finished {
            progress.committed.max(next_cursor)
        } else {
            progress.committed
        };

        self.record_progress(&progress);
        self.set_state(MonitorState::Advancing);
        self.commit(cursor, target).await?;

        if let Some(reason) = progress.storage_error {
            return Err(Failure::Transient(reason));
        }
        if progress.interrupted {
            return Ok(CycleOutcome::Stopped);
        }
        if timed_out {
            warn!(cursor = %target, timeout = ?self.settings.cycle_timeout, "batch processing timed out");
            return Ok(self.back_off(format!(
                "processing exceeded the cycle timeout of {:?}",
                self.settings.cycle_timeout
            )));
        }
        if let Some(event_id) = &progress.held_at {
            return Ok(self.back_off(format!(
                "cursor held before event {event_id} until its consumers acknowledge"
            )));
        }

        self.consecutive_failures = 0;
        self.backoff.reset();
        self.status.send_modify(|status| {
            status.state = MonitorState::Idle;
            status.consecutive_failures = 0;
        });
        Ok(if has_more {
            CycleOutcome::MoreAvailable
        } else {
            CycleOutcome::Idle
        })
    }

    async fn process_batch(
        &self,
        events: &[RawLedgerEvent],
        progress: &mut BatchProgress,
        shutdown: &ShutdownSignal,
    ) {
        for raw in events {
            if shutdown.is_triggered() {
                progress.interrupted = true;
                return;
            }

            let event = match normalize(raw) {
                Ok(event) => event,
                Err(err) => {
                    warn!(cursor = %raw.position, ledger = raw.ledger_sequence, %err, "skipping malformed event");
                    counter!("monitor_events_total", "result" => "malformed").increment(1);
                    progress.skipped += 1;
                    progress.settle(raw.position);
                    continue;
                }
            };

            match self.dedup.seen(&event.event_id).await {
                Ok(true) => {
                    debug!(event_id = %event.event_id, cursor = %event.position, "event already processed");
                    counter!("monitor_events_total", "result" => "duplicate").increment(1);
                    progress.duplicates += 1;
                    progress.settle(event.position);
                    continue;
                }
                Ok(false) => {}
                Err(err) => {
                    progress.storage_error = Some(err.to_string());
                    return;
                }
            }

            let report = match self
                .dispatcher
                .deliver_excluding(&event, &progress.blocked)
                .await
            {
                Ok(report) => report,
                Err(err) => {
                    progress.storage_error = Some(err.to_string());
                    return;
                }
            };

            let processed = report.is_complete()
                || self.settings.delivery_policy == DeliveryPolicy::SkipAfterBudget;
            if processed {
                for (consumer, err) in report.failures() {
                    warn!(
                        event_id = %event.event_id,
                        cursor = %event.position,
                        %consumer,
                        %err,
                        "delivery abandoned after retry budget"
                    );
                }
                if let Err(err) = self.dedup.mark_seen(&event.event_id, self.dedup.ttl()).await {
                    progress.storage_error = Some(err.to_string());
                    return;
                }
                counter!("monitor_events_total", "result" => "dispatched").increment(1);
                progress.dispatched += 1;
                progress.settle(event.position);
            } else {
                progress.blocked.extend(report.unacknowledged().cloned());
                counter!("monitor_events_total", "result" => "held").increment(1);
                if !progress.stalled() {
                    warn!(
                        event_id = %event.event_id,
                        cursor = %progress.committed,
                        blocked = ?progress.blocked,
                        "consumers did not acknowledge; holding cursor"
                    );
                    progress.held_at = Some(event.event_id.clone());
                }
            }
        }
    }

    async fn current_cursor(&mut self) -> Result<Cursor, Failure> {
        if let Some(cursor) = self.cursor {
            return Ok(cursor);
        }
        if let Some(stored) = self.cursors.load().await? {
            info!(cursor = %stored, "resuming from persisted cursor");
            self.adopt(stored);
            return Ok(stored);
        }

        let initial = self.resolve(self.settings.initial_cursor).await?;
        let cursor = match self.cursors.initialize(initial).await? {
            CursorAdvance::Advanced(cursor) => cursor,
            CursorAdvance::Conflict {
                stored: Some(stored),
            } => stored,
            CursorAdvance::Conflict { stored: None } => {
                return Err(Failure::Transient(
                    "cursor could not be initialized".into(),
                ))
            }
        };
        info!(%cursor, initial = %self.settings.initial_cursor, "starting from initial cursor");
        self.adopt(cursor);
        Ok(cursor)
    }

    async fn resolve(&self, initial: InitialCursor) -> Result<Cursor, FetchError> {
        match initial {
            InitialCursor::At(cursor) => Ok(cursor),
            InitialCursor::Now => self.source.latest_cursor().await,
        }
    }

    async fn commit(&mut self, expected: Cursor, target: Cursor) -> Result<(), Failure> {
        match self.cursors.advance(expected, target).await? {
            CursorAdvance::Advanced(cursor) => {
                self.adopt(cursor);
                Ok(())
            }
            CursorAdvance::Conflict {
                stored: Some(stored),
            } => {
                info!(%stored, attempted = %target, "adopting cursor written by another instance");
                self.adopt(stored);
                Ok(())
            }
            CursorAdvance::Conflict { stored: None } => {
                self.cursor = None;
                Err(Failure::Transient("persisted cursor disappeared".into()))
            }
        }
    }

    fn adopt(&mut self, cursor: Cursor) {
        self.cursor = Some(cursor);
        gauge!("monitor_cursor").set(cursor.value() as f64);
        self.status
            .send_modify(|status| status.cursor = Some(cursor));
    }

    fn record_progress(&self, progress: &BatchProgress) {
        self.status.send_modify(|status| {
            status.events_dispatched += progress.dispatched;
            status.events_skipped += progress.skipped;
            status.events_duplicate += progress.duplicates;
        });
    }

    fn fail_transient(&mut self, reason: String) -> CycleOutcome {
        self.consecutive_failures += 1;
        if self.consecutive_failures > self.settings.max_retries {
            return self.halt(format!(
                "retry budget exhausted after {} consecutive failures: {reason}",
                self.consecutive_failures
            ));
        }
        warn!(
            cursor = ?self.cursor,
            failures = self.consecutive_failures,
            %reason,
            "cycle failed"
        );
        let failures = self.consecutive_failures;
        self.status
            .send_modify(|status| status.consecutive_failures = failures);
        self.back_off(reason)
    }

    /// Backs off without touching the retry budget.
    fn back_off(&mut self, reason: String) -> CycleOutcome {
        let delay = self.backoff.next_delay();
        histogram!("monitor_backoff_ms").record(delay.as_millis() as f64);
        self.status.send_modify(|status| {
            status.state = MonitorState::BackingOff;
            status.last_error = Some(reason);
        });
        CycleOutcome::BackingOff(delay)
    }

    fn halt(&mut self, reason: String) -> CycleOutcome {
        error!(cursor = ?self.cursor, %reason, "monitor halted; waiting for resync");
        gauge!("monitor_halted").set(1.0);
        let failures = self.consecutive_failures;
        self.status.send_modify(|status| {
            status.state = MonitorState::Halted;
            status.halted_reason = Some(reason.clone());
            status.last_error = Some(reason.clone());
            status.consecutive_failures = failures;
        });
        self.halted = Some(reason);
        CycleOutcome::Halted
    }

    async fn apply_command(&mut self, command: ControlCommand) {
        match command {
            ControlCommand::Resync(initial) => match self.resync(initial).await {
                Ok(cursor) => {
                    info!(%cursor, "resync applied");
                    self.halted = None;
                    self.consecutive_failures = 0;
                    self.backoff.reset();
                    gauge!("monitor_halted").set(0.0);
                    self.adopt(cursor);
                    self.status.send_modify(|status| {
                        status.state = MonitorState::Idle;
                        status.halted_reason = None;
                        status.consecutive_failures = 0;
                    });
                }
                Err(failure) => {
                    let reason = match failure {
                        Failure::Transient(reason) | Failure::Fatal(reason) => reason,
                    };
                    warn!(%initial, %reason, "resync failed");
                    self.status
                        .send_modify(|status| status.last_error = Some(format!("resync failed: {reason}")));
                }
            },
        }
    }

    /// Resets the stored cursor before [`run`](Self::run) starts, for
    /// deployments without a [`MonitorHandle`] consumer.
    pub async fn resync_on_start(&mut self, initial: InitialCursor) -> Result<Cursor, MonitorError> {
        let cursor = self.resync(initial).await.map_err(|failure| match failure {
            Failure::Transient(reason) | Failure::Fatal(reason) => MonitorError::Resync(reason),
        })?;
        info!(%cursor, %initial, "cursor reset on start");
        self.adopt(cursor);
        Ok(cursor)
    }

    async fn resync(&mut self, initial: InitialCursor) -> Result<Cursor, Failure> {
        let cursor = self.resolve(initial).await?;
        self.cursors.reset(cursor).await?;
        Ok(cursor)
    }

    /// Waits out `wait` (forever when `None`) while serving control
    /// commands. Returns `false` once shutdown is requested.
    async fn pause(&mut self, wait: Option<Duration>, shutdown: &mut ShutdownSignal) -> bool {
        let deadline = wait.map(|delay| Instant::now() + delay);
        loop {
            let command = tokio::select! {
                _ = shutdown.triggered() => return false,
                _ = sleep_until_deadline(deadline) => return true,
                command = self.commands.recv(), if self.commands_open => command,
            };
            match command {
                Some(command) => {
                    self.apply_command(command).await;
                    if self.halted.is_none() {
                        return true;
                    }
                }
                None => self.commands_open = false,
            }
        }
    }

    fn set_state(&self, state: MonitorState) {
        self.status.send_modify(|status| status.state = state);
    }
}

async fn sleep_until_deadline(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

fn fetch_label(err: &FetchError) -> &'static str {
    match err {
        FetchError::Transient(_) => "transient",
        FetchError::FatalProtocol(_) => "fatal",
        FetchError::InvalidCursor { .. } => "invalid_cursor",
    }
}

/// Wires the Horizon source, the shared store and the built-in consumers
/// together from environment configuration.
pub fn build_monitor(
    config: &BootstrapConfig,
    store: Arc<dyn KeyValueStore>,
) -> Result<(MonitorController<HorizonSource>, MonitorHandle), MonitorError> {
    let settings = config.settings().clone();
    settings.validate()?;

    let source = HorizonSource::new(config.horizon_url())?;
    let cursors = CursorStore::new(store.clone());
    let dedup = Arc::new(DedupCache::new(store, settings.dedup_ttl));
    let dispatcher = Arc::new(Dispatcher::from_settings(dedup.clone(), &settings));

    dispatcher.register(LogConsumer::ID, InterestFilter::all(), Arc::new(LogConsumer))?;
    if let Some(webhook) = config.webhook() {
        let filter = InterestFilter::all()
            .with_kinds(webhook.kinds().iter().copied())
            .with_accounts(webhook.accounts().iter().cloned());
        let consumer = WebhookConsumer::new(webhook.url(), settings.consumer_timeout)?;
        dispatcher.register("webhook", filter, Arc::new(consumer))?;
        info!(url = webhook.url(), "webhook consumer registered");
    }

    Ok(MonitorController::new(
        source, cursors, dedup, dispatcher, settings,
    ))
}

/// Builds the monitor and runs it until `shutdown` fires. Nothing holds the
/// handle here, so a halted standalone monitor is recovered by restarting it
/// with `MONITOR_RESYNC_CURSOR` set; the api binary exposes resync over HTTP.
pub async fn run_monitor(
    config: &BootstrapConfig,
    store: Arc<dyn KeyValueStore>,
    shutdown: ShutdownSignal,
) -> Result<(), MonitorError> {
    let (mut controller, _handle) = build_monitor(config, store)?;
    if let Some(initial) = config.resync_cursor() {
        controller.resync_on_start(initial).await?;
    }
    controller.run(shutdown).await;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::{
        collections::VecDeque,
        sync::{
            atomic::{AtomicBool, AtomicUsize, Ordering},
            Mutex,
        },
    };

    use async_trait::async_trait;
    use serde_json::json;
    use stellar_monitor_domain::{
        model::NormalizedEvent, services::cache::InMemoryKvStore, storage::StorageResult,
    };

    use crate::{
        dispatcher::EventConsumer,
        error::ConsumerError,
        shutdown::{shutdown_channel, ShutdownTrigger},
    };

    fn position(ledger: u32) -> Cursor {
        Cursor::from_parts(ledger, 1, 1)
    }

    fn payment(ledger: u32) -> RawLedgerEvent {
        let position = position(ledger);
        RawLedgerEvent {
            position,
            ledger_sequence: ledger,
            transaction_hash: format!("{ledger:064x}"),
            operation_index: position.operation_index(),
            operation_type: "payment".into(),
            source_account: Some("GSOURCE".into()),
            closed_at: Some("2024-05-01T00:00:00Z".into()),
            payload: json!({
                "from": "GSOURCE",
                "to": "GDEST",
                "amount": "1.0000000",
                "asset_type": "native",
            }),
        }
    }

    #[derive(Default)]
    struct MockSource {
        events: Mutex<Vec<RawLedgerEvent>>,
        errors: Mutex<VecDeque<FetchError>>,
        requests: Mutex<Vec<Cursor>>,
        latest: Mutex<Option<Cursor>>,
    }

    impl MockSource {
        fn with_events(events: Vec<RawLedgerEvent>) -> Arc<Self> {
            let source = Self::default();
            *source.events.lock().unwrap() = events;
            Arc::new(source)
        }

        fn push_events(&self, events: impl IntoIterator<Item = RawLedgerEvent>) {
            self.events.lock().unwrap().extend(events);
        }

        fn fail_next(&self, err: FetchError) {
            self.errors.lock().unwrap().push_back(err);
        }

        fn fetches(&self) -> usize {
            self.requests.lock().unwrap().len()
        }
    }

    #[async_trait]
    impl LedgerSource for MockSource {
        async fn fetch_since(&self, cursor: Cursor, limit: u32) -> Result<FetchedBatch, FetchError> {
            self.requests.lock().unwrap().push(cursor);
            if let Some(err) = self.errors.lock().unwrap().pop_front() {
                return Err(err);
            }
            // Served in storage order, not sorted, like a misbehaving node.
            let events: Vec<_> = self
                .events
                .lock()
                .unwrap()
                .iter()
                .filter(|event| event.position > cursor)
                .take(limit as usize)
                .cloned()
                .collect();
            let next_cursor = events
                .iter()
                .map(|event| event.position)
                .max()
                .unwrap_or(cursor);
            Ok(FetchedBatch {
                has_more: events.len() >= limit as usize,
                events,
                next_cursor,
            })
        }

        async fn latest_cursor(&self) -> Result<Cursor, FetchError> {
            self.latest
                .lock()
                .unwrap()
                .ok_or_else(|| FetchError::Transient("no ledger yet".into()))
        }
    }

    #[derive(Default)]
    struct Recording {
        ledgers: Mutex<Vec<u32>>,
    }

    impl Recording {
        fn ledgers(&self) -> Vec<u32> {
            self.ledgers.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl EventConsumer for Recording {
        async fn deliver(&self, event: &NormalizedEvent) -> Result<(), ConsumerError> {
            self.ledgers.lock().unwrap().push(event.ledger_sequence);
            Ok(())
        }
    }

    struct Hanging {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl EventConsumer for Hanging {
        async fn deliver(&self, _event: &NormalizedEvent) -> Result<(), ConsumerError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            std::future::pending().await
        }
    }

    /// Lets cursor initialization through but fails later cursor writes
    /// while `broken` is set, simulating a crash before the cursor lands.
    #[derive(Default)]
    struct FlakyKv {
        inner: InMemoryKvStore,
        broken: AtomicBool,
    }

    #[async_trait]
    impl KeyValueStore for FlakyKv {
        async fn get(&self, key: &str) -> StorageResult<Option<String>> {
            self.inner.get(key).await
        }

        async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> StorageResult<()> {
            self.inner.set(key, value, ttl).await
        }

        async fn compare_and_set(
            &self,
            key: &str,
            expected: Option<&str>,
            value: &str,
            ttl: Option<Duration>,
        ) -> StorageResult<bool> {
            if expected.is_some() && self.broken.load(Ordering::SeqCst) {
                return Err(StorageError::Database("connection reset".into()));
            }
            self.inner.compare_and_set(key, expected, value, ttl).await
        }

        async fn delete(&self, key: &str) -> StorageResult<bool> {
            self.inner.delete(key).await
        }
    }

    fn settings() -> MonitorSettings {
        MonitorSettings {
            initial_cursor: InitialCursor::At(Cursor::GENESIS),
            min_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(10),
            max_retries: 3,
            consumer_timeout: Duration::from_millis(50),
            consumer_retries: 1,
            batch_size: 50,
            ..MonitorSettings::default()
        }
    }

    struct Harness {
        controller: MonitorController<Arc<MockSource>>,
        handle: MonitorHandle,
        cursors: CursorStore,
        _trigger: ShutdownTrigger,
        shutdown: ShutdownSignal,
    }

    fn harness(
        source: Arc<MockSource>,
        store: Arc<dyn KeyValueStore>,
        settings: MonitorSettings,
        consumers: Vec<(&str, Arc<dyn EventConsumer>)>,
    ) -> Harness {
        let cursors = CursorStore::new(store.clone());
        let dedup = Arc::new(DedupCache::new(store, settings.dedup_ttl));
        let dispatcher = Arc::new(Dispatcher::from_settings(dedup.clone(), &settings));
        for (id, consumer) in consumers {
            dispatcher
                .register(id, InterestFilter::all(), consumer)
                .unwrap();
        }
        let (controller, handle) =
            MonitorController::new(source, cursors.clone(), dedup, dispatcher, settings);
        let (trigger, shutdown) = shutdown_channel();
        Harness {
            controller,
            handle,
            cursors,
            _trigger: trigger,
            shutdown,
        }
    }

    impl Harness {
        async fn cycle(&mut self) -> CycleOutcome {
            self.controller.run_cycle(&self.shutdown).await
        }

        async fn stored_cursor(&self) -> Option<Cursor> {
            self.cursors.load().await.unwrap()
        }
    }

    #[tokio::test]
    async fn delivers_out_of_order_batch_in_position_order() {
        let source = MockSource::with_events(vec![payment(3), payment(1), payment(2)]);
        let consumer = Arc::new(Recording::default());
        let mut h = harness(
            source,
            Arc::new(InMemoryKvStore::default()),
            settings(),
            vec![("voice", consumer.clone())],
        );

        assert_eq!(h.cycle().await, CycleOutcome::Idle);
        assert_eq!(consumer.ledgers(), vec![1, 2, 3]);
        assert_eq!(h.stored_cursor().await, Some(position(3)));
        assert_eq!(h.handle.status().events_dispatched, 3);
    }

    #[tokio::test]
    async fn replayed_events_are_dispatched_once() {
        let source = MockSource::with_events(vec![payment(1), payment(2)]);
        let consumer = Arc::new(Recording::default());
        let mut h = harness(
            source,
            Arc::new(InMemoryKvStore::default()),
            settings(),
            vec![("voice", consumer.clone())],
        );

        h.cycle().await;
        h.controller
            .apply_command(ControlCommand::Resync(InitialCursor::At(Cursor::GENESIS)))
            .await;
        assert_eq!(h.stored_cursor().await, Some(Cursor::GENESIS));

        assert_eq!(h.cycle().await, CycleOutcome::Idle);
        assert_eq!(consumer.ledgers(), vec![1, 2]);
        let status = h.handle.status();
        assert_eq!(status.events_duplicate, 2);
        assert_eq!(status.cursor, Some(position(2)));
    }

    #[tokio::test]
    async fn resumes_after_crash_without_redelivery_or_gaps() {
        let kv = Arc::new(FlakyKv::default());
        let source = MockSource::with_events(vec![payment(1), payment(2), payment(3)]);
        let consumer = Arc::new(Recording::default());

        let mut first = harness(
            source.clone(),
            kv.clone(),
            settings(),
            vec![("voice", consumer.clone())],
        );
        kv.broken.store(true, Ordering::SeqCst);
        assert!(matches!(first.cycle().await, CycleOutcome::BackingOff(_)));
        assert_eq!(consumer.ledgers(), vec![1, 2, 3]);
        assert_eq!(first.stored_cursor().await, Some(Cursor::GENESIS));
        drop(first);

        // A fresh instance takes over the same store after the "crash".
        kv.broken.store(false, Ordering::SeqCst);
        source.push_events([payment(4), payment(5)]);
        let mut second = harness(
            source,
            kv.clone(),
            settings(),
            vec![("voice", consumer.clone())],
        );
        assert_eq!(second.cycle().await, CycleOutcome::Idle);
        assert_eq!(consumer.ledgers(), vec![1, 2, 3, 4, 5]);
        assert_eq!(second.stored_cursor().await, Some(position(5)));
    }

    #[tokio::test]
    async fn transient_failures_back_off_with_growing_delays() {
        let source = MockSource::with_events(vec![payment(1)]);
        for _ in 0..3 {
            source.fail_next(FetchError::Transient("connection refused".into()));
        }
        let mut h = harness(
            source.clone(),
            Arc::new(InMemoryKvStore::default()),
            settings(),
            Vec::new(),
        );

        let mut delays = Vec::new();
        for _ in 0..3 {
            match h.cycle().await {
                CycleOutcome::BackingOff(delay) => delays.push(delay),
                other => panic!("expected backoff, got {other:?}"),
            }
        }
        assert!(delays[0] < delays[1] && delays[1] < delays[2]);
        assert!(delays[0] >= Duration::from_millis(100) && delays[0] <= Duration::from_millis(125));
        assert!(delays[2] <= Duration::from_secs(10));
        assert_eq!(h.handle.status().consecutive_failures, 3);

        assert_eq!(h.cycle().await, CycleOutcome::Idle);
        assert_eq!(h.handle.status().consecutive_failures, 0);

        source.fail_next(FetchError::Transient("connection refused".into()));
        match h.cycle().await {
            CycleOutcome::BackingOff(delay) => assert!(delay <= Duration::from_millis(125)),
            other => panic!("expected backoff, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn exhausted_retry_budget_halts() {
        let source = MockSource::with_events(Vec::new());
        for _ in 0..4 {
            source.fail_next(FetchError::Transient("503".into()));
        }
        let mut h = harness(
            source,
            Arc::new(InMemoryKvStore::default()),
            settings(),
            Vec::new(),
        );
        for _ in 0..3 {
            assert!(matches!(h.cycle().await, CycleOutcome::BackingOff(_)));
        }
        assert_eq!(h.cycle().await, CycleOutcome::Halted);
        let status = h.handle.status();
        assert!(status.is_halted());
        assert!(status
            .halted_reason
            .unwrap()
            .contains("retry budget exhausted"));
    }

    #[tokio::test(start_paused = true)]
    async fn failing_consumer_holds_cursor_under_require_ack() {
        let source = MockSource::with_events(vec![payment(1), payment(2)]);
        let healthy = Arc::new(Recording::default());
        let stuck = Arc::new(Hanging {
            calls: AtomicUsize::new(0),
        });
        let mut h = harness(
            source,
            Arc::new(InMemoryKvStore::default()),
            settings(),
            vec![("stuck", stuck.clone()), ("healthy", healthy.clone())],
        );

        assert!(matches!(h.cycle().await, CycleOutcome::BackingOff(_)));
        assert_eq!(healthy.ledgers(), vec![1, 2]);
        // Blocked after its first failure, so never handed event 2.
        assert_eq!(stuck.calls.load(Ordering::SeqCst), 2);
        assert_eq!(h.stored_cursor().await, Some(Cursor::GENESIS));
        assert_eq!(h.handle.status().consecutive_failures, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn failing_consumer_is_skipped_under_skip_after_budget() {
        let source = MockSource::with_events(vec![payment(1), payment(2)]);
        let healthy = Arc::new(Recording::default());
        let stuck = Arc::new(Hanging {
            calls: AtomicUsize::new(0),
        });
        let mut h = harness(
            source,
            Arc::new(InMemoryKvStore::default()),
            MonitorSettings {
                delivery_policy: DeliveryPolicy::SkipAfterBudget,
                ..settings()
            },
            vec![("stuck", stuck.clone()), ("healthy", healthy.clone())],
        );

        assert_eq!(h.cycle().await, CycleOutcome::Idle);
        assert_eq!(healthy.ledgers(), vec![1, 2]);
        assert_eq!(stuck.calls.load(Ordering::SeqCst), 4);
        assert_eq!(h.stored_cursor().await, Some(position(2)));
    }

    #[tokio::test]
    async fn malformed_event_is_skipped_and_passed() {
        let mut broken = payment(3);
        broken.payload = json!({ "from": "GSOURCE", "amount": "1", "asset_type": "native" });
        let source = MockSource::with_events(vec![
            payment(1),
            payment(2),
            broken,
            payment(4),
            payment(5),
        ]);
        let consumer = Arc::new(Recording::default());
        let mut h = harness(
            source,
            Arc::new(InMemoryKvStore::default()),
            settings(),
            vec![("voice", consumer.clone())],
        );

        assert_eq!(h.cycle().await, CycleOutcome::Idle);
        assert_eq!(consumer.ledgers(), vec![1, 2, 4, 5]);
        let status = h.handle.status();
        assert_eq!(status.events_dispatched, 4);
        assert_eq!(status.events_skipped, 1);
        assert_eq!(h.stored_cursor().await, Some(position(5)));
    }

    #[tokio::test]
    async fn invalid_cursor_halts_until_resync() {
        let source = MockSource::with_events(vec![payment(7)]);
        source.fail_next(FetchError::InvalidCursor {
            cursor: "0".into(),
            reason: "too old".into(),
        });
        let consumer = Arc::new(Recording::default());
        let mut h = harness(
            source.clone(),
            Arc::new(InMemoryKvStore::default()),
            settings(),
            vec![("voice", consumer.clone())],
        );

        assert_eq!(h.cycle().await, CycleOutcome::Halted);
        assert_eq!(h.cycle().await, CycleOutcome::Halted);
        assert_eq!(source.fetches(), 1);
        assert_eq!(h.handle.status().state, MonitorState::Halted);

        h.controller
            .apply_command(ControlCommand::Resync(InitialCursor::At(position(5))))
            .await;
        let status = h.handle.status();
        assert_eq!(status.state, MonitorState::Idle);
        assert_eq!(status.halted_reason, None);

        assert_eq!(h.cycle().await, CycleOutcome::Idle);
        assert_eq!(consumer.ledgers(), vec![7]);
        assert_eq!(source.requests.lock().unwrap().last(), Some(&position(5)));
    }

    #[tokio::test]
    async fn fatal_protocol_error_halts() {
        let source = MockSource::with_events(Vec::new());
        source.fail_next(FetchError::FatalProtocol("missing _embedded".into()));
        let mut h = harness(
            source,
            Arc::new(InMemoryKvStore::default()),
            settings(),
            Vec::new(),
        );
        assert_eq!(h.cycle().await, CycleOutcome::Halted);
        assert!(h
            .handle
            .status()
            .halted_reason
            .unwrap()
            .contains("missing _embedded"));
    }

    #[tokio::test]
    async fn now_starts_after_the_latest_ledger() {
        let source = MockSource::with_events(vec![payment(10), payment(11)]);
        *source.latest.lock().unwrap() = Some(Cursor::ledger_start(11));
        let consumer = Arc::new(Recording::default());
        let mut h = harness(
            source,
            Arc::new(InMemoryKvStore::default()),
            MonitorSettings {
                initial_cursor: InitialCursor::Now,
                ..settings()
            },
            vec![("voice", consumer.clone())],
        );
        assert_eq!(h.cycle().await, CycleOutcome::Idle);
        assert_eq!(consumer.ledgers(), vec![11]);
    }

    #[tokio::test]
    async fn conflicting_instance_adopts_stored_cursor() {
        let kv: Arc<dyn KeyValueStore> = Arc::new(InMemoryKvStore::default());
        let source = MockSource::with_events(vec![payment(1), payment(2)]);
        let mut first = harness(source.clone(), kv.clone(), settings(), Vec::new());
        let mut second = harness(source.clone(), kv.clone(), settings(), Vec::new());

        // Both instances settle on the same starting cursor.
        source.fail_next(FetchError::Transient("warmup".into()));
        source.fail_next(FetchError::Transient("warmup".into()));
        first.cycle().await;
        second.cycle().await;

        assert_eq!(first.cycle().await, CycleOutcome::Idle);
        assert_eq!(second.cycle().await, CycleOutcome::Idle);
        assert_eq!(second.handle.status().cursor, Some(position(2)));
        assert_eq!(second.stored_cursor().await, Some(position(2)));
    }

    #[tokio::test]
    async fn has_more_requests_an_immediate_fetch() {
        let source = MockSource::with_events(vec![payment(1), payment(2), payment(3)]);
        let mut h = harness(
            source,
            Arc::new(InMemoryKvStore::default()),
            MonitorSettings {
                batch_size: 2,
                ..settings()
            },
            Vec::new(),
        );
        assert_eq!(h.cycle().await, CycleOutcome::MoreAvailable);
        assert_eq!(h.cycle().await, CycleOutcome::Idle);
        assert_eq!(h.stored_cursor().await, Some(position(3)));
    }

    #[tokio::test(start_paused = true)]
    async fn run_stops_on_shutdown_and_serves_resync() {
        let source = MockSource::with_events(vec![payment(1)]);
        source.fail_next(FetchError::FatalProtocol("boom".into()));
        let consumer = Arc::new(Recording::default());
        let h = harness(
            source,
            Arc::new(InMemoryKvStore::default()),
            settings(),
            vec![("voice", consumer.clone())],
        );
        let Harness {
            controller,
            handle,
            _trigger,
            ..
        } = h;
        let (trigger, shutdown) = shutdown_channel();
        let task = tokio::spawn(controller.run(shutdown));

        let mut status = handle.subscribe();
        status.wait_for(|status| status.is_halted()).await.unwrap();
        handle
            .resync(InitialCursor::At(Cursor::GENESIS))
            .await
            .unwrap();
        status
            .wait_for(|status| status.events_dispatched == 1)
            .await
            .unwrap();

        trigger.trigger();
        task.await.unwrap();
        assert_eq!(handle.status().state, MonitorState::Stopped);
        assert_eq!(consumer.ledgers(), vec![1]);
        assert!(matches!(
            handle.resync(InitialCursor::Now).await,
            Err(MonitorError::Stopped)
        ));
    }

    struct Slow {
        delay: Duration,
        ledgers: Mutex<Vec<u32>>,
    }

    #[async_trait]
    impl EventConsumer for Slow {
        async fn deliver(&self, event: &NormalizedEvent) -> Result<(), ConsumerError> {
            tokio::time::sleep(self.delay).await;
            self.ledgers.lock().unwrap().push(event.ledger_sequence);
            Ok(())
        }
    }

    /// Requests shutdown once it has accepted `ledger`.
    struct StopAfter {
        ledger: u32,
        trigger: ShutdownTrigger,
        inner: Recording,
    }

    #[async_trait]
    impl EventConsumer for StopAfter {
        async fn deliver(&self, event: &NormalizedEvent) -> Result<(), ConsumerError> {
            self.inner.deliver(event).await?;
            if event.ledger_sequence == self.ledger {
                self.trigger.trigger();
            }
            Ok(())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn cycle_timeout_commits_prefix_and_backs_off() {
        let source = MockSource::with_events((1..=5).map(payment).collect());
        let consumer = Arc::new(Slow {
            delay: Duration::from_millis(40),
            ledgers: Mutex::default(),
        });
        let mut h = harness(
            source,
            Arc::new(InMemoryKvStore::default()),
            MonitorSettings {
                cycle_timeout: Duration::from_millis(100),
                ..settings()
            },
            vec![("voice", consumer.clone())],
        );

        assert!(matches!(h.cycle().await, CycleOutcome::BackingOff(_)));
        assert_eq!(consumer.ledgers.lock().unwrap().clone(), vec![1, 2]);
        assert_eq!(h.stored_cursor().await, Some(position(2)));
        let status = h.handle.status();
        assert_eq!(status.state, MonitorState::BackingOff);
        assert_eq!(status.consecutive_failures, 0);
        assert!(status.last_error.unwrap().contains("cycle timeout"));
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_mid_batch_commits_only_finished_events() {
        let source = MockSource::with_events((1..=4).map(payment).collect());
        let (trigger, shutdown) = shutdown_channel();
        let consumer = Arc::new(StopAfter {
            ledger: 2,
            trigger,
            inner: Recording::default(),
        });
        let mut h = harness(
            source,
            Arc::new(InMemoryKvStore::default()),
            settings(),
            vec![("voice", consumer.clone())],
        );

        assert_eq!(
            h.controller.run_cycle(&shutdown).await,
            CycleOutcome::Stopped
        );
        assert_eq!(consumer.inner.ledgers(), vec![1, 2]);
        assert_eq!(h.stored_cursor().await, Some(position(2)));
        assert_eq!(h.handle.status().events_dispatched, 2);
    }

    #[tokio::test]
    async fn resync_on_start_rewinds_persisted_cursor() {
        let source = MockSource::with_events((1..=3).map(payment).collect());
        let consumer = Arc::new(Recording::default());
        let mut h = harness(
            source,
            Arc::new(InMemoryKvStore::default()),
            settings(),
            vec![("voice", consumer.clone())],
        );
        assert_eq!(h.cycle().await, CycleOutcome::Idle);
        assert_eq!(h.stored_cursor().await, Some(position(3)));

        let cursor = h
            .controller
            .resync_on_start(InitialCursor::At(position(1)))
            .await
            .unwrap();
        assert_eq!(cursor, position(1));
        assert_eq!(h.stored_cursor().await, Some(position(1)));
        assert_eq!(h.handle.status().cursor, Some(position(1)));

        // Replayed events are recognised, not redelivered.
        assert_eq!(h.cycle().await, CycleOutcome::Idle);
        assert_eq!(consumer.ledgers(), vec![1, 2, 3]);
        assert_eq!(h.handle.status().events_duplicate, 2);
        assert_eq!(h.stored_cursor().await, Some(position(3)));
    }
}
