//! Fan-out of normalized events to registered consumers.
//!
//! Every matching consumer of one event is called concurrently, each call
//! bounded by a timeout and retried a fixed number of times. Events
//! themselves are handed over one at a time, so a consumer sees them in
//! position order.

mod consumers;

use std::{
    collections::HashSet,
    sync::{Arc, PoisonError, RwLock},
    time::Duration,
};

use async_trait::async_trait;
use metrics::counter;
use stellar_monitor_domain::{
    config::MonitorSettings,
    model::{ConsumerId, EventId, EventKind, NormalizedEvent},
    storage::StorageResult,
};
use tokio::time::timeout;
use tracing::{debug, warn};

use crate::{
    dedup::DedupCache,
    error::{ConsumerError, RegistrationError},
};

pub use consumers::{ChannelConsumer, FnConsumer, LogConsumer, WebhookConsumer};

/// Downstream receiver of ledger events.
#[async_trait]
pub trait EventConsumer: Send + Sync {
    /// Last-chance filter evaluated after the registration's
    /// [`InterestFilter`].
    fn accepts(&self, _event: &NormalizedEvent) -> bool {
        true
    }

    /// Must be idempotent per `event_id`: the same event can arrive again
    /// after a crash between delivery and cursor persistence.
    async fn deliver(&self, event: &NormalizedEvent) -> Result<(), ConsumerError>;
}

/// Kinds and accounts a consumer cares about. An empty set matches
/// everything.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InterestFilter {
    kinds: HashSet<EventKind>,
    accounts: HashSet<String>,
}

impl InterestFilter {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn with_kinds(mut self, kinds: impl IntoIterator<Item = EventKind>) -> Self {
        self.kinds.extend(kinds);
        self
    }

    pub fn with_accounts<S: Into<String>>(mut self, accounts: impl IntoIterator<Item = S>) -> Self {
        self.accounts.extend(accounts.into_iter().map(Into::into));
        self
    }

    pub fn matches(&self, event: &NormalizedEvent) -> bool {
        let kind_ok = self.kinds.is_empty() || self.kinds.contains(&event.kind);
        let account_ok = self.accounts.is_empty()
            || self
                .accounts
                .iter()
                .any(|account| event.involves_account(account));
        kind_ok && account_ok
    }
}

struct Registration {
    id: ConsumerId,
    filter: InterestFilter,
    consumer: Arc<dyn EventConsumer>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryOutcome {
    Delivered { attempts: u32 },
    /// A previous run already got an acknowledgement for this event.
    AlreadyDelivered,
    Failed { attempts: u32, error: ConsumerError },
    /// Not attempted because the consumer is blocked on an earlier event.
    Deferred,
}

impl DeliveryOutcome {
    fn label(&self) -> &'static str {
        match self {
            DeliveryOutcome::Delivered { .. } => "delivered",
            DeliveryOutcome::AlreadyDelivered => "duplicate",
            DeliveryOutcome::Failed { .. } => "failed",
            DeliveryOutcome::Deferred => "deferred",
        }
    }

    pub fn is_acknowledged(&self) -> bool {
        matches!(
            self,
            DeliveryOutcome::Delivered { .. } | DeliveryOutcome::AlreadyDelivered
        )
    }
}

/// Per-consumer results of dispatching one event, in registration order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DispatchReport {
    pub event_id: EventId,
    pub outcomes: Vec<(ConsumerId, DeliveryOutcome)>,
}

impl DispatchReport {
    /// True when every matching consumer acknowledged the event.
    pub fn is_complete(&self) -> bool {
        self.outcomes.iter().all(|(_, outcome)| outcome.is_acknowledged())
    }

    /// Consumers that did not acknowledge, whether they failed or were
    /// deferred.
    pub fn unacknowledged(&self) -> impl Iterator<Item = &ConsumerId> {
        self.outcomes
            .iter()
            .filter(|(_, outcome)| !outcome.is_acknowledged())
            .map(|(id, _)| id)
    }

    pub fn failures(&self) -> impl Iterator<Item = (&ConsumerId, &ConsumerError)> {
        self.outcomes.iter().filter_map(|(id, outcome)| match outcome {
            DeliveryOutcome::Failed { error, .. } => Some((id, error)),
            _ => None,
        })
    }

    pub fn delivered_to(&self) -> impl Iterator<Item = &ConsumerId> {
        self.outcomes
            .iter()
            .filter(|(_, outcome)| matches!(outcome, DeliveryOutcome::Delivered { .. }))
            .map(|(id, _)| id)
    }
}

pub struct Dispatcher {
    registry: RwLock<Vec<Arc<Registration>>>,
    dedup: Arc<DedupCache>,
    consumer_timeout: Duration,
    consumer_retries: u32,
}

impl Dispatcher {
    pub fn new(dedup: Arc<DedupCache>, consumer_timeout: Duration, consumer_retries: u32) -> Self {
        Self {
            registry: RwLock::new(Vec::new()),
            dedup,
            consumer_timeout,
            consumer_retries,
        }
    }

    pub fn from_settings(dedup: Arc<DedupCache>, settings: &MonitorSettings) -> Self {
        Self::new(dedup, settings.consumer_timeout, settings.consumer_retries)
    }

    /// Appends a consumer to the dispatch order.
    pub fn register(
        &self,
        id: impl Into<ConsumerId>,
        filter: InterestFilter,
        consumer: Arc<dyn EventConsumer>,
    ) -> Result<(), RegistrationError> {
        let id = id.into();
        let mut registry = self.registry.write().unwrap_or_else(PoisonError::into_inner);
        if registry.iter().any(|registration| registration.id == id) {
            return Err(RegistrationError::Duplicate(id));
        }
        debug!(consumer = %id, "consumer registered");
        registry.push(Arc::new(Registration {
            id,
            filter,
            consumer,
        }));
        Ok(())
    }

    /// Returns whether a consumer with that id was registered.
    pub fn unregister(&self, id: &ConsumerId) -> bool {
        let mut registry = self.registry.write().unwrap_or_else(PoisonError::into_inner);
        let before = registry.len();
        registry.retain(|registration| &registration.id != id);
        before != registry.len()
    }

    pub fn consumers(&self) -> Vec<ConsumerId> {
        self.snapshot()
            .iter()
            .map(|registration| registration.id.clone())
            .collect()
    }

    pub async fn deliver(&self, event: &NormalizedEvent) -> StorageResult<DispatchReport> {
        self.deliver_excluding(event, &HashSet::new()).await
    }

    /// Like [`Dispatcher::deliver`], except that consumers in `blocked` are
    /// reported as [`DeliveryOutcome::Deferred`] without being called.
    pub async fn deliver_excluding(
        &self,
        event: &NormalizedEvent,
        blocked: &HashSet<ConsumerId>,
    ) -> StorageResult<DispatchReport> {
        let matching: Vec<_> = self
            .snapshot()
            .into_iter()
            .filter(|registration| {
                registration.filter.matches(event) && registration.consumer.accepts(event)
            })
            .collect();

        // Resolve every dedup lookup before spawning so a storage error
        // leaves no delivery running in the background.
        let mut pending = Vec::with_capacity(matching.len());
        for registration in matching {
            let settled = if blocked.contains(&registration.id) {
                Some(DeliveryOutcome::Deferred)
            } else if self.dedup.delivered(&registration.id, &event.event_id).await? {
                Some(DeliveryOutcome::AlreadyDelivered)
            } else {
                None
            };
            pending.push((registration, settled));
        }

        let shared = Arc::new(event.clone());
        let slots: Vec<_> = pending
            .into_iter()
            .map(|(registration, settled)| {
                let slot = match settled {
                    Some(outcome) => Slot::Done(outcome),
                    None => Slot::Running(tokio::spawn(deliver_with_retries(
                        registration.clone(),
                        shared.clone(),
                        self.consumer_timeout,
                        self.consumer_retries,
                    ))),
                };
                (registration.id.clone(), slot)
            })
            .collect();

        let mut outcomes = Vec::with_capacity(slots.len());
        for (id, slot) in slots {
            let outcome = match slot {
                Slot::Done(outcome) => outcome,
                Slot::Running(task) => match task.await {
                    Ok(outcome) => outcome,
                    Err(err) => {
                        warn!(consumer = %id, event_id = %event.event_id, ?err, "consumer task aborted");
                        DeliveryOutcome::Failed {
                            attempts: 1,
                            error: ConsumerError::Panicked,
                        }
                    }
                },
            };

            if let DeliveryOutcome::Delivered { .. } = outcome {
                // The event-level mark still covers this consumer if this write is lost.
                if let Err(err) = self.dedup.mark_delivered(&id, &event.event_id).await {
                    warn!(consumer = %id, event_id = %event.event_id, ?err, "failed to record delivery");
                }
            }
            counter!(
                "monitor_consumer_deliveries_total",
                "consumer" => id.to_string(),
                "result" => outcome.label()
            )
            .increment(1);
            outcomes.push((id, outcome));
        }

        Ok(DispatchReport {
            event_id: event.event_id.clone(),
            outcomes,
        })
    }

    fn snapshot(&self) -> Vec<Arc<Registration>> {
        self.registry
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

enum Slot {
    Done(DeliveryOutcome),
    Running(tokio::task::JoinHandle<DeliveryOutcome>),
}

async fn deliver_with_retries(
    registration: Arc<Registration>,
    event: Arc<NormalizedEvent>,
    consumer_timeout: Duration,
    retries: u32,
) -> DeliveryOutcome {
    let mut attempts = 0;
    loop {
        attempts += 1;
        let result = match timeout(consumer_timeout, registration.consumer.deliver(&event)).await {
            Ok(result) => result,
            Err(_) => Err(ConsumerError::Timeout(consumer_timeout)),
        };
        match result {
            Ok(()) => return DeliveryOutcome::Delivered { attempts },
            Err(error) if attempts > retries => {
                warn!(
                    consumer = %registration.id,
                    event_id = %event.event_id,
                    ledger = event.ledger_sequence,
                    attempts,
                    %error,
                    "consumer delivery failed"
                );
                return DeliveryOutcome::Failed { attempts, error };
            }
            Err(error) => {
                debug!(consumer = %registration.id, event_id = %event.event_id, %error, "retrying delivery");
            }
        }
    }
}
