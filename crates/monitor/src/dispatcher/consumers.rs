use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use stellar_monitor_domain::model::NormalizedEvent;
use tokio::sync::mpsc;
use tracing::info;

use super::EventConsumer;
use crate::error::{ConsumerError, MonitorError};

/// Forwards events to an in-process task over a bounded tokio channel.
///
/// A full channel applies backpressure until the dispatcher's timeout
/// turns it into a failed delivery.
pub struct ChannelConsumer {
    sender: mpsc::Sender<NormalizedEvent>,
}

impl ChannelConsumer {
    pub fn new(sender: mpsc::Sender<NormalizedEvent>) -> Self {
        Self { sender }
    }

    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<NormalizedEvent>) {
        let (sender, receiver) = mpsc::channel(capacity);
        (Self::new(sender), receiver)
    }
}

#[async_trait]
impl EventConsumer for ChannelConsumer {
    async fn deliver(&self, event: &NormalizedEvent) -> Result<(), ConsumerError> {
        self.sender
            .send(event.clone())
            .await
            .map_err(|_| ConsumerError::Transport("receiver dropped".into()))
    }
}

/// POSTs each event as JSON. The event id travels in the `Idempotency-Key`
/// header so the receiver can drop redeliveries.
pub struct WebhookConsumer {
    client: Client,
    url: String,
}

impl WebhookConsumer {
    pub fn new(url: impl Into<String>, request_timeout: Duration) -> Result<Self, MonitorError> {
        let client = Client::builder().timeout(request_timeout).build()?;
        Ok(Self::with_client(client, url))
    }

    pub fn with_client(client: Client, url: impl Into<String>) -> Self {
        Self {
            client,
            url: url.into(),
        }
    }
}

#[async_trait]
impl EventConsumer for WebhookConsumer {
    async fn deliver(&self, event: &NormalizedEvent) -> Result<(), ConsumerError> {
        let response = self
            .client
            .post(&self.url)
            .header("Idempotency-Key", event.event_id.as_str())
            .json(event)
            .send()
            .await
            .map_err(|err| ConsumerError::Transport(err.to_string()))?;

        let status = response.status();
        if status.is_success() {
            Ok(())
        } else if status.is_client_error() {
            Err(ConsumerError::Rejected(format!("webhook answered {status}")))
        } else {
            Err(ConsumerError::Transport(format!("webhook answered {status}")))
        }
    }
}

/// Writes every event to the `audit` tracing target.
#[derive(Debug, Default)]
pub struct LogConsumer;

impl LogConsumer {
    pub const ID: &'static str = "audit-log";
}

#[async_trait]
impl EventConsumer for LogConsumer {
    async fn deliver(&self, event: &NormalizedEvent) -> Result<(), ConsumerError> {
        info!(
            target: "audit",
            event_id = %event.event_id,
            ledger = event.ledger_sequence,
            cursor = %event.position,
            kind = %event.kind,
            account = event.account.as_deref().unwrap_or("-"),
            "ledger event"
        );
        Ok(())
    }
}

/// Adapts a synchronous closure, mostly for embedding and tests.
pub struct FnConsumer<F> {
    handler: F,
}

impl<F> FnConsumer<F>
where
    F: Fn(&NormalizedEvent) -> Result<(), ConsumerError> + Send + Sync,
{
    pub fn new(handler: F) -> Self {
        Self { handler }
    }
}

#[async_trait]
impl<F> EventConsumer for FnConsumer<F>
where
    F: Fn(&NormalizedEvent) -> Result<(), ConsumerError> + Send + Sync,
{
    async fn deliver(&self, event: &NormalizedEvent) -> Result<(), ConsumerError> {
        (self.handler)(event)
    }
}
