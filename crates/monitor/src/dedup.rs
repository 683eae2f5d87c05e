use std::{sync::Arc, time::Duration};

use chrono::Utc;
use moka::sync::Cache;
use stellar_monitor_domain::{
    model::{ConsumerId, EventId},
    storage::{KeyValueStore, StorageResult},
};

const LOCAL_CAPACITY: u64 = 100_000;

/// Remembers which events (and which per-consumer deliveries) already went
/// out, for one retention window.
///
/// The shared store is the source of truth so that several instances agree.
/// Shared entries hold their expiry as unix milliseconds; the local moka cache
/// remembers positives together with that expiry, so a local hit never
/// outlives the shared entry it mirrors.
pub struct DedupCache {
    store: Arc<dyn KeyValueStore>,
    local: Cache<String, i64>,
    ttl: Duration,
}

impl DedupCache {
    pub fn new(store: Arc<dyn KeyValueStore>, ttl: Duration) -> Self {
        Self {
            store,
            local: Cache::builder()
                .time_to_live(ttl)
                .max_capacity(LOCAL_CAPACITY)
                .build(),
            ttl,
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Whether the event was fully processed within the retention window.
    pub async fn seen(&self, event_id: &EventId) -> StorageResult<bool> {
        self.contains(event_key(event_id)).await
    }

    /// Idempotent. Call only after every required delivery is confirmed.
    pub async fn mark_seen(&self, event_id: &EventId, ttl: Duration) -> StorageResult<()> {
        self.insert(event_key(event_id), ttl).await
    }

    pub async fn delivered(&self, consumer: &ConsumerId, event_id: &EventId) -> StorageResult<bool> {
        self.contains(delivery_key(consumer, event_id)).await
    }

    pub async fn mark_delivered(
        &self,
        consumer: &ConsumerId,
        event_id: &EventId,
    ) -> StorageResult<()> {
        self.insert(delivery_key(consumer, event_id), self.ttl).await
    }

    async fn contains(&self, key: String) -> StorageResult<bool> {
        let now = Utc::now().timestamp_millis();
        if let Some(expires_at) = self.local.get(&key) {
            if expires_at > now {
                return Ok(true);
            }
            self.local.invalidate(&key);
        }
        let Some(stored) = self.store.get(&key).await? else {
            return Ok(false);
        };
        // Markers without a readable expiry still count, but stay uncached.
        if let Ok(expires_at) = stored.parse::<i64>() {
            if expires_at > now {
                self.local.insert(key, expires_at);
            }
        }
        Ok(true)
    }

    async fn insert(&self, key: String, ttl: Duration) -> StorageResult<()> {
        let ttl_ms = i64::try_from(ttl.as_millis()).unwrap_or(i64::MAX);
        let expires_at = Utc::now().timestamp_millis().saturating_add(ttl_ms);
        self.store
            .set(&key, &expires_at.to_string(), Some(ttl))
            .await?;
        self.local.insert(key, expires_at);
        Ok(())
    }
}

fn event_key(event_id: &EventId) -> String {
    format!("dedup:event:{event_id}")
}

fn delivery_key(consumer: &ConsumerId, event_id: &EventId) -> String {
    format!("dedup:delivery:{consumer}:{event_id}")
}
