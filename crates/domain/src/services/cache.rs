use std::{
    collections::HashMap,
    sync::{Mutex, MutexGuard, PoisonError},
    time::{Duration, Instant},
};

use async_trait::async_trait;
use moka::{sync::Cache, Expiry};

use crate::storage::{KeyValueStore, StorageResult};

#[derive(Debug, Clone)]
struct ExpiringValue {
    value: String,
    ttl: Duration,
}

/// Expires each entry after the TTL it was written with.
struct PerEntryTtl;

impl Expiry<String, ExpiringValue> for PerEntryTtl {
    fn expire_after_create(
        &self,
        _key: &String,
        value: &ExpiringValue,
        _created_at: Instant,
    ) -> Option<Duration> {
        Some(value.ttl)
    }

    fn expire_after_update(
        &self,
        _key: &String,
        value: &ExpiringValue,
        _updated_at: Instant,
        _duration_until_expiry: Option<Duration>,
    ) -> Option<Duration> {
        Some(value.ttl)
    }
}

/// Process-local [`KeyValueStore`]. Suitable for a single monitor instance
/// and for tests; multi-instance deployments use the database-backed store
/// instead.
///
/// Entries written with a TTL (dedup markers) live in a size-bounded moka
/// cache. Entries written without one (the cursor) live in a plain map that
/// never evicts. A key sits in at most one of the two.
pub struct InMemoryKvStore {
    expiring: Cache<String, ExpiringValue>,
    pinned: Mutex<HashMap<String, String>>,
}

impl InMemoryKvStore {
    /// Large enough that dedup markers are dropped by TTL, not by eviction.
    pub const DEFAULT_CAPACITY: u64 = 1_000_000;

    pub fn new() -> Self {
        Self::with_capacity(Self::DEFAULT_CAPACITY)
    }

    /// `capacity` bounds the TTL entries only.
    pub fn with_capacity(capacity: u64) -> Self {
        Self {
            expiring: Cache::builder()
                .max_capacity(capacity.max(1))
                .expire_after(PerEntryTtl)
                .build(),
            pinned: Mutex::new(HashMap::new()),
        }
    }

    pub fn len(&self) -> u64 {
        let pinned = self.pinned().len() as u64;
        self.expiring.run_pending_tasks();
        pinned + self.expiring.entry_count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Writers hold this lock for the whole operation, so compare-and-set
    /// sees both halves consistently.
    fn pinned(&self) -> MutexGuard<'_, HashMap<String, String>> {
        self.pinned.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lookup(&self, pinned: &HashMap<String, String>, key: &str) -> Option<String> {
        pinned
            .get(key)
            .cloned()
            .or_else(|| self.expiring.get(key).map(|stored| stored.value))
    }

    fn write(
        &self,
        pinned: &mut HashMap<String, String>,
        key: &str,
        value: &str,
        ttl: Option<Duration>,
    ) {
        match ttl {
            None => {
                self.expiring.invalidate(key);
                pinned.insert(key.to_owned(), value.to_owned());
            }
            Some(ttl) => {
                pinned.remove(key);
                self.expiring.insert(
                    key.to_owned(),
                    ExpiringValue {
                        value: value.to_owned(),
                        ttl,
                    },
                );
            }
        }
    }
}

impl Default for InMemoryKvStore {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for InMemoryKvStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InMemoryKvStore")
            .field("pinned", &self.pinned().len())
            .field("expiring", &self.expiring.entry_count())
            .finish()
    }
}

#[async_trait]
impl KeyValueStore for InMemoryKvStore {
    async fn get(&self, key: &str) -> StorageResult<Option<String>> {
        let pinned = self.pinned();
        Ok(self.lookup(&pinned, key))
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> StorageResult<()> {
        let mut pinned = self.pinned();
        self.write(&mut pinned, key, value, ttl);
        Ok(())
    }

    async fn compare_and_set(
        &self,
        key: &str,
        expected: Option<&str>,
        value: &str,
        ttl: Option<Duration>,
    ) -> StorageResult<bool> {
        let mut pinned = self.pinned();
        if self.lookup(&pinned, key).as_deref() != expected {
            return Ok(false);
        }
        self.write(&mut pinned, key, value, ttl);
        Ok(true)
    }

    async fn delete(&self, key: &str) -> StorageResult<bool> {
        let mut pinned = self.pinned();
        let was_pinned = pinned.remove(key).is_some();
        let was_expiring = self.expiring.remove(key).is_some();
        Ok(was_pinned || was_expiring)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn set_get_delete() {
        let store = InMemoryKvStore::default();
        assert_eq!(store.get("k").await.unwrap(), None);
        store.set("k", "v1", None).await.unwrap();
        assert_eq!(store.get("k").await.unwrap().as_deref(), Some("v1"));
        assert!(store.delete("k").await.unwrap());
        assert!(!store.delete("k").await.unwrap());
        assert_eq!(store.get("k").await.unwrap(), None);
    }

    #[tokio::test]
    async fn compare_and_set_requires_matching_value() {
        let store = InMemoryKvStore::default();
        assert!(store.compare_and_set("k", None, "1", None).await.unwrap());
        assert!(!store.compare_and_set("k", None, "2", None).await.unwrap());
        assert!(!store
            .compare_and_set("k", Some("0"), "2", None)
            .await
            .unwrap());
        assert!(store
            .compare_and_set("k", Some("1"), "2", None)
            .await
            .unwrap());
        assert_eq!(store.get("k").await.unwrap().as_deref(), Some("2"));
    }

    #[tokio::test]
    async fn entries_expire_after_their_ttl() {
        let store = InMemoryKvStore::default();
        store
            .set("short", "x", Some(Duration::from_millis(20)))
            .await
            .unwrap();
        store.set("forever", "y", None).await.unwrap();
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(store.get("short").await.unwrap(), None);
        assert_eq!(store.get("forever").await.unwrap().as_deref(), Some("y"));
        assert!(store
            .compare_and_set("short", None, "z", None)
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn entries_without_ttl_survive_eviction_pressure() {
        let store = InMemoryKvStore::with_capacity(100);
        store.set("stellar_monitor:cursor", "42", None).await.unwrap();
        for i in 0..2_000 {
            let key = format!("dedup:event:{i}");
            store
                .set(&key, "1", Some(Duration::from_secs(3600)))
                .await
                .unwrap();
            store.get(&key).await.unwrap();
        }
        store.expiring.run_pending_tasks();
        assert_eq!(
            store.get("stellar_monitor:cursor").await.unwrap().as_deref(),
            Some("42")
        );
        assert!(store
            .compare_and_set("stellar_monitor:cursor", Some("42"), "43", None)
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn rewriting_a_key_moves_it_between_halves() {
        let store = InMemoryKvStore::default();
        store
            .set("k", "short", Some(Duration::from_millis(20)))
            .await
            .unwrap();
        store.set("k", "pinned", None).await.unwrap();
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(store.get("k").await.unwrap().as_deref(), Some("pinned"));

        assert!(store
            .compare_and_set("k", Some("pinned"), "expiring", Some(Duration::from_millis(20)))
            .await
            .unwrap());
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(store.get("k").await.unwrap(), None);
    }
}
