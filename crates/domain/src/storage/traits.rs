use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use thiserror::Error;

/// Common result alias for storage operations.
pub type StorageResult<T> = Result<T, StorageError>;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StorageError {
    #[error("database error: {0}")]
    Database(String),
    #[error("cache error: {0}")]
    Cache(String),
}

impl StorageError {
    pub fn from_source(err: impl std::fmt::Display) -> Self {
        Self::Database(err.to_string())
    }
}

/// Shared key-value store with optional per-entry expiry. Both the cursor and
/// the deduplication markers live here so several monitor instances can
/// coordinate through one backend.
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    /// Returns the live value for `key`; expired entries read as absent.
    async fn get(&self, key: &str) -> StorageResult<Option<String>>;

    /// Unconditionally writes `value`, replacing any previous entry.
    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> StorageResult<()>;

    /// Writes `value` only if the live entry currently equals `expected`
    /// (`None` meaning the key must be absent). Returns whether the write
    /// happened.
    async fn compare_and_set(
        &self,
        key: &str,
        expected: Option<&str>,
        value: &str,
        ttl: Option<Duration>,
    ) -> StorageResult<bool>;

    /// Removes `key`, returning whether a live entry was present.
    async fn delete(&self, key: &str) -> StorageResult<bool>;
}

#[async_trait]
impl<T> KeyValueStore for Arc<T>
where
    T: KeyValueStore + ?Sized,
{
    async fn get(&self, key: &str) -> StorageResult<Option<String>> {
        self.as_ref().get(key).await
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> StorageResult<()> {
        self.as_ref().set(key, value, ttl).await
    }

    async fn compare_and_set(
        &self,
        key: &str,
        expected: Option<&str>,
        value: &str,
        ttl: Option<Duration>,
    ) -> StorageResult<bool> {
        self.as_ref()
            .compare_and_set(key, expected, value, ttl)
            .await
    }

    async fn delete(&self, key: &str) -> StorageResult<bool> {
        self.as_ref().delete(key).await
    }
}
