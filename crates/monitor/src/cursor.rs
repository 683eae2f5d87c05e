use std::sync::Arc;

use stellar_monitor_domain::{model::Cursor, storage::KeyValueStore};
use tracing::{info, warn};

use crate::error::CursorError;

pub const DEFAULT_CURSOR_KEY: &str = "stellar_monitor:cursor";

/// Result of a conditional cursor write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CursorAdvance {
    Advanced(Cursor),
    /// The stored value no longer matched what this instance expected, so
    /// nothing was written. `stored` is what the store holds now.
    Conflict { stored: Option<Cursor> },
}

/// Durable last-processed position. Every write after the first is a
/// compare-and-set against the value the writer last observed, so concurrent
/// instances cannot overwrite a newer position with an older one.
#[derive(Clone)]
pub struct CursorStore {
    store: Arc<dyn KeyValueStore>,
    key: String,
}

impl CursorStore {
    pub fn new(store: Arc<dyn KeyValueStore>) -> Self {
        Self::with_key(store, DEFAULT_CURSOR_KEY)
    }

    pub fn with_key(store: Arc<dyn KeyValueStore>, key: impl Into<String>) -> Self {
        Self {
            store,
            key: key.into(),
        }
    }

    pub async fn load(&self) -> Result<Option<Cursor>, CursorError> {
        let Some(value) = self.store.get(&self.key).await? else {
            return Ok(None);
        };
        value
            .parse()
            .map(Some)
            .map_err(|source| CursorError::Invalid { value, source })
    }

    /// Persists the first cursor of a fresh deployment. Loses gracefully to an
    /// instance that initialized first.
    pub async fn initialize(&self, cursor: Cursor) -> Result<CursorAdvance, CursorError> {
        let written = self
            .store
            .compare_and_set(&self.key, None, &cursor.to_string(), None)
            .await?;
        if written {
            info!(%cursor, "cursor initialized");
            return Ok(CursorAdvance::Advanced(cursor));
        }
        Ok(CursorAdvance::Conflict {
            stored: self.load().await?,
        })
    }

    /// Moves the stored cursor from `expected` to `next`.
    pub async fn advance(
        &self,
        expected: Cursor,
        next: Cursor,
    ) -> Result<CursorAdvance, CursorError> {
        if next < expected {
            return Err(CursorError::Regression {
                from: expected,
                to: next,
            });
        }
        if next == expected {
            return Ok(CursorAdvance::Advanced(next));
        }

        let written = self
            .store
            .compare_and_set(
                &self.key,
                Some(&expected.to_string()),
                &next.to_string(),
                None,
            )
            .await?;
        if written {
            return Ok(CursorAdvance::Advanced(next));
        }

        let stored = self.load().await?;
        warn!(
            %expected,
            %next,
            stored = ?stored,
            "cursor changed underneath this instance; write rejected"
        );
        Ok(CursorAdvance::Conflict { stored })
    }

    /// Operator resync: the only path allowed to move the cursor backward.
    pub async fn reset(&self, cursor: Cursor) -> Result<(), CursorError> {
        self.store.set(&self.key, &cursor.to_string(), None).await?;
        warn!(%cursor, "cursor reset by resync");
        Ok(())
    }
}
