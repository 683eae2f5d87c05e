//! SeaORM-backed storage adapters that satisfy the domain key-value contract
//! while keeping the database backend swappable (SQLite by default,
//! PostgreSQL via feature flag). Cursor and dedup state from several monitor
//! instances meet here.

mod builder;
mod entity;
mod kv_store;
mod migration;

use std::sync::Arc;

use builder::StorageBuilder;
use sea_orm::DatabaseConnection;
use stellar_monitor_domain::storage::StorageResult;

/// Shared storage handle used by the monitor and the status API.
#[derive(Clone)]
pub struct SeaOrmStorage {
    db: Arc<DatabaseConnection>,
}

impl SeaOrmStorage {
    /// Connects to the provided database URL and ensures the schema is present.
    pub async fn connect(database_url: &str) -> StorageResult<Self> {
        Self::builder().database_url(database_url).build().await
    }

    pub fn builder() -> StorageBuilder {
        StorageBuilder::new()
    }

    pub(crate) fn from_connection(db: DatabaseConnection) -> Self {
        Self { db: Arc::new(db) }
    }

    pub fn connection(&self) -> &DatabaseConnection {
        self.db.as_ref()
    }
}
