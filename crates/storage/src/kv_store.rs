use std::time::Duration;

use chrono::Utc;
use sea_orm::sea_query::{Expr, OnConflict};
use sea_orm::{ColumnTrait, Condition, EntityTrait, QueryFilter, Set, TransactionTrait};
use stellar_monitor_domain::storage::{KeyValueStore, StorageError, StorageResult};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::entity::kv_entries;
use crate::SeaOrmStorage;

fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

fn expiry_ms(now: i64, ttl: Option<Duration>) -> Option<i64> {
    ttl.map(|ttl| now.saturating_add(i64::try_from(ttl.as_millis()).unwrap_or(i64::MAX)))
}

fn live_at(now: i64) -> Condition {
    Condition::any()
        .add(kv_entries::Column::ExpiresAtMs.is_null())
        .add(kv_entries::Column::ExpiresAtMs.gt(now))
}

impl SeaOrmStorage {
    /// Deletes rows whose TTL has elapsed. Reads already ignore them; this only
    /// reclaims space.
    pub async fn purge_expired(&self) -> StorageResult<u64> {
        let result = kv_entries::Entity::delete_many()
            .filter(kv_entries::Column::ExpiresAtMs.lte(now_ms()))
            .exec(self.connection())
            .await
            .map_err(StorageError::from_source)?;
        Ok(result.rows_affected)
    }

    /// Runs [`purge_expired`](Self::purge_expired) every `every` until the
    /// returned handle is aborted.
    pub fn spawn_purger(&self, every: Duration) -> JoinHandle<()> {
        let storage = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                match storage.purge_expired().await {
                    Ok(0) => {}
                    Ok(purged) => debug!(purged, "expired kv entries purged"),
                    Err(err) => warn!(?err, "kv purge failed"),
                }
            }
        })
    }
}

#[async_trait::async_trait]
impl KeyValueStore for SeaOrmStorage {
    async fn get(&self, key: &str) -> StorageResult<Option<String>> {
        let maybe = kv_entries::Entity::find_by_id(key.to_owned())
            .filter(live_at(now_ms()))
            .one(self.connection())
            .await
            .map_err(StorageError::from_source)?;
        Ok(maybe.map(|model| model.value))
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> StorageResult<()> {
        let active = kv_entries::ActiveModel {
            key: Set(key.to_owned()),
            value: Set(value.to_owned()),
            expires_at_ms: Set(expiry_ms(now_ms(), ttl)),
        };
        kv_entries::Entity::insert(active)
            .on_conflict(
                OnConflict::column(kv_entries::Column::Key)
                    .update_columns([kv_entries::Column::Value, kv_entries::Column::ExpiresAtMs])
                    .to_owned(),
            )
            .exec_without_returning(self.connection())
            .await
            .map_err(StorageError::from_source)?;
        Ok(())
    }

    async fn compare_and_set(
        &self,
        key: &str,
        expected: Option<&str>,
        value: &str,
        ttl: Option<Duration>,
    ) -> StorageResult<bool> {
        let now = now_ms();
        let expires_at_ms = expiry_ms(now, ttl);
        let txn = self
            .connection()
            .begin()
            .await
            .map_err(StorageError::from_source)?;

        // An expired row must behave exactly like a missing one.
        kv_entries::Entity::delete_many()
            .filter(kv_entries::Column::Key.eq(key))
            .filter(kv_entries::Column::ExpiresAtMs.lte(now))
            .exec(&txn)
            .await
            .map_err(StorageError::from_source)?;

        let rows = match expected {
            None => {
                let active = kv_entries::ActiveModel {
                    key: Set(key.to_owned()),
                    value: Set(value.to_owned()),
                    expires_at_ms: Set(expires_at_ms),
                };
                kv_entries::Entity::insert(active)
                    .on_conflict(
                        OnConflict::column(kv_entries::Column::Key)
                            .do_nothing()
                            .to_owned(),
                    )
                    .exec_without_returning(&txn)
                    .await
                    .map_err(StorageError::from_source)?
            }
            Some(expected) => {
                kv_entries::Entity::update_many()
                    .col_expr(kv_entries::Column::Value, Expr::value(value))
                    .col_expr(kv_entries::Column::ExpiresAtMs, Expr::value(expires_at_ms))
                    .filter(kv_entries::Column::Key.eq(key))
                    .filter(kv_entries::Column::Value.eq(expected))
                    .exec(&txn)
                    .await
                    .map_err(StorageError::from_source)?
                    .rows_affected
            }
        };

        txn.commit().await.map_err(StorageError::from_source)?;
        Ok(rows == 1)
    }

    async fn delete(&self, key: &str) -> StorageResult<bool> {
        let result = kv_entries::Entity::delete_many()
            .filter(kv_entries::Column::Key.eq(key))
            .filter(live_at(now_ms()))
            .exec(self.connection())
            .await
            .map_err(StorageError::from_source)?;
        Ok(result.rows_affected > 0)
    }
}
