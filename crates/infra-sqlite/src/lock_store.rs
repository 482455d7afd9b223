// SQLite LockStore Implementation
// Lease-based locks: a single upsert decides the holder atomically

use crate::error::map_sqlx_error;
use async_trait::async_trait;
use mergeflow_core::error::Result;
use mergeflow_core::port::{LockStore, TimeProvider};
use sqlx::SqlitePool;
use std::sync::Arc;
use std::time::Duration;

pub struct SqliteLockStore {
    pool: SqlitePool,
    time_provider: Arc<dyn TimeProvider>,
}

impl SqliteLockStore {
    pub fn new(pool: SqlitePool, time_provider: Arc<dyn TimeProvider>) -> Self {
        Self {
            pool,
            time_provider,
        }
    }
}

#[async_trait]
impl LockStore for SqliteLockStore {
    async fn try_acquire(&self, lock_key: &str, holder: &str, ttl: Duration) -> Result<bool> {
        let now = self.time_provider.now_millis();
        let expires_at = now + ttl.as_millis() as i64;

        // Takes the row when absent, expired, or already ours (lease extension).
        // An extension keeps the original acquired_at.
        let result = sqlx::query(
            r#"
            INSERT INTO locks (lock_key, holder, acquired_at, expires_at) VALUES (?, ?, ?, ?)
            ON CONFLICT (lock_key) DO UPDATE
                SET acquired_at = CASE
                        WHEN locks.holder = excluded.holder THEN locks.acquired_at
                        ELSE excluded.acquired_at
                    END,
                    holder = excluded.holder,
                    expires_at = excluded.expires_at
                WHERE locks.expires_at <= ? OR locks.holder = excluded.holder
            "#,
        )
        .bind(lock_key)
        .bind(holder)
        .bind(now)
        .bind(expires_at)
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(map_sqlx_error)?;

        Ok(result.rows_affected() > 0)
    }

    async fn release(&self, lock_key: &str, holder: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM locks WHERE lock_key = ? AND holder = ?")
            .bind(lock_key)
            .bind(holder)
            .execute(&self.pool)
            .await
            .map_err(map_sqlx_error)?;

        Ok(result.rows_affected() > 0)
    }
}
