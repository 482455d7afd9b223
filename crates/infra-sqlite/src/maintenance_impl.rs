// SQLite Maintenance Implementation
use crate::error::map_sqlx_error;
use async_trait::async_trait;
use mergeflow_core::domain::{InvocationState, JobStatus};
use mergeflow_core::error::Result;
use mergeflow_core::port::{Maintenance, MaintenanceStats, TimeProvider};
use sqlx::SqlitePool;
use std::sync::Arc;
use tracing::info;

const DAY_MS: i64 = 24 * 60 * 60 * 1000;

/// SQLite maintenance implementation
pub struct SqliteMaintenance {
    pool: SqlitePool,
    time_provider: Arc<dyn TimeProvider>,
}

impl SqliteMaintenance {
    pub fn new(pool: SqlitePool, time_provider: Arc<dyn TimeProvider>) -> Self {
        Self {
            pool,
            time_provider,
        }
    }

    fn cutoff(&self, retention_days: i64) -> i64 {
        self.time_provider.now_millis() - retention_days * DAY_MS
    }

    async fn pragma(&self, name: &str) -> Result<i64> {
        sqlx::query_scalar(&format!("PRAGMA {}", name))
            .fetch_one(&self.pool)
            .await
            .map_err(map_sqlx_error)
    }

    async fn pages(&self) -> Result<PageStats> {
        Ok(PageStats {
            size: self.pragma("page_size").await?,
            count: self.pragma("page_count").await?,
            free: self.pragma("freelist_count").await?,
        })
    }

    async fn count(&self, sql: &str) -> Result<i64> {
        sqlx::query_scalar(sql)
            .fetch_one(&self.pool)
            .await
            .map_err(map_sqlx_error)
    }
}

struct PageStats {
    size: i64,
    count: i64,
    free: i64,
}

impl PageStats {
    fn bytes(&self) -> i64 {
        self.size * self.count
    }

    /// Share of pages on the freelist, reclaimable by VACUUM
    fn free_percent(&self) -> f64 {
        if self.count == 0 {
            0.0
        } else {
            self.free as f64 / self.count as f64 * 100.0
        }
    }
}

fn to_mb(bytes: i64) -> f64 {
    bytes as f64 / (1024.0 * 1024.0)
}

#[async_trait]
impl Maintenance for SqliteMaintenance {
    async fn vacuum(&self) -> Result<f64> {
        let before = self.pages().await?;
        sqlx::query("VACUUM")
            .execute(&self.pool)
            .await
            .map_err(map_sqlx_error)?;
        let after = self.pages().await?;

        let reclaimed = to_mb(before.bytes() - after.bytes()).max(0.0);
        info!(
            free_pages_before = before.free,
            size_after_mb = to_mb(after.bytes()),
            reclaimed_mb = reclaimed,
            "Store compacted"
        );

        Ok(reclaimed)
    }

    async fn gc_finished_jobs(&self, retention_days: i64) -> Result<i64> {
        let cutoff_time = self.cutoff(retention_days);

        info!(
            retention_days = retention_days,
            cutoff_time = cutoff_time,
            "Running finished job GC"
        );

        let expired = r#"
            SELECT job_id FROM jobs
            WHERE status IN (?, ?) AND completed_at IS NOT NULL AND completed_at < ?
        "#;

        let mut tx = self.pool.begin().await.map_err(map_sqlx_error)?;

        // Dependent rows first, there are no cascading keys
        for table in ["unit_completions", "job_timings"] {
            let sql = format!("DELETE FROM {} WHERE job_id IN ({})", table, expired);
            sqlx::query(&sql)
                .bind(JobStatus::Done.as_str())
                .bind(JobStatus::Failed.as_str())
                .bind(cutoff_time)
                .execute(&mut *tx)
                .await
                .map_err(map_sqlx_error)?;
        }

        let result = sqlx::query(
            r#"
            DELETE FROM jobs
            WHERE status IN (?, ?) AND completed_at IS NOT NULL AND completed_at < ?
            "#,
        )
        .bind(JobStatus::Done.as_str())
        .bind(JobStatus::Failed.as_str())
        .bind(cutoff_time)
        .execute(&mut *tx)
        .await
        .map_err(map_sqlx_error)?;

        tx.commit().await.map_err(map_sqlx_error)?;

        let deleted = result.rows_affected() as i64;
        info!(deleted_jobs = deleted, "Finished job GC completed");
        Ok(deleted)
    }

    async fn gc_invocations(&self, retention_days: i64) -> Result<i64> {
        let cutoff_time = self.cutoff(retention_days);

        let result = sqlx::query(
            r#"
            DELETE FROM invocations
            WHERE state IN (?, ?) AND finished_at IS NOT NULL AND finished_at < ?
            "#,
        )
        .bind(InvocationState::Done.to_string())
        .bind(InvocationState::Failed.to_string())
        .bind(cutoff_time)
        .execute(&self.pool)
        .await
        .map_err(map_sqlx_error)?;

        let deleted = result.rows_affected() as i64;
        info!(deleted_invocations = deleted, "Invocation GC completed");
        Ok(deleted)
    }

    async fn gc_expired_locks(&self) -> Result<i64> {
        let result = sqlx::query("DELETE FROM locks WHERE expires_at <= ?")
            .bind(self.time_provider.now_millis())
            .execute(&self.pool)
            .await
            .map_err(map_sqlx_error)?;
        Ok(result.rows_affected() as i64)
    }

    async fn get_stats(&self) -> Result<MaintenanceStats> {
        let pages = self.pages().await?;
        let db_size_bytes = pages.bytes();

        let job_count = self.count("SELECT COUNT(*) FROM jobs").await?;
        let finished_job_count = self
            .count("SELECT COUNT(*) FROM jobs WHERE status IN ('DONE', 'FAILED')")
            .await?;
        let invocation_count = self.count("SELECT COUNT(*) FROM invocations").await?;
        let dead_letter_count = self
            .count("SELECT COUNT(*) FROM invocations WHERE state = 'FAILED'")
            .await?;
        let lock_count = self.count("SELECT COUNT(*) FROM locks").await?;

        Ok(MaintenanceStats {
            db_size_mb: to_mb(db_size_bytes),
            db_size_bytes,
            job_count,
            finished_job_count,
            invocation_count,
            dead_letter_count,
            lock_count,
            fragmentation_percent: pages.free_percent(),
        })
    }
}
