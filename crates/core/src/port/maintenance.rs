// Store maintenance port: retention GC and compaction
use crate::error::Result;
use async_trait::async_trait;

/// Store size and row counts, reported by admin.stats.v1
#[derive(Debug, Clone, Default)]
pub struct MaintenanceStats {
    pub db_size_mb: f64,
    pub db_size_bytes: i64,
    pub job_count: i64,
    pub finished_job_count: i64,
    pub invocation_count: i64,
    pub dead_letter_count: i64,
    pub lock_count: i64,
    pub fragmentation_percent: f64,
}

/// Outcome of one retention pass
#[derive(Debug, Clone, Default)]
pub struct MaintenanceReport {
    pub deleted_jobs: i64,
    pub deleted_invocations: i64,
    pub deleted_locks: i64,
    /// Zero unless the store was compacted
    pub reclaimed_mb: f64,
    pub stats: MaintenanceStats,
}

/// Retention windows and compaction threshold
#[derive(Debug, Clone)]
pub struct MaintenanceConfig {
    /// Retention period for finished jobs, their markers and timings (days)
    pub finished_job_retention_days: i64,

    /// Retention period for acknowledged and dead-lettered invocations (days)
    pub invocation_retention_days: i64,

    /// Maximum DB size before forcing VACUUM (MB)
    pub max_db_size_mb: f64,
}

impl Default for MaintenanceConfig {
    fn default() -> Self {
        Self {
            finished_job_retention_days: 7,
            invocation_retention_days: 7,
            max_db_size_mb: 1000.0,
        }
    }
}

/// Store maintenance operations
#[async_trait]
pub trait Maintenance: Send + Sync {
    /// Compact the store. Returns the space reclaimed in MB.
    async fn vacuum(&self) -> Result<f64>;

    /// Delete terminal jobs older than the retention period, together with
    /// their completion markers and timing records
    ///
    /// # Returns
    /// Number of jobs deleted
    async fn gc_finished_jobs(&self, retention_days: i64) -> Result<i64>;

    /// Delete acknowledged and dead-lettered invocations older than the
    /// retention period
    async fn gc_invocations(&self, retention_days: i64) -> Result<i64>;

    /// Delete lock records whose lease has expired
    async fn gc_expired_locks(&self) -> Result<i64>;

    async fn get_stats(&self) -> Result<MaintenanceStats>;

    /// One retention pass: GC everything past its window, then compact
    /// the store if it outgrew `max_db_size_mb`
    async fn run_full_maintenance(&self, config: &MaintenanceConfig) -> Result<MaintenanceReport> {
        let size_before = self.get_stats().await?.db_size_mb;

        let deleted_jobs = self
            .gc_finished_jobs(config.finished_job_retention_days)
            .await?;
        let deleted_invocations = self
            .gc_invocations(config.invocation_retention_days)
            .await?;
        let deleted_locks = self.gc_expired_locks().await?;

        let reclaimed_mb = if size_before > config.max_db_size_mb {
            self.vacuum().await?
        } else {
            0.0
        };

        Ok(MaintenanceReport {
            deleted_jobs,
            deleted_invocations,
            deleted_locks,
            reclaimed_mb,
            stats: self.get_stats().await?,
        })
    }
}
