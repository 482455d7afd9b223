// Periodic retention GC for job state, invocations and expired locks

use crate::error::Result;
use crate::port::{Maintenance, MaintenanceConfig, MaintenanceReport};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{error, info};

pub struct MaintenanceScheduler {
    maintenance: Arc<dyn Maintenance>,
    config: MaintenanceConfig,
    period: Duration,
}

impl MaintenanceScheduler {
    /// `interval_hours` below 1 is treated as 1
    pub fn new(
        maintenance: Arc<dyn Maintenance>,
        config: MaintenanceConfig,
        interval_hours: u64,
    ) -> Self {
        Self {
            maintenance,
            config,
            period: Duration::from_secs(interval_hours.max(1) * 3600),
        }
    }

    pub fn period(&self) -> Duration {
        self.period
    }

    /// Background loop; the first pass runs immediately. Spawn it.
    pub async fn run(self) {
        info!(
            period_secs = self.period.as_secs(),
            job_retention_days = self.config.finished_job_retention_days,
            invocation_retention_days = self.config.invocation_retention_days,
            "Maintenance scheduler started"
        );

        let mut tick = interval(self.period);
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tick.tick().await;
            // Failures are logged; the next tick tries again
            let _ = self.run_once().await;
        }
    }

    /// One retention pass with its outcome logged
    pub async fn run_once(&self) -> Result<MaintenanceReport> {
        match self.maintenance.run_full_maintenance(&self.config).await {
            Ok(report) => {
                info!(
                    deleted_jobs = report.deleted_jobs,
                    deleted_invocations = report.deleted_invocations,
                    deleted_locks = report.deleted_locks,
                    reclaimed_mb = report.reclaimed_mb,
                    db_size_mb = report.stats.db_size_mb,
                    jobs = report.stats.job_count,
                    dead_letters = report.stats.dead_letter_count,
                    "Maintenance pass completed"
                );
                Ok(report)
            }
            Err(e) => {
                error!(error = ?e, "Maintenance pass failed");
                Err(e)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::AppError;
    use crate::port::MaintenanceStats;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};

    /// Deletes what it is told to and remembers the retention windows it saw
    struct ScriptedMaintenance {
        fail_gc: AtomicBool,
        seen_job_retention: AtomicI64,
        seen_invocation_retention: AtomicI64,
    }

    impl ScriptedMaintenance {
        fn new() -> Self {
            Self {
                fail_gc: AtomicBool::new(false),
                seen_job_retention: AtomicI64::new(-1),
                seen_invocation_retention: AtomicI64::new(-1),
            }
        }
    }

    #[async_trait]
    impl Maintenance for ScriptedMaintenance {
        async fn vacuum(&self) -> Result<f64> {
            Ok(0.0)
        }
        async fn gc_finished_jobs(&self, retention_days: i64) -> Result<i64> {
            if self.fail_gc.load(Ordering::SeqCst) {
                return Err(AppError::Storage("disk I/O error".to_string()));
            }
            self.seen_job_retention.store(retention_days, Ordering::SeqCst);
            Ok(3)
        }
        async fn gc_invocations(&self, retention_days: i64) -> Result<i64> {
            self.seen_invocation_retention
                .store(retention_days, Ordering::SeqCst);
            Ok(12)
        }
        async fn gc_expired_locks(&self) -> Result<i64> {
            Ok(1)
        }
        async fn get_stats(&self) -> Result<MaintenanceStats> {
            Ok(MaintenanceStats::default())
        }
    }

    #[tokio::test]
    async fn test_run_once_applies_configured_windows() {
        let maintenance = Arc::new(ScriptedMaintenance::new());
        let config = MaintenanceConfig {
            finished_job_retention_days: 3,
            invocation_retention_days: 1,
            ..MaintenanceConfig::default()
        };
        let scheduler = MaintenanceScheduler::new(maintenance.clone(), config, 0);
        assert_eq!(scheduler.period(), Duration::from_secs(3600));

        let report = scheduler.run_once().await.unwrap();
        assert_eq!(
            (report.deleted_jobs, report.deleted_invocations, report.deleted_locks),
            (3, 12, 1)
        );
        assert_eq!(maintenance.seen_job_retention.load(Ordering::SeqCst), 3);
        assert_eq!(maintenance.seen_invocation_retention.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_run_once_surfaces_failures() {
        let maintenance = Arc::new(ScriptedMaintenance::new());
        maintenance.fail_gc.store(true, Ordering::SeqCst);
        let scheduler =
            MaintenanceScheduler::new(maintenance, MaintenanceConfig::default(), 24);

        assert!(matches!(
            scheduler.run_once().await,
            Err(AppError::Storage(_))
        ));
    }
}
