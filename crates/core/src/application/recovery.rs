// Crash recovery: redeliver orphaned invocations, re-drive stranded
// reduces, fail stalled jobs
use crate::application::worker::constants::{DEFAULT_STALL_TIMEOUT_MS, DEFAULT_VISIBILITY_TIMEOUT_MS};
use crate::domain::{JobStatus, StageInvocation, TimingEvent};
use crate::error::Result;
use crate::port::{InvocationQueue, StageInvoker, StateStore, TimeProvider};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::interval;
use tracing::{error, info, warn};

/// Result of one recovery pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RecoveryReport {
    pub requeued_invocations: u64,
    pub failed_jobs: usize,
    pub redriven_reduces: usize,
}

/// Recovery service
///
/// Runs once on daemon startup (a crashed daemon leaves RUNNING
/// invocations behind) and then periodically.
pub struct RecoveryService {
    queue: Arc<dyn InvocationQueue>,
    state: Arc<dyn StateStore>,
    time_provider: Arc<dyn TimeProvider>,
    visibility_timeout_ms: i64,
    /// Disabled when `None`
    stall_timeout_ms: Option<i64>,
    /// Invoker and takeover age for jobs stuck in Reducing
    reduce_redrive: Option<(Arc<dyn StageInvoker>, i64)>,
}

impl RecoveryService {
    /// Create a new recovery service
    ///
    /// # Arguments
    /// * `visibility_timeout_ms` - Claimed invocations unacknowledged for longer are redelivered (default: 15 minutes)
    /// * `stall_timeout_ms` - Non-terminal jobs without progress for longer are failed (default: 30 minutes)
    pub fn new(
        queue: Arc<dyn InvocationQueue>,
        state: Arc<dyn StateStore>,
        time_provider: Arc<dyn TimeProvider>,
        visibility_timeout_ms: Option<i64>,
        stall_timeout_ms: Option<i64>,
    ) -> Self {
        Self {
            queue,
            state,
            time_provider,
            visibility_timeout_ms: visibility_timeout_ms.unwrap_or(DEFAULT_VISIBILITY_TIMEOUT_MS),
            stall_timeout_ms,
            reduce_redrive: None,
        }
    }

    /// Enqueue a fresh Reduce for every job left in Reducing for longer
    /// than `takeover_after_ms`. The reducer finishes such jobs instead of
    /// skipping them.
    pub fn with_reduce_redrive(mut self, invoker: Arc<dyn StageInvoker>, takeover_after_ms: i64) -> Self {
        self.reduce_redrive = Some((invoker, takeover_after_ms));
        self
    }

    /// Same as `new` with the default stall timeout enabled
    pub fn with_defaults(
        queue: Arc<dyn InvocationQueue>,
        state: Arc<dyn StateStore>,
        time_provider: Arc<dyn TimeProvider>,
    ) -> Self {
        Self::new(queue, state, time_provider, None, Some(DEFAULT_STALL_TIMEOUT_MS))
    }

    pub async fn recover(&self) -> Result<RecoveryReport> {
        let requeued_invocations = self.requeue_orphaned().await?;
        let failed_jobs = self.fail_stalled_jobs().await?;
        let redriven_reduces = self.redrive_stranded_reduces().await?;
        Ok(RecoveryReport {
            requeued_invocations,
            failed_jobs,
            redriven_reduces,
        })
    }

    /// Redeliver invocations whose worker never acknowledged them
    pub async fn requeue_orphaned(&self) -> Result<u64> {
        let cutoff = self.time_provider.now_millis() - self.visibility_timeout_ms;
        let requeued = self.queue.requeue_orphaned(cutoff).await?;
        if requeued > 0 {
            warn!(
                requeued = requeued,
                visibility_timeout_ms = self.visibility_timeout_ms,
                "Requeued orphaned invocations"
            );
        }
        Ok(requeued)
    }

    /// Fail non-terminal jobs that made no progress within the stall timeout
    pub async fn fail_stalled_jobs(&self) -> Result<usize> {
        let Some(stall_timeout_ms) = self.stall_timeout_ms else {
            return Ok(0);
        };
        let cutoff = self.time_provider.now_millis() - stall_timeout_ms;

        let mut failed = 0;
        for job in self.state.find_stalled(cutoff).await? {
            let reason = format!(
                "stalled in {} for more than {}ms",
                job.status, stall_timeout_ms
            );
            if self.state.mark_failed(&job.job_id, &reason).await? {
                warn!(job_id = %job.job_id, status = %job.status, "Stalled job marked failed");
                if let Err(e) = self
                    .state
                    .record_timing(&job.job_id, TimingEvent::JobFailed)
                    .await
                {
                    warn!(job_id = %job.job_id, error = %e, "Failed to record timing");
                }
                failed += 1;
            }
        }
        Ok(failed)
    }

    /// Re-invoke Reduce for jobs whose finalizer claimed them and never
    /// finished. Jobs past the stall timeout were already failed above.
    pub async fn redrive_stranded_reduces(&self) -> Result<usize> {
        let Some((invoker, takeover_after_ms)) = &self.reduce_redrive else {
            return Ok(0);
        };
        let cutoff = self.time_provider.now_millis() - takeover_after_ms;

        let mut redriven = 0;
        for job in self.state.find_stalled(cutoff).await? {
            if job.status != JobStatus::Reducing {
                continue;
            }
            invoker
                .invoke(StageInvocation::Reduce {
                    job_id: job.job_id.clone(),
                })
                .await?;
            warn!(job_id = %job.job_id, reducing_since = job.updated_at, "Re-driving stranded reduce");
            redriven += 1;
        }
        Ok(redriven)
    }

    /// Periodic recovery loop. Should be spawned in tokio::spawn.
    pub async fn run(self, period: Duration) {
        let mut tick = interval(period);
        loop {
            tick.tick().await;
            match self.recover().await {
                Ok(report) if report != RecoveryReport::default() => {
                    info!(
                        requeued_invocations = report.requeued_invocations,
                        failed_jobs = report.failed_jobs,
                        redriven_reduces = report.redriven_reduces,
                        "Recovery pass complete"
                    );
                }
                Ok(_) => {}
                Err(e) => error!(error = %e, "Recovery pass failed"),
            }
        }
    }
}
