// Stage dispatch: routes a claimed invocation to its stage service
use crate::application::mapper::MapperService;
use crate::application::reducer::ReducerService;
use crate::application::work::WorkService;
use crate::domain::{StageInvocation, TimingEvent};
use crate::error::Result;
use crate::port::StateStore;
use std::sync::Arc;
use tracing::{error, warn};

pub struct Pipeline {
    state: Arc<dyn StateStore>,
    mapper: MapperService,
    work: WorkService,
    reducer: ReducerService,
}

impl Pipeline {
    pub fn new(
        state: Arc<dyn StateStore>,
        mapper: MapperService,
        work: WorkService,
        reducer: ReducerService,
    ) -> Self {
        Self {
            state,
            mapper,
            work,
            reducer,
        }
    }

    pub async fn dispatch(&self, invocation: &StageInvocation) -> Result<()> {
        match invocation {
            StageInvocation::Map { job_id, request } => self.mapper.map(job_id, request).await,
            StageInvocation::Work { unit } => self.work.execute(unit).await,
            StageInvocation::Reduce { job_id } => {
                self.reducer.try_finalize(job_id).await.map(|_| ())
            }
        }
    }

    /// An invocation will not be delivered again: the job cannot complete
    pub async fn on_exhausted(&self, invocation: &StageInvocation, reason: &str) {
        let job_id = invocation.job_id();
        let reason = format!("{} stage failed: {}", invocation.stage(), reason);
        match self.state.mark_failed(job_id, &reason).await {
            Ok(true) => {
                error!(job_id = job_id, reason = %reason, "Job failed");
                if let Err(e) = self.state.record_timing(job_id, TimingEvent::JobFailed).await {
                    warn!(job_id = job_id, error = %e, "Failed to record timing");
                }
            }
            Ok(false) => {}
            Err(e) => {
                // Recovery fails the job later via the stall timeout
                error!(job_id = job_id, error = %e, "Failed to mark job failed");
            }
        }
    }
}
