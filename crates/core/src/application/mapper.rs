// Mapper: partition a job's inputs into work units and fan out Work invocations
use crate::domain::{
    ChunkKey, InputFile, JobRequest, JobStatus, StageInvocation, TimingEvent, UnitLimits, WorkUnit,
};
use crate::error::{AppError, Result};
use crate::port::{StageInvoker, StateStore};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Split `request.inputs` into contiguous groups.
///
/// A group closes when the next file would exceed the file limit or the byte
/// limit. Unknown sizes count as zero bytes; a file larger than the byte limit
/// on its own still gets a unit. Deterministic for the same inputs and limits.
pub fn partition_inputs(
    job_id: &str,
    request: &JobRequest,
    limits: &UnitLimits,
) -> Result<Vec<WorkUnit>> {
    limits
        .validate()
        .map_err(|e| AppError::Partitioning(e.to_string()))?;
    if request.inputs.is_empty() {
        return Err(AppError::Partitioning("no input files".to_string()));
    }

    let mut groups: Vec<Vec<InputFile>> = Vec::new();
    let mut current: Vec<InputFile> = Vec::new();
    let mut current_bytes: u64 = 0;

    for file in &request.inputs {
        let size = file.size_bytes.unwrap_or(0);
        let over_files = current.len() as u64 + 1 > limits.max_files_per_unit;
        let over_bytes = limits
            .max_bytes_per_unit
            .map_or(false, |max| current_bytes.saturating_add(size) > max);

        if !current.is_empty() && (over_files || over_bytes) {
            groups.push(std::mem::take(&mut current));
            current_bytes = 0;
        }
        current.push(file.clone());
        current_bytes = current_bytes.saturating_add(size);
    }
    if !current.is_empty() {
        groups.push(current);
    }

    Ok(groups
        .into_iter()
        .enumerate()
        .map(|(index, inputs)| {
            let unit_index = index as u64;
            WorkUnit {
                job_id: job_id.to_string(),
                unit_index,
                inputs,
                chunk_key: ChunkKey::for_unit(unit_index),
                destination: request.destination.clone(),
                params: request.params.clone(),
            }
        })
        .collect())
}

/// Mapper stage
pub struct MapperService {
    state: Arc<dyn StateStore>,
    invoker: Arc<dyn StageInvoker>,
    limits: UnitLimits,
}

impl MapperService {
    pub fn new(state: Arc<dyn StateStore>, invoker: Arc<dyn StageInvoker>, limits: UnitLimits) -> Self {
        Self {
            state,
            invoker,
            limits,
        }
    }

    /// Handle one (possibly redelivered) Map invocation
    pub async fn map(&self, job_id: &str, request: &JobRequest) -> Result<()> {
        let job = self
            .state
            .get(job_id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("Job {} not found", job_id)))?;

        match job.status {
            JobStatus::Submitted => {
                if !self
                    .state
                    .compare_and_set_status(job_id, JobStatus::Submitted, JobStatus::Mapping)
                    .await?
                {
                    // Another delivery took ownership concurrently
                    debug!(job_id = job_id, "Mapping already claimed");
                    return Ok(());
                }
            }
            JobStatus::Mapping => {
                info!(job_id = job_id, "Resuming interrupted mapping");
            }
            JobStatus::Working => {
                // Redelivery after a crash mid fan-out; Work is idempotent
                return self.redispatch(job_id, request).await;
            }
            JobStatus::Reducing | JobStatus::Done | JobStatus::Failed => {
                debug!(job_id = job_id, status = %job.status, "Map already done, skipping");
                return Ok(());
            }
        }

        let units = match partition_inputs(job_id, request, &self.limits) {
            Ok(units) => units,
            Err(e) => {
                warn!(job_id = job_id, error = %e, "Partitioning failed");
                self.state.mark_failed(job_id, &e.to_string()).await?;
                return Err(e);
            }
        };

        let expected_units = units.len() as u64;
        if !self.state.begin_working(job_id, expected_units).await? {
            let reason = format!("could not record expected_units = {}", expected_units);
            warn!(job_id = job_id, reason = %reason, "Mapping aborted");
            self.state.mark_failed(job_id, &reason).await?;
            return Err(AppError::Partitioning(reason));
        }

        info!(
            job_id = job_id,
            expected_units = expected_units,
            "Job partitioned"
        );

        self.dispatch(units).await?;
        self.record_timing(job_id, TimingEvent::MapperComplete).await;
        Ok(())
    }

    async fn redispatch(&self, job_id: &str, request: &JobRequest) -> Result<()> {
        let units = partition_inputs(job_id, request, &self.limits)?;
        let job = self.state.get(job_id).await?;
        if job.and_then(|j| j.expected_units) != Some(units.len() as u64) {
            // Limits changed between deliveries; the recorded partition wins
            warn!(job_id = job_id, "Partition differs from recorded expected_units");
            return Ok(());
        }
        info!(job_id = job_id, units = units.len(), "Re-dispatching work units");
        self.dispatch(units).await
    }

    async fn dispatch(&self, units: Vec<WorkUnit>) -> Result<()> {
        for unit in units {
            debug!(
                job_id = %unit.job_id,
                unit_index = unit.unit_index,
                files = unit.inputs.len(),
                "Dispatching work unit"
            );
            self.invoker.invoke(StageInvocation::Work { unit }).await?;
        }
        Ok(())
    }

    async fn record_timing(&self, job_id: &str, event: TimingEvent) {
        if let Err(e) = self.state.record_timing(job_id, event).await {
            warn!(job_id = job_id, event = %event, error = %e, "Failed to record timing");
        }
    }
}
