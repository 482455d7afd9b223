// Work stage: convert one unit, filter it, and write its chunk under the chunk lock
use crate::application::lock::ChunkLock;
use crate::domain::{RowFilter, StageInvocation, TimingEvent, WorkUnit};
use crate::error::{AppError, Result};
use crate::port::{ConversionError, Converter, OutputStore, StageInvoker, StateStore, UnitCompletion};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Default conversion timeout per unit
pub const DEFAULT_CONVERT_TIMEOUT: Duration = Duration::from_secs(300);

pub struct WorkService {
    state: Arc<dyn StateStore>,
    output: Arc<dyn OutputStore>,
    converter: Arc<dyn Converter>,
    invoker: Arc<dyn StageInvoker>,
    lock: ChunkLock,
    convert_timeout: Duration,
}

impl WorkService {
    pub fn new(
        state: Arc<dyn StateStore>,
        output: Arc<dyn OutputStore>,
        converter: Arc<dyn Converter>,
        invoker: Arc<dyn StageInvoker>,
        lock: ChunkLock,
        convert_timeout: Duration,
    ) -> Self {
        Self {
            state,
            output,
            converter,
            invoker,
            lock,
            convert_timeout,
        }
    }

    /// Execute one (possibly redelivered) work unit
    pub async fn execute(&self, unit: &WorkUnit) -> Result<()> {
        let job_id = unit.job_id.as_str();

        let job = self
            .state
            .get(job_id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("Job {} not found", job_id)))?;
        if job.status.is_terminal() {
            debug!(
                job_id = job_id,
                unit_index = unit.unit_index,
                status = %job.status,
                "Job already terminal, skipping unit"
            );
            return Ok(());
        }

        let bytes = self.convert_and_filter(unit).await?;

        let lock_key = unit.chunk_key.lock_key(job_id);
        self.lock
            .with_lock(&lock_key, move || async move {
                self.output
                    .write_chunk(&unit.destination, job_id, &unit.chunk_key, bytes)
                    .await
            })
            .await?;

        match self.state.complete_unit(job_id, unit.unit_index).await? {
            UnitCompletion::Recorded { completed_units } => {
                info!(
                    job_id = job_id,
                    unit_index = unit.unit_index,
                    chunk_key = %unit.chunk_key,
                    completed_units = completed_units,
                    "Unit complete"
                );
                self.record_timing(job_id, TimingEvent::UnitComplete(unit.unit_index))
                    .await;
                if job.expected_units == Some(completed_units) {
                    self.record_timing(job_id, TimingEvent::WorkComplete).await;
                }
            }
            UnitCompletion::Duplicate => {
                debug!(
                    job_id = job_id,
                    unit_index = unit.unit_index,
                    "Duplicate delivery, completion already counted"
                );
            }
            UnitCompletion::Rejected => {
                warn!(
                    job_id = job_id,
                    unit_index = unit.unit_index,
                    "Completion rejected, job no longer accepts units"
                );
                return Ok(());
            }
        }

        // Also on duplicates: repairs a crash between completion and dispatch
        self.invoker
            .invoke(StageInvocation::Reduce {
                job_id: job_id.to_string(),
            })
            .await
    }

    async fn convert_and_filter(&self, unit: &WorkUnit) -> Result<Vec<u8>> {
        let filter = match unit.params.filter.as_deref() {
            Some(expr) => Some(RowFilter::parse(expr)?),
            None => None,
        };

        let converted = tokio::time::timeout(
            self.convert_timeout,
            self.converter.convert(&unit.inputs, &unit.params),
        )
        .await
        .map_err(|_| ConversionError::Timeout(self.convert_timeout.as_millis() as u64))??;

        converted
            .validate()
            .map_err(|e| ConversionError::SchemaMismatch(e.to_string()))?;

        let rows_in = converted.len();
        let table = match filter {
            Some(filter) => filter.apply(converted)?,
            None => converted,
        };

        debug!(
            job_id = %unit.job_id,
            unit_index = unit.unit_index,
            rows_in = rows_in,
            rows_out = table.len(),
            "Unit converted"
        );

        Ok(table.to_chunk_bytes()?)
    }

    async fn record_timing(&self, job_id: &str, event: TimingEvent) {
        if let Err(e) = self.state.record_timing(job_id, event).await {
            warn!(job_id = job_id, event = %event, error = %e, "Failed to record timing");
        }
    }
}
