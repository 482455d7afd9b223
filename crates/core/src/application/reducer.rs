// Reducer: single-winner finalization of a fully worked job
use crate::application::retry::LocalRetry;
use crate::application::worker::constants::DEFAULT_REDUCE_TAKEOVER_MS;
use crate::domain::{
    ChunkEntry, ChunkKey, JobState, JobStatus, OutputManifest, Table, TimingEvent,
};
use crate::error::{AppError, Result};
use crate::port::{OutputStore, StateStore, TimeProvider};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// What a `try_finalize` call did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReduceOutcome {
    /// Not all units reported yet
    NotReady,
    /// Another invocation already finalized (or is finalizing), or the job is terminal
    AlreadyHandled,
    Finalized,
    Failed,
}

pub struct ReducerService {
    state: Arc<dyn StateStore>,
    output: Arc<dyn OutputStore>,
    time_provider: Arc<dyn TimeProvider>,
    retry: LocalRetry,
    takeover_after_ms: i64,
}

impl ReducerService {
    pub fn new(
        state: Arc<dyn StateStore>,
        output: Arc<dyn OutputStore>,
        time_provider: Arc<dyn TimeProvider>,
        retry: LocalRetry,
    ) -> Self {
        Self {
            state,
            output,
            time_provider,
            retry,
            takeover_after_ms: DEFAULT_REDUCE_TAKEOVER_MS,
        }
    }

    /// How long a job may sit in Reducing before another call finishes it
    pub fn with_takeover_after(mut self, takeover_after_ms: i64) -> Self {
        self.takeover_after_ms = takeover_after_ms;
        self
    }

    pub fn takeover_after_ms(&self) -> i64 {
        self.takeover_after_ms
    }

    /// Finalize the job if every unit has completed. Safe to call any
    /// number of times concurrently; at most one caller finalizes.
    ///
    /// A job stuck in Reducing (its finalizer crashed or errored after
    /// claiming it) is finished by the first call made after
    /// `takeover_after_ms` without progress.
    pub async fn try_finalize(&self, job_id: &str) -> Result<ReduceOutcome> {
        let job = self
            .state
            .get(job_id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("Job {} not found", job_id)))?;

        match job.status {
            JobStatus::Working => {}
            JobStatus::Reducing if self.is_stranded(&job) => {
                warn!(
                    job_id = job_id,
                    reducing_since = job.updated_at,
                    "Taking over a stranded finalization"
                );
                return self.finish(&job, true).await;
            }
            status => {
                debug!(job_id = job_id, status = %status, "Reduce skipped");
                return Ok(ReduceOutcome::AlreadyHandled);
            }
        }
        if !job.is_ready_to_reduce() {
            debug!(
                job_id = job_id,
                completed_units = job.completed_units,
                expected_units = ?job.expected_units,
                "Not all units complete yet"
            );
            return Ok(ReduceOutcome::NotReady);
        }

        if !self
            .state
            .compare_and_set_status(job_id, JobStatus::Working, JobStatus::Reducing)
            .await?
        {
            debug!(job_id = job_id, "Lost the finalize race");
            return Ok(ReduceOutcome::AlreadyHandled);
        }
        self.record_timing(job_id, TimingEvent::ReduceStarted).await;

        self.finish(&job, false).await
    }

    fn is_stranded(&self, job: &JobState) -> bool {
        self.time_provider.now_millis() - job.updated_at >= self.takeover_after_ms
    }

    /// Write the manifest and move `Reducing -> Done`. The caller owns the
    /// Reducing claim, either fresh or taken over.
    async fn finish(&self, job: &JobState, resumed: bool) -> Result<ReduceOutcome> {
        let job_id = job.job_id.as_str();
        match self.finalize(job, resumed).await {
            Ok(manifest) => {
                let done = self
                    .retry
                    .run("mark done", || {
                        self.state
                            .compare_and_set_status(job_id, JobStatus::Reducing, JobStatus::Done)
                    })
                    .await?;
                if !done {
                    warn!(job_id = job_id, "Job left Reducing during finalization");
                    return Ok(ReduceOutcome::AlreadyHandled);
                }
                self.record_timing(job_id, TimingEvent::ReduceComplete).await;
                info!(
                    job_id = job_id,
                    chunks = manifest.chunks.len(),
                    total_rows = manifest.total_rows,
                    resumed = resumed,
                    "Job finalized"
                );
                Ok(ReduceOutcome::Finalized)
            }
            Err(e) => {
                error!(job_id = job_id, error = %e, "Finalization failed");
                self.state
                    .mark_failed(job_id, &format!("finalization failed: {}", e))
                    .await?;
                self.record_timing(job_id, TimingEvent::JobFailed).await;
                Ok(ReduceOutcome::Failed)
            }
        }
    }

    /// Build the manifest and write it. A resumed finalization keeps a
    /// manifest that is already in place.
    async fn finalize(&self, job: &JobState, resumed: bool) -> Result<OutputManifest> {
        let manifest = self.build_manifest(job).await?;
        if resumed
            && self
                .retry
                .run("is_finalized", || {
                    self.output.is_finalized(&job.destination, &job.job_id)
                })
                .await?
        {
            debug!(job_id = %job.job_id, "Manifest already written");
            return Ok(manifest);
        }
        self.retry
            .run("finalize", || {
                self.output
                    .finalize(&job.destination, &job.job_id, &manifest)
            })
            .await?;
        Ok(manifest)
    }

    async fn build_manifest(&self, job: &JobState) -> Result<OutputManifest> {
        let expected = job.expected_units.unwrap_or(0);
        let keys = self
            .retry
            .run("list_chunks", || {
                self.output.list_chunks(&job.destination, &job.job_id)
            })
            .await?;

        if keys.len() as u64 != expected {
            return Err(AppError::Validation(format!(
                "expected {} chunks, found {}",
                expected,
                keys.len()
            )));
        }

        let mut schema: Option<(String, Vec<String>)> = None;
        let mut chunks = Vec::with_capacity(keys.len());
        let mut row_offset = 0u64;

        for unit_index in 0..expected {
            let key = ChunkKey::for_unit(unit_index);
            let bytes = self
                .retry
                .run("read_chunk", || {
                    self.output.read_chunk(&job.destination, &job.job_id, &key)
                })
                .await?
                .ok_or_else(|| AppError::Validation(format!("missing chunk {}", key)))?;
            let table = Table::from_chunk_bytes(&bytes)?;

            match &schema {
                None => schema = Some((table.row_label.clone(), table.columns.clone())),
                Some((row_label, columns)) => {
                    if *row_label != table.row_label || *columns != table.columns {
                        return Err(AppError::Validation(format!(
                            "chunk {} has a different schema",
                            key
                        )));
                    }
                }
            }

            let row_count = table.len() as u64;
            chunks.push(ChunkEntry {
                chunk_key: key,
                unit_index,
                row_offset,
                row_count,
            });
            row_offset += row_count;
        }

        let (row_label, columns) = schema.unwrap_or_default();
        Ok(OutputManifest {
            job_id: job.job_id.clone(),
            destination: job.destination.clone(),
            row_label,
            columns,
            total_rows: row_offset,
            chunks,
            finalized_at: self.time_provider.now_millis(),
        })
    }

    async fn record_timing(&self, job_id: &str, event: TimingEvent) {
        if let Err(e) = self.state.record_timing(job_id, event).await {
            warn!(job_id = job_id, event = %event, error = %e, "Failed to record timing");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{InputFile, JobRequest, MergeParams, OutputDestination, TableRow};
    use crate::port::output_store::memory::InMemoryOutputStore;
    use crate::port::state_store::memory::InMemoryStateStore;
    use crate::port::time_provider::mocks::ManualTimeProvider;
    use std::time::Duration;

    struct Fixture {
        clock: Arc<ManualTimeProvider>,
        state: Arc<InMemoryStateStore>,
        output: Arc<InMemoryOutputStore>,
        reducer: Arc<ReducerService>,
        destination: OutputDestination,
    }

    fn fast_retry() -> LocalRetry {
        LocalRetry {
            max_attempts: 2,
            base_delay: Duration::from_millis(1),
        }
    }

    /// Writes through to the in-memory store, then breaks the next
    /// `failures` state store mutations once the manifest is in place
    struct StateFailsAfterFinalize {
        inner: Arc<InMemoryOutputStore>,
        state: Arc<InMemoryStateStore>,
        failures: usize,
    }

    #[async_trait::async_trait]
    impl OutputStore for StateFailsAfterFinalize {
        async fn write_chunk(
            &self,
            destination: &OutputDestination,
            job_id: &str,
            chunk_key: &ChunkKey,
            bytes: Vec<u8>,
        ) -> Result<()> {
            self.inner.write_chunk(destination, job_id, chunk_key, bytes).await
        }

        async fn read_chunk(
            &self,
            destination: &OutputDestination,
            job_id: &str,
            chunk_key: &ChunkKey,
        ) -> Result<Option<Vec<u8>>> {
            self.inner.read_chunk(destination, job_id, chunk_key).await
        }

        async fn list_chunks(
            &self,
            destination: &OutputDestination,
            job_id: &str,
        ) -> Result<Vec<ChunkKey>> {
            self.inner.list_chunks(destination, job_id).await
        }

        async fn finalize(
            &self,
            destination: &OutputDestination,
            job_id: &str,
            manifest: &OutputManifest,
        ) -> Result<()> {
            self.inner.finalize(destination, job_id, manifest).await?;
            self.state.inject_storage_failures(self.failures);
            Ok(())
        }

        async fn is_finalized(&self, destination: &OutputDestination, job_id: &str) -> Result<bool> {
            self.inner.is_finalized(destination, job_id).await
        }

        async fn exists(&self, destination: &OutputDestination, job_id: &str) -> Result<bool> {
            self.inner.exists(destination, job_id).await
        }
    }

    fn reducer_failing_after_finalize(f: &Fixture, failures: usize) -> ReducerService {
        let output = Arc::new(StateFailsAfterFinalize {
            inner: f.output.clone(),
            state: f.state.clone(),
            failures,
        });
        ReducerService::new(f.state.clone(), output, f.clock.clone(), fast_retry())
    }

    async fn fixture(expected: u64) -> Fixture {
        let clock = Arc::new(ManualTimeProvider::new(1_000));
        let state = Arc::new(InMemoryStateStore::new(clock.clone()));
        let output = Arc::new(InMemoryOutputStore::new());
        let request = JobRequest {
            job_id: None,
            inputs: vec![InputFile::new("a")],
            destination: OutputDestination::new("out"),
            params: MergeParams {
                format: "tsv".into(),
                filter: None,
            },
        };
        state.insert(&JobState::submitted("j", &request, 0)).await.unwrap();
        state
            .compare_and_set_status("j", JobStatus::Submitted, JobStatus::Mapping)
            .await
            .unwrap();
        state.begin_working("j", expected).await.unwrap();

        let reducer = Arc::new(ReducerService::new(
            state.clone(),
            output.clone(),
            clock.clone(),
            fast_retry(),
        ));
        Fixture {
            clock,
            state,
            output,
            reducer,
            destination: request.destination,
        }
    }

    async fn complete_unit(f: &Fixture, unit_index: u64, rows: usize, columns: &[&str]) {
        let table = Table::new(
            "cell",
            columns.iter().map(|c| c.to_string()).collect(),
            (0..rows)
                .map(|r| TableRow::new(format!("u{}r{}", unit_index, r), vec![0.0; columns.len()]))
                .collect(),
        );
        f.output
            .write_chunk(
                &f.destination,
                "j",
                &ChunkKey::for_unit(unit_index),
                table.to_chunk_bytes().unwrap(),
            )
            .await
            .unwrap();
        f.state.complete_unit("j", unit_index).await.unwrap();
    }

    #[tokio::test]
    async fn test_not_ready_until_all_units_complete() {
        let f = fixture(2).await;
        complete_unit(&f, 0, 3, &["CD4"]).await;

        assert_eq!(f.reducer.try_finalize("j").await.unwrap(), ReduceOutcome::NotReady);
        assert_eq!(f.output.finalize_calls(), 0);
        assert_eq!(f.state.get("j").await.unwrap().unwrap().status, JobStatus::Working);
    }

    #[tokio::test]
    async fn test_finalize_builds_manifest_with_offsets() {
        let f = fixture(2).await;
        complete_unit(&f, 0, 3, &["CD4"]).await;
        complete_unit(&f, 1, 2, &["CD4"]).await;

        assert_eq!(f.reducer.try_finalize("j").await.unwrap(), ReduceOutcome::Finalized);

        let job = f.state.get("j").await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Done);
        assert!(job.completed_at.is_some());

        let manifest = f.output.manifest(&f.destination, "j").unwrap();
        assert_eq!(manifest.total_rows, 5);
        assert_eq!(manifest.chunks[1].row_offset, 3);
        assert_eq!(manifest.columns, vec!["CD4".to_string()]);
    }

    #[tokio::test]
    async fn test_concurrent_reducers_finalize_once() {
        let f = fixture(3).await;
        for i in 0..3 {
            complete_unit(&f, i, 1, &["CD4"]).await;
        }

        let mut handles = Vec::new();
        for _ in 0..10 {
            let reducer = f.reducer.clone();
            handles.push(tokio::spawn(async move { reducer.try_finalize("j").await }));
        }
        let mut finalized = 0;
        for handle in handles {
            if handle.await.unwrap().unwrap() == ReduceOutcome::Finalized {
                finalized += 1;
            }
        }

        assert_eq!(finalized, 1);
        assert_eq!(f.output.finalize_calls(), 1);
    }

    #[tokio::test]
    async fn test_second_call_after_done_is_noop() {
        let f = fixture(1).await;
        complete_unit(&f, 0, 1, &["CD4"]).await;

        f.reducer.try_finalize("j").await.unwrap();
        assert_eq!(
            f.reducer.try_finalize("j").await.unwrap(),
            ReduceOutcome::AlreadyHandled
        );
        assert_eq!(f.output.finalize_calls(), 1);
    }

    #[tokio::test]
    async fn test_schema_mismatch_fails_job() {
        let f = fixture(2).await;
        complete_unit(&f, 0, 1, &["CD4"]).await;
        complete_unit(&f, 1, 1, &["CD8"]).await;

        assert_eq!(f.reducer.try_finalize("j").await.unwrap(), ReduceOutcome::Failed);

        let job = f.state.get("j").await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert!(job.failure_reason.unwrap().contains("schema"));
        assert_eq!(f.output.finalize_calls(), 0);
    }

    #[tokio::test]
    async fn test_transient_error_after_finalize_is_retried() {
        let f = fixture(2).await;
        complete_unit(&f, 0, 2, &["CD4"]).await;
        complete_unit(&f, 1, 1, &["CD4"]).await;

        let reducer = reducer_failing_after_finalize(&f, 1);
        assert_eq!(reducer.try_finalize("j").await.unwrap(), ReduceOutcome::Finalized);

        let job = f.state.get("j").await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Done);
        assert_eq!(f.output.finalize_calls(), 1);
    }

    #[tokio::test]
    async fn test_stranded_reducing_job_is_taken_over() {
        let f = fixture(2).await;
        complete_unit(&f, 0, 2, &["CD4"]).await;
        complete_unit(&f, 1, 1, &["CD4"]).await;

        // Manifest written, but the state store stays down past the local retries
        let reducer = reducer_failing_after_finalize(&f, 5);
        assert!(matches!(
            reducer.try_finalize("j").await,
            Err(AppError::Storage(_))
        ));
        f.state.inject_storage_failures(0);
        assert_eq!(
            f.state.get("j").await.unwrap().unwrap().status,
            JobStatus::Reducing
        );

        // A redelivery right away leaves the claim alone
        assert_eq!(
            f.reducer.try_finalize("j").await.unwrap(),
            ReduceOutcome::AlreadyHandled
        );

        f.clock.advance(f.reducer.takeover_after_ms());
        assert_eq!(f.reducer.try_finalize("j").await.unwrap(), ReduceOutcome::Finalized);

        let job = f.state.get("j").await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Done);
        // The manifest already in place is kept
        assert_eq!(f.output.finalize_calls(), 1);
        assert_eq!(f.output.manifest(&f.destination, "j").unwrap().total_rows, 3);
    }

    #[tokio::test]
    async fn test_takeover_threshold_is_configurable() {
        let f = fixture(1).await;
        complete_unit(&f, 0, 1, &["CD4"]).await;
        f.state
            .compare_and_set_status("j", JobStatus::Working, JobStatus::Reducing)
            .await
            .unwrap();

        let reducer = ReducerService::new(
            f.state.clone(),
            f.output.clone(),
            f.clock.clone(),
            fast_retry(),
        )
        .with_takeover_after(500);
        f.clock.advance(499);
        assert_eq!(reducer.try_finalize("j").await.unwrap(), ReduceOutcome::AlreadyHandled);

        f.clock.advance(1);
        assert_eq!(reducer.try_finalize("j").await.unwrap(), ReduceOutcome::Finalized);
        assert_eq!(f.output.finalize_calls(), 1);
    }
}
