// Driver: validate and accept jobs, then hand them to the Mapper (fire and poll)
use crate::application::retry::LocalRetry;
use crate::domain::{
    JobId, JobRequest, JobState, RowFilter, StageInvocation, TimingEvent, TimingRecord,
};
use crate::error::{AppError, Result};
use crate::port::{Converter, IdProvider, OutputStore, StageInvoker, StateStore, TimeProvider};
use std::sync::Arc;
use tracing::{error, info, warn};

pub struct DriverService {
    state: Arc<dyn StateStore>,
    output: Arc<dyn OutputStore>,
    invoker: Arc<dyn StageInvoker>,
    id_provider: Arc<dyn IdProvider>,
    time_provider: Arc<dyn TimeProvider>,
    /// When set, formats it cannot handle are rejected at submission
    converter: Option<Arc<dyn Converter>>,
    retry: LocalRetry,
}

impl DriverService {
    pub fn new(
        state: Arc<dyn StateStore>,
        output: Arc<dyn OutputStore>,
        invoker: Arc<dyn StageInvoker>,
        id_provider: Arc<dyn IdProvider>,
        time_provider: Arc<dyn TimeProvider>,
    ) -> Self {
        Self {
            state,
            output,
            invoker,
            id_provider,
            time_provider,
            converter: None,
            retry: LocalRetry::default(),
        }
    }

    pub fn with_converter(mut self, converter: Arc<dyn Converter>) -> Self {
        self.converter = Some(converter);
        self
    }

    pub fn with_retry(mut self, retry: LocalRetry) -> Self {
        self.retry = retry;
        self
    }

    /// Accept a job and return its ID without waiting for any stage.
    ///
    /// # Errors
    /// `InvalidRequest` for malformed requests and for a supplied job ID that
    /// is already taken. Failing to dispatch the Mapper does not
    /// error: the job is marked Failed and the ID returned for polling.
    pub async fn submit(&self, request: JobRequest) -> Result<JobId> {
        self.validate(&request)?;

        let job_id = match &request.job_id {
            Some(job_id) => {
                self.check_job_id_free(job_id, &request).await?;
                job_id.clone()
            }
            None => self.id_provider.generate_id(),
        };

        let now = self.time_provider.now_millis();
        let state = JobState::submitted(job_id.clone(), &request, now);
        self.retry
            .run("insert job", || self.state.insert(&state))
            .await
            .map_err(|e| match e {
                // Lost a race with a concurrent submit of the same ID
                AppError::Conflict(message) => AppError::InvalidRequest(message),
                other => other,
            })?;
        self.record_timing(&job_id, TimingEvent::DriverStarted).await;

        info!(
            job_id = %job_id,
            inputs = request.inputs.len(),
            destination = %request.destination,
            format = %request.params.format,
            "Job submitted"
        );

        let invocation = StageInvocation::Map {
            job_id: job_id.clone(),
            request: JobRequest {
                job_id: Some(job_id.clone()),
                ..request
            },
        };
        let dispatched = self
            .retry
            .run("dispatch mapper", || self.invoker.invoke(invocation.clone()))
            .await;

        if let Err(e) = dispatched {
            error!(job_id = %job_id, error = %e, "Failed to dispatch mapper");
            let reason = format!("mapper dispatch failed: {}", e);
            if let Err(e) = self.state.mark_failed(&job_id, &reason).await {
                error!(job_id = %job_id, error = %e, "Failed to mark job failed");
            }
            self.record_timing(&job_id, TimingEvent::JobFailed).await;
            return Ok(job_id);
        }

        self.record_timing(&job_id, TimingEvent::DriverComplete).await;
        Ok(job_id)
    }

    pub async fn poll(&self, job_id: &str) -> Result<JobState> {
        self.state
            .get(job_id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("Job {} not found", job_id)))
    }

    pub async fn timings(&self, job_id: &str) -> Result<Vec<TimingRecord>> {
        self.poll(job_id).await?;
        self.state.timings(job_id).await
    }

    fn validate(&self, request: &JobRequest) -> Result<()> {
        if request.inputs.is_empty() {
            return Err(AppError::InvalidRequest(
                "at least one input file is required".to_string(),
            ));
        }
        if let Some(index) = request.inputs.iter().position(|f| f.path.trim().is_empty()) {
            return Err(AppError::InvalidRequest(format!(
                "input file {} has an empty path",
                index
            )));
        }
        if let Some(job_id) = &request.job_id {
            if job_id.trim().is_empty() {
                return Err(AppError::InvalidRequest("job_id must not be empty".to_string()));
            }
            // Used as a single path segment under the destination
            let allowed = |c: char| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.');
            if !job_id.chars().all(allowed) || job_id.starts_with('.') {
                return Err(AppError::InvalidRequest(format!(
                    "job_id may only contain letters, digits, '-', '_' and '.': {}",
                    job_id
                )));
            }
        }
        request
            .destination
            .validate()
            .map_err(|e| AppError::InvalidRequest(e.to_string()))?;

        let format = request.params.format.trim();
        if format.is_empty() {
            return Err(AppError::InvalidRequest("format must not be empty".to_string()));
        }
        if let Some(converter) = &self.converter {
            if !converter.supports_format(format) {
                return Err(AppError::InvalidRequest(format!(
                    "unsupported format: {}",
                    format
                )));
            }
        }

        if let Some(expr) = &request.params.filter {
            RowFilter::parse(expr).map_err(|e| AppError::InvalidRequest(e.to_string()))?;
        }
        Ok(())
    }

    async fn check_job_id_free(&self, job_id: &str, request: &JobRequest) -> Result<()> {
        if self.state.get(job_id).await?.is_some() {
            return Err(AppError::InvalidRequest(format!("job {} already exists", job_id)));
        }
        if self.output.exists(&request.destination, job_id).await? {
            return Err(AppError::InvalidRequest(format!(
                "destination {} already holds output for job {}",
                request.destination, job_id
            )));
        }
        Ok(())
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
    use crate::domain::{ChunkKey, InputFile, JobStatus, MergeParams, OutputDestination, Stage};
    use crate::port::converter::mocks::MockConverter;
    use crate::port::id_provider::mocks::SequentialIdProvider;
    use crate::port::invoker::mocks::RecordingInvoker;
    use crate::port::output_store::memory::InMemoryOutputStore;
    use crate::port::state_store::memory::InMemoryStateStore;
    use crate::port::time_provider::mocks::ManualTimeProvider;
    use std::time::Duration;
    use tokio_test::{assert_err, assert_ok};

    struct Fixture {
        state: Arc<InMemoryStateStore>,
        output: Arc<InMemoryOutputStore>,
        invoker: Arc<RecordingInvoker>,
        driver: DriverService,
    }

    fn fixture() -> Fixture {
        let clock = Arc::new(ManualTimeProvider::new(1_000));
        let state = Arc::new(InMemoryStateStore::new(clock.clone()));
        let output = Arc::new(InMemoryOutputStore::new());
        let invoker = Arc::new(RecordingInvoker::new());
        let driver = DriverService::new(
            state.clone(),
            output.clone(),
            invoker.clone(),
            Arc::new(SequentialIdProvider::new("job")),
            clock,
        )
        .with_converter(Arc::new(MockConverter::new(&["CD4"])))
        .with_retry(LocalRetry {
            max_attempts: 2,
            base_delay: Duration::from_millis(1),
        });
        Fixture {
            state,
            output,
            invoker,
            driver,
        }
    }

    fn request(n: usize) -> JobRequest {
        JobRequest {
            job_id: None,
            inputs: (0..n).map(|i| InputFile::new(format!("f{}", i))).collect(),
            destination: OutputDestination::new("merged/run"),
            params: MergeParams {
                format: "mock".into(),
                filter: Some("CD4 > 0".into()),
            },
        }
    }

    #[tokio::test]
    async fn test_submit_creates_state_and_one_map_invocation() {
        let f = fixture();

        let job_id = f.driver.submit(request(3)).await.unwrap();

        let job = f.driver.poll(&job_id).await.unwrap();
        assert_eq!(job.status, JobStatus::Submitted);
        assert_eq!(job.expected_units, None);
        assert_eq!(job.completed_units, 0);
        assert_eq!(f.invoker.count(Stage::Map), 1);

        match &f.invoker.invocations()[0] {
            StageInvocation::Map { job_id: id, request } => {
                assert_eq!(id, &job_id);
                assert_eq!(request.job_id.as_deref(), Some(job_id.as_str()));
            }
            other => panic!("unexpected invocation {:?}", other),
        }

        let events: Vec<String> = f
            .driver
            .timings(&job_id)
            .await
            .unwrap()
            .into_iter()
            .map(|t| t.event)
            .collect();
        assert!(events.contains(&"driver_started".to_string()));
        assert!(events.contains(&"driver_complete".to_string()));
    }

    #[tokio::test]
    async fn test_invalid_requests_rejected_synchronously() {
        let f = fixture();

        let empty = request(0);
        assert!(matches!(
            f.driver.submit(empty).await,
            Err(AppError::InvalidRequest(_))
        ));

        let mut bad_dest = request(1);
        bad_dest.destination = OutputDestination::new("../escape");
        assert_err!(f.driver.submit(bad_dest).await);

        let mut bad_format = request(1);
        bad_format.params.format = "parquet".into();
        assert_err!(f.driver.submit(bad_format).await);

        let mut bad_filter = request(1);
        bad_filter.params.filter = Some("CD4 >".into());
        assert_err!(f.driver.submit(bad_filter).await);

        assert!(f.invoker.invocations().is_empty());
    }

    #[tokio::test]
    async fn test_supplied_job_id_conflicts() {
        let f = fixture();

        let mut first = request(1);
        first.job_id = Some("fixed".into());
        assert_ok!(f.driver.submit(first.clone()).await);

        assert!(matches!(
            f.driver.submit(first).await,
            Err(AppError::InvalidRequest(_))
        ));
    }

    #[tokio::test]
    async fn test_existing_artifacts_conflict() {
        let f = fixture();
        let mut req = request(1);
        req.job_id = Some("old".into());
        f.output
            .write_chunk(&req.destination, "old", &ChunkKey::for_unit(0), vec![1])
            .await
            .unwrap();

        assert!(matches!(
            f.driver.submit(req).await,
            Err(AppError::InvalidRequest(_))
        ));
    }

    #[tokio::test]
    async fn test_dispatch_failure_marks_job_failed() {
        let f = fixture();
        f.invoker.inject_failures(5);

        let job_id = f.driver.submit(request(2)).await.unwrap();

        let job = f.state.get(&job_id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert!(job.failure_reason.unwrap().contains("mapper dispatch"));
    }

    #[tokio::test]
    async fn test_transient_dispatch_failure_is_retried() {
        let f = fixture();
        f.invoker.inject_failures(1);

        let job_id = f.driver.submit(request(2)).await.unwrap();
        assert_eq!(f.driver.poll(&job_id).await.unwrap().status, JobStatus::Submitted);
        assert_eq!(f.invoker.count(Stage::Map), 1);
    }

    #[tokio::test]
    async fn test_poll_unknown_job() {
        let f = fixture();
        assert!(matches!(
            f.driver.poll("nope").await,
            Err(AppError::NotFound(_))
        ));
    }
}
