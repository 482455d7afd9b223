// Stage worker - invocation execution loop

pub mod constants;
mod shutdown;

use constants::*;
pub use shutdown::{shutdown_channel, ShutdownSender, ShutdownToken};

use crate::application::pipeline::Pipeline;
use crate::application::retry::{RetryDecision, RetryPolicy};
use crate::domain::QueuedInvocation;
use crate::error::{AppError, Result};
use crate::port::InvocationQueue;
use std::sync::Arc;
use tokio::time::sleep;
use tracing::{debug, error, info, warn};

/// Pulls invocations from the queue and runs them through the pipeline
pub struct StageWorker {
    name: String,
    queue: Arc<dyn InvocationQueue>,
    pipeline: Arc<Pipeline>,
    retry_policy: Arc<RetryPolicy>,
}

impl StageWorker {
    pub fn new(
        name: impl Into<String>,
        queue: Arc<dyn InvocationQueue>,
        pipeline: Arc<Pipeline>,
        retry_policy: Arc<RetryPolicy>,
    ) -> Self {
        Self {
            name: name.into(),
            queue,
            pipeline,
            retry_policy,
        }
    }

    /// Run worker loop with graceful shutdown support
    pub async fn run(&self, mut shutdown: ShutdownToken) -> Result<()> {
        info!(worker = %self.name, "Stage worker started");
        loop {
            if shutdown.is_shutdown() {
                break;
            }
            match self.process_next().await {
                Ok(true) => {}
                Ok(false) => {
                    tokio::select! {
                        _ = sleep(IDLE_SLEEP_DURATION) => {},
                        _ = shutdown.wait() => {
                            info!(worker = %self.name, "Worker interrupted during idle");
                            break;
                        }
                    }
                }
                Err(e) => {
                    error!(worker = %self.name, error = %e, "Worker error");
                    tokio::select! {
                        _ = sleep(ERROR_RECOVERY_SLEEP_DURATION) => {},
                        _ = shutdown.wait() => {
                            info!(worker = %self.name, "Worker interrupted during error recovery");
                            break;
                        }
                    }
                }
            }
        }
        info!(worker = %self.name, "Stage worker stopped");
        Ok(())
    }

    /// Claim and run one invocation. Returns false when the queue is empty.
    pub async fn process_next(&self) -> Result<bool> {
        let claimed = match self.queue.pop_next().await? {
            Some(invocation) => invocation,
            None => return Ok(false),
        };

        debug!(
            worker = %self.name,
            invocation_id = %claimed.id,
            job_id = claimed.invocation.job_id(),
            stage = %claimed.invocation.stage(),
            attempt = claimed.attempts,
            "Invocation claimed"
        );

        // Spawned so a panicking stage cannot take the worker down
        let pipeline = Arc::clone(&self.pipeline);
        let invocation = claimed.invocation.clone();
        let handle = tokio::task::spawn(async move { pipeline.dispatch(&invocation).await });

        match handle.await {
            Ok(Ok(())) => {
                self.queue.ack(&claimed.id).await?;
            }
            Ok(Err(e)) => self.handle_failure(&claimed, e).await?,
            Err(join_err) => {
                let reason = if join_err.is_panic() {
                    "stage panicked"
                } else {
                    "stage cancelled"
                };
                error!(
                    invocation_id = %claimed.id,
                    job_id = claimed.invocation.job_id(),
                    error = ?join_err,
                    "Invocation aborted"
                );
                self.exhaust(&claimed, reason).await?;
            }
        }
        Ok(true)
    }

    async fn handle_failure(&self, claimed: &QueuedInvocation, e: AppError) -> Result<()> {
        warn!(
            invocation_id = %claimed.id,
            job_id = claimed.invocation.job_id(),
            stage = %claimed.invocation.stage(),
            attempt = claimed.attempts,
            error = %e,
            "Invocation failed"
        );
        match self.retry_policy.decide(claimed, &e) {
            RetryDecision::Retry { available_at, .. } => {
                self.queue
                    .requeue(&claimed.id, available_at, &e.to_string())
                    .await
            }
            RetryDecision::Exhausted => self.exhaust(claimed, &e.to_string()).await,
        }
    }

    async fn exhaust(&self, claimed: &QueuedInvocation, reason: &str) -> Result<()> {
        self.pipeline.on_exhausted(&claimed.invocation, reason).await;
        self.queue.fail(&claimed.id, reason).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::application::{
        ChunkLock, DeliveryBudget, DriverService, LocalRetry, LockPolicy, MapperService,
        QueueInvoker, ReducerService, WorkService,
    };
    use crate::domain::{
        InputFile, InvocationState, JobRequest, JobStatus, MergeParams, OutputDestination,
        UnitLimits,
    };
    use crate::port::converter::mocks::MockConverter;
    use crate::port::id_provider::mocks::SequentialIdProvider;
    use crate::port::invocation_queue::memory::InMemoryInvocationQueue;
    use crate::port::lock_store::memory::InMemoryLockStore;
    use crate::port::output_store::memory::InMemoryOutputStore;
    use crate::port::state_store::memory::InMemoryStateStore;
    use crate::port::time_provider::mocks::ManualTimeProvider;
    use std::time::Duration;

    struct Fixture {
        clock: Arc<ManualTimeProvider>,
        queue: Arc<InMemoryInvocationQueue>,
        converter: Arc<MockConverter>,
        driver: DriverService,
        worker: StageWorker,
    }

    fn fixture() -> Fixture {
        let clock = Arc::new(ManualTimeProvider::new(1_000));
        let ids = Arc::new(SequentialIdProvider::new("id"));
        let state = Arc::new(InMemoryStateStore::new(clock.clone()));
        let output = Arc::new(InMemoryOutputStore::new());
        let queue = Arc::new(InMemoryInvocationQueue::new(clock.clone(), ids.clone()));
        let converter = Arc::new(MockConverter::new(&["CD4"]));
        let invoker = Arc::new(QueueInvoker::new(queue.clone(), DeliveryBudget::default()));

        let lock = ChunkLock::new(
            Arc::new(InMemoryLockStore::new(clock.clone())),
            ids.clone(),
            LockPolicy::default(),
        );
        let pipeline = Arc::new(Pipeline::new(
            state.clone(),
            MapperService::new(state.clone(), invoker.clone(), UnitLimits::files(3)),
            WorkService::new(
                state.clone(),
                output.clone(),
                converter.clone(),
                invoker.clone(),
                lock,
                Duration::from_secs(5),
            ),
            ReducerService::new(state.clone(), output.clone(), clock.clone(), LocalRetry::default()),
        ));
        let worker = StageWorker::new(
            "w0",
            queue.clone(),
            pipeline,
            Arc::new(RetryPolicy::new(clock.clone(), 1_000)),
        );
        let driver = DriverService::new(state, output, invoker, ids, clock.clone());

        Fixture {
            clock,
            queue,
            converter,
            driver,
            worker,
        }
    }

    fn request(filter: Option<&str>) -> JobRequest {
        JobRequest {
            job_id: None,
            inputs: vec![InputFile::new("/in/0"), InputFile::new("/in/1")],
            destination: OutputDestination::new("merged/w"),
            params: MergeParams {
                format: "mock".into(),
                filter: filter.map(str::to_string),
            },
        }
    }

    async fn run_until_idle(worker: &StageWorker) -> usize {
        let mut processed = 0;
        while worker.process_next().await.unwrap() {
            processed += 1;
        }
        processed
    }

    #[tokio::test]
    async fn test_successful_stages_are_acknowledged() {
        let f = fixture();
        let job_id = f.driver.submit(request(None)).await.unwrap();

        // map, one work unit, reduce
        assert_eq!(run_until_idle(&f.worker).await, 3);
        assert_eq!(f.driver.poll(&job_id).await.unwrap().status, JobStatus::Done);
        assert_eq!(f.queue.count_by_state(InvocationState::Done).await.unwrap(), 3);
    }

    #[tokio::test]
    async fn test_retryable_failure_waits_for_backoff() {
        let f = fixture();
        f.converter.fail_times("/in/0", 1);
        let job_id = f.driver.submit(request(None)).await.unwrap();

        assert!(f.worker.process_next().await.unwrap()); // map
        assert!(f.worker.process_next().await.unwrap()); // work fails, requeued
        assert!(!f.worker.process_next().await.unwrap());
        assert_eq!(f.queue.count_by_state(InvocationState::Queued).await.unwrap(), 1);

        f.clock.advance(2_000);
        run_until_idle(&f.worker).await;
        assert_eq!(f.driver.poll(&job_id).await.unwrap().status, JobStatus::Done);
        assert_eq!(f.converter.calls(), 2);
    }

    #[tokio::test]
    async fn test_non_retryable_failure_dead_letters_and_fails_job() {
        let f = fixture();
        let job_id = f.driver.submit(request(Some("missing > 1"))).await.unwrap();

        run_until_idle(&f.worker).await;

        let job = f.driver.poll(&job_id).await.unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(f.queue.count_by_state(InvocationState::Failed).await.unwrap(), 1);
        assert_eq!(f.converter.calls(), 1);
    }

    #[tokio::test]
    async fn test_panicking_stage_is_contained() {
        let f = fixture();
        f.converter.panic_on("/in/1");
        let job_id = f.driver.submit(request(None)).await.unwrap();

        run_until_idle(&f.worker).await;

        let job = f.driver.poll(&job_id).await.unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert!(job.failure_reason.unwrap().contains("panicked"));
        assert_eq!(f.queue.count_by_state(InvocationState::Failed).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_run_exits_on_shutdown() {
        let f = fixture();
        let (sender, token) = shutdown_channel();
        let worker = f.worker;
        let handle = tokio::spawn(async move { worker.run(token).await });

        sender.shutdown();
        let result = tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .unwrap()
            .unwrap();
        assert!(result.is_ok());
    }
}
