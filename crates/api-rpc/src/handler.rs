//! RPC Method Handlers
//!
//! Thin adapters from JSON-RPC params onto the Driver and stores.

use crate::error::to_rpc_error;
use crate::types::{
    JobIdRequest, PollResponse, StatsRequest, StatsResponse, SubmitRequest, SubmitResponse,
    TimingsResponse,
};
use jsonrpsee::types::ErrorObjectOwned;
use mergeflow_core::application::DriverService;
use mergeflow_core::domain::{InvocationState, JobStatus};
use mergeflow_core::port::{InvocationQueue, Maintenance, StateStore};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::info;

/// RPC Handler with injected dependencies
pub struct RpcHandler {
    driver: Arc<DriverService>,
    state: Arc<dyn StateStore>,
    queue: Arc<dyn InvocationQueue>,
    maintenance: Arc<dyn Maintenance>,
    start_time: std::time::Instant,
}

impl RpcHandler {
    pub fn new(
        driver: Arc<DriverService>,
        state: Arc<dyn StateStore>,
        queue: Arc<dyn InvocationQueue>,
        maintenance: Arc<dyn Maintenance>,
    ) -> Self {
        Self {
            driver,
            state,
            queue,
            maintenance,
            start_time: std::time::Instant::now(),
        }
    }

    /// job.submit.v1
    pub async fn submit(&self, params: SubmitRequest) -> Result<SubmitResponse, ErrorObjectOwned> {
        let job_id = self
            .driver
            .submit(params.into())
            .await
            .map_err(to_rpc_error)?;

        // Mapper dispatch failure is reported through the status, not an error
        let job = self.driver.poll(&job_id).await.map_err(to_rpc_error)?;
        info!(job_id = %job_id, status = %job.status, "Job submitted via RPC");

        Ok(SubmitResponse {
            job_id,
            status: job.status.to_string(),
        })
    }

    /// job.poll.v1
    pub async fn poll(&self, params: JobIdRequest) -> Result<PollResponse, ErrorObjectOwned> {
        self.driver.poll(&params.job_id).await.map_err(to_rpc_error)
    }

    /// job.timings.v1
    pub async fn timings(&self, params: JobIdRequest) -> Result<TimingsResponse, ErrorObjectOwned> {
        let records = self
            .driver
            .timings(&params.job_id)
            .await
            .map_err(to_rpc_error)?;

        Ok(TimingsResponse {
            job_id: params.job_id,
            timings: records.into_iter().map(Into::into).collect(),
        })
    }

    /// admin.stats.v1
    pub async fn stats(&self, _params: StatsRequest) -> Result<StatsResponse, ErrorObjectOwned> {
        let mut jobs_by_status = BTreeMap::new();
        for status in JobStatus::ALL {
            let count = self
                .state
                .count_by_status(status)
                .await
                .map_err(to_rpc_error)?;
            jobs_by_status.insert(status.to_string(), count);
        }

        let queued_invocations = self.count_invocations(InvocationState::Queued).await?;
        let running_invocations = self.count_invocations(InvocationState::Running).await?;
        let dead_letters = self.count_invocations(InvocationState::Failed).await?;

        // Get maintenance stats for DB size
        let stats = self.maintenance.get_stats().await.map_err(to_rpc_error)?;

        Ok(StatsResponse {
            total_jobs: jobs_by_status.values().sum(),
            jobs_by_status,
            queued_invocations,
            running_invocations,
            dead_letters,
            db_size_bytes: stats.db_size_bytes,
            uptime_seconds: self.start_time.elapsed().as_secs() as i64,
        })
    }

    async fn count_invocations(&self, state: InvocationState) -> Result<i64, ErrorObjectOwned> {
        self.queue.count_by_state(state).await.map_err(to_rpc_error)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::code;
    use tokio_test::{assert_err, assert_ok};
    use mergeflow_core::application::{DeliveryBudget, QueueInvoker};
    use mergeflow_core::domain::InputFile;
    use mergeflow_core::port::id_provider::mocks::SequentialIdProvider;
    use mergeflow_core::port::invocation_queue::memory::InMemoryInvocationQueue;
    use mergeflow_core::port::maintenance::MaintenanceStats;
    use mergeflow_core::port::output_store::memory::InMemoryOutputStore;
    use mergeflow_core::port::state_store::memory::InMemoryStateStore;
    use mergeflow_core::port::time_provider::mocks::ManualTimeProvider;
    use mergeflow_core::Result;

    struct NoopMaintenance;

    #[async_trait::async_trait]
    impl Maintenance for NoopMaintenance {
        async fn vacuum(&self) -> Result<f64> {
            Ok(0.0)
        }
        async fn gc_finished_jobs(&self, _retention_days: i64) -> Result<i64> {
            Ok(0)
        }
        async fn gc_invocations(&self, _retention_days: i64) -> Result<i64> {
            Ok(0)
        }
        async fn gc_expired_locks(&self) -> Result<i64> {
            Ok(0)
        }
        async fn get_stats(&self) -> Result<MaintenanceStats> {
            Ok(MaintenanceStats {
                db_size_bytes: 4096,
                ..Default::default()
            })
        }
    }

    fn handler() -> RpcHandler {
        let clock = Arc::new(ManualTimeProvider::new(1_000));
        let state = Arc::new(InMemoryStateStore::new(clock.clone()));
        let queue = Arc::new(InMemoryInvocationQueue::new(
            clock.clone(),
            Arc::new(SequentialIdProvider::new("inv")),
        ));
        let driver = DriverService::new(
            state.clone(),
            Arc::new(InMemoryOutputStore::new()),
            Arc::new(QueueInvoker::new(queue.clone(), DeliveryBudget::default())),
            Arc::new(SequentialIdProvider::new("job")),
            clock,
        );
        RpcHandler::new(Arc::new(driver), state, queue, Arc::new(NoopMaintenance))
    }

    fn submit_request() -> SubmitRequest {
        SubmitRequest {
            job_id: None,
            inputs: vec![InputFile::new("a.tsv"), InputFile::new("b.tsv")],
            destination: "merged/run".into(),
            format: "tsv".into(),
            filter: Some("CD4 > 0.5".into()),
        }
    }

    #[tokio::test]
    async fn test_submit_then_poll_and_timings() {
        let h = handler();
        let submitted = assert_ok!(h.submit(submit_request()).await);
        assert_eq!(submitted.status, "SUBMITTED");

        let job = h
            .poll(JobIdRequest {
                job_id: submitted.job_id.clone(),
            })
            .await
            .unwrap();
        assert_eq!(job.input_count, 2);

        let timings = h
            .timings(JobIdRequest {
                job_id: submitted.job_id,
            })
            .await
            .unwrap();
        let events: Vec<&str> = timings.timings.iter().map(|t| t.event.as_str()).collect();
        assert!(events.contains(&"driver_started"));
        assert!(events.contains(&"driver_complete"));
    }

    #[tokio::test]
    async fn test_invalid_submit_and_unknown_job() {
        let h = handler();
        let mut bad = submit_request();
        bad.inputs.clear();
        assert_eq!(h.submit(bad).await.unwrap_err().code(), code::INVALID_REQUEST);

        let err = assert_err!(
            h.poll(JobIdRequest {
                job_id: "missing".into(),
            })
            .await
        );
        assert_eq!(err.code(), code::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_stats_counts_jobs_and_invocations() {
        let h = handler();
        h.submit(submit_request()).await.unwrap();
        h.submit(submit_request()).await.unwrap();

        let stats = h.stats(StatsRequest::default()).await.unwrap();
        assert_eq!(stats.total_jobs, 2);
        assert_eq!(stats.jobs_by_status["SUBMITTED"], 2);
        assert_eq!(stats.jobs_by_status["DONE"], 0);
        assert_eq!(stats.queued_invocations, 2);
        assert_eq!(stats.dead_letters, 0);
        assert_eq!(stats.db_size_bytes, 4096);
    }
}
