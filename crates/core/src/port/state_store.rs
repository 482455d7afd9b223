// State Store Port (Interface)
// Durable key-value record of job status, unit counters and timings.

use crate::domain::{JobId, JobState, JobStatus, TimingEvent, TimingRecord};
use crate::error::Result;
use async_trait::async_trait;

/// Outcome of recording one unit completion
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnitCompletion {
    /// Marker written and counter incremented
    Recorded { completed_units: u64 },
    /// Marker already present (duplicate delivery); counter untouched
    Duplicate,
    /// Job is terminal or not yet expecting units; counter untouched
    Rejected,
}

/// State store interface. Every mutation is atomic in the store itself:
/// no caller performs read-then-write.
#[async_trait]
pub trait StateStore: Send + Sync {
    /// Insert a new job record (Conflict if the job ID exists)
    async fn insert(&self, state: &JobState) -> Result<()>;

    /// Find job by ID
    async fn get(&self, job_id: &str) -> Result<Option<JobState>>;

    /// Single-winner status transition. Returns false if the current status
    /// is not `from`. Entering a terminal status sets `completed_at`.
    async fn compare_and_set_status(
        &self,
        job_id: &str,
        from: JobStatus,
        to: JobStatus,
    ) -> Result<bool>;

    /// `Mapping -> Working` while setting `expected_units`. Refused when a
    /// different `expected_units` was already recorded.
    async fn begin_working(&self, job_id: &str, expected_units: u64) -> Result<bool>;

    /// Write the `(job_id, unit_index)` completion marker and increment
    /// `completed_units` in one atomic step.
    async fn complete_unit(&self, job_id: &str, unit_index: u64) -> Result<UnitCompletion>;

    /// Any non-terminal status -> Failed. Returns false if already terminal.
    async fn mark_failed(&self, job_id: &str, reason: &str) -> Result<bool>;

    /// Record (or overwrite) a timing event
    async fn record_timing(&self, job_id: &str, event: TimingEvent) -> Result<()>;

    /// Timing events of a job, oldest first
    async fn timings(&self, job_id: &str) -> Result<Vec<TimingRecord>>;

    /// Non-terminal jobs whose last state change is older than `updated_before`
    async fn find_stalled(&self, updated_before: i64) -> Result<Vec<JobState>>;

    /// Count jobs by status
    async fn count_by_status(&self, status: JobStatus) -> Result<i64>;
}

// ============================================================================
// In-memory implementation (tests, embedded use)
// ============================================================================

pub mod memory {
    use super::*;
    use crate::domain::DomainError;
    use crate::error::AppError;
    use crate::port::TimeProvider;
    use std::collections::{HashMap, HashSet};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};

    #[derive(Default)]
    struct Inner {
        jobs: HashMap<JobId, JobState>,
        markers: HashSet<(JobId, u64)>,
        timings: Vec<TimingRecord>,
    }

    pub struct InMemoryStateStore {
        inner: Mutex<Inner>,
        time_provider: Arc<dyn TimeProvider>,
        failures_to_inject: AtomicUsize,
    }

    impl InMemoryStateStore {
        pub fn new(time_provider: Arc<dyn TimeProvider>) -> Self {
            Self {
                inner: Mutex::new(Inner::default()),
                time_provider,
                failures_to_inject: AtomicUsize::new(0),
            }
        }

        /// Make the next `count` mutations fail with a storage error
        pub fn inject_storage_failures(&self, count: usize) {
            self.failures_to_inject.store(count, Ordering::SeqCst);
        }

        fn check_injected_failure(&self) -> Result<()> {
            let injected = self
                .failures_to_inject
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
            match injected {
                Ok(_) => Err(AppError::Storage("injected storage failure".to_string())),
                Err(_) => Ok(()),
            }
        }

        fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
            self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
        }
    }

    #[async_trait]
    impl StateStore for InMemoryStateStore {
        async fn insert(&self, state: &JobState) -> Result<()> {
            self.check_injected_failure()?;
            let mut inner = self.lock();
            if inner.jobs.contains_key(&state.job_id) {
                return Err(AppError::Conflict(format!(
                    "Job {} already exists",
                    state.job_id
                )));
            }
            inner.jobs.insert(state.job_id.clone(), state.clone());
            Ok(())
        }

        async fn get(&self, job_id: &str) -> Result<Option<JobState>> {
            Ok(self.lock().jobs.get(job_id).cloned())
        }

        async fn compare_and_set_status(
            &self,
            job_id: &str,
            from: JobStatus,
            to: JobStatus,
        ) -> Result<bool> {
            if !from.can_transition_to(to) {
                return Err(DomainError::InvalidStateTransition {
                    from: from.to_string(),
                    to: to.to_string(),
                }
                .into());
            }
            self.check_injected_failure()?;
            let now = self.time_provider.now_millis();
            let mut inner = self.lock();
            match inner.jobs.get_mut(job_id) {
                Some(job) if job.status == from => {
                    job.transition(to, now)?;
                    Ok(true)
                }
                Some(_) => Ok(false),
                None => Err(AppError::NotFound(format!("Job {} not found", job_id))),
            }
        }

        async fn begin_working(&self, job_id: &str, expected_units: u64) -> Result<bool> {
            self.check_injected_failure()?;
            let now = self.time_provider.now_millis();
            let mut inner = self.lock();
            let job = inner
                .jobs
                .get_mut(job_id)
                .ok_or_else(|| AppError::NotFound(format!("Job {} not found", job_id)))?;

            let compatible = job.expected_units.map_or(true, |e| e == expected_units);
            if job.status != JobStatus::Mapping || !compatible {
                return Ok(false);
            }
            job.expected_units = Some(expected_units);
            job.transition(JobStatus::Working, now)?;
            Ok(true)
        }

        async fn complete_unit(&self, job_id: &str, unit_index: u64) -> Result<UnitCompletion> {
            self.check_injected_failure()?;
            let now = self.time_provider.now_millis();
            let mut inner = self.lock();
            let marker = (job_id.to_string(), unit_index);
            if inner.markers.contains(&marker) {
                return Ok(UnitCompletion::Duplicate);
            }
            let job = inner
                .jobs
                .get_mut(job_id)
                .ok_or_else(|| AppError::NotFound(format!("Job {} not found", job_id)))?;

            match job.record_completion(now) {
                Ok(completed_units) => {
                    inner.markers.insert(marker);
                    Ok(UnitCompletion::Recorded { completed_units })
                }
                Err(_) => Ok(UnitCompletion::Rejected),
            }
        }

        async fn mark_failed(&self, job_id: &str, reason: &str) -> Result<bool> {
            self.check_injected_failure()?;
            let now = self.time_provider.now_millis();
            let mut inner = self.lock();
            match inner.jobs.get_mut(job_id) {
                Some(job) if !job.status.is_terminal() => {
                    job.fail(reason, now)?;
                    Ok(true)
                }
                Some(_) => Ok(false),
                None => Err(AppError::NotFound(format!("Job {} not found", job_id))),
            }
        }

        async fn record_timing(&self, job_id: &str, event: TimingEvent) -> Result<()> {
            let now = self.time_provider.now_millis();
            let key = event.key();
            let mut inner = self.lock();
            inner
                .timings
                .retain(|t| !(t.job_id == job_id && t.event == key));
            inner.timings.push(TimingRecord {
                job_id: job_id.to_string(),
                event: key,
                at: now,
            });
            Ok(())
        }

        async fn timings(&self, job_id: &str) -> Result<Vec<TimingRecord>> {
            let mut records: Vec<TimingRecord> = self
                .lock()
                .timings
                .iter()
                .filter(|t| t.job_id == job_id)
                .cloned()
                .collect();
            records.sort_by_key(|t| t.at);
            Ok(records)
        }

        async fn find_stalled(&self, updated_before: i64) -> Result<Vec<JobState>> {
            let mut stalled: Vec<JobState> = self
                .lock()
                .jobs
                .values()
                .filter(|j| !j.status.is_terminal() && j.updated_at < updated_before)
                .cloned()
                .collect();
            stalled.sort_by_key(|j| j.updated_at);
            Ok(stalled)
        }

        async fn count_by_status(&self, status: JobStatus) -> Result<i64> {
            Ok(self
                .lock()
                .jobs
                .values()
                .filter(|j| j.status == status)
                .count() as i64)
        }
    }
}
