// Invocation Queue Port (Interface)
// Durable at-least-once queue of stage invocations

use crate::domain::{InvocationId, InvocationState, QueuedInvocation, StageInvocation};
use crate::error::Result;
use async_trait::async_trait;

#[async_trait]
pub trait InvocationQueue: Send + Sync {
    /// Persist a new invocation, available immediately
    async fn enqueue(
        &self,
        invocation: &StageInvocation,
        max_attempts: u32,
        backoff_factor: f64,
    ) -> Result<InvocationId>;

    /// Claim the oldest available invocation (QUEUED -> RUNNING, attempts + 1)
    async fn pop_next(&self) -> Result<Option<QueuedInvocation>>;

    /// Acknowledge successful execution
    async fn ack(&self, id: &str) -> Result<()>;

    /// Return to the queue, invisible until `available_at` (epoch ms)
    async fn requeue(&self, id: &str, available_at: i64, error: &str) -> Result<()>;

    /// Dead-letter after the retry budget is exhausted
    async fn fail(&self, id: &str, error: &str) -> Result<()>;

    /// Redeliver invocations claimed before `started_before` and never
    /// acknowledged (worker crashed). Returns how many were requeued.
    async fn requeue_orphaned(&self, started_before: i64) -> Result<u64>;

    async fn count_by_state(&self, state: InvocationState) -> Result<i64>;
}

pub mod memory {
    use super::*;
    use crate::error::AppError;
    use crate::port::{IdProvider, TimeProvider};
    use std::sync::{Arc, Mutex};

    #[derive(Debug, Clone)]
    struct Entry {
        queued: QueuedInvocation,
        state: InvocationState,
        available_at: i64,
        last_error: Option<String>,
    }

    pub struct InMemoryInvocationQueue {
        entries: Mutex<Vec<Entry>>,
        time_provider: Arc<dyn TimeProvider>,
        id_provider: Arc<dyn IdProvider>,
    }

    impl InMemoryInvocationQueue {
        pub fn new(time_provider: Arc<dyn TimeProvider>, id_provider: Arc<dyn IdProvider>) -> Self {
            Self {
                entries: Mutex::new(Vec::new()),
                time_provider,
                id_provider,
            }
        }

        pub fn last_error(&self, id: &str) -> Option<String> {
            self.lock()
                .iter()
                .find(|e| e.queued.id == id)
                .and_then(|e| e.last_error.clone())
        }

        fn lock(&self) -> std::sync::MutexGuard<'_, Vec<Entry>> {
            self.entries
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner())
        }

        fn update<F>(&self, id: &str, f: F) -> Result<()>
        where
            F: FnOnce(&mut Entry),
        {
            let mut entries = self.lock();
            let entry = entries
                .iter_mut()
                .find(|e| e.queued.id == id)
                .ok_or_else(|| AppError::NotFound(format!("Invocation {} not found", id)))?;
            f(entry);
            Ok(())
        }
    }

    #[async_trait]
    impl InvocationQueue for InMemoryInvocationQueue {
        async fn enqueue(
            &self,
            invocation: &StageInvocation,
            max_attempts: u32,
            backoff_factor: f64,
        ) -> Result<InvocationId> {
            let now = self.time_provider.now_millis();
            let id = self.id_provider.generate_id();
            self.lock().push(Entry {
                queued: QueuedInvocation {
                    id: id.clone(),
                    invocation: invocation.clone(),
                    attempts: 0,
                    max_attempts,
                    backoff_factor,
                    created_at: now,
                    started_at: None,
                },
                state: InvocationState::Queued,
                available_at: now,
                last_error: None,
            });
            Ok(id)
        }

        async fn pop_next(&self) -> Result<Option<QueuedInvocation>> {
            let now = self.time_provider.now_millis();
            let mut entries = self.lock();
            let next = entries
                .iter_mut()
                .filter(|e| e.state == InvocationState::Queued && e.available_at <= now)
                .min_by_key(|e| (e.available_at, e.queued.created_at));
            Ok(next.map(|entry| {
                entry.state = InvocationState::Running;
                entry.queued.attempts += 1;
                entry.queued.started_at = Some(now);
                entry.queued.clone()
            }))
        }

        async fn ack(&self, id: &str) -> Result<()> {
            self.update(id, |e| e.state = InvocationState::Done)
        }

        async fn requeue(&self, id: &str, available_at: i64, error: &str) -> Result<()> {
            self.update(id, |e| {
                e.state = InvocationState::Queued;
                e.available_at = available_at;
                e.queued.started_at = None;
                e.last_error = Some(error.to_string());
            })
        }

        async fn fail(&self, id: &str, error: &str) -> Result<()> {
            self.update(id, |e| {
                e.state = InvocationState::Failed;
                e.last_error = Some(error.to_string());
            })
        }

        async fn requeue_orphaned(&self, started_before: i64) -> Result<u64> {
            let now = self.time_provider.now_millis();
            let mut count = 0;
            for entry in self.lock().iter_mut() {
                let orphaned = entry.state == InvocationState::Running
                    && entry.queued.started_at.map_or(false, |t| t < started_before);
                if orphaned {
                    entry.state = InvocationState::Queued;
                    entry.available_at = now;
                    entry.queued.started_at = None;
                    count += 1;
                }
            }
            Ok(count)
        }

        async fn count_by_state(&self, state: InvocationState) -> Result<i64> {
            Ok(self.lock().iter().filter(|e| e.state == state).count() as i64)
        }
    }
}
