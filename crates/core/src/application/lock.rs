// Chunk lock: bounded acquisition with jittered backoff, release on every path
use crate::error::{AppError, Result};
use crate::port::{IdProvider, LockStore};
use rand::Rng;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Lock acquisition policy
#[derive(Debug, Clone, Copy)]
pub struct LockPolicy {
    /// Lease length; a crashed holder's lock is reclaimable after this
    pub ttl: Duration,
    pub max_attempts: u32,
    pub base_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for LockPolicy {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(60),
            max_attempts: 10,
            base_backoff: Duration::from_millis(50),
            max_backoff: Duration::from_secs(2),
        }
    }
}

impl LockPolicy {
    /// Longest time `acquire` can spend sleeping before giving up,
    /// jitter included
    pub fn max_wait(&self) -> Duration {
        let mut total = Duration::ZERO;
        let mut backoff = self.base_backoff;
        for _ in 1..self.max_attempts {
            total += backoff + backoff / 2;
            backoff = (backoff * 2).min(self.max_backoff);
        }
        total
    }
}

pub struct ChunkLock {
    store: Arc<dyn LockStore>,
    id_provider: Arc<dyn IdProvider>,
    policy: LockPolicy,
}

impl ChunkLock {
    pub fn new(store: Arc<dyn LockStore>, id_provider: Arc<dyn IdProvider>, policy: LockPolicy) -> Self {
        Self {
            store,
            id_provider,
            policy,
        }
    }

    /// Run `critical` while holding `lock_key`.
    ///
    /// Fails with `LockContentionTimeout` once the attempt budget is spent.
    /// The lock is released whether `critical` succeeds or fails; a failed
    /// release is logged and left to lease expiry.
    pub async fn with_lock<T, F, Fut>(&self, lock_key: &str, critical: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let holder = self.id_provider.generate_id();
        self.acquire(lock_key, &holder).await?;

        let result = critical().await;

        match self.store.release(lock_key, &holder).await {
            Ok(true) => debug!(lock_key = lock_key, "Lock released"),
            Ok(false) => warn!(
                lock_key = lock_key,
                holder = %holder,
                "Lock lease lost before release"
            ),
            Err(e) => warn!(
                lock_key = lock_key,
                error = %e,
                "Failed to release lock, leaving it to expire"
            ),
        }

        result
    }

    async fn acquire(&self, lock_key: &str, holder: &str) -> Result<()> {
        let mut backoff = self.policy.base_backoff;
        for attempt in 1..=self.policy.max_attempts {
            if self.store.try_acquire(lock_key, holder, self.policy.ttl).await? {
                debug!(lock_key = lock_key, attempt = attempt, "Lock acquired");
                return Ok(());
            }
            if attempt == self.policy.max_attempts {
                break;
            }

            let jitter_ms = rand::thread_rng().gen_range(0..=backoff.as_millis() as u64 / 2);
            tokio::time::sleep(backoff + Duration::from_millis(jitter_ms)).await;
            backoff = (backoff * 2).min(self.policy.max_backoff);
        }

        warn!(
            lock_key = lock_key,
            attempts = self.policy.max_attempts,
            "Lock contention timeout"
        );
        Err(AppError::LockContentionTimeout {
            lock_key: lock_key.to_string(),
            attempts: self.policy.max_attempts,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::port::id_provider::mocks::SequentialIdProvider;
    use crate::port::lock_store::memory::InMemoryLockStore;
    use crate::port::time_provider::mocks::ManualTimeProvider;
    use crate::port::time_provider::SystemTimeProvider;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    fn fast_policy(max_attempts: u32) -> LockPolicy {
        LockPolicy {
            ttl: Duration::from_secs(60),
            max_attempts,
            base_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(4),
        }
    }

    #[tokio::test]
    async fn test_released_after_failure() {
        let store = Arc::new(InMemoryLockStore::new(Arc::new(ManualTimeProvider::new(0))));
        let lock = ChunkLock::new(
            store.clone(),
            Arc::new(SequentialIdProvider::new("holder")),
            fast_policy(3),
        );

        let result: Result<()> = lock
            .with_lock("j/unit-000000", || async {
                Err(AppError::Storage("write failed".into()))
            })
            .await;

        assert!(result.is_err());
        assert_eq!(store.holder_of("j/unit-000000"), None);
    }

    #[tokio::test]
    async fn test_contention_timeout() {
        let store = Arc::new(InMemoryLockStore::new(Arc::new(ManualTimeProvider::new(0))));
        store
            .try_acquire("k", "someone-else", Duration::from_secs(60))
            .await
            .unwrap();
        let lock = ChunkLock::new(
            store,
            Arc::new(SequentialIdProvider::new("holder")),
            fast_policy(3),
        );

        let result = lock.with_lock("k", || async { Ok(()) }).await;
        assert!(matches!(
            result,
            Err(AppError::LockContentionTimeout { attempts: 3, .. })
        ));
    }

    #[tokio::test]
    async fn test_mutual_exclusion_under_concurrency() {
        let store: Arc<dyn LockStore> = Arc::new(InMemoryLockStore::new(Arc::new(SystemTimeProvider)));
        let lock = Arc::new(ChunkLock::new(
            store,
            Arc::new(SequentialIdProvider::new("holder")),
            fast_policy(1000),
        ));
        let inside = Arc::new(AtomicBool::new(false));
        let entered = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let lock = lock.clone();
            let inside = inside.clone();
            let entered = entered.clone();
            handles.push(tokio::spawn(async move {
                lock.with_lock("shared", || async {
                    assert!(!inside.swap(true, Ordering::SeqCst), "two holders at once");
                    tokio::time::sleep(Duration::from_millis(2)).await;
                    inside.store(false, Ordering::SeqCst);
                    entered.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                })
                .await
            }));
        }

        for handle in handles {
            handle.await.unwrap().unwrap();
        }
        assert_eq!(entered.load(Ordering::SeqCst), 8);
    }

    #[test]
    fn test_max_wait_follows_capped_backoff() {
        // 50 100 200 400 800 1600 then capped at 2000, each plus half again
        assert_eq!(LockPolicy::default().max_wait(), Duration::from_millis(13_725));
        assert_eq!(fast_policy(1).max_wait(), Duration::ZERO);
        // 1 2 4 4 with jitter: 1.5 + 3 + 6 + 6
        assert_eq!(fast_policy(5).max_wait(), Duration::from_micros(16_500));
    }
}
