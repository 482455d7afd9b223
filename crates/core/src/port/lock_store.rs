// Lock Store Port (Interface)
// Per-chunk mutual exclusion with lease expiry

use crate::error::Result;
use async_trait::async_trait;
use std::time::Duration;

#[async_trait]
pub trait LockStore: Send + Sync {
    /// Take the lease on `lock_key`.
    ///
    /// Succeeds when the key is absent, its lease has expired, or it is
    /// already held by `holder` (the lease is then extended). Never blocks.
    async fn try_acquire(&self, lock_key: &str, holder: &str, ttl: Duration) -> Result<bool>;

    /// Release the lease if still held by `holder`. Returns false otherwise.
    async fn release(&self, lock_key: &str, holder: &str) -> Result<bool>;
}

pub mod memory {
    use super::*;
    use crate::port::TimeProvider;
    use std::collections::HashMap;
    use std::sync::{Arc, Mutex};

    #[derive(Debug, Clone)]
    struct Lease {
        holder: String,
        acquired_at: i64,
        expires_at: i64,
    }

    pub struct InMemoryLockStore {
        leases: Mutex<HashMap<String, Lease>>,
        time_provider: Arc<dyn TimeProvider>,
    }

    impl InMemoryLockStore {
        pub fn new(time_provider: Arc<dyn TimeProvider>) -> Self {
            Self {
                leases: Mutex::new(HashMap::new()),
                time_provider,
            }
        }

        /// Current holder, ignoring expiry
        pub fn holder_of(&self, lock_key: &str) -> Option<String> {
            self.leases
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner())
                .get(lock_key)
                .map(|lease| lease.holder.clone())
        }

        /// When the current holder first took the lock
        pub fn acquired_at_of(&self, lock_key: &str) -> Option<i64> {
            self.leases
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner())
                .get(lock_key)
                .map(|lease| lease.acquired_at)
        }
    }

    #[async_trait]
    impl LockStore for InMemoryLockStore {
        async fn try_acquire(&self, lock_key: &str, holder: &str, ttl: Duration) -> Result<bool> {
            let now = self.time_provider.now_millis();
            let mut leases = self
                .leases
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());

            let (available, acquired_at) = match leases.get(lock_key) {
                None => (true, now),
                // Extending our own lease keeps the original acquisition time
                Some(lease) if lease.holder == holder => (true, lease.acquired_at),
                Some(lease) => (lease.expires_at <= now, now),
            };
            if available {
                leases.insert(
                    lock_key.to_string(),
                    Lease {
                        holder: holder.to_string(),
                        acquired_at,
                        expires_at: now + ttl.as_millis() as i64,
                    },
                );
            }
            Ok(available)
        }

        async fn release(&self, lock_key: &str, holder: &str) -> Result<bool> {
            let mut leases = self
                .leases
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            match leases.get(lock_key) {
                Some(lease) if lease.holder == holder => {
                    leases.remove(lock_key);
                    Ok(true)
                }
                _ => Ok(false),
            }
        }
    }
}
