// Stage Invoker Port (Interface)
// Fire-and-forget asynchronous invocation of a pipeline stage

use crate::domain::StageInvocation;
use crate::error::Result;
use async_trait::async_trait;

#[async_trait]
pub trait StageInvoker: Send + Sync {
    /// Hand the invocation to the platform. Returns once it is durably
    /// accepted, not once it ran. Delivery is at-least-once.
    async fn invoke(&self, invocation: StageInvocation) -> Result<()>;
}

pub mod mocks {
    use super::*;
    use crate::domain::Stage;
    use crate::error::AppError;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    /// Records invocations instead of running them
    #[derive(Default)]
    pub struct RecordingInvoker {
        invocations: Mutex<Vec<StageInvocation>>,
        failures_to_inject: AtomicUsize,
    }

    impl RecordingInvoker {
        pub fn new() -> Self {
            Self::default()
        }

        /// Make the next `count` invokes fail with a storage error
        pub fn inject_failures(&self, count: usize) {
            self.failures_to_inject.store(count, Ordering::SeqCst);
        }

        pub fn invocations(&self) -> Vec<StageInvocation> {
            self.lock().clone()
        }

        pub fn count(&self, stage: Stage) -> usize {
            self.lock().iter().filter(|i| i.stage() == stage).count()
        }

        /// Remove and return everything recorded so far
        pub fn drain(&self) -> Vec<StageInvocation> {
            std::mem::take(&mut *self.lock())
        }

        fn lock(&self) -> std::sync::MutexGuard<'_, Vec<StageInvocation>> {
            self.invocations
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner())
        }
    }

    #[async_trait]
    impl StageInvoker for RecordingInvoker {
        async fn invoke(&self, invocation: StageInvocation) -> Result<()> {
            let injected = self
                .failures_to_inject
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
            if injected.is_ok() {
                return Err(AppError::Storage("injected invoke failure".to_string()));
            }
            self.lock().push(invocation);
            Ok(())
        }
    }
}
