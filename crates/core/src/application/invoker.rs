// Stage invoker backed by the durable invocation queue
use crate::application::retry::{DEFAULT_BACKOFF_FACTOR, DEFAULT_MAX_ATTEMPTS};
use crate::domain::StageInvocation;
use crate::error::Result;
use crate::port::{InvocationQueue, StageInvoker};
use async_trait::async_trait;
use std::sync::Arc;
use tracing::debug;

/// Delivery budget stamped on every enqueued invocation
#[derive(Debug, Clone, Copy)]
pub struct DeliveryBudget {
    pub max_attempts: u32,
    pub backoff_factor: f64,
}

impl Default for DeliveryBudget {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            backoff_factor: DEFAULT_BACKOFF_FACTOR,
        }
    }
}

pub struct QueueInvoker {
    queue: Arc<dyn InvocationQueue>,
    budget: DeliveryBudget,
}

impl QueueInvoker {
    pub fn new(queue: Arc<dyn InvocationQueue>, budget: DeliveryBudget) -> Self {
        Self { queue, budget }
    }
}

#[async_trait]
impl StageInvoker for QueueInvoker {
    async fn invoke(&self, invocation: StageInvocation) -> Result<()> {
        let id = self
            .queue
            .enqueue(
                &invocation,
                self.budget.max_attempts,
                self.budget.backoff_factor,
            )
            .await?;
        debug!(
            invocation_id = %id,
            job_id = invocation.job_id(),
            stage = %invocation.stage(),
            "Invocation enqueued"
        );
        Ok(())
    }
}
