// Retry logic: invocation redelivery decisions and local transient retry
use crate::domain::QueuedInvocation;
use crate::error::{AppError, Result};
use crate::port::TimeProvider;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

/// Default delivery budget per invocation
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;
/// Default base delay between deliveries
pub const DEFAULT_BASE_DELAY_MS: i64 = 1000;
/// Default exponential backoff factor
pub const DEFAULT_BACKOFF_FACTOR: f64 = 2.0;

/// Retry decision result
#[derive(Debug, PartialEq, Eq)]
pub enum RetryDecision {
    /// Redeliver, not before this epoch ms
    Retry { available_at: i64, delay_ms: i64 },
    /// Give up: dead-letter the invocation and fail the job
    Exhausted,
}

/// Redelivery policy for failed stage invocations
pub struct RetryPolicy {
    time_provider: Arc<dyn TimeProvider>,
    base_delay_ms: i64,
}

impl RetryPolicy {
    /// Create a new retry policy
    ///
    /// # Arguments
    /// * `time_provider` - Time provider for current time
    /// * `base_delay_ms` - Delay before the second delivery (default: 1000)
    pub fn new(time_provider: Arc<dyn TimeProvider>, base_delay_ms: i64) -> Self {
        Self {
            time_provider,
            base_delay_ms,
        }
    }

    /// Decide what happens to an invocation whose handler returned `error`.
    ///
    /// Backoff: `base_delay * backoff_factor ^ (attempts - 1)` with a ±10%
    /// jitter seeded by the invocation ID, so the same invocation always
    /// gets the same delay for a given attempt.
    pub fn decide(&self, invocation: &QueuedInvocation, error: &AppError) -> RetryDecision {
        if !error.is_retryable() {
            warn!(
                invocation_id = %invocation.id,
                error = %error,
                "Non-retryable error"
            );
            return RetryDecision::Exhausted;
        }

        if invocation.budget_exhausted() {
            warn!(
                invocation_id = %invocation.id,
                attempts = invocation.attempts,
                max_attempts = invocation.max_attempts,
                "Max delivery attempts reached"
            );
            return RetryDecision::Exhausted;
        }

        let delay_ms = self.delay_ms(invocation);
        let available_at = self.time_provider.now_millis() + delay_ms;

        info!(
            invocation_id = %invocation.id,
            attempt = invocation.attempts,
            max_attempts = invocation.max_attempts,
            delay_ms = delay_ms,
            "Scheduling redelivery"
        );

        RetryDecision::Retry {
            available_at,
            delay_ms,
        }
    }

    fn delay_ms(&self, invocation: &QueuedInvocation) -> i64 {
        let exponent = invocation.attempts.saturating_sub(1) as i32;
        let base = self.base_delay_ms as f64 * invocation.backoff_factor.powi(exponent);

        // Spread retries of simultaneous failures
        let jitter_seed = invocation.id.chars().map(|c| c as u32).sum::<u32>();
        let jitter_factor = 0.9 + ((jitter_seed % 21) as f64 / 100.0); // 0.9 to 1.1

        (base * jitter_factor) as i64
    }
}

/// Bounded local retry for transient store errors
#[derive(Debug, Clone, Copy)]
pub struct LocalRetry {
    pub max_attempts: u32,
    pub base_delay: Duration,
}

impl Default for LocalRetry {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(50),
        }
    }
}

impl LocalRetry {
    /// Run `op`, retrying transient failures (`AppError::is_transient`)
    /// with doubling delay. Other errors return immediately.
    pub async fn run<T, F, Fut>(&self, what: &str, mut op: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut delay = self.base_delay;
        let mut attempt = 1;
        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_transient() && attempt < self.max_attempts => {
                    warn!(
                        operation = what,
                        attempt = attempt,
                        error = %e,
                        "Transient failure, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    delay *= 2;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}
