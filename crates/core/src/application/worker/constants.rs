// Worker constants (no magic values)
use std::time::Duration;

/// Sleep duration when no invocations are available (100ms)
pub const IDLE_SLEEP_DURATION: Duration = Duration::from_millis(100);

/// Sleep duration after worker error before retry (1s)
pub const ERROR_RECOVERY_SLEEP_DURATION: Duration = Duration::from_secs(1);

/// Default visibility timeout for claimed invocations (15 minutes).
/// Must exceed the convert timeout plus the chunk lock wait.
pub const DEFAULT_VISIBILITY_TIMEOUT_MS: i64 = 15 * 60 * 1000;

/// A job left in Reducing for longer may be finished by another Reduce (10 minutes)
pub const DEFAULT_REDUCE_TAKEOVER_MS: i64 = 10 * 60 * 1000;

/// Default job stall timeout (30 minutes)
pub const DEFAULT_STALL_TIMEOUT_MS: i64 = 30 * 60 * 1000;

/// Default number of concurrent stage workers
pub const DEFAULT_WORKER_COUNT: usize = 4;
