// Application Layer - Pipeline stages and their runtime

pub mod driver;
pub mod invoker;
pub mod lock;
pub mod maintenance;
pub mod mapper;
pub mod pipeline;
pub mod recovery;
pub mod reducer;
pub mod retry;
pub mod work;
pub mod worker;

// Re-exports
pub use driver::DriverService;
pub use invoker::{DeliveryBudget, QueueInvoker};
pub use lock::{ChunkLock, LockPolicy};
pub use maintenance::MaintenanceScheduler;
pub use mapper::{partition_inputs, MapperService};
pub use pipeline::Pipeline;
pub use recovery::{RecoveryReport, RecoveryService};
pub use reducer::{ReduceOutcome, ReducerService};
pub use retry::{LocalRetry, RetryDecision, RetryPolicy};
pub use work::WorkService;
pub use worker::{shutdown_channel, ShutdownSender, ShutdownToken, StageWorker};
