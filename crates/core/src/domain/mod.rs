// Domain Layer - Pure business logic and entities

pub mod error;
pub mod filter;
pub mod invocation;
pub mod job;
pub mod output;
pub mod table;
pub mod timing;
pub mod unit;

// Re-exports
pub use error::DomainError;
pub use filter::RowFilter;
pub use invocation::{InvocationId, InvocationState, QueuedInvocation, Stage, StageInvocation};
pub use job::{InputFile, JobId, JobRequest, JobState, JobStatus, MergeParams};
pub use output::{ChunkEntry, ChunkKey, OutputDestination, OutputManifest};
pub use table::{Table, TableRow};
pub use timing::{TimingEvent, TimingRecord};
pub use unit::{UnitLimits, WorkUnit};
