// Port Layer - Interfaces for external dependencies

pub mod converter;
pub mod id_provider; // For deterministic testing
pub mod invocation_queue;
pub mod invoker;
pub mod lock_store;
pub mod maintenance;
pub mod output_store;
pub mod state_store;
pub mod time_provider;

// Re-exports
pub use converter::{ConversionError, Converter};
pub use id_provider::IdProvider;
pub use invocation_queue::InvocationQueue;
pub use invoker::StageInvoker;
pub use lock_store::LockStore;
pub use maintenance::{Maintenance, MaintenanceConfig, MaintenanceReport, MaintenanceStats};
pub use output_store::OutputStore;
pub use state_store::{StateStore, UnitCompletion};
pub use time_provider::TimeProvider;
