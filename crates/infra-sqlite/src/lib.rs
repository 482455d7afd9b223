// Mergeflow Infrastructure - SQLite Adapter
// Implements: StateStore, LockStore, InvocationQueue, Maintenance

mod connection;
mod error;
mod invocation_queue;
mod lock_store;
mod maintenance_impl;
mod migration;
mod state_store;

pub use connection::create_pool;
pub use invocation_queue::SqliteInvocationQueue;
pub use lock_store::SqliteLockStore;
pub use maintenance_impl::SqliteMaintenance;
pub use migration::{run_migrations, SCHEMA_VERSION};
pub use state_store::SqliteStateStore;

// Note: sqlx::Error conversion lives in error.rs as a helper function
// due to Rust's orphan rules (cannot implement From<sqlx::Error> for AppError here)
