//! JSON-RPC API Layer
//!
//! Implements the JSON-RPC 2.0 job API: `job.submit.v1`, `job.poll.v1`,
//! `job.timings.v1` and `admin.stats.v1`.

pub mod error;
pub mod handler;
pub mod server;
pub mod types;

pub use handler::RpcHandler;
pub use server::{RpcServer, RpcServerConfig};
