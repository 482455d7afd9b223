//! JSON-RPC Server
//!
//! Serves the client-facing job API over HTTP on localhost.

use crate::handler::RpcHandler;
use crate::types::{JobIdRequest, StatsRequest, SubmitRequest};
use jsonrpsee::server::{Server, ServerHandle};
use jsonrpsee::RpcModule;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::info;

const DEFAULT_RPC_HOST: &str = "127.0.0.1";
const DEFAULT_RPC_PORT: u16 = 9627;

/// RPC Server Configuration
#[derive(Debug, Clone)]
pub struct RpcServerConfig {
    pub host: String,
    pub port: u16,
}

impl Default for RpcServerConfig {
    fn default() -> Self {
        Self {
            host: DEFAULT_RPC_HOST.to_string(),
            port: DEFAULT_RPC_PORT,
        }
    }
}

/// RPC Server
pub struct RpcServer {
    config: RpcServerConfig,
    handler: Arc<RpcHandler>,
}

impl RpcServer {
    pub fn new(config: RpcServerConfig, handler: RpcHandler) -> Self {
        Self {
            config,
            handler: Arc::new(handler),
        }
    }

    /// Start the JSON-RPC server
    ///
    /// Returns the bound address (useful with port 0) and the handle that
    /// keeps the server alive.
    pub async fn start(self) -> Result<(SocketAddr, ServerHandle), String> {
        let addr = format!("{}:{}", self.config.host, self.config.port);

        info!(
            host = %self.config.host,
            port = %self.config.port,
            "Starting JSON-RPC server"
        );

        let server = Server::builder()
            .build(&addr)
            .await
            .map_err(|e| format!("Failed to build server on {}: {}", addr, e))?;
        let local_addr = server
            .local_addr()
            .map_err(|e| format!("Failed to read bound address: {}", e))?;

        let module = self.module()?;

        info!(addr = %local_addr, "JSON-RPC server started successfully");

        let handle = server.start(module);
        Ok((local_addr, handle))
    }

    fn module(&self) -> Result<RpcModule<()>, String> {
        let mut module = RpcModule::new(());

        let handler = self.handler.clone();
        module.register_async_method("job.submit.v1", move |params, _, _| {
            let handler = handler.clone();
            async move {
                let req: SubmitRequest = params.parse()?;
                handler.submit(req).await
            }
        })
        .map_err(|e| e.to_string())?;

        let handler = self.handler.clone();
        module.register_async_method("job.poll.v1", move |params, _, _| {
            let handler = handler.clone();
            async move {
                let req: JobIdRequest = params.parse()?;
                handler.poll(req).await
            }
        })
        .map_err(|e| e.to_string())?;

        let handler = self.handler.clone();
        module.register_async_method("job.timings.v1", move |params, _, _| {
            let handler = handler.clone();
            async move {
                let req: JobIdRequest = params.parse()?;
                handler.timings(req).await
            }
        })
        .map_err(|e| e.to_string())?;

        let handler = self.handler.clone();
        module.register_async_method("admin.stats.v1", move |params, _, _| {
            let handler = handler.clone();
            async move {
                // Tolerate a missing params member
                let req: StatsRequest = params.parse().unwrap_or_default();
                handler.stats(req).await
            }
        })
        .map_err(|e| e.to_string())?;

        Ok(module)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::RpcHandler;
    use mergeflow_core::application::{DeliveryBudget, DriverService, QueueInvoker};
    use mergeflow_core::port::id_provider::mocks::SequentialIdProvider;
    use mergeflow_core::port::invocation_queue::memory::InMemoryInvocationQueue;
    use mergeflow_core::port::output_store::memory::InMemoryOutputStore;
    use mergeflow_core::port::state_store::memory::InMemoryStateStore;
    use mergeflow_core::port::time_provider::mocks::ManualTimeProvider;
    use mergeflow_core::port::{Maintenance, MaintenanceStats};

    struct NoopMaintenance;

    #[async_trait::async_trait]
    impl Maintenance for NoopMaintenance {
        async fn vacuum(&self) -> mergeflow_core::Result<f64> {
            Ok(0.0)
        }
        async fn gc_finished_jobs(&self, _days: i64) -> mergeflow_core::Result<i64> {
            Ok(0)
        }
        async fn gc_invocations(&self, _days: i64) -> mergeflow_core::Result<i64> {
            Ok(0)
        }
        async fn gc_expired_locks(&self) -> mergeflow_core::Result<i64> {
            Ok(0)
        }
        async fn get_stats(&self) -> mergeflow_core::Result<MaintenanceStats> {
            Ok(MaintenanceStats::default())
        }
    }

    #[test]
    fn test_registers_versioned_methods() {
        let clock = Arc::new(ManualTimeProvider::new(0));
        let state = Arc::new(InMemoryStateStore::new(clock.clone()));
        let queue = Arc::new(InMemoryInvocationQueue::new(
            clock.clone(),
            Arc::new(SequentialIdProvider::new("inv")),
        ));
        let driver = DriverService::new(
            state.clone(),
            Arc::new(InMemoryOutputStore::new()),
            Arc::new(QueueInvoker::new(queue.clone(), DeliveryBudget::default())),
            Arc::new(SequentialIdProvider::new("job")),
            clock,
        );
        let handler = RpcHandler::new(Arc::new(driver), state, queue, Arc::new(NoopMaintenance));
        let server = RpcServer::new(RpcServerConfig::default(), handler);

        let module = server.module().unwrap();
        let mut names: Vec<&str> = module.method_names().collect();
        names.sort();
        assert_eq!(
            names,
            vec!["admin.stats.v1", "job.poll.v1", "job.submit.v1", "job.timings.v1"]
        );
    }
}
