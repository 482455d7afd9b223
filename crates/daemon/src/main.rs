//! Mergeflow Daemon - Main Entry Point
//! JSON-RPC job API + stage worker pool + recovery and maintenance loops

mod config;
mod telemetry;

use anyhow::{Context, Result};
use clap::Parser;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

use config::{DaemonConfig, ExternalConverterConfig, LoggingConfig};
use mergeflow_api_rpc::{RpcHandler, RpcServer, RpcServerConfig};
use mergeflow_core::application::{
    shutdown_channel, ChunkLock, DriverService, LocalRetry, MaintenanceScheduler, MapperService,
    Pipeline, QueueInvoker, RecoveryService, ReducerService, RetryPolicy, StageWorker,
    WorkService,
};
use mergeflow_core::port::id_provider::UuidProvider;
use mergeflow_core::port::time_provider::SystemTimeProvider;
use mergeflow_core::port::{Converter, IdProvider, TimeProvider};
use mergeflow_infra_sqlite::{
    create_pool, run_migrations, SqliteInvocationQueue, SqliteLockStore, SqliteMaintenance,
    SqliteStateStore,
};
use mergeflow_infra_system::{ConverterRegistry, FsOutputStore, SubprocessConverter};

const VERSION: &str = env!("CARGO_PKG_VERSION");
const LOG_FILE_PREFIX: &str = "mergeflowd.log";
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

#[derive(Debug, Parser)]
#[command(name = "mergeflowd", version, about = "Mergeflow orchestrator daemon")]
struct Args {
    /// Configuration file (TOML)
    #[arg(long, env = "MERGEFLOW_CONFIG")]
    config: Option<PathBuf>,
}

/// Install the global subscriber. The returned guard flushes the log file on drop.
fn init_logging(cfg: &LoggingConfig) -> Result<Option<WorkerGuard>> {
    let log_format = std::env::var("MERGEFLOW_LOG_FORMAT")
        .ok()
        .or_else(|| cfg.format.clone())
        .unwrap_or_else(|| "pretty".to_string());

    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new("mergeflow=info"))
        .context("Failed to create env filter")?;

    let mut layers: Vec<telemetry::BoxedLayer> = Vec::new();
    match log_format.as_str() {
        // Production: JSON structured logging
        "json" => layers.push(fmt::layer().json().boxed()),
        // Development: Pretty formatting with colors
        _ => layers.push(fmt::layer().pretty().boxed()),
    }

    let mut guard = None;
    if let Some(dir) = &cfg.directory {
        let appender = tracing_appender::rolling::daily(dir, LOG_FILE_PREFIX);
        let (writer, file_guard) = tracing_appender::non_blocking(appender);
        layers.push(fmt::layer().json().with_ansi(false).with_writer(writer).boxed());
        guard = Some(file_guard);
    }

    if let Some(layer) = telemetry::telemetry_layer()? {
        layers.push(layer);
    }

    tracing_subscriber::registry()
        .with(layers)
        .with(env_filter)
        .try_init()
        .context("Failed to install tracing subscriber")?;

    Ok(guard)
}

fn build_converters(external: &[ExternalConverterConfig]) -> ConverterRegistry {
    external
        .iter()
        .fold(ConverterRegistry::with_builtin(), |registry, cfg| {
            let mut converter =
                SubprocessConverter::new(&cfg.program, cfg.args.clone(), cfg.formats.clone());
            if let Some(allowlist) = &cfg.env_allowlist {
                converter = converter.with_env_allowlist(allowlist.clone());
            }
            registry.register_subprocess(&cfg.formats, converter)
        })
}

fn ensure_parent_dir(path: &str) -> Result<()> {
    if path.contains(":memory:") {
        return Ok(());
    }
    if let Some(parent) = Path::new(path).parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create {}", parent.display()))?;
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // 1. Load configuration
    let cfg = DaemonConfig::load(args.config.as_deref())?;

    // 2. Initialize logging
    let _log_guard = init_logging(&cfg.logging)?;

    info!("Mergeflow daemon v{} starting...", VERSION);
    if telemetry::endpoint_configured() && !cfg!(feature = "telemetry") {
        warn!("OpenTelemetry endpoint set but feature 'telemetry' not enabled");
    }

    // 3. Initialize database
    info!(db_path = %cfg.database.path, "Initializing database...");
    ensure_parent_dir(&cfg.database.path)?;
    let pool = create_pool(&cfg.database.path)
        .await
        .map_err(|e| anyhow::anyhow!("DB pool creation failed: {}", e))?;
    run_migrations(&pool)
        .await
        .map_err(|e| anyhow::anyhow!("Migration failed: {}", e))?;

    std::fs::create_dir_all(&cfg.output.root)
        .with_context(|| format!("Failed to create output root {}", cfg.output.root))?;

    // 4. Setup dependencies (DI wiring)
    let time_provider: Arc<dyn TimeProvider> = Arc::new(SystemTimeProvider);
    let id_provider: Arc<dyn IdProvider> = Arc::new(UuidProvider);

    let state = Arc::new(SqliteStateStore::new(pool.clone(), time_provider.clone()));
    let locks = Arc::new(SqliteLockStore::new(pool.clone(), time_provider.clone()));
    let queue = Arc::new(SqliteInvocationQueue::new(
        pool.clone(),
        time_provider.clone(),
        id_provider.clone(),
    ));
    let maintenance = Arc::new(SqliteMaintenance::new(pool.clone(), time_provider.clone()));
    let output = Arc::new(FsOutputStore::new(&cfg.output.root));

    let registry = build_converters(&cfg.converters);
    info!(formats = ?registry.formats(), "Converters registered");
    let converters: Arc<dyn Converter> = Arc::new(registry);

    let invoker = Arc::new(QueueInvoker::new(queue.clone(), cfg.retry.budget()));

    let mapper = MapperService::new(state.clone(), invoker.clone(), cfg.partition.limits());
    let redrive_invoker = invoker.clone();
    let work = WorkService::new(
        state.clone(),
        output.clone(),
        converters.clone(),
        invoker.clone(),
        ChunkLock::new(locks, id_provider.clone(), cfg.lock.policy()),
        cfg.convert_timeout(),
    );
    let reducer = ReducerService::new(
        state.clone(),
        output.clone(),
        time_provider.clone(),
        LocalRetry::default(),
    )
    .with_takeover_after(cfg.workers.reduce_takeover_ms);
    let pipeline = Arc::new(Pipeline::new(state.clone(), mapper, work, reducer));
    let retry_policy = Arc::new(RetryPolicy::new(
        time_provider.clone(),
        cfg.retry.base_delay_ms,
    ));

    let driver = Arc::new(
        DriverService::new(
            state.clone(),
            output.clone(),
            invoker,
            id_provider.clone(),
            time_provider.clone(),
        )
        .with_converter(converters),
    );

    // 5. Run crash recovery: no worker runs yet, so every claimed invocation is orphaned
    info!("Running crash recovery...");
    let startup_recovery = RecoveryService::new(
        queue.clone(),
        state.clone(),
        time_provider.clone(),
        Some(0),
        cfg.workers.stall_timeout(),
    )
    .with_reduce_redrive(redrive_invoker.clone(), cfg.workers.reduce_takeover_ms);
    match startup_recovery.recover().await {
        Ok(report) => info!(
            requeued_invocations = report.requeued_invocations,
            failed_jobs = report.failed_jobs,
            redriven_reduces = report.redriven_reduces,
            "Crash recovery completed"
        ),
        Err(e) => error!(error = ?e, "Crash recovery failed"),
    }

    // 6. Start JSON-RPC server
    info!("Starting JSON-RPC server...");
    let rpc_config = RpcServerConfig {
        host: cfg.rpc.host.clone(),
        port: cfg.rpc.port,
    };
    let handler = RpcHandler::new(driver, state.clone(), queue.clone(), maintenance.clone());
    let (rpc_addr, rpc_handle) = RpcServer::new(rpc_config, handler)
        .start()
        .await
        .map_err(|e| anyhow::anyhow!("RPC server start failed: {}", e))?;

    // 7. Start stage workers
    info!(workers = cfg.workers.count, "Starting stage workers...");
    let (shutdown_tx, shutdown_rx) = shutdown_channel();
    let mut worker_handles = Vec::with_capacity(cfg.workers.count);
    for index in 0..cfg.workers.count {
        let worker = StageWorker::new(
            format!("worker-{}", index),
            queue.clone(),
            pipeline.clone(),
            retry_policy.clone(),
        );
        let token = shutdown_rx.clone();
        worker_handles.push(tokio::spawn(async move {
            if let Err(e) = worker.run(token).await {
                error!(error = ?e, "Worker failed");
            }
        }));
    }

    // 8. Periodic recovery and maintenance
    let recovery = RecoveryService::new(
        queue.clone(),
        state.clone(),
        time_provider.clone(),
        Some(cfg.workers.visibility_timeout_ms),
        cfg.workers.stall_timeout(),
    )
    .with_reduce_redrive(redrive_invoker, cfg.workers.reduce_takeover_ms);
    let recovery_handle = tokio::spawn(
        recovery.run(Duration::from_secs(cfg.workers.recovery_interval_secs.max(1))),
    );

    info!("Starting maintenance scheduler...");
    let maintenance_scheduler = MaintenanceScheduler::new(
        maintenance,
        cfg.maintenance.config(),
        cfg.maintenance.interval_hours,
    );
    let maintenance_handle = tokio::spawn(maintenance_scheduler.run());

    info!(rpc_addr = %rpc_addr, "System ready. Waiting for jobs...");
    info!("Press Ctrl+C to shutdown");

    // 9. Wait for shutdown signal
    tokio::signal::ctrl_c().await?;

    info!("Shutdown signal received. Exiting gracefully...");

    // 10. Graceful shutdown: in-flight invocations finish or are redelivered later
    shutdown_tx.shutdown();
    rpc_handle
        .stop()
        .map_err(|e| anyhow::anyhow!("RPC server stop failed: {}", e))?;
    recovery_handle.abort();
    maintenance_handle.abort();
    let all_workers = futures::future::join_all(worker_handles);
    if tokio::time::timeout(SHUTDOWN_GRACE, all_workers).await.is_err() {
        warn!("Workers did not stop within the grace period");
    }
    telemetry::shutdown();

    info!("Shutdown complete.");

    Ok(())
}
