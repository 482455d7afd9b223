//! Daemon configuration
//!
//! Layered from built-in defaults, an optional TOML file and
//! `MERGEFLOW__SECTION__KEY` environment variables (highest precedence).

use anyhow::{bail, Context, Result};
use directories::ProjectDirs;
use mergeflow_core::application::worker::constants::{
    DEFAULT_REDUCE_TAKEOVER_MS, DEFAULT_STALL_TIMEOUT_MS, DEFAULT_VISIBILITY_TIMEOUT_MS,
    DEFAULT_WORKER_COUNT,
};
use mergeflow_core::application::{DeliveryBudget, LockPolicy};
use mergeflow_core::domain::UnitLimits;
use mergeflow_core::port::MaintenanceConfig;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

const ENV_PREFIX: &str = "MERGEFLOW";
const CONFIG_FILE_NAME: &str = "config.toml";
const FALLBACK_HOME: &str = "~/.mergeflow";

fn project_dirs() -> Option<ProjectDirs> {
    ProjectDirs::from("dev", "mergeflow", "mergeflow")
}

fn data_dir() -> PathBuf {
    project_dirs()
        .map(|dirs| dirs.data_dir().to_path_buf())
        .unwrap_or_else(|| PathBuf::from(shellexpand::tilde(FALLBACK_HOME).into_owned()))
}

/// Default config file location under the platform config dir
pub fn default_config_path() -> Option<PathBuf> {
    project_dirs().map(|dirs| dirs.config_dir().join(CONFIG_FILE_NAME))
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct DaemonConfig {
    pub database: DatabaseConfig,
    pub output: OutputConfig,
    pub rpc: RpcConfig,
    pub workers: WorkerConfig,
    pub partition: PartitionConfig,
    pub lock: LockConfig,
    pub work: WorkConfig,
    pub retry: RetryConfig,
    pub maintenance: MaintenanceSection,
    pub logging: LoggingConfig,
    /// External converters, one entry per program
    pub converters: Vec<ExternalConverterConfig>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    /// SQLite file path, or `sqlite::memory:`
    pub path: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: data_dir().join("state.db").to_string_lossy().into_owned(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct OutputConfig {
    /// Root directory of the Output Store
    pub root: String,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            root: data_dir().join("output").to_string_lossy().into_owned(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RpcConfig {
    pub host: String,
    pub port: u16,
}

impl Default for RpcConfig {
    fn default() -> Self {
        let defaults = mergeflow_api_rpc::RpcServerConfig::default();
        Self {
            host: defaults.host,
            port: defaults.port,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    pub count: usize,
    /// Must exceed the convert timeout plus the worst lock wait
    pub visibility_timeout_ms: i64,
    /// Jobs without progress for longer are failed; 0 disables
    pub stall_timeout_ms: i64,
    /// Jobs left in Reducing for longer are finished by a fresh Reduce
    pub reduce_takeover_ms: i64,
    pub recovery_interval_secs: u64,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            count: DEFAULT_WORKER_COUNT,
            visibility_timeout_ms: DEFAULT_VISIBILITY_TIMEOUT_MS,
            stall_timeout_ms: DEFAULT_STALL_TIMEOUT_MS,
            reduce_takeover_ms: DEFAULT_REDUCE_TAKEOVER_MS,
            recovery_interval_secs: 60,
        }
    }
}

impl WorkerConfig {
    pub fn stall_timeout(&self) -> Option<i64> {
        (self.stall_timeout_ms > 0).then_some(self.stall_timeout_ms)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PartitionConfig {
    pub max_files_per_unit: u64,
    /// 0 means unlimited
    pub max_bytes_per_unit: u64,
}

impl Default for PartitionConfig {
    fn default() -> Self {
        Self {
            max_files_per_unit: UnitLimits::default().max_files_per_unit,
            max_bytes_per_unit: 0,
        }
    }
}

impl PartitionConfig {
    pub fn limits(&self) -> UnitLimits {
        UnitLimits {
            max_files_per_unit: self.max_files_per_unit,
            max_bytes_per_unit: (self.max_bytes_per_unit > 0).then_some(self.max_bytes_per_unit),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LockConfig {
    pub ttl_ms: u64,
    pub max_attempts: u32,
    pub base_backoff_ms: u64,
    pub max_backoff_ms: u64,
}

impl Default for LockConfig {
    fn default() -> Self {
        let policy = LockPolicy::default();
        Self {
            ttl_ms: policy.ttl.as_millis() as u64,
            max_attempts: policy.max_attempts,
            base_backoff_ms: policy.base_backoff.as_millis() as u64,
            max_backoff_ms: policy.max_backoff.as_millis() as u64,
        }
    }
}

impl LockConfig {
    pub fn policy(&self) -> LockPolicy {
        LockPolicy {
            ttl: Duration::from_millis(self.ttl_ms),
            max_attempts: self.max_attempts,
            base_backoff: Duration::from_millis(self.base_backoff_ms),
            max_backoff: Duration::from_millis(self.max_backoff_ms),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct WorkConfig {
    pub convert_timeout_secs: u64,
}

impl Default for WorkConfig {
    fn default() -> Self {
        Self {
            convert_timeout_secs: mergeflow_core::application::work::DEFAULT_CONVERT_TIMEOUT
                .as_secs(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub base_delay_ms: i64,
    pub backoff_factor: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        let budget = DeliveryBudget::default();
        Self {
            max_attempts: budget.max_attempts,
            base_delay_ms: mergeflow_core::application::retry::DEFAULT_BASE_DELAY_MS,
            backoff_factor: budget.backoff_factor,
        }
    }
}

impl RetryConfig {
    pub fn budget(&self) -> DeliveryBudget {
        DeliveryBudget {
            max_attempts: self.max_attempts,
            backoff_factor: self.backoff_factor,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MaintenanceSection {
    pub interval_hours: u64,
    pub finished_job_retention_days: i64,
    pub invocation_retention_days: i64,
    pub max_db_size_mb: f64,
}

impl Default for MaintenanceSection {
    fn default() -> Self {
        let defaults = MaintenanceConfig::default();
        Self {
            interval_hours: 24,
            finished_job_retention_days: defaults.finished_job_retention_days,
            invocation_retention_days: defaults.invocation_retention_days,
            max_db_size_mb: defaults.max_db_size_mb,
        }
    }
}

impl MaintenanceSection {
    pub fn config(&self) -> MaintenanceConfig {
        MaintenanceConfig {
            finished_job_retention_days: self.finished_job_retention_days,
            invocation_retention_days: self.invocation_retention_days,
            max_db_size_mb: self.max_db_size_mb,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// `json` or `pretty`; `MERGEFLOW_LOG_FORMAT` wins when set
    pub format: Option<String>,
    /// Also write JSON logs to a daily rolling file in this directory
    pub directory: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ExternalConverterConfig {
    pub program: String,
    #[serde(default)]
    pub args: Vec<String>,
    pub formats: Vec<String>,
    #[serde(default)]
    pub env_allowlist: Option<Vec<String>>,
}

impl DaemonConfig {
    /// Load configuration.
    ///
    /// An explicitly given file must exist; the default location is optional.
    pub fn load(explicit: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder();

        match explicit {
            Some(path) => {
                builder = builder.add_source(config::File::from(path.to_path_buf()).required(true));
            }
            None => {
                if let Some(path) = default_config_path() {
                    builder = builder.add_source(config::File::from(path).required(false));
                }
            }
        }

        builder = builder.add_source(
            config::Environment::with_prefix(ENV_PREFIX)
                .separator("__")
                .try_parsing(true),
        );

        let mut cfg: DaemonConfig = builder
            .build()
            .context("Failed to read configuration")?
            .try_deserialize()
            .context("Invalid configuration")?;

        cfg.expand_paths();
        cfg.validate()?;
        Ok(cfg)
    }

    fn expand_paths(&mut self) {
        let expand = |s: &str| shellexpand::tilde(s).into_owned();
        self.database.path = expand(&self.database.path);
        self.output.root = expand(&self.output.root);
        if let Some(dir) = &self.logging.directory {
            self.logging.directory = Some(expand(dir));
        }
        for converter in &mut self.converters {
            converter.program = expand(&converter.program);
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.workers.count == 0 {
            bail!("workers.count must be at least 1");
        }
        self.partition
            .limits()
            .validate()
            .context("Invalid partition limits")?;
        if self.lock.max_attempts == 0 {
            bail!("lock.max_attempts must be at least 1");
        }
        if self.retry.max_attempts == 0 {
            bail!("retry.max_attempts must be at least 1");
        }
        if self.work.convert_timeout_secs == 0 {
            bail!("work.convert_timeout_secs must be at least 1");
        }
        // A Work invocation still running must not be redelivered
        let work_budget = self.convert_timeout() + self.lock.policy().max_wait();
        if self.workers.visibility_timeout_ms <= 0
            || self.workers.visibility_timeout_ms as u128 <= work_budget.as_millis()
        {
            bail!(
                "workers.visibility_timeout_ms ({}) must exceed the convert timeout plus the lock wait ({}ms)",
                self.workers.visibility_timeout_ms,
                work_budget.as_millis()
            );
        }
        if self.workers.reduce_takeover_ms <= 0 {
            bail!("workers.reduce_takeover_ms must be positive");
        }
        if let Some(stall_timeout_ms) = self.workers.stall_timeout() {
            if stall_timeout_ms <= self.workers.reduce_takeover_ms {
                bail!("workers.stall_timeout_ms must exceed workers.reduce_takeover_ms");
            }
        }
        for converter in &self.converters {
            if converter.formats.is_empty() {
                bail!("converter {} declares no formats", converter.program);
            }
        }
        Ok(())
    }

    pub fn convert_timeout(&self) -> Duration {
        Duration::from_secs(self.work.convert_timeout_secs)
    }
}
