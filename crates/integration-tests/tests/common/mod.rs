//! Shared wiring for the end-to-end tests: SQLite stores, a filesystem
//! output store in a scratch directory and one stage worker.

#![allow(dead_code)]

use std::path::{Path, PathBuf};
use std::sync::Arc;

use mergeflow_core::application::{
    ChunkLock, DeliveryBudget, DriverService, LocalRetry, LockPolicy, MapperService, Pipeline,
    QueueInvoker, ReducerService, RetryPolicy, StageWorker, WorkService,
};
use mergeflow_core::domain::{InputFile, JobRequest, MergeParams, OutputDestination, UnitLimits};
use mergeflow_core::port::id_provider::UuidProvider;
use mergeflow_core::port::time_provider::SystemTimeProvider;
use mergeflow_core::port::{Converter, IdProvider, TimeProvider};
use mergeflow_infra_sqlite::{
    create_pool, run_migrations, SqliteInvocationQueue, SqliteLockStore, SqliteStateStore,
};
use mergeflow_infra_system::FsOutputStore;
use std::time::Duration;

pub struct Harness {
    pub driver: DriverService,
    pub state: Arc<SqliteStateStore>,
    pub queue: Arc<SqliteInvocationQueue>,
    pub locks: Arc<SqliteLockStore>,
    pub output: Arc<FsOutputStore>,
    pub pipeline: Arc<Pipeline>,
    pub worker: StageWorker,
    pub time: Arc<dyn TimeProvider>,
    pub ids: Arc<dyn IdProvider>,
    pub root: PathBuf,
}

impl Drop for Harness {
    fn drop(&mut self) {
        let _ = std::fs::remove_dir_all(&self.root);
    }
}

pub fn scratch_dir(tag: &str) -> PathBuf {
    let dir = std::env::temp_dir().join(format!("mergeflow-it-{}-{}", tag, uuid::Uuid::new_v4()));
    std::fs::create_dir_all(&dir).unwrap();
    dir
}

pub fn fast_lock_policy() -> LockPolicy {
    LockPolicy {
        ttl: Duration::from_secs(30),
        max_attempts: 200,
        base_backoff: Duration::from_millis(2),
        max_backoff: Duration::from_millis(20),
    }
}

pub async fn harness(
    tag: &str,
    converter: Arc<dyn Converter>,
    limits: UnitLimits,
    budget: DeliveryBudget,
) -> Harness {
    let pool = create_pool("sqlite::memory:").await.unwrap();
    run_migrations(&pool).await.unwrap();

    let time: Arc<dyn TimeProvider> = Arc::new(SystemTimeProvider);
    let ids: Arc<dyn IdProvider> = Arc::new(UuidProvider);
    let root = scratch_dir(tag);

    let state = Arc::new(SqliteStateStore::new(pool.clone(), time.clone()));
    let locks = Arc::new(SqliteLockStore::new(pool.clone(), time.clone()));
    let queue = Arc::new(SqliteInvocationQueue::new(pool, time.clone(), ids.clone()));
    let output = Arc::new(FsOutputStore::new(root.join("out")));
    let invoker = Arc::new(QueueInvoker::new(queue.clone(), budget));

    let mapper = MapperService::new(state.clone(), invoker.clone(), limits);
    let work = WorkService::new(
        state.clone(),
        output.clone(),
        converter.clone(),
        invoker.clone(),
        ChunkLock::new(locks.clone(), ids.clone(), fast_lock_policy()),
        Duration::from_secs(10),
    );
    let reducer = ReducerService::new(state.clone(), output.clone(), time.clone(), LocalRetry::default());
    let pipeline = Arc::new(Pipeline::new(state.clone(), mapper, work, reducer));

    // Zero base delay: retried invocations are claimable immediately
    let worker = StageWorker::new(
        "it-worker",
        queue.clone(),
        pipeline.clone(),
        Arc::new(RetryPolicy::new(time.clone(), 0)),
    );
    let driver = DriverService::new(state.clone(), output.clone(), invoker, ids.clone(), time.clone())
        .with_converter(converter);

    Harness {
        driver,
        state,
        queue,
        locks,
        output,
        pipeline,
        worker,
        time,
        ids,
        root,
    }
}

/// Process invocations until the queue is empty. Returns how many ran.
pub async fn drain(worker: &StageWorker) -> usize {
    let mut processed = 0;
    while worker.process_next().await.unwrap() {
        processed += 1;
        assert!(processed < 1_000, "queue never drained");
    }
    processed
}

/// Write a one-row expression matrix and describe it as a job input
pub fn write_tsv(dir: &Path, name: &str, row: &str, values: [f64; 2]) -> InputFile {
    let path = dir.join(name);
    let contents = format!("gene\tCD4\tqc\n{}\t{}\t{}\n", row, values[0], values[1]);
    std::fs::write(&path, contents).unwrap();
    InputFile {
        path: path.to_string_lossy().into_owned(),
        size_bytes: Some(std::fs::metadata(&path).unwrap().len()),
    }
}

pub fn request(job_id: &str, inputs: Vec<InputFile>, format: &str, filter: Option<&str>) -> JobRequest {
    JobRequest {
        job_id: Some(job_id.to_string()),
        inputs,
        destination: OutputDestination::new("merged/it"),
        params: MergeParams {
            format: format.to_string(),
            filter: filter.map(str::to_string),
        },
    }
}

/// Inputs for the mock converter: paths only, nothing on disk
pub fn mock_inputs(n: usize) -> Vec<InputFile> {
    (0..n)
        .map(|i| InputFile {
            path: format!("/data/f{}", i),
            size_bytes: None,
        })
        .collect()
}
