// Converter Port (Interface)
// Turns a unit's raw input files into one in-memory table

use crate::domain::{InputFile, MergeParams, Table};
use async_trait::async_trait;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ConversionError {
    #[error("Unsupported input format: {0}")]
    UnsupportedFormat(String),

    #[error("Failed to read {path}: {message}")]
    Read { path: String, message: String },

    #[error("Failed to parse {path}: {message}")]
    Parse { path: String, message: String },

    #[error("Schema mismatch: {0}")]
    SchemaMismatch(String),

    #[error("Conversion timed out after {0}ms")]
    Timeout(u64),

    #[error("Failed to spawn converter: {0}")]
    SpawnFailed(String),

    #[error("Converter exited with code {code:?}: {stderr}")]
    ProcessFailed { code: Option<i32>, stderr: String },
}

#[async_trait]
pub trait Converter: Send + Sync {
    /// Convert and concatenate all inputs of one unit
    async fn convert(
        &self,
        inputs: &[InputFile],
        params: &MergeParams,
    ) -> std::result::Result<Table, ConversionError>;

    /// Whether `format` can be handled (checked at submission)
    fn supports_format(&self, format: &str) -> bool;
}

pub mod mocks {
    use super::*;
    use crate::domain::TableRow;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use std::time::Duration;

    /// Converter producing one row per input path.
    ///
    /// Rows default to `1.0` in every column; individual rows, failures and
    /// panics are scripted per path.
    pub struct MockConverter {
        columns: Vec<String>,
        rows: Mutex<HashMap<String, Vec<f64>>>,
        failures: Mutex<HashMap<String, u32>>,
        panic_on: Mutex<Option<String>>,
        delay: Option<Duration>,
        calls: AtomicUsize,
    }

    impl MockConverter {
        pub fn new(columns: &[&str]) -> Self {
            Self {
                columns: columns.iter().map(|c| c.to_string()).collect(),
                rows: Mutex::new(HashMap::new()),
                failures: Mutex::new(HashMap::new()),
                panic_on: Mutex::new(None),
                delay: None,
                calls: AtomicUsize::new(0),
            }
        }

        pub fn with_delay(mut self, delay: Duration) -> Self {
            self.delay = Some(delay);
            self
        }

        pub fn set_row(&self, path: &str, values: Vec<f64>) {
            lock(&self.rows).insert(path.to_string(), values);
        }

        /// Fail conversions touching `path` the next `times` calls
        pub fn fail_times(&self, path: &str, times: u32) {
            lock(&self.failures).insert(path.to_string(), times);
        }

        pub fn fail_always(&self, path: &str) {
            self.fail_times(path, u32::MAX);
        }

        pub fn panic_on(&self, path: &str) {
            *lock(&self.panic_on) = Some(path.to_string());
        }

        pub fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
        m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    #[async_trait]
    impl Converter for MockConverter {
        async fn convert(
            &self,
            inputs: &[InputFile],
            params: &MergeParams,
        ) -> std::result::Result<Table, ConversionError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if !self.supports_format(&params.format) {
                return Err(ConversionError::UnsupportedFormat(params.format.clone()));
            }
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }

            let panic_path = lock(&self.panic_on).clone();
            if let Some(path) = panic_path {
                if inputs.iter().any(|f| f.path == path) {
                    panic!("mock converter panic on {}", path);
                }
            }

            {
                let mut failures = lock(&self.failures);
                for input in inputs {
                    if let Some(remaining) = failures.get_mut(&input.path) {
                        if *remaining > 0 {
                            if *remaining != u32::MAX {
                                *remaining -= 1;
                            }
                            return Err(ConversionError::ProcessFailed {
                                code: Some(1),
                                stderr: format!("scripted failure for {}", input.path),
                            });
                        }
                    }
                }
            }

            let rows = lock(&self.rows);
            let table_rows = inputs
                .iter()
                .map(|f| {
                    let values = rows
                        .get(&f.path)
                        .cloned()
                        .unwrap_or_else(|| vec![1.0; self.columns.len()]);
                    TableRow::new(f.path.clone(), values)
                })
                .collect();
            Ok(Table::new("cell", self.columns.clone(), table_rows))
        }

        fn supports_format(&self, format: &str) -> bool {
            format == "mock"
        }
    }
}
