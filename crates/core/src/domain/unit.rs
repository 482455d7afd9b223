// Work Unit Domain Model

use crate::domain::error::{DomainError, Result};
use crate::domain::job::{InputFile, JobId, MergeParams};
use crate::domain::output::{ChunkKey, OutputDestination};
use serde::{Deserialize, Serialize};

/// Default maximum files per unit
pub const DEFAULT_MAX_FILES_PER_UNIT: u64 = 3;

/// Per-unit size limits. Whichever binds first closes a unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnitLimits {
    pub max_files_per_unit: u64,
    /// Unlimited when absent
    #[serde(default)]
    pub max_bytes_per_unit: Option<u64>,
}

impl Default for UnitLimits {
    fn default() -> Self {
        Self {
            max_files_per_unit: DEFAULT_MAX_FILES_PER_UNIT,
            max_bytes_per_unit: None,
        }
    }
}

impl UnitLimits {
    pub fn files(max_files_per_unit: u64) -> Self {
        Self {
            max_files_per_unit,
            max_bytes_per_unit: None,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_files_per_unit == 0 {
            return Err(DomainError::ValidationError(
                "max_files_per_unit must be at least 1".to_string(),
            ));
        }
        if self.max_bytes_per_unit == Some(0) {
            return Err(DomainError::ValidationError(
                "max_bytes_per_unit must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

/// One independently schedulable slice of a job.
/// Identity is `(job_id, unit_index)`; never persisted beyond the invocation payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkUnit {
    pub job_id: JobId,
    pub unit_index: u64,
    pub inputs: Vec<InputFile>,
    pub chunk_key: ChunkKey,
    pub destination: OutputDestination,
    pub params: MergeParams,
}

impl WorkUnit {
    pub fn input_paths(&self) -> Vec<&str> {
        self.inputs.iter().map(|f| f.path.as_str()).collect()
    }
}
