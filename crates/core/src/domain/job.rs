// Job Domain Model

use crate::domain::error::{DomainError, Result};
use crate::domain::output::OutputDestination;
use serde::{Deserialize, Serialize};
use std::str::FromStr;

/// Job ID (UUID v4 unless supplied by the client)
pub type JobId = String;

/// Job status. Moves forward one step at a time; `Failed` is reachable from
/// any non-terminal status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    Submitted,
    Mapping,
    Working,
    Reducing,
    Done,
    Failed,
}

impl JobStatus {
    pub const ALL: [JobStatus; 6] = [
        JobStatus::Submitted,
        JobStatus::Mapping,
        JobStatus::Working,
        JobStatus::Reducing,
        JobStatus::Done,
        JobStatus::Failed,
    ];

    pub fn is_terminal(self) -> bool {
        matches!(self, JobStatus::Done | JobStatus::Failed)
    }

    /// Immediate successor on the happy path
    pub fn successor(self) -> Option<JobStatus> {
        match self {
            JobStatus::Submitted => Some(JobStatus::Mapping),
            JobStatus::Mapping => Some(JobStatus::Working),
            JobStatus::Working => Some(JobStatus::Reducing),
            JobStatus::Reducing => Some(JobStatus::Done),
            JobStatus::Done | JobStatus::Failed => None,
        }
    }

    pub fn can_transition_to(self, to: JobStatus) -> bool {
        if self.is_terminal() {
            return false;
        }
        to == JobStatus::Failed || self.successor() == Some(to)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            JobStatus::Submitted => "SUBMITTED",
            JobStatus::Mapping => "MAPPING",
            JobStatus::Working => "WORKING",
            JobStatus::Reducing => "REDUCING",
            JobStatus::Done => "DONE",
            JobStatus::Failed => "FAILED",
        }
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self> {
        JobStatus::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| DomainError::ValidationError(format!("Unknown job status: {}", s)))
    }
}

/// One input file reference
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InputFile {
    pub path: String,
    /// Estimated size, used by the byte limit when partitioning
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size_bytes: Option<u64>,
}

impl InputFile {
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            size_bytes: None,
        }
    }

    pub fn with_size(path: impl Into<String>, size_bytes: u64) -> Self {
        Self {
            path: path.into(),
            size_bytes: Some(size_bytes),
        }
    }
}

/// Merge/filter parameters chosen by the client
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MergeParams {
    /// Input format, selects the converter (e.g. "tsv")
    pub format: String,
    /// Row filter expression, e.g. `CD4 > 0 & qc > 0.6`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filter: Option<String>,
}

/// Client job request. Immutable once submitted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobRequest {
    /// Assigned by the Driver when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub job_id: Option<JobId>,
    pub inputs: Vec<InputFile>,
    pub destination: OutputDestination,
    pub params: MergeParams,
}

/// Job record in the State Store
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobState {
    pub job_id: JobId,
    pub status: JobStatus,
    pub destination: OutputDestination,
    pub format: String,
    pub input_count: u64,

    /// Set once by the Mapper
    pub expected_units: Option<u64>,
    /// Monotonically incremented by Work completions
    pub completed_units: u64,

    pub failure_reason: Option<String>,

    pub created_at: i64, // epoch ms
    pub updated_at: i64,
    pub completed_at: Option<i64>,
}

impl JobState {
    /// Create the initial record written by the Driver
    ///
    /// # Arguments
    ///
    /// * `job_id` - Job ID (already assigned)
    /// * `request` - Validated request
    /// * `now_millis` - Creation timestamp (injected, not system time)
    pub fn submitted(job_id: impl Into<String>, request: &JobRequest, now_millis: i64) -> Self {
        Self {
            job_id: job_id.into(),
            status: JobStatus::Submitted,
            destination: request.destination.clone(),
            format: request.params.format.clone(),
            input_count: request.inputs.len() as u64,
            expected_units: None,
            completed_units: 0,
            failure_reason: None,
            created_at: now_millis,
            updated_at: now_millis,
            completed_at: None,
        }
    }

    /// All expected units have reported completion
    pub fn is_ready_to_reduce(&self) -> bool {
        matches!(self.expected_units, Some(expected) if self.completed_units >= expected)
    }

    /// Apply a status transition with explicit timestamp
    pub fn transition(&mut self, to: JobStatus, now_millis: i64) -> Result<()> {
        if !self.status.can_transition_to(to) {
            return Err(DomainError::InvalidStateTransition {
                from: self.status.to_string(),
                to: to.to_string(),
            });
        }
        self.status = to;
        self.updated_at = now_millis;
        if to.is_terminal() {
            self.completed_at = Some(now_millis);
        }
        Ok(())
    }

    /// Mark as Failed with explicit timestamp
    pub fn fail(&mut self, reason: impl Into<String>, now_millis: i64) -> Result<()> {
        self.transition(JobStatus::Failed, now_millis)?;
        self.failure_reason = Some(reason.into());
        Ok(())
    }

    /// Count one unit completion. Refuses to exceed `expected_units`.
    pub fn record_completion(&mut self, now_millis: i64) -> Result<u64> {
        if self.status.is_terminal() {
            return Err(DomainError::InvalidStateTransition {
                from: self.status.to_string(),
                to: "unit completion".to_string(),
            });
        }
        match self.expected_units {
            Some(expected) if self.completed_units < expected => {
                self.completed_units += 1;
                self.updated_at = now_millis;
                Ok(self.completed_units)
            }
            Some(expected) => Err(DomainError::ValidationError(format!(
                "completed_units would exceed expected_units ({})",
                expected
            ))),
            None => Err(DomainError::ValidationError(
                "expected_units not set".to_string(),
            )),
        }
    }
}
