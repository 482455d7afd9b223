// Stage Invocation Model
// One queued execution of a pipeline stage. Delivery is at-least-once.

use crate::domain::job::{JobId, JobRequest};
use crate::domain::unit::WorkUnit;
use serde::{Deserialize, Serialize};

/// Invocation ID (UUID v4)
pub type InvocationId = String;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Stage {
    Map,
    Work,
    Reduce,
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Stage::Map => write!(f, "MAP"),
            Stage::Work => write!(f, "WORK"),
            Stage::Reduce => write!(f, "REDUCE"),
        }
    }
}

/// Payload of an asynchronous stage invocation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "stage", rename_all = "snake_case")]
pub enum StageInvocation {
    Map { job_id: JobId, request: JobRequest },
    Work { unit: WorkUnit },
    Reduce { job_id: JobId },
}

impl StageInvocation {
    pub fn stage(&self) -> Stage {
        match self {
            StageInvocation::Map { .. } => Stage::Map,
            StageInvocation::Work { .. } => Stage::Work,
            StageInvocation::Reduce { .. } => Stage::Reduce,
        }
    }

    pub fn job_id(&self) -> &str {
        match self {
            StageInvocation::Map { job_id, .. } => job_id,
            StageInvocation::Work { unit } => &unit.job_id,
            StageInvocation::Reduce { job_id } => job_id,
        }
    }
}

/// Queue state of an invocation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum InvocationState {
    Queued,
    Running,
    /// Acknowledged
    Done,
    /// Dead-lettered after exhausting its retry budget
    Failed,
}

impl std::fmt::Display for InvocationState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            InvocationState::Queued => write!(f, "QUEUED"),
            InvocationState::Running => write!(f, "RUNNING"),
            InvocationState::Done => write!(f, "DONE"),
            InvocationState::Failed => write!(f, "FAILED"),
        }
    }
}

/// Claimed invocation as handed to a stage worker
#[derive(Debug, Clone, PartialEq)]
pub struct QueuedInvocation {
    pub id: InvocationId,
    pub invocation: StageInvocation,
    /// Deliveries so far, including the current one
    pub attempts: u32,
    pub max_attempts: u32,
    pub backoff_factor: f64,
    pub created_at: i64,
    pub started_at: Option<i64>,
}

impl QueuedInvocation {
    pub fn budget_exhausted(&self) -> bool {
        self.attempts >= self.max_attempts
    }
}
