// Timing events recorded per job (best effort)

use crate::domain::job::JobId;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimingEvent {
    DriverStarted,
    DriverComplete,
    MapperComplete,
    UnitComplete(u64),
    WorkComplete,
    ReduceStarted,
    ReduceComplete,
    JobFailed,
}

impl TimingEvent {
    pub fn key(&self) -> String {
        match self {
            TimingEvent::DriverStarted => "driver_started".to_string(),
            TimingEvent::DriverComplete => "driver_complete".to_string(),
            TimingEvent::MapperComplete => "mapper_complete".to_string(),
            TimingEvent::UnitComplete(index) => format!("unit_{:06}_complete", index),
            TimingEvent::WorkComplete => "work_complete".to_string(),
            TimingEvent::ReduceStarted => "reduce_started".to_string(),
            TimingEvent::ReduceComplete => "reduce_complete".to_string(),
            TimingEvent::JobFailed => "job_failed".to_string(),
        }
    }
}

impl std::fmt::Display for TimingEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.key())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimingRecord {
    pub job_id: JobId,
    pub event: String,
    pub at: i64, // epoch ms
}
