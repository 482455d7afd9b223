//! RPC Request/Response Types
//!
//! Defines the JSON-RPC method parameters and results.

use mergeflow_core::domain::{
    InputFile, JobRequest, JobState, MergeParams, OutputDestination, TimingRecord,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// job.submit.v1 - Submit a filter-and-merge job
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubmitRequest {
    #[serde(default)]
    pub job_id: Option<String>,
    pub inputs: Vec<InputFile>,
    pub destination: String,
    pub format: String,
    #[serde(default)]
    pub filter: Option<String>,
}

impl From<SubmitRequest> for JobRequest {
    fn from(req: SubmitRequest) -> Self {
        JobRequest {
            job_id: req.job_id,
            inputs: req.inputs,
            destination: OutputDestination::new(req.destination),
            params: MergeParams {
                format: req.format,
                filter: req.filter,
            },
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubmitResponse {
    pub job_id: String,
    pub status: String,
}

/// job.poll.v1 / job.timings.v1 - Identify a job
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobIdRequest {
    pub job_id: String,
}

/// job.poll.v1 result: the job's current state record
pub type PollResponse = JobState;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimingsResponse {
    pub job_id: String,
    pub timings: Vec<TimingEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimingEntry {
    pub event: String,
    pub at: i64,
}

impl From<TimingRecord> for TimingEntry {
    fn from(record: TimingRecord) -> Self {
        Self {
            event: record.event,
            at: record.at,
        }
    }
}

/// admin.stats.v1 - Get system statistics
#[derive(Debug, Default, Deserialize)]
pub struct StatsRequest {
    // No parameters needed
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatsResponse {
    pub total_jobs: i64,
    pub jobs_by_status: BTreeMap<String, i64>,
    pub queued_invocations: i64,
    pub running_invocations: i64,
    pub dead_letters: i64,
    pub db_size_bytes: i64,
    pub uptime_seconds: i64,
}
