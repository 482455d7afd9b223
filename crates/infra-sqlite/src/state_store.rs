// SQLite StateStore Implementation

use crate::error::map_sqlx_error;
use async_trait::async_trait;
use mergeflow_core::domain::{
    DomainError, JobState, JobStatus, OutputDestination, TimingEvent, TimingRecord,
};
use mergeflow_core::error::{AppError, Result};
use mergeflow_core::port::{StateStore, TimeProvider, UnitCompletion};
use sqlx::SqlitePool;
use std::sync::Arc;

const TERMINAL: (&str, &str) = ("DONE", "FAILED");

pub struct SqliteStateStore {
    pool: SqlitePool,
    time_provider: Arc<dyn TimeProvider>,
}

impl SqliteStateStore {
    pub fn new(pool: SqlitePool, time_provider: Arc<dyn TimeProvider>) -> Self {
        Self {
            pool,
            time_provider,
        }
    }

    /// Distinguishes "no such job" from "condition not met" after a
    /// conditional update touched no rows
    async fn ensure_exists(&self, job_id: &str) -> Result<()> {
        let exists: Option<String> = sqlx::query_scalar("SELECT status FROM jobs WHERE job_id = ?")
            .bind(job_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(map_sqlx_error)?;
        match exists {
            Some(_) => Ok(()),
            None => Err(AppError::NotFound(format!("Job {} not found", job_id))),
        }
    }
}

#[async_trait]
impl StateStore for SqliteStateStore {
    async fn insert(&self, state: &JobState) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO jobs (
                job_id, status, destination, format, input_count,
                expected_units, completed_units, failure_reason,
                created_at, updated_at, completed_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&state.job_id)
        .bind(state.status.as_str())
        .bind(state.destination.as_str())
        .bind(&state.format)
        .bind(state.input_count as i64)
        .bind(state.expected_units.map(|n| n as i64))
        .bind(state.completed_units as i64)
        .bind(&state.failure_reason)
        .bind(state.created_at)
        .bind(state.updated_at)
        .bind(state.completed_at)
        .execute(&self.pool)
        .await
        .map_err(|e| match map_sqlx_error(e) {
            AppError::Conflict(_) => {
                AppError::Conflict(format!("Job {} already exists", state.job_id))
            }
            other => other,
        })?;

        Ok(())
    }

    async fn get(&self, job_id: &str) -> Result<Option<JobState>> {
        let row = sqlx::query_as::<_, JobRow>("SELECT * FROM jobs WHERE job_id = ?")
            .bind(job_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(map_sqlx_error)?;

        row.map(JobRow::into_state).transpose()
    }

    async fn compare_and_set_status(
        &self,
        job_id: &str,
        from: JobStatus,
        to: JobStatus,
    ) -> Result<bool> {
        if !from.can_transition_to(to) {
            return Err(DomainError::InvalidStateTransition {
                from: from.to_string(),
                to: to.to_string(),
            }
            .into());
        }

        let now = self.time_provider.now_millis();
        let completed_at = to.is_terminal().then_some(now);

        // Conditional update: only one concurrent caller can win
        let result = sqlx::query(
            r#"
            UPDATE jobs
            SET status = ?, updated_at = ?, completed_at = COALESCE(?, completed_at)
            WHERE job_id = ? AND status = ?
            "#,
        )
        .bind(to.as_str())
        .bind(now)
        .bind(completed_at)
        .bind(job_id)
        .bind(from.as_str())
        .execute(&self.pool)
        .await
        .map_err(map_sqlx_error)?;

        if result.rows_affected() == 0 {
            self.ensure_exists(job_id).await?;
            return Ok(false);
        }
        Ok(true)
    }

    async fn begin_working(&self, job_id: &str, expected_units: u64) -> Result<bool> {
        let now = self.time_provider.now_millis();
        let expected = expected_units as i64;

        let result = sqlx::query(
            r#"
            UPDATE jobs
            SET status = ?, expected_units = ?, updated_at = ?
            WHERE job_id = ?
              AND status = ?
              AND (expected_units IS NULL OR expected_units = ?)
            "#,
        )
        .bind(JobStatus::Working.as_str())
        .bind(expected)
        .bind(now)
        .bind(job_id)
        .bind(JobStatus::Mapping.as_str())
        .bind(expected)
        .execute(&self.pool)
        .await
        .map_err(map_sqlx_error)?;

        if result.rows_affected() == 0 {
            self.ensure_exists(job_id).await?;
            return Ok(false);
        }
        Ok(true)
    }

    async fn complete_unit(&self, job_id: &str, unit_index: u64) -> Result<UnitCompletion> {
        let now = self.time_provider.now_millis();
        let mut tx = self.pool.begin().await.map_err(map_sqlx_error)?;

        // Write first so the transaction takes the write lock immediately
        let marker = sqlx::query(
            r#"
            INSERT INTO unit_completions (job_id, unit_index, completed_at)
            VALUES (?, ?, ?)
            ON CONFLICT (job_id, unit_index) DO NOTHING
            "#,
        )
        .bind(job_id)
        .bind(unit_index as i64)
        .bind(now)
        .execute(&mut *tx)
        .await
        .map_err(map_sqlx_error)?;

        if marker.rows_affected() == 0 {
            tx.rollback().await.map_err(map_sqlx_error)?;
            return Ok(UnitCompletion::Duplicate);
        }

        let completed: Option<i64> = sqlx::query_scalar(
            r#"
            UPDATE jobs
            SET completed_units = completed_units + 1, updated_at = ?
            WHERE job_id = ?
              AND status NOT IN (?, ?)
              AND expected_units IS NOT NULL
              AND completed_units < expected_units
            RETURNING completed_units
            "#,
        )
        .bind(now)
        .bind(job_id)
        .bind(TERMINAL.0)
        .bind(TERMINAL.1)
        .fetch_optional(&mut *tx)
        .await
        .map_err(map_sqlx_error)?;

        match completed {
            Some(completed_units) => {
                tx.commit().await.map_err(map_sqlx_error)?;
                Ok(UnitCompletion::Recorded {
                    completed_units: completed_units as u64,
                })
            }
            None => {
                tx.rollback().await.map_err(map_sqlx_error)?;
                self.ensure_exists(job_id).await?;
                Ok(UnitCompletion::Rejected)
            }
        }
    }

    async fn mark_failed(&self, job_id: &str, reason: &str) -> Result<bool> {
        let now = self.time_provider.now_millis();

        let result = sqlx::query(
            r#"
            UPDATE jobs
            SET status = ?, failure_reason = ?, updated_at = ?, completed_at = ?
            WHERE job_id = ? AND status NOT IN (?, ?)
            "#,
        )
        .bind(JobStatus::Failed.as_str())
        .bind(reason)
        .bind(now)
        .bind(now)
        .bind(job_id)
        .bind(TERMINAL.0)
        .bind(TERMINAL.1)
        .execute(&self.pool)
        .await
        .map_err(map_sqlx_error)?;

        if result.rows_affected() == 0 {
            self.ensure_exists(job_id).await?;
            return Ok(false);
        }
        Ok(true)
    }

    async fn record_timing(&self, job_id: &str, event: TimingEvent) -> Result<()> {
        let now = self.time_provider.now_millis();
        sqlx::query(
            r#"
            INSERT INTO job_timings (job_id, event, at) VALUES (?, ?, ?)
            ON CONFLICT (job_id, event) DO UPDATE SET at = excluded.at
            "#,
        )
        .bind(job_id)
        .bind(event.key())
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(map_sqlx_error)?;
        Ok(())
    }

    async fn timings(&self, job_id: &str) -> Result<Vec<TimingRecord>> {
        let rows: Vec<(String, String, i64)> = sqlx::query_as(
            "SELECT job_id, event, at FROM job_timings WHERE job_id = ? ORDER BY at ASC, event ASC",
        )
        .bind(job_id)
        .fetch_all(&self.pool)
        .await
        .map_err(map_sqlx_error)?;

        Ok(rows
            .into_iter()
            .map(|(job_id, event, at)| TimingRecord { job_id, event, at })
            .collect())
    }

    async fn find_stalled(&self, updated_before: i64) -> Result<Vec<JobState>> {
        let rows: Vec<JobRow> = sqlx::query_as(
            r#"
            SELECT * FROM jobs
            WHERE status NOT IN (?, ?) AND updated_at < ?
            ORDER BY updated_at ASC
            "#,
        )
        .bind(TERMINAL.0)
        .bind(TERMINAL.1)
        .bind(updated_before)
        .fetch_all(&self.pool)
        .await
        .map_err(map_sqlx_error)?;

        rows.into_iter().map(JobRow::into_state).collect()
    }

    async fn count_by_status(&self, status: JobStatus) -> Result<i64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM jobs WHERE status = ?")
            .bind(status.as_str())
            .fetch_one(&self.pool)
            .await
            .map_err(map_sqlx_error)?;
        Ok(count)
    }
}

/// SQLite row representation
#[derive(Debug, sqlx::FromRow)]
struct JobRow {
    job_id: String,
    status: String,
    destination: String,
    format: String,
    input_count: i64,
    expected_units: Option<i64>,
    completed_units: i64,
    failure_reason: Option<String>,
    created_at: i64,
    updated_at: i64,
    completed_at: Option<i64>,
}

impl JobRow {
    fn into_state(self) -> Result<JobState> {
        Ok(JobState {
            status: self.status.parse()?,
            job_id: self.job_id,
            destination: OutputDestination::new(self.destination),
            format: self.format,
            input_count: self.input_count as u64,
            expected_units: self.expected_units.map(|n| n as u64),
            completed_units: self.completed_units as u64,
            failure_reason: self.failure_reason,
            created_at: self.created_at,
            updated_at: self.updated_at,
            completed_at: self.completed_at,
        })
    }
}
