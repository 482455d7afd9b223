// SQLite InvocationQueue Implementation
// Durable at-least-once delivery of stage invocations

use crate::error::map_sqlx_error;
use async_trait::async_trait;
use mergeflow_core::domain::{InvocationId, InvocationState, QueuedInvocation, StageInvocation};
use mergeflow_core::error::{AppError, Result};
use mergeflow_core::port::{IdProvider, InvocationQueue, TimeProvider};
use sqlx::SqlitePool;
use std::sync::Arc;
use tracing::debug;

pub struct SqliteInvocationQueue {
    pool: SqlitePool,
    time_provider: Arc<dyn TimeProvider>,
    id_provider: Arc<dyn IdProvider>,
}

impl SqliteInvocationQueue {
    pub fn new(
        pool: SqlitePool,
        time_provider: Arc<dyn TimeProvider>,
        id_provider: Arc<dyn IdProvider>,
    ) -> Self {
        Self {
            pool,
            time_provider,
            id_provider,
        }
    }

    /// Transition a RUNNING invocation; errors if it does not exist
    async fn finish(&self, id: &str, state: InvocationState, error: Option<&str>) -> Result<()> {
        let now = self.time_provider.now_millis();
        let result = sqlx::query(
            r#"
            UPDATE invocations
            SET state = ?, finished_at = ?, last_error = COALESCE(?, last_error)
            WHERE id = ?
            "#,
        )
        .bind(state.to_string())
        .bind(now)
        .bind(error)
        .bind(id)
        .execute(&self.pool)
        .await
        .map_err(map_sqlx_error)?;

        if result.rows_affected() == 0 {
            return Err(AppError::NotFound(format!("Invocation {} not found", id)));
        }
        Ok(())
    }
}

#[async_trait]
impl InvocationQueue for SqliteInvocationQueue {
    async fn enqueue(
        &self,
        invocation: &StageInvocation,
        max_attempts: u32,
        backoff_factor: f64,
    ) -> Result<InvocationId> {
        let id = self.id_provider.generate_id();
        let now = self.time_provider.now_millis();
        let payload = serde_json::to_string(invocation)?;

        sqlx::query(
            r#"
            INSERT INTO invocations (
                id, job_id, stage, payload, state, attempts, max_attempts,
                backoff_factor, available_at, created_at
            ) VALUES (?, ?, ?, ?, ?, 0, ?, ?, ?, ?)
            "#,
        )
        .bind(&id)
        .bind(invocation.job_id())
        .bind(invocation.stage().to_string())
        .bind(payload)
        .bind(InvocationState::Queued.to_string())
        .bind(max_attempts as i64)
        .bind(backoff_factor)
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(map_sqlx_error)?;

        debug!(
            invocation_id = %id,
            job_id = %invocation.job_id(),
            stage = %invocation.stage(),
            "Invocation enqueued"
        );
        Ok(id)
    }

    async fn pop_next(&self) -> Result<Option<QueuedInvocation>> {
        let now = self.time_provider.now_millis();

        // Claim in one statement so two workers never get the same row
        let row = sqlx::query_as::<_, InvocationRow>(
            r#"
            UPDATE invocations
            SET state = ?, attempts = attempts + 1, started_at = ?
            WHERE id = (
                SELECT id FROM invocations
                WHERE state = ? AND available_at <= ?
                ORDER BY available_at ASC, created_at ASC, id ASC
                LIMIT 1
            )
            RETURNING id, payload, attempts, max_attempts, backoff_factor, created_at, started_at
            "#,
        )
        .bind(InvocationState::Running.to_string())
        .bind(now)
        .bind(InvocationState::Queued.to_string())
        .bind(now)
        .fetch_optional(&self.pool)
        .await
        .map_err(map_sqlx_error)?;

        row.map(InvocationRow::into_queued).transpose()
    }

    async fn ack(&self, id: &str) -> Result<()> {
        self.finish(id, InvocationState::Done, None).await
    }

    async fn requeue(&self, id: &str, available_at: i64, error: &str) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE invocations
            SET state = ?, available_at = ?, started_at = NULL, last_error = ?
            WHERE id = ?
            "#,
        )
        .bind(InvocationState::Queued.to_string())
        .bind(available_at)
        .bind(error)
        .bind(id)
        .execute(&self.pool)
        .await
        .map_err(map_sqlx_error)?;

        if result.rows_affected() == 0 {
            return Err(AppError::NotFound(format!("Invocation {} not found", id)));
        }
        Ok(())
    }

    async fn fail(&self, id: &str, error: &str) -> Result<()> {
        self.finish(id, InvocationState::Failed, Some(error)).await
    }

    async fn requeue_orphaned(&self, started_before: i64) -> Result<u64> {
        let now = self.time_provider.now_millis();
        let result = sqlx::query(
            r#"
            UPDATE invocations
            SET state = ?, available_at = ?, started_at = NULL
            WHERE state = ? AND started_at IS NOT NULL AND started_at < ?
            "#,
        )
        .bind(InvocationState::Queued.to_string())
        .bind(now)
        .bind(InvocationState::Running.to_string())
        .bind(started_before)
        .execute(&self.pool)
        .await
        .map_err(map_sqlx_error)?;

        Ok(result.rows_affected())
    }

    async fn count_by_state(&self, state: InvocationState) -> Result<i64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM invocations WHERE state = ?")
            .bind(state.to_string())
            .fetch_one(&self.pool)
            .await
            .map_err(map_sqlx_error)?;
        Ok(count)
    }
}

#[derive(Debug, sqlx::FromRow)]
struct InvocationRow {
    id: String,
    payload: String,
    attempts: i64,
    max_attempts: i64,
    backoff_factor: f64,
    created_at: i64,
    started_at: Option<i64>,
}

impl InvocationRow {
    fn into_queued(self) -> Result<QueuedInvocation> {
        Ok(QueuedInvocation {
            invocation: serde_json::from_str(&self.payload)?,
            id: self.id,
            attempts: self.attempts as u32,
            max_attempts: self.max_attempts as u32,
            backoff_factor: self.backoff_factor,
            created_at: self.created_at,
            started_at: self.started_at,
        })
    }
}
