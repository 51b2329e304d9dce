//! Postgres-backed job state repository.
//!
//! One row per user holds the whole board as a JSONB document:
//!
//! | Column | Type | Notes |
//! |--------|------|-------|
//! | `user_id` | `uuid` | primary key (partition key of the store) |
//! | `state` | `jsonb` | serialized `UserJobBoard` |
//! | `updated_at` | `timestamptz` | set on every save |
//!
//! Saves are single-statement upserts, so a returned `Ok` means the board is
//! committed.
//!
//! Job ids are claimed in `brief_job_ids` (`job_id` primary key, `user_id`),
//! which keeps an id owned by one user across all boards.

use std::sync::Arc;

use async_trait::async_trait;
use sqlx::{PgPool, Row};
use tracing::{Span, instrument};

use civicbrief_core::{JobId, JobRecord, UserId, UserJobBoard};

use super::store::{JobStateRepository, JobStoreError};

#[derive(Debug, Clone)]
pub struct PostgresJobStateRepository {
    pool: Arc<PgPool>,
}

impl PostgresJobStateRepository {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
        }
    }

    /// Create the backing table if it does not exist.
    pub async fn ensure_schema(&self) -> Result<(), JobStoreError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS user_job_state (
                user_id UUID PRIMARY KEY,
                state JSONB NOT NULL,
                updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
            )
            "#,
        )
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("ensure_schema", e))?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS brief_job_ids (
                job_id UUID PRIMARY KEY,
                user_id UUID NOT NULL,
                claimed_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
            )
            "#,
        )
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("ensure_schema", e))?;
        Ok(())
    }
}

#[async_trait]
impl JobStateRepository for PostgresJobStateRepository {
    #[instrument(skip(self), fields(user_id = %user_id, operation), err)]
    async fn load(&self, user_id: UserId) -> Result<Option<UserJobBoard>, JobStoreError> {
        Span::current().record("operation", "load_job_state");

        let row = sqlx::query(
            r#"
            SELECT state
            FROM user_job_state
            WHERE user_id = $1
            "#,
        )
        .bind(user_id.as_uuid())
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("load_job_state", e))?;

        let Some(row) = row else {
            return Ok(None);
        };
        let state: serde_json::Value = row
            .try_get("state")
            .map_err(|e| map_sqlx_error("load_job_state", e))?;
        serde_json::from_value(state)
            .map(Some)
            .map_err(|e| JobStoreError::Serialization(format!("user {}: {}", user_id, e)))
    }

    #[instrument(skip(self, board), fields(user_id = %board.user_id, operation), err)]
    async fn save(&self, board: &UserJobBoard) -> Result<(), JobStoreError> {
        Span::current().record("operation", "save_job_state");

        let state =
            serde_json::to_value(board).map_err(|e| JobStoreError::Serialization(e.to_string()))?;

        sqlx::query(
            r#"
            INSERT INTO user_job_state (user_id, state, updated_at)
            VALUES ($1, $2, NOW())
            ON CONFLICT (user_id) DO UPDATE SET
                state = EXCLUDED.state,
                updated_at = NOW()
            "#,
        )
        .bind(board.user_id.as_uuid())
        .bind(state)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("save_job_state", e))?;

        Ok(())
    }

    #[instrument(skip(self), fields(job_id = %job_id, user_id = %user_id, operation), err)]
    async fn claim_job_id(
        &self,
        job_id: JobId,
        user_id: UserId,
    ) -> Result<Option<UserId>, JobStoreError> {
        Span::current().record("operation", "claim_job_id");

        // Both branches read the pre-insert snapshot, so exactly one row comes back.
        let row = sqlx::query(
            r#"
            WITH inserted AS (
                INSERT INTO brief_job_ids (job_id, user_id)
                VALUES ($1, $2)
                ON CONFLICT (job_id) DO NOTHING
                RETURNING user_id
            )
            SELECT user_id, TRUE AS claimed FROM inserted
            UNION ALL
            SELECT user_id, FALSE AS claimed
            FROM brief_job_ids
            WHERE job_id = $1 AND NOT EXISTS (SELECT 1 FROM inserted)
            "#,
        )
        .bind(job_id.as_uuid())
        .bind(user_id.as_uuid())
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("claim_job_id", e))?;

        let Some(row) = row else {
            return Err(JobStoreError::Conflict(format!(
                "job id {job_id} was released while being claimed"
            )));
        };
        let claimed: bool = row
            .try_get("claimed")
            .map_err(|e| map_sqlx_error("claim_job_id", e))?;
        if claimed {
            return Ok(None);
        }
        let owner: uuid::Uuid = row
            .try_get("user_id")
            .map_err(|e| map_sqlx_error("claim_job_id", e))?;
        Ok(Some(UserId::from_uuid(owner)))
    }

    #[instrument(skip(self), fields(job_id = %job_id, user_id = %user_id, operation), err)]
    async fn release_job_id(&self, job_id: JobId, user_id: UserId) -> Result<(), JobStoreError> {
        Span::current().record("operation", "release_job_id");

        sqlx::query("DELETE FROM brief_job_ids WHERE job_id = $1 AND user_id = $2")
            .bind(job_id.as_uuid())
            .bind(user_id.as_uuid())
            .execute(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("release_job_id", e))?;
        Ok(())
    }

    #[instrument(skip(self), fields(operation), err)]
    async fn list_unfinished(&self) -> Result<Vec<JobRecord>, JobStoreError> {
        Span::current().record("operation", "list_unfinished");

        let rows = sqlx::query("SELECT user_id, state FROM user_job_state")
            .fetch_all(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("list_unfinished", e))?;

        let mut jobs = Vec::new();
        for row in rows {
            let user_id: uuid::Uuid = row
                .try_get("user_id")
                .map_err(|e| map_sqlx_error("list_unfinished", e))?;
            let state: serde_json::Value = row
                .try_get("state")
                .map_err(|e| map_sqlx_error("list_unfinished", e))?;
            let board: UserJobBoard = serde_json::from_value(state)
                .map_err(|e| JobStoreError::Serialization(format!("user {}: {}", user_id, e)))?;
            jobs.extend(board.unfinished().cloned());
        }
        Ok(jobs)
    }
}

fn map_sqlx_error(operation: &str, err: sqlx::Error) -> JobStoreError {
    match err {
        sqlx::Error::Database(db_err) => {
            JobStoreError::Storage(format!("database error in {}: {}", operation, db_err.message()))
        }
        sqlx::Error::PoolClosed => {
            JobStoreError::Storage(format!("connection pool closed in {}", operation))
        }
        sqlx::Error::ColumnDecode { .. } | sqlx::Error::Decode(_) => {
            JobStoreError::Serialization(format!("decode error in {}: {}", operation, err))
        }
        _ => JobStoreError::Storage(format!("sqlx error in {}: {}", operation, err)),
    }
}
