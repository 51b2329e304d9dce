//! Generated brief archive (metadata persistence stage).

use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use sqlx::PgPool;
use tracing::{Span, instrument};

use civicbrief_core::UserId;

use super::ports::{ArchiveError, BriefArchive, GeneratedBrief};

/// In-memory archive for tests/dev. Re-recording a job replaces its entry.
#[derive(Debug, Default)]
pub struct InMemoryBriefArchive {
    briefs: RwLock<Vec<GeneratedBrief>>,
}

impl InMemoryBriefArchive {
    pub fn new() -> Self {
        Self::default()
    }

    /// Archived briefs for a user, newest first.
    pub fn for_user(&self, user_id: UserId) -> Vec<GeneratedBrief> {
        let Ok(briefs) = self.briefs.read() else {
            return Vec::new();
        };
        let mut out: Vec<_> = briefs
            .iter()
            .filter(|b| b.user_id == user_id)
            .cloned()
            .collect();
        out.sort_by(|a, b| b.generated_at.cmp(&a.generated_at));
        out
    }
}

#[async_trait]
impl BriefArchive for InMemoryBriefArchive {
    async fn record(&self, brief: &GeneratedBrief) -> Result<(), ArchiveError> {
        let mut briefs = self
            .briefs
            .write()
            .map_err(|_| ArchiveError::Storage("archive lock poisoned".to_string()))?;
        briefs.retain(|b| b.job_id != brief.job_id);
        briefs.push(brief.clone());
        Ok(())
    }
}

/// Postgres archive over the `generated_briefs` table.
#[derive(Debug, Clone)]
pub struct PostgresBriefArchive {
    pool: Arc<PgPool>,
}

impl PostgresBriefArchive {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
        }
    }

    pub async fn ensure_schema(&self) -> Result<(), ArchiveError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS generated_briefs (
                job_id UUID PRIMARY KEY,
                user_id UUID NOT NULL,
                brief_type TEXT NOT NULL,
                audio_url TEXT NOT NULL,
                transcript TEXT NOT NULL,
                duration_seconds INTEGER NOT NULL,
                content_ids JSONB NOT NULL,
                generated_at TIMESTAMPTZ NOT NULL
            )
            "#,
        )
        .execute(&*self.pool)
        .await
        .map_err(|e| ArchiveError::Storage(format!("ensure_schema: {e}")))?;
        Ok(())
    }
}

#[async_trait]
impl BriefArchive for PostgresBriefArchive {
    #[instrument(skip(self, brief), fields(job_id = %brief.job_id, operation), err)]
    async fn record(&self, brief: &GeneratedBrief) -> Result<(), ArchiveError> {
        Span::current().record("operation", "record_brief");

        let content_ids = serde_json::to_value(&brief.content_ids)
            .map_err(|e| ArchiveError::Serialization(e.to_string()))?;
        let duration = i32::try_from(brief.duration_seconds).unwrap_or(i32::MAX);

        sqlx::query(
            r#"
            INSERT INTO generated_briefs (
                job_id, user_id, brief_type, audio_url, transcript,
                duration_seconds, content_ids, generated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            ON CONFLICT (job_id) DO UPDATE SET
                audio_url = EXCLUDED.audio_url,
                transcript = EXCLUDED.transcript,
                duration_seconds = EXCLUDED.duration_seconds,
                content_ids = EXCLUDED.content_ids,
                generated_at = EXCLUDED.generated_at
            WHERE generated_briefs.user_id = EXCLUDED.user_id
            "#,
        )
        .bind(brief.job_id.as_uuid())
        .bind(brief.user_id.as_uuid())
        .bind(brief.job_type.as_str())
        .bind(&brief.audio_url)
        .bind(&brief.transcript)
        .bind(duration)
        .bind(content_ids)
        .bind(brief.generated_at)
        .execute(&*self.pool)
        .await
        .map_err(|e| ArchiveError::Storage(format!("record_brief: {e}")))?;

        Ok(())
    }
}
