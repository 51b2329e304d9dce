//! The Job Record: one request to produce an audio brief for a user.
//!
//! A record is plain data plus one mutation entry point, [`JobRecord::apply`],
//! which merges a [`JobPatch`] field by field and enforces the
//! `queued -> processing -> {completed | failed}` state machine.

use core::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};

use crate::error::{DomainError, DomainResult};
use crate::id::{JobId, UserId};

/// Brief variant. Drives pipeline parameters such as target length.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BriefType {
    Daily,
    Weekly,
}

impl BriefType {
    pub fn as_str(&self) -> &'static str {
        match self {
            BriefType::Daily => "daily",
            BriefType::Weekly => "weekly",
        }
    }

    /// Target spoken length in minutes.
    pub fn target_minutes(&self) -> u32 {
        match self {
            BriefType::Daily => 5,
            BriefType::Weekly => 15,
        }
    }
}

impl FromStr for BriefType {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "daily" => Ok(BriefType::Daily),
            "weekly" => Ok(BriefType::Weekly),
            other => Err(DomainError::validation(format!(
                "invalid brief type: {other} (expected daily or weekly)"
            ))),
        }
    }
}

impl core::fmt::Display for BriefType {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Job lifecycle status.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Queued,
    Processing,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Queued => "queued",
            JobStatus::Processing => "processing",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }
}

impl FromStr for JobStatus {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "queued" => Ok(JobStatus::Queued),
            "processing" => Ok(JobStatus::Processing),
            "completed" => Ok(JobStatus::Completed),
            "failed" => Ok(JobStatus::Failed),
            other => Err(DomainError::validation(format!("invalid job status: {other}"))),
        }
    }
}

impl core::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Content identifiers and generation parameters. Immutable once the job exists.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct JobPayload {
    #[serde(default)]
    pub content_ids: Vec<String>,

    /// Free-form generation parameters (voice, focus topics, ...).
    #[serde(flatten)]
    pub params: Map<String, JsonValue>,
}

impl JobPayload {
    pub fn new(content_ids: Vec<String>) -> Self {
        Self {
            content_ids,
            params: Map::new(),
        }
    }

    pub fn with_param(mut self, key: impl Into<String>, value: JsonValue) -> Self {
        self.params.insert(key.into(), value);
        self
    }
}

/// Output artifacts of a completed job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BriefResult {
    pub audio_url: String,
    pub transcript: String,
    pub duration_seconds: u32,
}

/// Marker for a failed attempt that the queue will redeliver.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingRetry {
    /// The attempt that failed (1-based).
    pub attempt: u32,
    pub next_attempt_at: DateTime<Utc>,
}

/// Partial update merged into a [`JobRecord`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct JobPatch {
    pub status: Option<JobStatus>,
    pub progress: Option<u8>,
    pub message: Option<String>,
    pub result: Option<BriefResult>,
    pub error: Option<String>,
    pub retry: Option<PendingRetry>,
}

impl JobPatch {
    /// A worker picked the job up.
    pub fn processing(message: impl Into<String>) -> Self {
        Self {
            status: Some(JobStatus::Processing),
            progress: Some(0),
            message: Some(message.into()),
            ..Self::default()
        }
    }

    /// Progress milestone while processing.
    pub fn checkpoint(progress: u8, message: impl Into<String>) -> Self {
        Self {
            progress: Some(progress),
            message: Some(message.into()),
            ..Self::default()
        }
    }

    pub fn completed(result: BriefResult) -> Self {
        Self {
            status: Some(JobStatus::Completed),
            progress: Some(100),
            message: Some("Brief ready".to_string()),
            result: Some(result),
            ..Self::default()
        }
    }

    /// Permanent failure.
    pub fn failed(error: impl Into<String>) -> Self {
        let error = error.into();
        Self {
            status: Some(JobStatus::Failed),
            message: Some(format!("Failed: {error}")),
            error: Some(error),
            ..Self::default()
        }
    }

    /// Failed attempt awaiting redelivery; the record stays out of history.
    pub fn retrying(error: impl Into<String>, retry: PendingRetry) -> Self {
        let error = error.into();
        Self {
            status: Some(JobStatus::Failed),
            message: Some(format!(
                "Attempt {} failed, retrying at {}",
                retry.attempt,
                retry.next_attempt_at.to_rfc3339()
            )),
            error: Some(error),
            retry: Some(retry),
            ..Self::default()
        }
    }
}

/// The durable unit of work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRecord {
    pub id: JobId,
    #[serde(rename = "type")]
    pub job_type: BriefType,
    pub user_id: UserId,
    pub payload: JobPayload,
    pub created_at: DateTime<Utc>,
    pub status: JobStatus,
    pub progress: u8,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<BriefResult>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    /// Number of times the job entered `processing`.
    #[serde(default)]
    pub attempts: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry: Option<PendingRetry>,
    pub updated_at: DateTime<Utc>,
}

impl JobRecord {
    pub fn new(
        id: JobId,
        user_id: UserId,
        job_type: BriefType,
        payload: JobPayload,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id,
            job_type,
            user_id,
            payload,
            created_at: now,
            status: JobStatus::Queued,
            progress: 0,
            message: "Queued".to_string(),
            result: None,
            error: None,
            completed_at: None,
            attempts: 0,
            retry: None,
            updated_at: now,
        }
    }

    /// Terminal and not awaiting redelivery: no further transitions occur.
    pub fn is_finalized(&self) -> bool {
        self.status.is_terminal() && self.retry.is_none()
    }

    fn can_move_to(&self, next: JobStatus) -> bool {
        match (self.status, next) {
            (JobStatus::Queued, JobStatus::Queued | JobStatus::Processing | JobStatus::Failed) => {
                true
            }
            (
                JobStatus::Processing,
                JobStatus::Processing | JobStatus::Completed | JobStatus::Failed,
            ) => true,
            (JobStatus::Failed, JobStatus::Processing | JobStatus::Failed) => self.retry.is_some(),
            _ => false,
        }
    }

    /// Merge a patch into the record.
    ///
    /// Re-applying a patch is safe: a finalized record ignores patches with
    /// its own terminal status (or none), so duplicate deliveries converge.
    pub fn apply(&mut self, patch: &JobPatch, now: DateTime<Utc>) -> DomainResult<()> {
        if self.is_finalized() {
            return match patch.status {
                None => Ok(()),
                Some(next) if next == self.status => Ok(()),
                Some(next) => Err(DomainError::invalid_transition(format!(
                    "job {} is already {}, cannot move to {}",
                    self.id, self.status, next
                ))),
            };
        }

        let next = patch.status.unwrap_or(self.status);
        if !self.can_move_to(next) {
            return Err(DomainError::invalid_transition(format!(
                "job {}: {} -> {}",
                self.id, self.status, next
            )));
        }
        if next == JobStatus::Completed && patch.result.is_none() && self.result.is_none() {
            return Err(DomainError::validation("completed job requires a result"));
        }

        let entering_processing = next == JobStatus::Processing && self.status != JobStatus::Processing;
        self.status = next;

        match next {
            JobStatus::Queued => {}
            JobStatus::Processing => {
                if entering_processing {
                    self.progress = 0;
                    self.error = None;
                    self.result = None;
                    self.retry = None;
                    self.attempts += 1;
                }
                if let Some(progress) = patch.progress {
                    self.progress = self.progress.max(progress.min(100));
                }
            }
            JobStatus::Completed => {
                self.progress = 100;
                if let Some(result) = &patch.result {
                    self.result = Some(result.clone());
                }
                self.error = None;
                self.retry = None;
            }
            JobStatus::Failed => {
                self.result = None;
                let error = patch
                    .error
                    .clone()
                    .or_else(|| self.error.take())
                    .unwrap_or_else(|| "unknown error".to_string());
                self.error = Some(error);
                self.retry = patch.retry.clone();
            }
        }

        if let Some(message) = &patch.message {
            self.message = message.clone();
        }
        if self.is_finalized() {
            self.completed_at = Some(now);
        }
        self.updated_at = now;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn queued_job() -> JobRecord {
        JobRecord::new(
            JobId::new(),
            UserId::new(),
            BriefType::Daily,
            JobPayload::new(vec!["hr-1".to_string()]),
            Utc::now(),
        )
    }

    fn result() -> BriefResult {
        BriefResult {
            audio_url: "https://cdn.example/audio.mp3".to_string(),
            transcript: "HOST: hello".to_string(),
            duration_seconds: 42,
        }
    }

    #[test]
    fn processing_resets_progress_and_counts_attempts() {
        let mut job = queued_job();
        job.progress = 55;

        job.apply(&JobPatch::processing("starting"), Utc::now()).unwrap();

        assert_eq!(job.status, JobStatus::Processing);
        assert_eq!(job.progress, 0);
        assert_eq!(job.attempts, 1);
    }

    #[test]
    fn progress_never_decreases_while_processing() {
        let mut job = queued_job();
        job.apply(&JobPatch::processing("starting"), Utc::now()).unwrap();
        job.apply(&JobPatch::checkpoint(60, "audio"), Utc::now()).unwrap();
        job.apply(&JobPatch::checkpoint(40, "late duplicate"), Utc::now()).unwrap();

        assert_eq!(job.progress, 60);
        assert_eq!(job.message, "late duplicate");
    }

    #[test]
    fn completion_sets_result_and_stamps_completed_at_once() {
        let mut job = queued_job();
        job.apply(&JobPatch::processing("starting"), Utc::now()).unwrap();

        let first = Utc::now();
        job.apply(&JobPatch::completed(result()), first).unwrap();
        let snapshot = job.clone();

        job.apply(&JobPatch::completed(result()), first + Duration::seconds(5))
            .unwrap();

        assert_eq!(job, snapshot);
        assert_eq!(job.completed_at, Some(first));
        assert_eq!(job.progress, 100);
        assert!(job.error.is_none());
    }

    #[test]
    fn retrying_failure_is_not_finalized_and_can_resume() {
        let mut job = queued_job();
        job.apply(&JobPatch::processing("starting"), Utc::now()).unwrap();

        let retry = PendingRetry {
            attempt: 1,
            next_attempt_at: Utc::now() + Duration::seconds(60),
        };
        job.apply(&JobPatch::retrying("tts timeout", retry), Utc::now())
            .unwrap();

        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.error.as_deref(), Some("tts timeout"));
        assert!(!job.is_finalized());
        assert!(job.completed_at.is_none());

        job.apply(&JobPatch::processing("retry"), Utc::now()).unwrap();
        assert_eq!(job.status, JobStatus::Processing);
        assert!(job.error.is_none());
        assert!(job.retry.is_none());
        assert_eq!(job.attempts, 2);
    }

    #[test]
    fn finalized_job_rejects_other_statuses() {
        let mut job = queued_job();
        job.apply(&JobPatch::failed("cancelled by user"), Utc::now())
            .unwrap();

        let err = job
            .apply(&JobPatch::processing("late delivery"), Utc::now())
            .unwrap_err();
        assert!(matches!(err, DomainError::InvalidTransition(_)));
    }

    #[test]
    fn queued_job_cannot_complete_directly() {
        let mut job = queued_job();
        let err = job
            .apply(&JobPatch::completed(result()), Utc::now())
            .unwrap_err();
        assert!(matches!(err, DomainError::InvalidTransition(_)));
    }

    #[test]
    fn record_serializes_type_field_and_omits_empty_terminal_fields() {
        let job = queued_job();
        let json = serde_json::to_value(&job).unwrap();

        assert_eq!(json["type"], "daily");
        assert_eq!(json["status"], "queued");
        assert!(json.get("result").is_none());
        assert!(json.get("error").is_none());
        assert_eq!(json["payload"]["content_ids"][0], "hr-1");
    }

    #[test]
    fn brief_type_parses_case_insensitively() {
        assert_eq!("Weekly".parse::<BriefType>().unwrap(), BriefType::Weekly);
        assert!("monthly".parse::<BriefType>().is_err());
    }
}
