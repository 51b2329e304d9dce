use serde::{Deserialize, Serialize};

use chrono::{DateTime, Utc};
use civicbrief_core::{
    BriefResult, BriefType, JobId, JobPayload, JobRecord, JobStatus,
};
use civicbrief_infra::JobRequest;

use crate::app::errors;

// -------------------------
// Request DTOs
// -------------------------

#[derive(Debug, Deserialize)]
pub struct SubmitBriefRequest {
    #[serde(default)]
    pub job_id: Option<String>,
    #[serde(rename = "type")]
    pub brief_type: String,
    #[serde(default)]
    pub payload: JobPayload,
}

impl SubmitBriefRequest {
    pub fn into_job_request(self) -> Result<JobRequest, axum::response::Response> {
        let brief_type = parse_brief_type(&self.brief_type)?;
        let mut request = JobRequest::new(brief_type, self.payload);
        if let Some(raw) = self.job_id {
            let job_id = parse_job_id(&raw)?;
            request = request.with_job_id(job_id);
        }
        Ok(request)
    }
}

#[derive(Debug, Deserialize)]
pub struct FanOutQuery {
    #[serde(rename = "type")]
    pub brief_type: String,
}

#[derive(Debug, Deserialize)]
pub struct SubscriptionRequest {
    pub types: Vec<String>,
    #[serde(default)]
    pub payload: JobPayload,
}

// -------------------------
// Response DTOs
// -------------------------

/// Public view of a job record.
#[derive(Debug, Serialize)]
pub struct JobView {
    pub job_id: JobId,
    #[serde(rename = "type")]
    pub brief_type: BriefType,
    pub status: JobStatus,
    pub progress: u8,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<BriefResult>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub queue_position: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_attempt_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

impl JobView {
    pub fn from_record(job: JobRecord, queue_position: Option<usize>) -> Self {
        Self {
            job_id: job.id,
            brief_type: job.job_type,
            status: job.status,
            progress: job.progress,
            message: job.message,
            result: job.result,
            error: job.error,
            queue_position,
            next_attempt_at: job.retry.map(|r| r.next_attempt_at),
            created_at: job.created_at,
            completed_at: job.completed_at,
        }
    }
}

// -------------------------
// Parsing helpers
// -------------------------

pub fn parse_brief_type(s: &str) -> Result<BriefType, axum::response::Response> {
    s.parse::<BriefType>().map_err(|_| {
        errors::json_error(
            axum::http::StatusCode::BAD_REQUEST,
            "invalid_brief_type",
            "type must be one of: daily, weekly",
        )
    })
}

pub fn parse_job_id(s: &str) -> Result<JobId, axum::response::Response> {
    s.parse::<JobId>().map_err(|e| {
        errors::json_error(
            axum::http::StatusCode::BAD_REQUEST,
            "invalid_id",
            e.to_string(),
        )
    })
}
