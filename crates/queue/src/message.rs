use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use civicbrief_core::{BriefType, JobId, JobPayload, UserId};

/// Work item handed from submission to the dispatcher.
///
/// Carries everything a worker needs to run the pipeline without reading the
/// job store first; the store remains the source of truth for status.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobMessage {
    pub job_id: JobId,
    pub user_id: UserId,
    #[serde(rename = "type")]
    pub job_type: BriefType,
    pub payload: JobPayload,
    pub enqueued_at: DateTime<Utc>,
    /// Attempts already spent on this job before the message was published.
    #[serde(default)]
    pub prior_attempts: u32,
}

impl JobMessage {
    pub fn new(job_id: JobId, user_id: UserId, job_type: BriefType, payload: JobPayload) -> Self {
        Self {
            job_id,
            user_id,
            job_type,
            payload,
            enqueued_at: Utc::now(),
            prior_attempts: 0,
        }
    }

    pub fn with_prior_attempts(mut self, attempts: u32) -> Self {
        self.prior_attempts = attempts;
        self
    }
}

/// Opaque token identifying one in-flight delivery.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ReceiptHandle(String);

impl ReceiptHandle {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl core::fmt::Display for ReceiptHandle {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(&self.0)
    }
}

/// A received message plus its delivery bookkeeping.
#[derive(Debug, Clone, PartialEq)]
pub struct Delivery {
    pub message: JobMessage,
    /// How many times this message has been delivered, including this one (1-based).
    pub attempts: u32,
    pub receipt: ReceiptHandle,
}
