//! Collaborator ports consumed by the brief pipeline.
//!
//! Each port is an opaque external service with a call/response contract and
//! its own error type. Implementations live in `dev` (local stand-ins) or in
//! deployment-specific crates.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use civicbrief_core::{BriefType, JobId, JobPayload, UserId};

/// Structured content item (a bill, a news story) feeding the script.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContentRecord {
    pub id: String,
    pub title: String,
    pub summary: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DialogueLine {
    pub speaker: String,
    pub text: String,
}

impl DialogueLine {
    pub fn new(speaker: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            speaker: speaker.into(),
            text: text.into(),
        }
    }
}

/// Metadata stored alongside the uploaded audio.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AudioMetadata {
    pub job_id: JobId,
    pub user_id: UserId,
    #[serde(rename = "type")]
    pub job_type: BriefType,
    pub duration_seconds: u32,
    pub content_ids: Vec<String>,
    pub generated_at: DateTime<Utc>,
}

/// Archive entry written by the metadata persistence stage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GeneratedBrief {
    pub job_id: JobId,
    pub user_id: UserId,
    #[serde(rename = "type")]
    pub job_type: BriefType,
    pub audio_url: String,
    pub transcript: String,
    pub duration_seconds: u32,
    pub content_ids: Vec<String>,
    pub generated_at: DateTime<Utc>,
}

#[async_trait]
pub trait ContentSource: Send + Sync {
    async fn fetch(&self, payload: &JobPayload) -> Result<Vec<ContentRecord>, ContentSourceError>;
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum ContentSourceError {
    #[error("no content available")]
    NoContent,
    #[error("content source unavailable: {0}")]
    Unavailable(String),
}

#[async_trait]
pub trait ScriptGenerator: Send + Sync {
    async fn generate(
        &self,
        content: &[ContentRecord],
        brief_type: BriefType,
    ) -> Result<Vec<DialogueLine>, ScriptError>;
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum ScriptError {
    #[error("script generation failed: {0}")]
    Generation(String),
    #[error("invalid script output: {0}")]
    InvalidOutput(String),
}

#[async_trait]
pub trait AudioSynthesizer: Send + Sync {
    async fn synthesize(&self, lines: &[DialogueLine]) -> Result<Vec<u8>, SynthesisError>;
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum SynthesisError {
    #[error("speech synthesis failed: {0}")]
    Service(String),
    #[error("speech synthesis rejected input: {0}")]
    Rejected(String),
}

#[async_trait]
pub trait ObjectStorage: Send + Sync {
    /// Store the audio durably and return its public URL.
    async fn put(&self, audio: &[u8], metadata: &AudioMetadata) -> Result<String, StorageError>;
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum StorageError {
    #[error("upload failed: {0}")]
    UploadFailed(String),
    #[error("io error: {0}")]
    Io(String),
}

impl From<std::io::Error> for StorageError {
    fn from(err: std::io::Error) -> Self {
        StorageError::Io(err.to_string())
    }
}

#[async_trait]
pub trait BriefArchive: Send + Sync {
    async fn record(&self, brief: &GeneratedBrief) -> Result<(), ArchiveError>;
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum ArchiveError {
    #[error("archive storage error: {0}")]
    Storage(String),
    #[error("archive serialization error: {0}")]
    Serialization(String),
}
