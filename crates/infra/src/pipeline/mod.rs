//! Brief generation pipeline.
//!
//! Stages run in a fixed order, each consuming the previous stage's output:
//!
//! | Stage | Checkpoint | Output |
//! |-------|-----------|--------|
//! | content fetch | 20 | content records |
//! | script generation | 40 | dialogue lines |
//! | audio synthesis | 60 | audio bytes |
//! | upload | 80 | audio URL |
//! | metadata persistence | 90 | archive entry (best-effort) |
//!
//! Stages know nothing about the job store. Sequencing, checkpoints and the
//! retry decision belong to the dispatcher.

pub mod archive;
pub mod dev;
pub mod ports;

use std::sync::Arc;

use chrono::{DateTime, Utc};

use civicbrief_core::{BriefResult, BriefType, JobId, JobPayload, UserId};

pub use archive::{InMemoryBriefArchive, PostgresBriefArchive};
pub use ports::{
    ArchiveError, AudioMetadata, AudioSynthesizer, BriefArchive, ContentRecord, ContentSource,
    ContentSourceError, DialogueLine, GeneratedBrief, ObjectStorage, ScriptError,
    ScriptGenerator, StorageError, SynthesisError,
};

pub const DEFAULT_AUDIO_BITRATE_KBPS: u32 = 128;

/// Stage failure as seen by the dispatcher.
///
/// External-service errors are wrapped transparently so their text reaches
/// the job record unchanged.
#[derive(Debug, Clone, thiserror::Error)]
pub enum PipelineError {
    #[error("No bills available")]
    NoContent,
    #[error("Script generation returned no dialogue")]
    EmptyScript,
    #[error(transparent)]
    Content(ContentSourceError),
    #[error(transparent)]
    Script(#[from] ScriptError),
    #[error(transparent)]
    Synthesis(#[from] SynthesisError),
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error(transparent)]
    Archive(#[from] ArchiveError),
}

impl From<ContentSourceError> for PipelineError {
    fn from(err: ContentSourceError) -> Self {
        match err {
            ContentSourceError::NoContent => PipelineError::NoContent,
            other => PipelineError::Content(other),
        }
    }
}

/// The ordered stage functions over their collaborators.
#[derive(Clone)]
pub struct BriefPipeline {
    content: Arc<dyn ContentSource>,
    scripts: Arc<dyn ScriptGenerator>,
    synthesizer: Arc<dyn AudioSynthesizer>,
    storage: Arc<dyn ObjectStorage>,
    archive: Arc<dyn BriefArchive>,
    bitrate_kbps: u32,
}

impl std::fmt::Debug for BriefPipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BriefPipeline")
            .field("bitrate_kbps", &self.bitrate_kbps)
            .finish_non_exhaustive()
    }
}

impl BriefPipeline {
    pub fn new(
        content: Arc<dyn ContentSource>,
        scripts: Arc<dyn ScriptGenerator>,
        synthesizer: Arc<dyn AudioSynthesizer>,
        storage: Arc<dyn ObjectStorage>,
        archive: Arc<dyn BriefArchive>,
    ) -> Self {
        Self {
            content,
            scripts,
            synthesizer,
            storage,
            archive,
            bitrate_kbps: DEFAULT_AUDIO_BITRATE_KBPS,
        }
    }

    pub fn with_bitrate_kbps(mut self, kbps: u32) -> Self {
        self.bitrate_kbps = kbps.max(1);
        self
    }

    /// Stage 1. Zero records is a hard failure.
    pub async fn fetch_content(
        &self,
        payload: &JobPayload,
    ) -> Result<Vec<ContentRecord>, PipelineError> {
        let records = self.content.fetch(payload).await?;
        if records.is_empty() {
            return Err(PipelineError::NoContent);
        }
        Ok(records)
    }

    /// Stage 2. An empty script is a hard failure.
    pub async fn generate_script(
        &self,
        content: &[ContentRecord],
        brief_type: BriefType,
    ) -> Result<Vec<DialogueLine>, PipelineError> {
        let lines = self.scripts.generate(content, brief_type).await?;
        if lines.is_empty() {
            return Err(PipelineError::EmptyScript);
        }
        Ok(lines)
    }

    /// Stage 3.
    pub async fn synthesize(&self, lines: &[DialogueLine]) -> Result<Vec<u8>, PipelineError> {
        Ok(self.synthesizer.synthesize(lines).await?)
    }

    /// Stage 4. Returns the durable audio URL.
    pub async fn upload(
        &self,
        audio: &[u8],
        metadata: &AudioMetadata,
    ) -> Result<String, PipelineError> {
        Ok(self.storage.put(audio, metadata).await?)
    }

    /// Stage 5. Callers treat failure as best-effort.
    pub async fn persist_metadata(&self, brief: &GeneratedBrief) -> Result<(), PipelineError> {
        Ok(self.archive.record(brief).await?)
    }

    /// Audio length in whole seconds at the configured constant bitrate.
    pub fn duration_seconds(&self, audio_len: usize) -> u32 {
        let bits = audio_len as u64 * 8;
        let per_second = self.bitrate_kbps as u64 * 1000;
        bits.div_ceil(per_second).min(u32::MAX as u64) as u32
    }

    pub fn audio_metadata(
        &self,
        job_id: JobId,
        user_id: UserId,
        job_type: BriefType,
        content: &[ContentRecord],
        audio_len: usize,
        generated_at: DateTime<Utc>,
    ) -> AudioMetadata {
        AudioMetadata {
            job_id,
            user_id,
            job_type,
            duration_seconds: self.duration_seconds(audio_len),
            content_ids: content.iter().map(|c| c.id.clone()).collect(),
            generated_at,
        }
    }
}

/// Render dialogue as `Speaker: text` lines.
pub fn transcript(lines: &[DialogueLine]) -> String {
    lines
        .iter()
        .map(|line| format!("{}: {}", line.speaker, line.text))
        .collect::<Vec<_>>()
        .join("\n")
}

impl GeneratedBrief {
    pub fn new(metadata: &AudioMetadata, audio_url: String, transcript: String) -> Self {
        Self {
            job_id: metadata.job_id,
            user_id: metadata.user_id,
            job_type: metadata.job_type,
            audio_url,
            transcript,
            duration_seconds: metadata.duration_seconds,
            content_ids: metadata.content_ids.clone(),
            generated_at: metadata.generated_at,
        }
    }

    pub fn result(&self) -> BriefResult {
        BriefResult {
            audio_url: self.audio_url.clone(),
            transcript: self.transcript.clone(),
            duration_seconds: self.duration_seconds,
        }
    }
}
