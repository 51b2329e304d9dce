//! Local stand-ins for the external collaborators.
//!
//! These let the service run end to end without vendor credentials. They are
//! deterministic, which also makes them convenient in tests.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::RwLock;

use async_trait::async_trait;

use civicbrief_core::{BriefType, JobPayload};

use super::ports::{
    AudioMetadata, AudioSynthesizer, ContentRecord, ContentSource, ContentSourceError,
    DialogueLine, ObjectStorage, ScriptError, ScriptGenerator, StorageError, SynthesisError,
};

/// Fixed catalogue of content records keyed by id.
#[derive(Debug, Default)]
pub struct StaticContentSource {
    records: Vec<ContentRecord>,
}

impl StaticContentSource {
    pub fn new(records: Vec<ContentRecord>) -> Self {
        Self { records }
    }

    /// A small catalogue of sample bills.
    pub fn sample() -> Self {
        let record = |id: &str, title: &str, summary: &str| ContentRecord {
            id: id.to_string(),
            title: title.to_string(),
            summary: summary.to_string(),
            url: None,
        };
        Self::new(vec![
            record(
                "hr-1024",
                "Rural Broadband Expansion Act",
                "Funds last-mile fiber grants for counties under 50,000 residents.",
            ),
            record(
                "s-311",
                "Transit Safety Modernization Act",
                "Requires annual inspections of municipal bus fleets.",
            ),
            record(
                "hr-2210",
                "Small Business Tax Simplification Act",
                "Raises the simplified deduction threshold for sole proprietors.",
            ),
            record(
                "s-87",
                "Clean Water Infrastructure Act",
                "Creates a revolving loan fund for lead pipe replacement.",
            ),
        ])
    }
}

#[async_trait]
impl ContentSource for StaticContentSource {
    /// Returns the requested ids that exist, or the whole catalogue when none are named.
    async fn fetch(&self, payload: &JobPayload) -> Result<Vec<ContentRecord>, ContentSourceError> {
        if payload.content_ids.is_empty() {
            return Ok(self.records.clone());
        }
        Ok(payload
            .content_ids
            .iter()
            .filter_map(|id| self.records.iter().find(|r| &r.id == id))
            .cloned()
            .collect())
    }
}

/// Two-host dialogue built from content titles and summaries.
#[derive(Debug, Clone)]
pub struct TemplateScriptGenerator {
    host: String,
    analyst: String,
}

impl Default for TemplateScriptGenerator {
    fn default() -> Self {
        Self {
            host: "HOST".to_string(),
            analyst: "ANALYST".to_string(),
        }
    }
}

impl TemplateScriptGenerator {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ScriptGenerator for TemplateScriptGenerator {
    async fn generate(
        &self,
        content: &[ContentRecord],
        brief_type: BriefType,
    ) -> Result<Vec<DialogueLine>, ScriptError> {
        if content.is_empty() {
            return Err(ScriptError::InvalidOutput("no content to script".to_string()));
        }

        // Roughly one item per target minute.
        let limit = brief_type.target_minutes() as usize;
        let period = match brief_type {
            BriefType::Daily => "today",
            BriefType::Weekly => "this week",
        };

        let mut lines = vec![DialogueLine::new(
            &self.host,
            format!("Here is your legislative brief for {period}."),
        )];
        for item in content.iter().take(limit) {
            lines.push(DialogueLine::new(
                &self.host,
                format!("Next up: {}.", item.title),
            ));
            lines.push(DialogueLine::new(&self.analyst, item.summary.clone()));
        }
        lines.push(DialogueLine::new(&self.host, "That's the brief. Thanks for listening."));
        Ok(lines)
    }
}

/// Produces silent audio sized from the script's word count.
#[derive(Debug, Clone)]
pub struct PlaceholderSynthesizer {
    bitrate_kbps: u32,
    words_per_second: f64,
}

impl Default for PlaceholderSynthesizer {
    fn default() -> Self {
        Self {
            bitrate_kbps: super::DEFAULT_AUDIO_BITRATE_KBPS,
            words_per_second: 2.5,
        }
    }
}

impl PlaceholderSynthesizer {
    pub fn new(bitrate_kbps: u32) -> Self {
        Self {
            bitrate_kbps: bitrate_kbps.max(1),
            ..Self::default()
        }
    }
}

#[async_trait]
impl AudioSynthesizer for PlaceholderSynthesizer {
    async fn synthesize(&self, lines: &[DialogueLine]) -> Result<Vec<u8>, SynthesisError> {
        let words: usize = lines.iter().map(|l| l.text.split_whitespace().count()).sum();
        if words == 0 {
            return Err(SynthesisError::Rejected("script has no words".to_string()));
        }
        let seconds = (words as f64 / self.words_per_second).ceil() as usize;
        let bytes_per_second = self.bitrate_kbps as usize * 1000 / 8;
        Ok(vec![0u8; seconds * bytes_per_second])
    }
}

fn object_key(metadata: &AudioMetadata) -> String {
    format!(
        "{}/{}-{}.mp3",
        metadata.user_id, metadata.job_type, metadata.job_id
    )
}

/// Writes audio under a local directory and returns URLs under a public prefix.
#[derive(Debug, Clone)]
pub struct LocalObjectStorage {
    root: PathBuf,
    public_base_url: String,
}

impl LocalObjectStorage {
    pub fn new(root: impl Into<PathBuf>, public_base_url: impl Into<String>) -> Self {
        Self {
            root: root.into(),
            public_base_url: public_base_url.into().trim_end_matches('/').to_string(),
        }
    }

    pub fn root(&self) -> &PathBuf {
        &self.root
    }
}

#[async_trait]
impl ObjectStorage for LocalObjectStorage {
    async fn put(&self, audio: &[u8], metadata: &AudioMetadata) -> Result<String, StorageError> {
        let key = object_key(metadata);
        let path = self.root.join(&key);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&path, audio).await?;

        let sidecar = serde_json::to_vec_pretty(metadata)
            .map_err(|e| StorageError::UploadFailed(format!("metadata encoding: {e}")))?;
        tokio::fs::write(path.with_extension("json"), sidecar).await?;

        Ok(format!("{}/{}", self.public_base_url, key))
    }
}

/// Keeps uploaded audio in memory.
#[derive(Debug, Default)]
pub struct MemoryObjectStorage {
    public_base_url: String,
    objects: RwLock<HashMap<String, Vec<u8>>>,
}

impl MemoryObjectStorage {
    pub fn new(public_base_url: impl Into<String>) -> Self {
        Self {
            public_base_url: public_base_url.into().trim_end_matches('/').to_string(),
            objects: RwLock::new(HashMap::new()),
        }
    }

    pub fn object_count(&self) -> usize {
        self.objects.read().map(|o| o.len()).unwrap_or(0)
    }
}

#[async_trait]
impl ObjectStorage for MemoryObjectStorage {
    async fn put(&self, audio: &[u8], metadata: &AudioMetadata) -> Result<String, StorageError> {
        let key = object_key(metadata);
        self.objects
            .write()
            .map_err(|_| StorageError::UploadFailed("object map lock poisoned".to_string()))?
            .insert(key.clone(), audio.to_vec());
        Ok(format!("{}/{}", self.public_base_url, key))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use civicbrief_core::{JobId, UserId};

    #[tokio::test]
    async fn static_source_filters_by_requested_ids() {
        let source = StaticContentSource::sample();
        let payload = JobPayload::new(vec!["s-311".to_string(), "missing".to_string()]);

        let records = source.fetch(&payload).await.unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].id, "s-311");
    }

    #[tokio::test]
    async fn template_script_brackets_items_with_intro_and_outro() {
        let content = StaticContentSource::sample()
            .fetch(&JobPayload::default())
            .await
            .unwrap();

        let lines = TemplateScriptGenerator::new()
            .generate(&content[..2], BriefType::Daily)
            .await
            .unwrap();

        assert_eq!(lines.len(), 2 + 2 * 2);
        assert_eq!(lines[0].speaker, "HOST");
        assert_eq!(lines[2].speaker, "ANALYST");
    }

    #[tokio::test]
    async fn placeholder_audio_length_tracks_word_count() {
        let synth = PlaceholderSynthesizer::new(8);
        let audio = synth
            .synthesize(&[DialogueLine::new("HOST", "one two three four five")])
            .await
            .unwrap();

        // 5 words at 2.5 words/s = 2s at 1000 bytes/s.
        assert_eq!(audio.len(), 2000);
    }

    #[tokio::test]
    async fn local_storage_writes_audio_and_returns_public_url() {
        let root = std::env::temp_dir().join(format!("civicbrief-test-{}", JobId::new()));
        let storage = LocalObjectStorage::new(&root, "http://localhost:8080/audio/");
        let metadata = AudioMetadata {
            job_id: JobId::new(),
            user_id: UserId::new(),
            job_type: BriefType::Weekly,
            duration_seconds: 1,
            content_ids: vec!["b1".to_string()],
            generated_at: Utc::now(),
        };

        let url = storage.put(b"abc", &metadata).await.unwrap();

        let key = format!("{}/weekly-{}.mp3", metadata.user_id, metadata.job_id);
        assert_eq!(url, format!("http://localhost:8080/audio/{key}"));
        assert_eq!(tokio::fs::read(root.join(&key)).await.unwrap(), b"abc");

        let _ = tokio::fs::remove_dir_all(&root).await;
    }
}
