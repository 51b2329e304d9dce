//! Durable per-user job store.
//!
//! Each user's [`UserJobBoard`] is owned by a single async mutex (one logical
//! actor per user). Boards are loaded lazily from a [`JobStateRepository`]
//! on first access, and every mutation is saved to the repository before the
//! in-memory view is replaced: if the save fails, callers get the error and
//! the previous state stays visible.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};

use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex as AsyncMutex;
use tracing::warn;

use civicbrief_core::{
    BoardStats, BriefType, DomainError, JobId, JobPatch, JobPayload, JobRecord, UserId,
    UserJobBoard,
};

/// Job store error.
#[derive(Debug, Clone, thiserror::Error)]
pub enum JobStoreError {
    #[error("job not found: {0}")]
    NotFound(JobId),
    #[error("job already exists: {0}")]
    AlreadyExists(JobId),
    #[error("conflicting job update: {0}")]
    Conflict(String),
    #[error("invalid job request: {0}")]
    Invalid(String),
    #[error("storage error: {0}")]
    Storage(String),
    #[error("serialization error: {0}")]
    Serialization(String),
}

impl From<DomainError> for JobStoreError {
    fn from(err: DomainError) -> Self {
        match err {
            DomainError::JobNotFound(id) => JobStoreError::NotFound(id),
            DomainError::JobExists(id) => JobStoreError::AlreadyExists(id),
            DomainError::InvalidTransition(msg) => JobStoreError::Conflict(msg),
            DomainError::Validation(msg) | DomainError::InvalidId(msg) => {
                JobStoreError::Invalid(msg)
            }
        }
    }
}

/// Durable backing for per-user boards (one record per user).
///
/// Also owns the global job-id index: a job id belongs to exactly one user.
#[async_trait]
pub trait JobStateRepository: Send + Sync {
    async fn load(&self, user_id: UserId) -> Result<Option<UserJobBoard>, JobStoreError>;

    /// Persist the full board. Must be durable once it returns `Ok`.
    async fn save(&self, board: &UserJobBoard) -> Result<(), JobStoreError>;

    /// Reserve `job_id` for `user_id`.
    ///
    /// Returns the existing owner if the id was already claimed (possibly by
    /// `user_id` itself), `None` if this call claimed it.
    async fn claim_job_id(
        &self,
        job_id: JobId,
        user_id: UserId,
    ) -> Result<Option<UserId>, JobStoreError>;

    /// Drop a claim made by `user_id`; claims held by other users are kept.
    async fn release_job_id(&self, job_id: JobId, user_id: UserId) -> Result<(), JobStoreError>;

    /// Non-finalized jobs across all users.
    async fn list_unfinished(&self) -> Result<Vec<JobRecord>, JobStoreError>;
}

#[async_trait]
impl<R> JobStateRepository for Arc<R>
where
    R: JobStateRepository + ?Sized,
{
    async fn load(&self, user_id: UserId) -> Result<Option<UserJobBoard>, JobStoreError> {
        (**self).load(user_id).await
    }

    async fn save(&self, board: &UserJobBoard) -> Result<(), JobStoreError> {
        (**self).save(board).await
    }

    async fn claim_job_id(
        &self,
        job_id: JobId,
        user_id: UserId,
    ) -> Result<Option<UserId>, JobStoreError> {
        (**self).claim_job_id(job_id, user_id).await
    }

    async fn release_job_id(&self, job_id: JobId, user_id: UserId) -> Result<(), JobStoreError> {
        (**self).release_job_id(job_id, user_id).await
    }

    async fn list_unfinished(&self) -> Result<Vec<JobRecord>, JobStoreError> {
        (**self).list_unfinished().await
    }
}

/// In-memory repository for tests/dev.
///
/// Boards are kept as JSON documents, the same shape the Postgres repository
/// stores, so serialization problems surface in tests too.
#[derive(Debug, Default)]
pub struct InMemoryJobStateRepository {
    states: RwLock<HashMap<UserId, serde_json::Value>>,
    job_owners: Mutex<HashMap<JobId, UserId>>,
}

impl InMemoryJobStateRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    pub fn user_count(&self) -> usize {
        self.states.read().map(|s| s.len()).unwrap_or(0)
    }

    fn owners(&self) -> Result<std::sync::MutexGuard<'_, HashMap<JobId, UserId>>, JobStoreError> {
        self.job_owners
            .lock()
            .map_err(|_| JobStoreError::Storage("job id index lock poisoned".to_string()))
    }
}

fn board_from_state(state: &serde_json::Value) -> Result<UserJobBoard, JobStoreError> {
    serde_json::from_value(state.clone()).map_err(|e| JobStoreError::Serialization(e.to_string()))
}

#[async_trait]
impl JobStateRepository for InMemoryJobStateRepository {
    async fn load(&self, user_id: UserId) -> Result<Option<UserJobBoard>, JobStoreError> {
        let states = self
            .states
            .read()
            .map_err(|_| JobStoreError::Storage("job state lock poisoned".to_string()))?;
        states.get(&user_id).map(board_from_state).transpose()
    }

    async fn save(&self, board: &UserJobBoard) -> Result<(), JobStoreError> {
        let state =
            serde_json::to_value(board).map_err(|e| JobStoreError::Serialization(e.to_string()))?;
        self.states
            .write()
            .map_err(|_| JobStoreError::Storage("job state lock poisoned".to_string()))?
            .insert(board.user_id, state);
        Ok(())
    }

    async fn claim_job_id(
        &self,
        job_id: JobId,
        user_id: UserId,
    ) -> Result<Option<UserId>, JobStoreError> {
        let mut owners = self.owners()?;
        match owners.get(&job_id) {
            Some(owner) => Ok(Some(*owner)),
            None => {
                owners.insert(job_id, user_id);
                Ok(None)
            }
        }
    }

    async fn release_job_id(&self, job_id: JobId, user_id: UserId) -> Result<(), JobStoreError> {
        let mut owners = self.owners()?;
        if owners.get(&job_id) == Some(&user_id) {
            owners.remove(&job_id);
        }
        Ok(())
    }

    async fn list_unfinished(&self) -> Result<Vec<JobRecord>, JobStoreError> {
        let states = self
            .states
            .read()
            .map_err(|_| JobStoreError::Storage("job state lock poisoned".to_string()))?;
        let mut jobs = Vec::new();
        for state in states.values() {
            jobs.extend(board_from_state(state)?.unfinished().cloned());
        }
        Ok(jobs)
    }
}

/// Inbound job submission.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRequest {
    /// Caller-chosen id; generated when absent.
    #[serde(default)]
    pub job_id: Option<JobId>,
    #[serde(rename = "type")]
    pub job_type: BriefType,
    #[serde(default)]
    pub payload: JobPayload,
}

impl JobRequest {
    pub fn new(job_type: BriefType, payload: JobPayload) -> Self {
        Self {
            job_id: None,
            job_type,
            payload,
        }
    }

    pub fn with_job_id(mut self, job_id: JobId) -> Self {
        self.job_id = Some(job_id);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnqueueReceipt {
    pub job_id: JobId,
    pub queue_position: usize,
    pub estimated_seconds: u64,
}

type BoardSlot = Arc<AsyncMutex<Option<UserJobBoard>>>;

/// Per-user job store.
pub struct JobStore {
    repository: Arc<dyn JobStateRepository>,
    boards: Mutex<HashMap<UserId, BoardSlot>>,
    estimated_seconds_per_job: u64,
}

impl std::fmt::Debug for JobStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobStore")
            .field("estimated_seconds_per_job", &self.estimated_seconds_per_job)
            .finish_non_exhaustive()
    }
}

pub const DEFAULT_ESTIMATED_SECONDS_PER_JOB: u64 = 120;

impl JobStore {
    pub fn new(repository: Arc<dyn JobStateRepository>) -> Self {
        Self {
            repository,
            boards: Mutex::new(HashMap::new()),
            estimated_seconds_per_job: DEFAULT_ESTIMATED_SECONDS_PER_JOB,
        }
    }

    /// Store over a fresh in-memory repository.
    pub fn in_memory() -> Self {
        Self::new(InMemoryJobStateRepository::arc())
    }

    pub fn with_estimated_seconds_per_job(mut self, seconds: u64) -> Self {
        self.estimated_seconds_per_job = seconds;
        self
    }

    fn slot(&self, user_id: UserId) -> Result<BoardSlot, JobStoreError> {
        let mut boards = self
            .boards
            .lock()
            .map_err(|_| JobStoreError::Storage("board registry lock poisoned".to_string()))?;
        Ok(boards.entry(user_id).or_default().clone())
    }

    async fn loaded<'a>(
        &self,
        user_id: UserId,
        slot: &'a mut Option<UserJobBoard>,
    ) -> Result<&'a mut UserJobBoard, JobStoreError> {
        let board = match slot.take() {
            Some(board) => board,
            None => self
                .repository
                .load(user_id)
                .await?
                .unwrap_or_else(|| UserJobBoard::new(user_id)),
        };
        Ok(slot.insert(board))
    }

    async fn read<T>(
        &self,
        user_id: UserId,
        f: impl FnOnce(&UserJobBoard) -> T,
    ) -> Result<T, JobStoreError> {
        let slot = self.slot(user_id)?;
        let mut guard = slot.lock().await;
        let board = self.loaded(user_id, &mut guard).await?;
        Ok(f(board))
    }

    /// Apply `f` to a copy of the board, persist the copy, then commit it.
    async fn mutate<T>(
        &self,
        user_id: UserId,
        f: impl FnOnce(&mut UserJobBoard) -> Result<T, JobStoreError>,
    ) -> Result<T, JobStoreError> {
        let slot = self.slot(user_id)?;
        let mut guard = slot.lock().await;
        let current = self.loaded(user_id, &mut guard).await?;

        let mut next = current.clone();
        let out = f(&mut next)?;
        if next != *current {
            self.repository.save(&next).await?;
            *current = next;
        }
        Ok(out)
    }

    /// Create a queued job at the back of the user's pending queue.
    ///
    /// Job ids are unique across users: an id held by anyone else is
    /// rejected with [`JobStoreError::AlreadyExists`].
    pub async fn enqueue(
        &self,
        user_id: UserId,
        request: JobRequest,
    ) -> Result<EnqueueReceipt, JobStoreError> {
        let job_id = request.job_id.unwrap_or_default();
        let fresh_claim = match self.repository.claim_job_id(job_id, user_id).await? {
            None => true,
            Some(owner) if owner == user_id => false,
            Some(_) => return Err(JobStoreError::AlreadyExists(job_id)),
        };

        let record = JobRecord::new(
            job_id,
            user_id,
            request.job_type,
            request.payload,
            Utc::now(),
        );
        let per_job = self.estimated_seconds_per_job;

        let enqueued = self
            .mutate(user_id, move |board| {
                let queue_position = board.enqueue(record)?;
                Ok(EnqueueReceipt {
                    job_id,
                    queue_position,
                    estimated_seconds: queue_position as u64 * per_job,
                })
            })
            .await;

        if enqueued.is_err() && fresh_claim {
            if let Err(e) = self.repository.release_job_id(job_id, user_id).await {
                warn!(job_id = %job_id, error = %e, "failed to release job id claim");
            }
        }
        enqueued
    }

    pub async fn get_status(
        &self,
        user_id: UserId,
        job_id: JobId,
    ) -> Result<Option<JobRecord>, JobStoreError> {
        self.read(user_id, |board| board.get(job_id).cloned()).await
    }

    /// 1-based pending position, `None` once the job has left the queue.
    pub async fn queue_position(
        &self,
        user_id: UserId,
        job_id: JobId,
    ) -> Result<Option<usize>, JobStoreError> {
        self.read(user_id, |board| board.position_of(job_id)).await
    }

    /// Merge a patch into a job. Idempotent for repeated terminal patches.
    pub async fn update_status(
        &self,
        user_id: UserId,
        job_id: JobId,
        patch: &JobPatch,
    ) -> Result<JobRecord, JobStoreError> {
        self.mutate(user_id, |board| Ok(board.update(job_id, patch, Utc::now())?))
            .await
    }

    /// Cancel a job that has not started processing.
    pub async fn cancel(&self, user_id: UserId, job_id: JobId) -> Result<bool, JobStoreError> {
        self.mutate(user_id, |board| Ok(board.cancel(job_id, Utc::now())))
            .await
    }

    pub async fn list_history(&self, user_id: UserId) -> Result<Vec<JobRecord>, JobStoreError> {
        self.read(user_id, |board| board.history().cloned().collect())
            .await
    }

    pub async fn get_queue(&self, user_id: UserId) -> Result<Vec<JobRecord>, JobStoreError> {
        self.read(user_id, |board| board.queue().cloned().collect())
            .await
    }

    pub async fn stats(&self, user_id: UserId) -> Result<BoardStats, JobStoreError> {
        self.read(user_id, |board| board.stats()).await
    }

    /// Every job across all users that has not reached a final state.
    pub async fn list_unfinished(&self) -> Result<Vec<JobRecord>, JobStoreError> {
        self.repository.list_unfinished().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use civicbrief_core::{BriefResult, JobStatus};
    use std::sync::atomic::{AtomicBool, Ordering};

    fn request() -> JobRequest {
        JobRequest::new(BriefType::Daily, JobPayload::new(vec!["b1".to_string()]))
    }

    fn result() -> BriefResult {
        BriefResult {
            audio_url: "https://cdn.example/audio.mp3".to_string(),
            transcript: "HOST: hi".to_string(),
            duration_seconds: 3,
        }
    }

    /// Repository whose saves can be switched off to simulate an outage.
    #[derive(Default)]
    struct FlakyRepository {
        inner: InMemoryJobStateRepository,
        failing: AtomicBool,
    }

    #[async_trait]
    impl JobStateRepository for FlakyRepository {
        async fn load(&self, user_id: UserId) -> Result<Option<UserJobBoard>, JobStoreError> {
            self.inner.load(user_id).await
        }

        async fn save(&self, board: &UserJobBoard) -> Result<(), JobStoreError> {
            if self.failing.load(Ordering::SeqCst) {
                return Err(JobStoreError::Storage("disk full".to_string()));
            }
            self.inner.save(board).await
        }

        async fn claim_job_id(
            &self,
            job_id: JobId,
            user_id: UserId,
        ) -> Result<Option<UserId>, JobStoreError> {
            self.inner.claim_job_id(job_id, user_id).await
        }

        async fn release_job_id(
            &self,
            job_id: JobId,
            user_id: UserId,
        ) -> Result<(), JobStoreError> {
            self.inner.release_job_id(job_id, user_id).await
        }

        async fn list_unfinished(&self) -> Result<Vec<JobRecord>, JobStoreError> {
            self.inner.list_unfinished().await
        }
    }

    #[tokio::test]
    async fn enqueue_reports_position_and_estimate() {
        let store = JobStore::in_memory().with_estimated_seconds_per_job(120);
        let user = UserId::new();

        let first = store.enqueue(user, request()).await.unwrap();
        let second = store.enqueue(user, request()).await.unwrap();
        let third = store.enqueue(user, request()).await.unwrap();

        assert_eq!(
            (first.queue_position, second.queue_position, third.queue_position),
            (1, 2, 3)
        );
        assert_eq!(third.estimated_seconds, 360);
    }

    #[tokio::test]
    async fn caller_supplied_id_is_used_and_duplicates_rejected() {
        let store = JobStore::in_memory();
        let user = UserId::new();
        let id = JobId::new();

        let receipt = store
            .enqueue(user, request().with_job_id(id))
            .await
            .unwrap();
        assert_eq!(receipt.job_id, id);

        let err = store
            .enqueue(user, request().with_job_id(id))
            .await
            .unwrap_err();
        assert!(matches!(err, JobStoreError::AlreadyExists(dup) if dup == id));
    }

    #[tokio::test]
    async fn job_id_held_by_another_user_is_rejected() {
        let repo = InMemoryJobStateRepository::arc();
        let store = JobStore::new(repo.clone());
        let alice = UserId::new();
        let bob = UserId::new();
        let id = JobId::new();

        store.enqueue(alice, request().with_job_id(id)).await.unwrap();
        let err = store
            .enqueue(bob, request().with_job_id(id))
            .await
            .unwrap_err();
        assert!(matches!(err, JobStoreError::AlreadyExists(dup) if dup == id));
        assert!(store.get_status(bob, id).await.unwrap().is_none());

        // The index is shared by every store over the repository.
        let other = JobStore::new(repo);
        assert!(other.enqueue(bob, request().with_job_id(id)).await.is_err());
    }

    #[tokio::test]
    async fn failed_enqueue_releases_its_job_id() {
        let repo = Arc::new(FlakyRepository::default());
        let store = JobStore::new(repo.clone());
        let id = JobId::new();

        repo.failing.store(true, Ordering::SeqCst);
        assert!(store
            .enqueue(UserId::new(), request().with_job_id(id))
            .await
            .is_err());

        repo.failing.store(false, Ordering::SeqCst);
        let receipt = store
            .enqueue(UserId::new(), request().with_job_id(id))
            .await
            .unwrap();
        assert_eq!(receipt.job_id, id);
    }

    #[tokio::test]
    async fn list_unfinished_spans_users_and_skips_finalized() {
        let store = JobStore::in_memory();
        let alice = UserId::new();
        let bob = UserId::new();
        let waiting = store.enqueue(alice, request()).await.unwrap().job_id;
        let done = store.enqueue(bob, request()).await.unwrap().job_id;
        let running = store.enqueue(bob, request()).await.unwrap().job_id;

        store
            .update_status(bob, done, &JobPatch::processing("start"))
            .await
            .unwrap();
        store
            .update_status(bob, done, &JobPatch::completed(result()))
            .await
            .unwrap();
        store
            .update_status(bob, running, &JobPatch::processing("start"))
            .await
            .unwrap();

        let mut ids: Vec<JobId> = store
            .list_unfinished()
            .await
            .unwrap()
            .into_iter()
            .map(|j| j.id)
            .collect();
        ids.sort();
        let mut expected = vec![waiting, running];
        expected.sort();
        assert_eq!(ids, expected);
    }

    #[tokio::test]
    async fn state_survives_a_new_store_over_the_same_repository() {
        let repo = InMemoryJobStateRepository::arc();
        let user = UserId::new();

        let receipt = {
            let store = JobStore::new(repo.clone());
            let receipt = store.enqueue(user, request()).await.unwrap();
            store
                .update_status(user, receipt.job_id, &JobPatch::processing("start"))
                .await
                .unwrap();
            receipt
        };

        let reopened = JobStore::new(repo);
        let job = reopened
            .get_status(user, receipt.job_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(job.status, JobStatus::Processing);
    }

    #[tokio::test]
    async fn failed_save_keeps_previous_state() {
        let repo = Arc::new(FlakyRepository::default());
        let store = JobStore::new(repo.clone());
        let user = UserId::new();
        let receipt = store.enqueue(user, request()).await.unwrap();

        repo.failing.store(true, Ordering::SeqCst);
        let err = store
            .update_status(user, receipt.job_id, &JobPatch::processing("start"))
            .await
            .unwrap_err();
        assert!(matches!(err, JobStoreError::Storage(_)));

        let job = store
            .get_status(user, receipt.job_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(job.status, JobStatus::Queued);
    }

    #[tokio::test]
    async fn users_are_isolated() {
        let store = JobStore::in_memory();
        let alice = UserId::new();
        let bob = UserId::new();
        let receipt = store.enqueue(alice, request()).await.unwrap();

        assert!(store.get_status(bob, receipt.job_id).await.unwrap().is_none());
        assert!(!store.cancel(bob, receipt.job_id).await.unwrap());
        assert_eq!(store.get_queue(bob).await.unwrap().len(), 0);
        assert_eq!(store.enqueue(bob, request()).await.unwrap().queue_position, 1);
    }

    #[tokio::test]
    async fn repeated_terminal_update_leaves_one_history_entry() {
        let store = JobStore::in_memory();
        let user = UserId::new();
        let receipt = store.enqueue(user, request()).await.unwrap();
        let id = receipt.job_id;

        store
            .update_status(user, id, &JobPatch::processing("start"))
            .await
            .unwrap();
        let once = store
            .update_status(user, id, &JobPatch::completed(result()))
            .await
            .unwrap();
        let twice = store
            .update_status(user, id, &JobPatch::completed(result()))
            .await
            .unwrap();

        assert_eq!(once, twice);
        assert_eq!(store.list_history(user).await.unwrap().len(), 1);
        assert_eq!(store.stats(user).await.unwrap().total_generated, 1);
    }

    #[tokio::test]
    async fn cancel_boundary_follows_processing() {
        let store = JobStore::in_memory();
        let user = UserId::new();
        let queued = store.enqueue(user, request()).await.unwrap().job_id;
        let started = store.enqueue(user, request()).await.unwrap().job_id;

        store
            .update_status(user, started, &JobPatch::processing("start"))
            .await
            .unwrap();

        assert!(store.cancel(user, queued).await.unwrap());
        assert!(!store.cancel(user, started).await.unwrap());

        let history = store.list_history(user).await.unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].error.as_deref(), Some("cancelled by user"));
    }

    #[tokio::test]
    async fn unknown_job_update_is_not_found() {
        let store = JobStore::in_memory();
        let err = store
            .update_status(UserId::new(), JobId::new(), &JobPatch::processing("start"))
            .await
            .unwrap_err();
        assert!(matches!(err, JobStoreError::NotFound(_)));
    }
}
