//! Job submission: durable record first, queue message second.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tracing::{error, info, warn};

use civicbrief_core::{JobId, JobPatch, JobRecord, JobStatus, UserId};
use civicbrief_queue::{JobMessage, MessageQueue, QueueError};

use crate::jobs::store::{EnqueueReceipt, JobRequest, JobStore, JobStoreError};

#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    #[error(transparent)]
    Store(#[from] JobStoreError),
    #[error("job {job_id} was recorded but could not be queued: {source}")]
    Publish {
        job_id: JobId,
        #[source]
        source: QueueError,
    },
}

/// Accepts brief requests from users and the scheduler.
pub struct BriefService {
    store: Arc<JobStore>,
    queue: Arc<dyn MessageQueue>,
}

impl BriefService {
    pub fn new(store: Arc<JobStore>, queue: Arc<dyn MessageQueue>) -> Self {
        Self { store, queue }
    }

    pub fn store(&self) -> &Arc<JobStore> {
        &self.store
    }

    /// Record the job, then publish it for the dispatcher.
    ///
    /// If publishing fails the job is finalized `failed` so it does not sit in
    /// the queue view forever, and the publish error is returned.
    pub async fn submit(
        &self,
        user_id: UserId,
        request: JobRequest,
    ) -> Result<EnqueueReceipt, ServiceError> {
        let job_type = request.job_type;
        let payload = request.payload.clone();
        let receipt = self.store.enqueue(user_id, request).await?;

        let message = JobMessage::new(receipt.job_id, user_id, job_type, payload);
        if let Err(source) = self.queue.send(message).await {
            error!(
                job_id = %receipt.job_id,
                user_id = %user_id,
                error = %source,
                "failed to publish brief job"
            );
            let patch = JobPatch::failed(format!("could not queue job: {source}"));
            if let Err(e) = self
                .store
                .update_status(user_id, receipt.job_id, &patch)
                .await
            {
                error!(job_id = %receipt.job_id, error = %e, "failed to finalize unpublished job");
            }
            return Err(ServiceError::Publish {
                job_id: receipt.job_id,
                source,
            });
        }

        info!(
            job_id = %receipt.job_id,
            user_id = %user_id,
            brief_type = %job_type,
            queue_position = receipt.queue_position,
            "brief job accepted"
        );
        Ok(receipt)
    }

    /// Publish a message for every job the store still considers unfinished.
    ///
    /// Run at startup when the queue does not survive restarts. Jobs waiting
    /// out a retry are republished with their remaining delay, and attempts
    /// already spent carry over so the retry limit still holds.
    pub async fn recover_unfinished(&self) -> Result<usize, ServiceError> {
        let jobs = self.store.list_unfinished().await?;
        let count = jobs.len();

        for job in jobs {
            let (message, delay) = recovery_message(&job);
            self.queue
                .send_delayed(message, delay)
                .await
                .map_err(|source| ServiceError::Publish {
                    job_id: job.id,
                    source,
                })?;
            warn!(
                job_id = %job.id,
                user_id = %job.user_id,
                status = %job.status,
                delay_secs = delay.as_secs(),
                "republished unfinished brief job"
            );
        }

        Ok(count)
    }
}

fn recovery_message(job: &JobRecord) -> (JobMessage, Duration) {
    // An interrupted run did not fail, so it is not counted against the job.
    let prior_attempts = match job.status {
        JobStatus::Processing => job.attempts.saturating_sub(1),
        _ => job.attempts,
    };
    let delay = job
        .retry
        .as_ref()
        .and_then(|retry| (retry.next_attempt_at - Utc::now()).to_std().ok())
        .unwrap_or(Duration::ZERO);

    let message = JobMessage::new(job.id, job.user_id, job.job_type, job.payload.clone())
        .with_prior_attempts(prior_attempts);
    (message, delay)
}
