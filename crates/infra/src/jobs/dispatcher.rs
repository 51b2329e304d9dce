//! Queue dispatcher: runs the brief pipeline for each delivered job message.
//!
//! The dispatcher is the only place that decides between retry and
//! finalization. A message is acknowledged only once its job has completed
//! or exhausted its retries; until then the queue owns it and will redeliver,
//! so every store write here must tolerate repeats.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use chrono::Utc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{Instrument, debug, error, info, info_span, warn};

use civicbrief_core::{BriefResult, JobPatch, PendingRetry};
use civicbrief_queue::{Delivery, JobMessage, MessageQueue, QueueError};

use super::retry::RetryPolicy;
use super::store::{JobStore, JobStoreError};
use crate::notify::{Notification, Notifier, notify_best_effort};
use crate::pipeline::{BriefPipeline, GeneratedBrief, PipelineError, transcript};

/// Dispatcher runtime configuration.
#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    /// How long one receive call waits for a message
    pub poll_interval: Duration,
    /// Concurrent worker loops (each handles one message at a time)
    pub workers: usize,
    /// Name for logging
    pub name: String,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(500),
            workers: 1,
            name: "brief-dispatcher".to_string(),
        }
    }
}

impl DispatcherConfig {
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers.max(1);
        self
    }
}

/// Dispatcher runtime statistics.
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct DispatcherStats {
    pub deliveries_processed: u64,
    pub jobs_completed: u64,
    pub jobs_retried: u64,
    pub jobs_failed: u64,
    pub deliveries_skipped: u64,
    pub dispatch_errors: u64,
    pub current_running: usize,
    pub uptime_secs: u64,
}

/// What happened to one delivery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryOutcome {
    Completed,
    /// Failed attempt; the queue will redeliver after `delay`.
    Retrying { attempt: u32, delay: Duration },
    /// Retries exhausted; finalized as failed.
    Failed,
    /// Job unknown or already finalized; acknowledged without work.
    Skipped,
}

/// Infrastructure failure while handling a delivery. The message stays unacknowledged.
#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error(transparent)]
    Queue(#[from] QueueError),
    #[error(transparent)]
    Store(#[from] JobStoreError),
}

/// Failure of a pipeline run, including the store writes made along the way.
#[derive(Debug, thiserror::Error)]
enum StageError {
    #[error(transparent)]
    Pipeline(#[from] PipelineError),
    #[error(transparent)]
    Store(#[from] JobStoreError),
}

/// Handle to control a running dispatcher.
///
/// Dropping the handle also stops the workers after their current delivery.
#[derive(Debug)]
pub struct DispatcherHandle {
    shutdown: mpsc::Sender<()>,
    joins: Vec<JoinHandle<()>>,
    stats: Arc<Mutex<DispatcherStats>>,
}

impl DispatcherHandle {
    /// Request graceful shutdown; in-flight jobs finish first.
    pub async fn shutdown(self) {
        for _ in 0..self.joins.len() {
            let _ = self.shutdown.send(()).await;
        }
        for join in self.joins {
            let _ = join.await;
        }
    }

    pub fn stats(&self) -> DispatcherStats {
        self.stats.lock().map(|s| s.clone()).unwrap_or_default()
    }
}

pub struct BriefDispatcher {
    store: Arc<JobStore>,
    queue: Arc<dyn MessageQueue>,
    pipeline: BriefPipeline,
    notifier: Arc<dyn Notifier>,
    retry_policy: RetryPolicy,
}

impl BriefDispatcher {
    pub fn new(
        store: Arc<JobStore>,
        queue: Arc<dyn MessageQueue>,
        pipeline: BriefPipeline,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        Self {
            store,
            queue,
            pipeline,
            notifier,
            retry_policy: RetryPolicy::default(),
        }
    }

    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = policy;
        self
    }

    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.retry_policy
    }

    /// Process one delivery end to end.
    pub async fn handle(&self, delivery: &Delivery) -> Result<DeliveryOutcome, DispatchError> {
        let msg = &delivery.message;
        let span = info_span!(
            "brief_job",
            job_id = %msg.job_id,
            user_id = %msg.user_id,
            brief_type = %msg.job_type,
            attempt = attempt_of(delivery),
        );
        self.handle_inner(delivery).instrument(span).await
    }

    async fn handle_inner(&self, delivery: &Delivery) -> Result<DeliveryOutcome, DispatchError> {
        let msg = &delivery.message;

        match self.store.get_status(msg.user_id, msg.job_id).await? {
            None => {
                warn!("delivery for unknown job, dropping");
                self.queue.ack(&delivery.receipt).await?;
                return Ok(DeliveryOutcome::Skipped);
            }
            Some(job) if job.is_finalized() => {
                debug!(status = %job.status, "job already finalized, dropping delivery");
                self.queue.ack(&delivery.receipt).await?;
                return Ok(DeliveryOutcome::Skipped);
            }
            Some(_) => {}
        }

        match self
            .store
            .update_status(
                msg.user_id,
                msg.job_id,
                &JobPatch::processing("Starting brief generation"),
            )
            .await
        {
            Ok(_) => {}
            Err(JobStoreError::Conflict(reason)) => {
                // Finalized between the read and the write (e.g. cancelled).
                debug!(reason = %reason, "job left the runnable states, dropping delivery");
                self.queue.ack(&delivery.receipt).await?;
                return Ok(DeliveryOutcome::Skipped);
            }
            Err(e) => return self.fail(delivery, StageError::Store(e)).await,
        }

        let completed = match self.run_stages(msg).await {
            Ok(result) => self
                .store
                .update_status(msg.user_id, msg.job_id, &JobPatch::completed(result))
                .await
                .map_err(StageError::from),
            Err(e) => Err(e),
        };

        match completed {
            Ok(job) => {
                info!(attempts = job.attempts, "brief completed");
                self.queue.ack(&delivery.receipt).await?;
                self.notify_in_background(Notification::ready(&job));
                Ok(DeliveryOutcome::Completed)
            }
            Err(e) => self.fail(delivery, e).await,
        }
    }

    async fn checkpoint(
        &self,
        msg: &JobMessage,
        progress: u8,
        message: &str,
    ) -> Result<(), StageError> {
        debug!(progress, stage = message, "checkpoint");
        self.store
            .update_status(
                msg.user_id,
                msg.job_id,
                &JobPatch::checkpoint(progress, message),
            )
            .await?;
        Ok(())
    }

    /// Run the stages in order, writing each checkpoint before its stage starts.
    async fn run_stages(&self, msg: &JobMessage) -> Result<BriefResult, StageError> {
        self.checkpoint(msg, 20, "Fetching content").await?;
        let content = self.pipeline.fetch_content(&msg.payload).await?;

        self.checkpoint(msg, 40, "Writing script").await?;
        let script = self
            .pipeline
            .generate_script(&content, msg.job_type)
            .await?;

        self.checkpoint(msg, 60, "Synthesizing audio").await?;
        let audio = self.pipeline.synthesize(&script).await?;

        self.checkpoint(msg, 80, "Uploading audio").await?;
        let metadata = self.pipeline.audio_metadata(
            msg.job_id,
            msg.user_id,
            msg.job_type,
            &content,
            audio.len(),
            Utc::now(),
        );
        let audio_url = self.pipeline.upload(&audio, &metadata).await?;

        self.checkpoint(msg, 90, "Saving brief").await?;
        let brief = GeneratedBrief::new(&metadata, audio_url, transcript(&script));
        if let Err(e) = self.pipeline.persist_metadata(&brief).await {
            warn!(error = %e, "brief metadata not persisted; audio is available");
        }

        Ok(brief.result())
    }

    async fn fail(
        &self,
        delivery: &Delivery,
        err: StageError,
    ) -> Result<DeliveryOutcome, DispatchError> {
        let msg = &delivery.message;
        let attempt = attempt_of(delivery);
        let error_text = err.to_string();

        if self.retry_policy.should_retry(attempt) {
            let delay = self.retry_policy.delay_for_job(msg.job_id, attempt);
            let retry = PendingRetry {
                attempt,
                next_attempt_at: Utc::now()
                    + chrono::Duration::from_std(delay).unwrap_or_default(),
            };
            if let Err(e) = self
                .store
                .update_status(
                    msg.user_id,
                    msg.job_id,
                    &JobPatch::retrying(error_text.clone(), retry),
                )
                .await
            {
                error!(error = %e, "failed to record retry state");
            }

            warn!(
                error = %error_text,
                delay_secs = delay.as_secs(),
                "brief generation failed, retry scheduled"
            );
            self.queue.retry(&delivery.receipt, delay).await?;
            return Ok(DeliveryOutcome::Retrying { attempt, delay });
        }

        let job = self
            .store
            .update_status(msg.user_id, msg.job_id, &JobPatch::failed(error_text.clone()))
            .await?;
        info!(error = %error_text, attempts = attempt, "brief failed permanently");
        self.queue.ack(&delivery.receipt).await?;
        self.notify_in_background(Notification::failed(&job));
        Ok(DeliveryOutcome::Failed)
    }

    /// Deliver a notification without holding up the worker.
    fn notify_in_background(&self, notification: Notification) {
        let notifier = self.notifier.clone();
        tokio::spawn(
            async move { notify_best_effort(notifier.as_ref(), &notification).await }
                .in_current_span(),
        );
    }

    /// Start worker loops on the current tokio runtime.
    pub fn spawn(self, config: DispatcherConfig) -> DispatcherHandle {
        let dispatcher = Arc::new(self);
        let stats = Arc::new(Mutex::new(DispatcherStats::default()));
        let (shutdown_tx, shutdown_rx) = mpsc::channel::<()>(config.workers.max(1));
        let shutdown_rx = Arc::new(tokio::sync::Mutex::new(shutdown_rx));

        let joins = (0..config.workers.max(1))
            .map(|worker| {
                tokio::spawn(dispatch_loop(
                    dispatcher.clone(),
                    config.clone(),
                    worker,
                    shutdown_rx.clone(),
                    stats.clone(),
                ))
            })
            .collect();

        DispatcherHandle {
            shutdown: shutdown_tx,
            joins,
            stats,
        }
    }
}

/// Attempt number across process restarts: deliveries of this message plus
/// attempts spent before it was published.
fn attempt_of(delivery: &Delivery) -> u32 {
    delivery
        .attempts
        .saturating_add(delivery.message.prior_attempts)
}

fn with_stats(stats: &Mutex<DispatcherStats>, f: impl FnOnce(&mut DispatcherStats)) {
    if let Ok(mut s) = stats.lock() {
        f(&mut s);
    }
}

async fn dispatch_loop(
    dispatcher: Arc<BriefDispatcher>,
    config: DispatcherConfig,
    worker: usize,
    shutdown_rx: Arc<tokio::sync::Mutex<mpsc::Receiver<()>>>,
    stats: Arc<Mutex<DispatcherStats>>,
) {
    info!(dispatcher = %config.name, worker, "brief dispatcher started");
    let start_time = Instant::now();

    loop {
        with_stats(&stats, |s| s.uptime_secs = start_time.elapsed().as_secs());

        let received = tokio::select! {
            _ = async { shutdown_rx.lock().await.recv().await } => break,
            received = dispatcher.queue.receive(config.poll_interval) => received,
        };

        let delivery = match received {
            Ok(Some(delivery)) => delivery,
            Ok(None) => continue,
            Err(e) => {
                error!(dispatcher = %config.name, error = %e, "failed to receive from queue");
                tokio::time::sleep(config.poll_interval).await;
                continue;
            }
        };

        with_stats(&stats, |s| s.current_running += 1);
        let outcome = dispatcher.handle(&delivery).await;
        with_stats(&stats, |s| {
            s.current_running = s.current_running.saturating_sub(1);
            s.deliveries_processed += 1;
            match &outcome {
                Ok(DeliveryOutcome::Completed) => s.jobs_completed += 1,
                Ok(DeliveryOutcome::Retrying { .. }) => s.jobs_retried += 1,
                Ok(DeliveryOutcome::Failed) => s.jobs_failed += 1,
                Ok(DeliveryOutcome::Skipped) => s.deliveries_skipped += 1,
                Err(_) => s.dispatch_errors += 1,
            }
        });

        if let Err(e) = outcome {
            error!(
                dispatcher = %config.name,
                job_id = %delivery.message.job_id,
                error = %e,
                "delivery handling failed, returning message to queue"
            );
            let delay = dispatcher
                .retry_policy
                .delay_for_job(delivery.message.job_id, attempt_of(&delivery));
            if let Err(e) = dispatcher.queue.retry(&delivery.receipt, delay).await {
                error!(dispatcher = %config.name, error = %e, "failed to return message to queue");
            }
        }
    }

    info!(dispatcher = %config.name, worker, "brief dispatcher stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::store::JobRequest;
    use crate::notify::{NotificationKind, NotifyError};
    use crate::pipeline::dev::{
        MemoryObjectStorage, PlaceholderSynthesizer, StaticContentSource, TemplateScriptGenerator,
    };
    use crate::pipeline::InMemoryBriefArchive;
    use async_trait::async_trait;
    use civicbrief_core::{BriefType, JobPayload, JobStatus, UserId};
    use civicbrief_queue::InMemoryJobQueue;

    #[derive(Default)]
    struct RecordingNotifier {
        seen: Mutex<Vec<Notification>>,
    }

    #[async_trait]
    impl Notifier for RecordingNotifier {
        async fn notify(&self, n: &Notification) -> Result<(), NotifyError> {
            self.seen.lock().unwrap().push(n.clone());
            Ok(())
        }
    }

    struct Fixture {
        store: Arc<JobStore>,
        queue: Arc<InMemoryJobQueue>,
        notifier: Arc<RecordingNotifier>,
        dispatcher: BriefDispatcher,
    }

    fn fixture() -> Fixture {
        let store = Arc::new(JobStore::in_memory());
        let queue = Arc::new(InMemoryJobQueue::new());
        let notifier = Arc::new(RecordingNotifier::default());
        let pipeline = BriefPipeline::new(
            Arc::new(StaticContentSource::sample()),
            Arc::new(TemplateScriptGenerator::new()),
            Arc::new(PlaceholderSynthesizer::default()),
            Arc::new(MemoryObjectStorage::new("https://cdn.example")),
            Arc::new(InMemoryBriefArchive::new()),
        );
        let dispatcher =
            BriefDispatcher::new(store.clone(), queue.clone(), pipeline, notifier.clone());
        Fixture {
            store,
            queue,
            notifier,
            dispatcher,
        }
    }

    /// Let spawned notification tasks run.
    async fn settle() {
        for _ in 0..5 {
            tokio::task::yield_now().await;
        }
    }

    async fn submit(f: &Fixture, user: UserId) -> JobMessage {
        let payload = JobPayload::new(vec!["hr-1024".to_string()]);
        let receipt = f
            .store
            .enqueue(user, JobRequest::new(BriefType::Daily, payload.clone()))
            .await
            .unwrap();
        let msg = JobMessage::new(receipt.job_id, user, BriefType::Daily, payload);
        f.queue.send(msg.clone()).await.unwrap();
        msg
    }

    #[tokio::test]
    async fn completes_job_and_acks() {
        let f = fixture();
        let user = UserId::new();
        let msg = submit(&f, user).await;

        let delivery = f.queue.receive(Duration::ZERO).await.unwrap().unwrap();
        let outcome = f.dispatcher.handle(&delivery).await.unwrap();

        assert_eq!(outcome, DeliveryOutcome::Completed);
        let job = f.store.get_status(user, msg.job_id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(job.progress, 100);
        assert_eq!(f.queue.in_flight_len(), 0);
        settle().await;
        assert_eq!(f.notifier.seen.lock().unwrap()[0].kind, NotificationKind::Ready);
    }

    #[tokio::test]
    async fn cancelled_job_delivery_is_skipped() {
        let f = fixture();
        let user = UserId::new();
        let msg = submit(&f, user).await;
        assert!(f.store.cancel(user, msg.job_id).await.unwrap());

        let delivery = f.queue.receive(Duration::ZERO).await.unwrap().unwrap();
        let outcome = f.dispatcher.handle(&delivery).await.unwrap();

        assert_eq!(outcome, DeliveryOutcome::Skipped);
        assert_eq!(f.queue.in_flight_len(), 0);
        assert!(f.notifier.seen.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn unknown_job_delivery_is_skipped() {
        let f = fixture();
        f.queue
            .send(JobMessage::new(
                civicbrief_core::JobId::new(),
                UserId::new(),
                BriefType::Weekly,
                JobPayload::default(),
            ))
            .await
            .unwrap();

        let delivery = f.queue.receive(Duration::ZERO).await.unwrap().unwrap();
        assert_eq!(
            f.dispatcher.handle(&delivery).await.unwrap(),
            DeliveryOutcome::Skipped
        );
    }

    #[tokio::test]
    async fn duplicate_delivery_after_completion_is_harmless() {
        let f = fixture();
        let user = UserId::new();
        let msg = submit(&f, user).await;
        let delivery = f.queue.receive(Duration::ZERO).await.unwrap().unwrap();
        f.dispatcher.handle(&delivery).await.unwrap();

        // Simulate a redelivery of the same message.
        f.queue.send(msg.clone()).await.unwrap();
        let again = f.queue.receive(Duration::ZERO).await.unwrap().unwrap();
        assert_eq!(
            f.dispatcher.handle(&again).await.unwrap(),
            DeliveryOutcome::Skipped
        );

        assert_eq!(f.store.list_history(user).await.unwrap().len(), 1);
        settle().await;
        assert_eq!(f.notifier.seen.lock().unwrap().len(), 1);
    }

    /// Notifier that never answers, like a webhook endpoint that hangs.
    struct StalledNotifier;

    #[async_trait]
    impl Notifier for StalledNotifier {
        async fn notify(&self, _: &Notification) -> Result<(), NotifyError> {
            std::future::pending::<()>().await;
            Ok(())
        }
    }

    #[tokio::test]
    async fn slow_notifier_does_not_hold_the_delivery() {
        let f = fixture();
        let user = UserId::new();
        submit(&f, user).await;
        let pipeline = BriefPipeline::new(
            Arc::new(StaticContentSource::sample()),
            Arc::new(TemplateScriptGenerator::new()),
            Arc::new(PlaceholderSynthesizer::default()),
            Arc::new(MemoryObjectStorage::new("https://cdn.example")),
            Arc::new(InMemoryBriefArchive::new()),
        );
        let dispatcher = BriefDispatcher::new(
            f.store.clone(),
            f.queue.clone(),
            pipeline,
            Arc::new(StalledNotifier),
        );

        let delivery = f.queue.receive(Duration::ZERO).await.unwrap().unwrap();
        let outcome = tokio::time::timeout(Duration::from_secs(5), dispatcher.handle(&delivery))
            .await
            .expect("handle returned while the notifier was still pending")
            .unwrap();

        assert_eq!(outcome, DeliveryOutcome::Completed);
        assert_eq!(f.queue.in_flight_len(), 0);
    }

    #[tokio::test]
    async fn prior_attempts_count_toward_the_retry_limit() {
        let store = Arc::new(JobStore::in_memory());
        let queue = Arc::new(InMemoryJobQueue::new());
        let pipeline = BriefPipeline::new(
            Arc::new(StaticContentSource::new(Vec::new())),
            Arc::new(TemplateScriptGenerator::new()),
            Arc::new(PlaceholderSynthesizer::default()),
            Arc::new(MemoryObjectStorage::new("https://cdn.example")),
            Arc::new(InMemoryBriefArchive::new()),
        );
        let dispatcher = BriefDispatcher::new(
            store.clone(),
            queue.clone(),
            pipeline,
            Arc::new(RecordingNotifier::default()),
        );
        let user = UserId::new();
        let payload = JobPayload::new(vec!["missing".to_string()]);
        let receipt = store
            .enqueue(user, JobRequest::new(BriefType::Daily, payload.clone()))
            .await
            .unwrap();

        // Three attempts were spent before the message was republished.
        queue
            .send(
                JobMessage::new(receipt.job_id, user, BriefType::Daily, payload)
                    .with_prior_attempts(3),
            )
            .await
            .unwrap();
        let delivery = queue.receive(Duration::ZERO).await.unwrap().unwrap();

        assert_eq!(
            dispatcher.handle(&delivery).await.unwrap(),
            DeliveryOutcome::Failed
        );
        let job = store.get_status(user, receipt.job_id).await.unwrap().unwrap();
        assert!(job.is_finalized());
    }

    #[tokio::test(start_paused = true)]
    async fn spawned_dispatcher_drains_queue_and_shuts_down() {
        let f = fixture();
        let user = UserId::new();
        let first = submit(&f, user).await;
        let second = submit(&f, user).await;

        let Fixture {
            store, dispatcher, ..
        } = f;
        let handle = dispatcher.spawn(
            DispatcherConfig::default()
                .with_name("test-dispatcher")
                .with_poll_interval(Duration::from_millis(10)),
        );

        for _ in 0..100 {
            if handle.stats().jobs_completed == 2 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        let stats = handle.stats();
        assert_eq!(stats.jobs_completed, 2);
        handle.shutdown().await;

        for id in [first.job_id, second.job_id] {
            let job = store.get_status(user, id).await.unwrap().unwrap();
            assert_eq!(job.status, JobStatus::Completed);
        }
        assert_eq!(store.stats(user).await.unwrap().total_generated, 2);
    }
}
