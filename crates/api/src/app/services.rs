//! Infrastructure wiring: job store, queue, pipeline, notifiers, dispatcher.

use std::convert::Infallible;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::response::sse::{Event as SseEvent, KeepAlive, Sse};
use sqlx::PgPool;
use tokio_stream::{StreamExt, wrappers::BroadcastStream};

use civicbrief_core::UserId;
use civicbrief_infra::{
    BriefsConfig,
    jobs::{
        BriefDispatcher, DispatcherConfig, DispatcherHandle, DispatcherStats,
        InMemoryJobStateRepository, JobStateRepository, JobStore, JobStoreError,
        PostgresJobStateRepository,
    },
    notify::{
        BroadcastNotifier, FanoutNotifier, Notifier, NotifyError, TracingNotifier,
        WebhookNotifier,
    },
    pipeline::{
        ArchiveError, BriefArchive, BriefPipeline, InMemoryBriefArchive, PostgresBriefArchive,
        dev::{
            LocalObjectStorage, PlaceholderSynthesizer, StaticContentSource,
            TemplateScriptGenerator,
        },
    },
    scheduler::{BriefScheduler, InMemorySubscriberDirectory},
    service::{BriefService, ServiceError},
};
use civicbrief_queue::{InMemoryJobQueue, MessageQueue, QueueError};

#[derive(Debug, thiserror::Error)]
pub enum ServicesError {
    #[error("failed to connect to Postgres: {0}")]
    Database(#[from] sqlx::Error),
    #[error(transparent)]
    Store(#[from] JobStoreError),
    #[error(transparent)]
    Archive(#[from] ArchiveError),
    #[error(transparent)]
    Queue(#[from] QueueError),
    #[error(transparent)]
    Notify(#[from] NotifyError),
    #[error("failed to republish unfinished jobs: {0}")]
    Recovery(#[from] ServiceError),
    #[error("DATABASE_URL must be set when USE_PERSISTENT_STORES=true")]
    MissingDatabaseUrl,
}

/// Wiring switches not covered by env configuration.
#[derive(Debug, Clone)]
pub struct AppOptions {
    /// Start the in-process dispatcher workers.
    pub run_dispatcher: bool,
    pub dispatcher_workers: usize,
}

impl Default for AppOptions {
    fn default() -> Self {
        Self {
            run_dispatcher: true,
            dispatcher_workers: 1,
        }
    }
}

pub struct AppServices {
    pub config: BriefsConfig,
    pub store: Arc<JobStore>,
    pub service: Arc<BriefService>,
    pub scheduler: Arc<BriefScheduler>,
    pub subscribers: Arc<InMemorySubscriberDirectory>,
    pub live: Arc<BroadcastNotifier>,
    dispatcher: Mutex<Option<DispatcherHandle>>,
}

impl AppServices {
    pub fn dispatcher_stats(&self) -> Option<DispatcherStats> {
        self.dispatcher
            .lock()
            .ok()
            .and_then(|h| h.as_ref().map(DispatcherHandle::stats))
    }

    /// Stop the dispatcher workers, letting in-flight jobs finish.
    pub async fn shutdown(&self) {
        let handle = self.dispatcher.lock().ok().and_then(|mut h| h.take());
        if let Some(handle) = handle {
            handle.shutdown().await;
        }
    }
}

pub async fn build_services(
    config: BriefsConfig,
    options: &AppOptions,
) -> Result<AppServices, ServicesError> {
    let repository: Arc<dyn JobStateRepository>;
    let archive: Arc<dyn BriefArchive>;
    if config.use_persistent_stores {
        let url = config
            .database_url
            .as_deref()
            .ok_or(ServicesError::MissingDatabaseUrl)?;
        let pool = PgPool::connect(url).await?;

        let postgres_state = PostgresJobStateRepository::new(pool.clone());
        postgres_state.ensure_schema().await?;
        let postgres_archive = PostgresBriefArchive::new(pool);
        postgres_archive.ensure_schema().await?;
        tracing::info!("using Postgres job state and brief archive");

        repository = Arc::new(postgres_state);
        archive = Arc::new(postgres_archive);
    } else {
        repository = InMemoryJobStateRepository::arc();
        archive = Arc::new(InMemoryBriefArchive::new());
    }

    let store = Arc::new(
        JobStore::new(repository).with_estimated_seconds_per_job(config.estimated_seconds_per_job),
    );
    let queue = build_queue(&config)?;

    let live = Arc::new(BroadcastNotifier::default());
    let mut notifier = FanoutNotifier::new()
        .with(Arc::new(TracingNotifier))
        .with(live.clone());
    if let Some(url) = &config.notify_webhook_url {
        notifier = notifier.with(Arc::new(WebhookNotifier::new(url.clone())?));
    }
    let notifier: Arc<dyn Notifier> = Arc::new(notifier);

    let pipeline = BriefPipeline::new(
        Arc::new(StaticContentSource::sample()),
        Arc::new(TemplateScriptGenerator::new()),
        Arc::new(PlaceholderSynthesizer::new(config.audio_bitrate_kbps)),
        Arc::new(LocalObjectStorage::new(
            config.audio_dir.clone(),
            config.public_base_url.clone(),
        )),
        archive,
    )
    .with_bitrate_kbps(config.audio_bitrate_kbps);

    let dispatcher = options.run_dispatcher.then(|| {
        BriefDispatcher::new(store.clone(), queue.clone(), pipeline, notifier)
            .with_retry_policy(config.retry_policy.clone())
            .spawn(
                DispatcherConfig::default()
                    .with_poll_interval(config.worker_poll_interval)
                    .with_workers(options.dispatcher_workers),
            )
    });

    let service = Arc::new(BriefService::new(store.clone(), queue.clone()));
    if !queue.is_durable() {
        // Messages from before a restart are gone; the job store still has the jobs.
        let recovered = service.recover_unfinished().await?;
        if recovered > 0 {
            tracing::info!(recovered, "republished unfinished brief jobs");
        }
    }
    let subscribers = Arc::new(InMemorySubscriberDirectory::new());
    let scheduler = Arc::new(BriefScheduler::new(service.clone(), subscribers.clone()));

    Ok(AppServices {
        config,
        store,
        service,
        scheduler,
        subscribers,
        live,
        dispatcher: Mutex::new(dispatcher),
    })
}

#[cfg(feature = "redis")]
fn build_queue(config: &BriefsConfig) -> Result<Arc<dyn MessageQueue>, ServicesError> {
    match &config.redis_url {
        Some(url) => {
            tracing::info!("using Redis job queue");
            Ok(Arc::new(civicbrief_infra::queue::RedisJobQueue::new(url, None)?))
        }
        None => Ok(Arc::new(InMemoryJobQueue::new())),
    }
}

#[cfg(not(feature = "redis"))]
fn build_queue(config: &BriefsConfig) -> Result<Arc<dyn MessageQueue>, ServicesError> {
    if config.redis_url.is_some() {
        tracing::warn!("REDIS_URL set but redis feature not enabled, falling back to in-memory queue");
    }
    Ok(Arc::new(InMemoryJobQueue::new()))
}

/// SSE stream of the caller's own notifications.
pub fn user_notification_stream(
    services: Arc<AppServices>,
    user_id: UserId,
) -> Sse<impl tokio_stream::Stream<Item = Result<SseEvent, Infallible>>> {
    let rx = services.live.subscribe();
    let stream = BroadcastStream::new(rx).filter_map(move |msg| match msg {
        Ok(n) if n.user_id == user_id => {
            let data = serde_json::to_string(&n).unwrap_or_else(|_| "{}".to_string());
            let event = match n.kind {
                civicbrief_infra::NotificationKind::Ready => "brief.ready",
                civicbrief_infra::NotificationKind::Failed => "brief.failed",
            };
            Some(Ok(SseEvent::default().event(event).data(data)))
        }
        _ => None,
    });

    Sse::new(stream).keep_alive(KeepAlive::new().interval(Duration::from_secs(15)))
}
