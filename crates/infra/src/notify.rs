//! Outbound notifications on terminal job states.
//!
//! Notification is fire-and-forget from the job's point of view: callers go
//! through [`notify_best_effort`], which logs failures and never returns them.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::{info, warn};

use civicbrief_core::{BriefType, JobId, JobRecord, UserId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationKind {
    Ready,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notification {
    pub user_id: UserId,
    #[serde(rename = "type")]
    pub kind: NotificationKind,
    pub job_id: JobId,
    pub brief_type: BriefType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub audio_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_seconds: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub occurred_at: DateTime<Utc>,
}

impl Notification {
    pub fn ready(job: &JobRecord) -> Self {
        Self {
            user_id: job.user_id,
            kind: NotificationKind::Ready,
            job_id: job.id,
            brief_type: job.job_type,
            audio_url: job.result.as_ref().map(|r| r.audio_url.clone()),
            duration_seconds: job.result.as_ref().map(|r| r.duration_seconds),
            error: None,
            occurred_at: Utc::now(),
        }
    }

    pub fn failed(job: &JobRecord) -> Self {
        Self {
            user_id: job.user_id,
            kind: NotificationKind::Failed,
            job_id: job.id,
            brief_type: job.job_type,
            audio_url: None,
            duration_seconds: None,
            error: job.error.clone(),
            occurred_at: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum NotifyError {
    #[error("notification delivery failed: {0}")]
    Delivery(String),
    #[error("notification endpoint rejected request with status {0}")]
    Rejected(u16),
    #[error("{failed} of {total} notifiers failed")]
    Partial { failed: usize, total: usize },
}

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, notification: &Notification) -> Result<(), NotifyError>;
}

#[async_trait]
impl<N> Notifier for Arc<N>
where
    N: Notifier + ?Sized,
{
    async fn notify(&self, notification: &Notification) -> Result<(), NotifyError> {
        (**self).notify(notification).await
    }
}

/// Send a notification, logging (never returning) any failure.
pub async fn notify_best_effort(notifier: &dyn Notifier, notification: &Notification) {
    if let Err(e) = notifier.notify(notification).await {
        warn!(
            job_id = %notification.job_id,
            user_id = %notification.user_id,
            kind = ?notification.kind,
            error = %e,
            "notification failed"
        );
    }
}

/// Writes notifications to the log.
#[derive(Debug, Default, Clone)]
pub struct TracingNotifier;

#[async_trait]
impl Notifier for TracingNotifier {
    async fn notify(&self, n: &Notification) -> Result<(), NotifyError> {
        info!(
            job_id = %n.job_id,
            user_id = %n.user_id,
            kind = ?n.kind,
            audio_url = n.audio_url.as_deref().unwrap_or(""),
            error = n.error.as_deref().unwrap_or(""),
            "brief notification"
        );
        Ok(())
    }
}

pub const DEFAULT_BROADCAST_CAPACITY: usize = 256;

/// In-process fan-out to live subscribers (the SSE stream).
#[derive(Debug, Clone)]
pub struct BroadcastNotifier {
    tx: broadcast::Sender<Notification>,
}

impl Default for BroadcastNotifier {
    fn default() -> Self {
        Self::new(DEFAULT_BROADCAST_CAPACITY)
    }
}

impl BroadcastNotifier {
    pub fn new(capacity: usize) -> Self {
        let (tx, _rx) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Notification> {
        self.tx.subscribe()
    }
}

#[async_trait]
impl Notifier for BroadcastNotifier {
    async fn notify(&self, n: &Notification) -> Result<(), NotifyError> {
        // No live subscribers is not a failure.
        let _ = self.tx.send(n.clone());
        Ok(())
    }
}

/// POSTs notifications as JSON to a configured URL.
#[derive(Debug, Clone)]
pub struct WebhookNotifier {
    client: reqwest::Client,
    url: String,
}

impl WebhookNotifier {
    pub fn new(url: impl Into<String>) -> Result<Self, NotifyError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| NotifyError::Delivery(e.to_string()))?;
        Ok(Self {
            client,
            url: url.into(),
        })
    }
}

#[async_trait]
impl Notifier for WebhookNotifier {
    async fn notify(&self, n: &Notification) -> Result<(), NotifyError> {
        let response = self
            .client
            .post(&self.url)
            .json(n)
            .send()
            .await
            .map_err(|e| NotifyError::Delivery(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(NotifyError::Rejected(status.as_u16()));
        }
        Ok(())
    }
}

/// Delivers to every inner notifier, even when some fail.
#[derive(Clone, Default)]
pub struct FanoutNotifier {
    notifiers: Vec<Arc<dyn Notifier>>,
}

impl FanoutNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, notifier: Arc<dyn Notifier>) -> Self {
        self.notifiers.push(notifier);
        self
    }

    pub fn len(&self) -> usize {
        self.notifiers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.notifiers.is_empty()
    }
}

#[async_trait]
impl Notifier for FanoutNotifier {
    async fn notify(&self, n: &Notification) -> Result<(), NotifyError> {
        let mut failed = 0;
        for notifier in &self.notifiers {
            if let Err(e) = notifier.notify(n).await {
                warn!(job_id = %n.job_id, error = %e, "notifier in fan-out failed");
                failed += 1;
            }
        }
        if failed > 0 {
            return Err(NotifyError::Partial {
                failed,
                total: self.notifiers.len(),
            });
        }
        Ok(())
    }
}
