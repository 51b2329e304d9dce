//! Scheduled fan-out: one brief job per eligible user.
//!
//! The scheduler only iterates and submits; it has no view of queue
//! mechanics. Each submission is independent, so one user's failure does not
//! stop the batch.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{error, info, warn};

use civicbrief_core::{BriefType, JobId, JobPayload, UserId};

use crate::jobs::store::JobRequest;
use crate::service::BriefService;

/// A user eligible for a scheduled brief, with their content selection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Subscriber {
    pub user_id: UserId,
    pub payload: JobPayload,
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum DirectoryError {
    #[error("subscriber directory unavailable: {0}")]
    Unavailable(String),
}

#[async_trait]
pub trait SubscriberDirectory: Send + Sync {
    async fn subscribers(&self, brief_type: BriefType) -> Result<Vec<Subscriber>, DirectoryError>;
}

#[derive(Debug, Clone)]
struct Subscription {
    brief_types: Vec<BriefType>,
    payload: JobPayload,
}

/// In-memory subscriber list for tests/dev.
#[derive(Debug, Default)]
pub struct InMemorySubscriberDirectory {
    subscriptions: RwLock<HashMap<UserId, Subscription>>,
}

impl InMemorySubscriberDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self, user_id: UserId, brief_types: Vec<BriefType>, payload: JobPayload) {
        if let Ok(mut subs) = self.subscriptions.write() {
            subs.insert(
                user_id,
                Subscription {
                    brief_types,
                    payload,
                },
            );
        }
    }

    pub fn unsubscribe(&self, user_id: UserId) -> bool {
        self.subscriptions
            .write()
            .map(|mut subs| subs.remove(&user_id).is_some())
            .unwrap_or(false)
    }
}

#[async_trait]
impl SubscriberDirectory for InMemorySubscriberDirectory {
    async fn subscribers(&self, brief_type: BriefType) -> Result<Vec<Subscriber>, DirectoryError> {
        let subs = self
            .subscriptions
            .read()
            .map_err(|_| DirectoryError::Unavailable("subscription lock poisoned".to_string()))?;
        let mut out: Vec<Subscriber> = subs
            .iter()
            .filter(|(_, s)| s.brief_types.contains(&brief_type))
            .map(|(user_id, s)| Subscriber {
                user_id: *user_id,
                payload: s.payload.clone(),
            })
            .collect();
        out.sort_by_key(|s| s.user_id);
        Ok(out)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FanOutReport {
    pub brief_type: BriefType,
    pub submitted: usize,
    pub failed: usize,
    pub job_ids: Vec<JobId>,
}

pub struct BriefScheduler {
    service: Arc<BriefService>,
    directory: Arc<dyn SubscriberDirectory>,
}

impl BriefScheduler {
    pub fn new(service: Arc<BriefService>, directory: Arc<dyn SubscriberDirectory>) -> Self {
        Self { service, directory }
    }

    /// Submit one job per eligible user.
    pub async fn fan_out(&self, brief_type: BriefType) -> Result<FanOutReport, DirectoryError> {
        let subscribers = self.directory.subscribers(brief_type).await?;
        let mut report = FanOutReport {
            brief_type,
            submitted: 0,
            failed: 0,
            job_ids: Vec::with_capacity(subscribers.len()),
        };

        for subscriber in subscribers {
            let request = JobRequest::new(brief_type, subscriber.payload);
            match self.service.submit(subscriber.user_id, request).await {
                Ok(receipt) => {
                    report.submitted += 1;
                    report.job_ids.push(receipt.job_id);
                }
                Err(e) => {
                    warn!(user_id = %subscriber.user_id, error = %e, "scheduled brief not submitted");
                    report.failed += 1;
                }
            }
        }

        info!(
            brief_type = %brief_type,
            submitted = report.submitted,
            failed = report.failed,
            "scheduled fan-out finished"
        );
        Ok(report)
    }

    /// Run [`fan_out`](Self::fan_out) every `period`, starting one period from now.
    pub fn spawn_every(self: Arc<Self>, brief_type: BriefType, period: Duration) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            ticker.tick().await;

            loop {
                ticker.tick().await;
                if let Err(e) = self.fan_out(brief_type).await {
                    error!(brief_type = %brief_type, error = %e, "scheduled fan-out failed");
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::store::JobStore;
    use civicbrief_queue::{InMemoryJobQueue, MessageQueue};

    fn scheduler() -> (Arc<BriefScheduler>, Arc<InMemorySubscriberDirectory>, Arc<InMemoryJobQueue>) {
        let store = Arc::new(JobStore::in_memory());
        let queue = Arc::new(InMemoryJobQueue::new());
        let service = Arc::new(BriefService::new(store, queue.clone()));
        let directory = Arc::new(InMemorySubscriberDirectory::new());
        (
            Arc::new(BriefScheduler::new(service, directory.clone())),
            directory,
            queue,
        )
    }

    #[tokio::test]
    async fn fan_out_submits_one_job_per_matching_user() {
        let (scheduler, directory, queue) = scheduler();
        directory.subscribe(UserId::new(), vec![BriefType::Daily], JobPayload::default());
        directory.subscribe(
            UserId::new(),
            vec![BriefType::Daily, BriefType::Weekly],
            JobPayload::default(),
        );
        directory.subscribe(UserId::new(), vec![BriefType::Weekly], JobPayload::default());

        let report = scheduler.fan_out(BriefType::Daily).await.unwrap();

        assert_eq!(report.submitted, 2);
        assert_eq!(report.failed, 0);
        assert_eq!(queue.pending_len(), 2);
    }

    #[tokio::test]
    async fn unsubscribed_users_are_skipped() {
        let (scheduler, directory, _queue) = scheduler();
        let user = UserId::new();
        directory.subscribe(user, vec![BriefType::Weekly], JobPayload::default());
        assert!(directory.unsubscribe(user));

        let report = scheduler.fan_out(BriefType::Weekly).await.unwrap();
        assert_eq!(report.submitted, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn spawn_every_runs_on_each_period() {
        let (scheduler, directory, queue) = scheduler();
        directory.subscribe(UserId::new(), vec![BriefType::Daily], JobPayload::default());

        let task = scheduler.spawn_every(BriefType::Daily, Duration::from_secs(3600));

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(queue.pending_len(), 0);

        tokio::time::sleep(Duration::from_secs(3600)).await;
        assert_eq!(queue.pending_len(), 1);

        task.abort();
        let delivery = queue.receive(Duration::ZERO).await.unwrap();
        assert!(delivery.is_some());
    }
}
