//! In-memory job queue for tests/dev.

use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Notify;
use tokio::time::Instant;

use crate::message::{Delivery, JobMessage, ReceiptHandle};
use crate::queue::{MessageQueue, QueueError};

#[derive(Debug, Clone)]
struct Entry {
    message: JobMessage,
    deliveries: u32,
}

#[derive(Debug, Default)]
struct State {
    ready: VecDeque<Entry>,
    delayed: Vec<(Instant, Entry)>,
    in_flight: HashMap<ReceiptHandle, Entry>,
    next_receipt: u64,
}

impl State {
    fn promote_due(&mut self, now: Instant) {
        if self.delayed.is_empty() {
            return;
        }
        self.delayed.sort_by_key(|(due, _)| *due);
        let due = self.delayed.partition_point(|(at, _)| *at <= now);
        for (_, entry) in self.delayed.drain(..due) {
            self.ready.push_back(entry);
        }
    }

    fn next_due(&self) -> Option<Instant> {
        self.delayed.iter().map(|(at, _)| *at).min()
    }
}

/// In-process queue with delayed redelivery.
///
/// - FIFO for due messages
/// - Uses the tokio clock, so paused-time tests drive backoff deterministically
/// - Nothing survives a restart
#[derive(Debug, Default)]
pub struct InMemoryJobQueue {
    state: Mutex<State>,
    notify: Notify,
}

impl InMemoryJobQueue {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, State>, QueueError> {
        self.state.lock().map_err(|_| QueueError::Poisoned)
    }

    /// Messages due or waiting out a retry delay.
    pub fn pending_len(&self) -> usize {
        self.lock()
            .map(|s| s.ready.len() + s.delayed.len())
            .unwrap_or(0)
    }

    pub fn in_flight_len(&self) -> usize {
        self.lock().map(|s| s.in_flight.len()).unwrap_or(0)
    }
}

#[async_trait]
impl MessageQueue for InMemoryJobQueue {
    async fn send(&self, message: JobMessage) -> Result<(), QueueError> {
        self.send_delayed(message, Duration::ZERO).await
    }

    async fn send_delayed(&self, message: JobMessage, delay: Duration) -> Result<(), QueueError> {
        let entry = Entry {
            message,
            deliveries: 0,
        };
        {
            let mut state = self.lock()?;
            if delay.is_zero() {
                state.ready.push_back(entry);
            } else {
                state.delayed.push((Instant::now() + delay, entry));
            }
        }
        self.notify.notify_one();
        Ok(())
    }

    fn is_durable(&self) -> bool {
        false
    }

    async fn receive(&self, wait: Duration) -> Result<Option<Delivery>, QueueError> {
        let deadline = Instant::now() + wait;

        loop {
            let next_due = {
                let mut state = self.lock()?;
                state.promote_due(Instant::now());

                if let Some(mut entry) = state.ready.pop_front() {
                    entry.deliveries += 1;
                    state.next_receipt += 1;
                    let receipt = ReceiptHandle::new(format!("mem-{}", state.next_receipt));
                    let delivery = Delivery {
                        message: entry.message.clone(),
                        attempts: entry.deliveries,
                        receipt: receipt.clone(),
                    };
                    state.in_flight.insert(receipt, entry);
                    return Ok(Some(delivery));
                }

                state.next_due()
            };

            if Instant::now() >= deadline {
                return Ok(None);
            }
            let wake_at = next_due.map_or(deadline, |due| due.min(deadline));

            tokio::select! {
                _ = self.notify.notified() => {}
                _ = tokio::time::sleep_until(wake_at) => {}
            }
        }
    }

    async fn ack(&self, receipt: &ReceiptHandle) -> Result<(), QueueError> {
        self.lock()?
            .in_flight
            .remove(receipt)
            .map(|_| ())
            .ok_or_else(|| QueueError::UnknownReceipt(receipt.clone()))
    }

    async fn retry(&self, receipt: &ReceiptHandle, delay: Duration) -> Result<(), QueueError> {
        {
            let mut state = self.lock()?;
            let entry = state
                .in_flight
                .remove(receipt)
                .ok_or_else(|| QueueError::UnknownReceipt(receipt.clone()))?;
            if delay.is_zero() {
                state.ready.push_back(entry);
            } else {
                state.delayed.push((Instant::now() + delay, entry));
            }
        }
        self.notify.notify_one();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use civicbrief_core::{BriefType, JobId, JobPayload, UserId};

    fn message() -> JobMessage {
        JobMessage::new(
            JobId::new(),
            UserId::new(),
            BriefType::Daily,
            JobPayload::new(vec!["b1".to_string()]),
        )
    }

    #[tokio::test]
    async fn delivers_fifo_and_ack_removes() {
        let queue = InMemoryJobQueue::new();
        let first = message();
        let second = message();
        queue.send(first.clone()).await.unwrap();
        queue.send(second.clone()).await.unwrap();

        let d1 = queue.receive(Duration::ZERO).await.unwrap().unwrap();
        let d2 = queue.receive(Duration::ZERO).await.unwrap().unwrap();
        assert_eq!(d1.message.job_id, first.job_id);
        assert_eq!(d2.message.job_id, second.job_id);
        assert_eq!(d1.attempts, 1);
        assert_eq!(queue.in_flight_len(), 2);

        queue.ack(&d1.receipt).await.unwrap();
        queue.ack(&d2.receipt).await.unwrap();
        assert_eq!(queue.in_flight_len(), 0);
        assert!(queue.receive(Duration::ZERO).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn ack_with_unknown_receipt_fails() {
        let queue = InMemoryJobQueue::new();
        let err = queue
            .ack(&ReceiptHandle::new("missing"))
            .await
            .unwrap_err();
        assert!(matches!(err, QueueError::UnknownReceipt(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn retry_redelivers_after_delay_with_incremented_attempts() {
        let queue = InMemoryJobQueue::new();
        queue.send(message()).await.unwrap();

        let first = queue.receive(Duration::ZERO).await.unwrap().unwrap();
        queue
            .retry(&first.receipt, Duration::from_secs(60))
            .await
            .unwrap();

        assert!(
            queue
                .receive(Duration::from_secs(59))
                .await
                .unwrap()
                .is_none()
        );

        let started = Instant::now();
        let second = queue
            .receive(Duration::from_secs(10))
            .await
            .unwrap()
            .unwrap();
        assert!(started.elapsed() <= Duration::from_secs(1));
        assert_eq!(second.attempts, 2);
        assert_eq!(second.message.job_id, first.message.job_id);
    }

    #[tokio::test(start_paused = true)]
    async fn delayed_send_is_hidden_until_due() {
        let queue = InMemoryJobQueue::new();
        let msg = message();
        queue
            .send_delayed(msg.clone(), Duration::from_secs(30))
            .await
            .unwrap();
        assert_eq!(queue.pending_len(), 1);

        assert!(queue.receive(Duration::from_secs(29)).await.unwrap().is_none());
        let delivery = queue
            .receive(Duration::from_secs(5))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(delivery.message.job_id, msg.job_id);
        assert_eq!(delivery.attempts, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn receive_wakes_when_a_message_is_sent() {
        let queue = std::sync::Arc::new(InMemoryJobQueue::new());
        let consumer = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.receive(Duration::from_secs(30)).await })
        };

        tokio::time::sleep(Duration::from_secs(1)).await;
        queue.send(message()).await.unwrap();

        let delivery = consumer.await.unwrap().unwrap();
        assert!(delivery.is_some());
    }
}
