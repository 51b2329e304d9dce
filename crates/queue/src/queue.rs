//! Message queue abstraction (mechanics only).
//!
//! Delivery is **at-least-once**: a message stays owned by the queue until it
//! is acknowledged, and a consumer that fails asks for redelivery after a
//! delay instead of dropping it. Consumers must tolerate duplicates.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::message::{Delivery, JobMessage, ReceiptHandle};

#[derive(Debug, Clone, thiserror::Error)]
pub enum QueueError {
    #[error("unknown receipt handle: {0}")]
    UnknownReceipt(ReceiptHandle),

    #[error("queue state lock poisoned")]
    Poisoned,

    #[error("queue backend error: {0}")]
    Backend(String),

    #[error("message serialization error: {0}")]
    Serialization(String),
}

#[async_trait]
pub trait MessageQueue: Send + Sync {
    /// Publish a message for immediate delivery.
    async fn send(&self, message: JobMessage) -> Result<(), QueueError>;

    /// Publish a message that becomes due only after `delay`.
    async fn send_delayed(&self, message: JobMessage, delay: Duration) -> Result<(), QueueError>;

    /// Whether queued messages survive a restart of this process.
    fn is_durable(&self) -> bool;

    /// Wait up to `wait` for the next due message.
    ///
    /// The returned delivery is in flight until [`ack`](Self::ack) or
    /// [`retry`](Self::retry) is called with its receipt.
    async fn receive(&self, wait: Duration) -> Result<Option<Delivery>, QueueError>;

    /// Remove an in-flight message permanently.
    async fn ack(&self, receipt: &ReceiptHandle) -> Result<(), QueueError>;

    /// Return an in-flight message to the queue, due again after `delay`.
    async fn retry(&self, receipt: &ReceiptHandle, delay: Duration) -> Result<(), QueueError>;
}

#[async_trait]
impl<Q> MessageQueue for Arc<Q>
where
    Q: MessageQueue + ?Sized,
{
    async fn send(&self, message: JobMessage) -> Result<(), QueueError> {
        (**self).send(message).await
    }

    async fn send_delayed(&self, message: JobMessage, delay: Duration) -> Result<(), QueueError> {
        (**self).send_delayed(message, delay).await
    }

    fn is_durable(&self) -> bool {
        (**self).is_durable()
    }

    async fn receive(&self, wait: Duration) -> Result<Option<Delivery>, QueueError> {
        (**self).receive(wait).await
    }

    async fn ack(&self, receipt: &ReceiptHandle) -> Result<(), QueueError> {
        (**self).ack(receipt).await
    }

    async fn retry(&self, receipt: &ReceiptHandle, delay: Duration) -> Result<(), QueueError> {
        (**self).retry(receipt, delay).await
    }
}
