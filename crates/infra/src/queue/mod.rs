//! Durable queue backends. The in-memory queue lives in `civicbrief-queue`.

#[cfg(feature = "redis")]
pub mod redis;

#[cfg(feature = "redis")]
pub use self::redis::RedisJobQueue;

pub use civicbrief_queue::{InMemoryJobQueue, MessageQueue, QueueError};
