//! Redis-backed job queue (durable, at-least-once delivery).
//!
//! ## Layout
//!
//! - `{prefix}:due` sorted set: entry id scored by due time (epoch ms)
//! - `{prefix}:inflight` sorted set: entry id scored by visibility deadline
//! - `{prefix}:messages` hash: entry id -> JSON `JobMessage`
//! - `{prefix}:deliveries` hash: entry id -> delivery count
//!
//! The receipt handle is the entry id. Entries whose visibility deadline
//! passes without an ack (crashed worker) are moved back to `due`.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use redis::AsyncCommands;
use tracing::{debug, instrument, warn};
use uuid::Uuid;

use civicbrief_queue::{Delivery, JobMessage, MessageQueue, QueueError, ReceiptHandle};

/// Default key prefix
const DEFAULT_PREFIX: &str = "civicbrief:jobs";

/// Default time an unacknowledged delivery stays invisible
const DEFAULT_VISIBILITY_TIMEOUT: Duration = Duration::from_secs(15 * 60);

/// Default sleep between polls while waiting for a due message
const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(250);

const CLAIM_SCRIPT: &str = r#"
local ids = redis.call('ZRANGEBYSCORE', KEYS[1], '-inf', ARGV[1], 'LIMIT', 0, 1)
if #ids == 0 then
  return false
end
local id = ids[1]
redis.call('ZREM', KEYS[1], id)
redis.call('ZADD', KEYS[2], ARGV[2], id)
local n = redis.call('HINCRBY', KEYS[4], id, 1)
local body = redis.call('HGET', KEYS[3], id)
return {id, body, n}
"#;

const RECLAIM_SCRIPT: &str = r#"
local ids = redis.call('ZRANGEBYSCORE', KEYS[1], '-inf', ARGV[1])
for _, id in ipairs(ids) do
  redis.call('ZREM', KEYS[1], id)
  redis.call('ZADD', KEYS[2], ARGV[1], id)
end
return #ids
"#;

const RETRY_SCRIPT: &str = r#"
if redis.call('ZREM', KEYS[1], ARGV[1]) == 0 then
  return 0
end
redis.call('ZADD', KEYS[2], ARGV[2], ARGV[1])
return 1
"#;

#[derive(Debug, Clone)]
pub struct RedisJobQueue {
    client: Arc<redis::Client>,
    prefix: String,
    visibility_timeout: Duration,
    poll_interval: Duration,
}

fn command_error(err: redis::RedisError) -> QueueError {
    QueueError::Backend(format!("redis command error: {err}"))
}

fn epoch_ms_after(delay: Duration) -> i64 {
    Utc::now().timestamp_millis() + delay.as_millis().min(i64::MAX as u128) as i64
}

impl RedisJobQueue {
    /// Create a queue over `redis_url` (e.g. `redis://localhost:6379`).
    pub fn new(redis_url: impl AsRef<str>, prefix: Option<String>) -> Result<Self, QueueError> {
        let client = redis::Client::open(redis_url.as_ref())
            .map_err(|e| QueueError::Backend(format!("redis connection error: {e}")))?;

        Ok(Self {
            client: Arc::new(client),
            prefix: prefix.unwrap_or_else(|| DEFAULT_PREFIX.to_string()),
            visibility_timeout: DEFAULT_VISIBILITY_TIMEOUT,
            poll_interval: DEFAULT_POLL_INTERVAL,
        })
    }

    pub fn with_visibility_timeout(mut self, timeout: Duration) -> Self {
        self.visibility_timeout = timeout;
        self
    }

    fn key(&self, suffix: &str) -> String {
        format!("{}:{}", self.prefix, suffix)
    }

    async fn connection(&self) -> Result<redis::aio::MultiplexedConnection, QueueError> {
        self.client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| QueueError::Backend(format!("redis connection error: {e}")))
    }

    async fn reclaim_expired(
        &self,
        conn: &mut redis::aio::MultiplexedConnection,
    ) -> Result<(), QueueError> {
        let reclaimed: i64 = redis::Script::new(RECLAIM_SCRIPT)
            .key(self.key("inflight"))
            .key(self.key("due"))
            .arg(Utc::now().timestamp_millis())
            .invoke_async(conn)
            .await
            .map_err(command_error)?;
        if reclaimed > 0 {
            warn!(reclaimed, "redelivering messages whose visibility timeout expired");
        }
        Ok(())
    }

    async fn try_claim(
        &self,
        conn: &mut redis::aio::MultiplexedConnection,
    ) -> Result<Option<Delivery>, QueueError> {
        let claimed: Option<(String, Option<String>, i64)> = redis::Script::new(CLAIM_SCRIPT)
            .key(self.key("due"))
            .key(self.key("inflight"))
            .key(self.key("messages"))
            .key(self.key("deliveries"))
            .arg(Utc::now().timestamp_millis())
            .arg(epoch_ms_after(self.visibility_timeout))
            .invoke_async(conn)
            .await
            .map_err(command_error)?;

        let Some((id, body, deliveries)) = claimed else {
            return Ok(None);
        };
        let Some(body) = body else {
            // Body vanished (acked elsewhere); drop the orphaned id.
            let _: () = conn
                .zrem(self.key("inflight"), &id)
                .await
                .map_err(command_error)?;
            return Ok(None);
        };

        let message: JobMessage = serde_json::from_str(&body)
            .map_err(|e| QueueError::Serialization(e.to_string()))?;
        Ok(Some(Delivery {
            message,
            attempts: u32::try_from(deliveries).unwrap_or(u32::MAX),
            receipt: ReceiptHandle::new(id),
        }))
    }
}

#[async_trait]
impl MessageQueue for RedisJobQueue {
    async fn send(&self, message: JobMessage) -> Result<(), QueueError> {
        self.send_delayed(message, Duration::ZERO).await
    }

    #[instrument(
        skip(self, message),
        fields(prefix = %self.prefix, job_id = %message.job_id, delay_secs = delay.as_secs()),
        err
    )]
    async fn send_delayed(&self, message: JobMessage, delay: Duration) -> Result<(), QueueError> {
        let body =
            serde_json::to_string(&message).map_err(|e| QueueError::Serialization(e.to_string()))?;
        let id = Uuid::now_v7().to_string();
        let mut conn = self.connection().await?;

        redis::pipe()
            .atomic()
            .hset(self.key("messages"), &id, body)
            .ignore()
            .zadd(self.key("due"), &id, epoch_ms_after(delay))
            .ignore()
            .query_async::<_, ()>(&mut conn)
            .await
            .map_err(command_error)?;

        debug!(entry_id = %id, "job message queued");
        Ok(())
    }

    fn is_durable(&self) -> bool {
        true
    }

    async fn receive(&self, wait: Duration) -> Result<Option<Delivery>, QueueError> {
        let deadline = tokio::time::Instant::now() + wait;
        let mut conn = self.connection().await?;

        loop {
            self.reclaim_expired(&mut conn).await?;
            if let Some(delivery) = self.try_claim(&mut conn).await? {
                return Ok(Some(delivery));
            }

            let now = tokio::time::Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            tokio::time::sleep(self.poll_interval.min(deadline - now)).await;
        }
    }

    #[instrument(skip(self), fields(prefix = %self.prefix), err)]
    async fn ack(&self, receipt: &ReceiptHandle) -> Result<(), QueueError> {
        let id = receipt.as_str();
        let mut conn = self.connection().await?;

        let (removed,): (i64,) = redis::pipe()
            .atomic()
            .zrem(self.key("inflight"), id)
            .hdel(self.key("messages"), id)
            .ignore()
            .hdel(self.key("deliveries"), id)
            .ignore()
            .query_async(&mut conn)
            .await
            .map_err(command_error)?;

        if removed == 0 {
            return Err(QueueError::UnknownReceipt(receipt.clone()));
        }
        Ok(())
    }

    #[instrument(skip(self), fields(prefix = %self.prefix, delay_secs = delay.as_secs()), err)]
    async fn retry(&self, receipt: &ReceiptHandle, delay: Duration) -> Result<(), QueueError> {
        let id = receipt.as_str();
        let mut conn = self.connection().await?;

        // Moved in one script so the id is never outside both sets.
        let moved: i64 = redis::Script::new(RETRY_SCRIPT)
            .key(self.key("inflight"))
            .key(self.key("due"))
            .arg(id)
            .arg(epoch_ms_after(delay))
            .invoke_async(&mut conn)
            .await
            .map_err(command_error)?;
        if moved == 0 {
            return Err(QueueError::UnknownReceipt(receipt.clone()));
        }
        Ok(())
    }
}
