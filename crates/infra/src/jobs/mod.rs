//! Brief job system: per-user state, retry policy, and the queue dispatcher.
//!
//! ## Design
//!
//! - Job state is user-scoped; every mutation is an idempotent merge
//! - Delivery is at-least-once; duplicate deliveries are dropped by status
//! - Failed attempts are redelivered with exponential backoff
//! - Jobs are finalized `failed` once retries are exhausted
//!
//! ## Components
//!
//! - `JobStore`: per-user boards over a `JobStateRepository` (in-memory or Postgres)
//! - `BriefDispatcher`: consumes the queue and runs the pipeline
//! - `RetryPolicy`: attempt ceiling and backoff schedule

pub mod dispatcher;
pub mod postgres;
pub mod retry;
pub mod store;

pub use dispatcher::{
    BriefDispatcher, DeliveryOutcome, DispatchError, DispatcherConfig, DispatcherHandle,
    DispatcherStats,
};
pub use postgres::PostgresJobStateRepository;
pub use retry::{BackoffStrategy, RetryPolicy};
pub use store::{
    EnqueueReceipt, InMemoryJobStateRepository, JobRequest, JobStateRepository, JobStore,
    JobStoreError,
};
