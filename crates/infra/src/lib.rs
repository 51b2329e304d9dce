//! Infrastructure layer: job store, dispatcher, pipeline adapters, notifiers, config.

pub mod config;
pub mod jobs;
pub mod notify;
pub mod pipeline;
pub mod queue;
pub mod scheduler;
pub mod service;


pub use config::{BriefsConfig, ConfigError};
pub use jobs::{
    BriefDispatcher, DispatcherConfig, DispatcherHandle, DispatcherStats, EnqueueReceipt,
    JobRequest, JobStore, JobStoreError, RetryPolicy,
};
pub use notify::{Notification, NotificationKind, Notifier};
pub use service::{BriefService, ServiceError};
