//! `civicbrief-core`: job lifecycle domain.
//!
//! This crate contains **pure domain** types (no infrastructure concerns):
//! identifiers, the job record state machine and the per-user job board.

pub mod board;
pub mod error;
pub mod id;
pub mod job;

pub use board::{BoardStats, CANCELLED_BY_USER, HISTORY_LIMIT, UserJobBoard};
pub use error::{DomainError, DomainResult};
pub use id::{JobId, UserId};
pub use job::{BriefResult, BriefType, JobPatch, JobPayload, JobRecord, JobStatus, PendingRetry};
