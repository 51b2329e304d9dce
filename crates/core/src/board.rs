//! Per-user job board: the state container behind the job store.
//!
//! One board exists per user. It holds at most one active job, a FIFO of
//! pending jobs and a bounded, most-recent-first history of finalized jobs.
//! The board is plain data; durability and serialization of concurrent
//! callers are the store's job.

use std::collections::VecDeque;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{DomainError, DomainResult};
use crate::id::{JobId, UserId};
use crate::job::{JobPatch, JobRecord, JobStatus};

/// Maximum number of finalized jobs kept per user.
pub const HISTORY_LIMIT: usize = 10;

/// Error text written when a user cancels a queued job.
pub const CANCELLED_BY_USER: &str = "cancelled by user";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserJobBoard {
    pub user_id: UserId,
    #[serde(default)]
    active: Option<JobRecord>,
    #[serde(default)]
    pending: VecDeque<JobRecord>,
    #[serde(default)]
    history: VecDeque<JobRecord>,
    /// Completed jobs over the board's lifetime (not capped like history).
    #[serde(default)]
    total_generated: u64,
}

/// Aggregate counters reported by [`UserJobBoard::stats`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BoardStats {
    pub queue_length: usize,
    pub total_generated: u64,
    pub success_rate: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Slot {
    Active,
    Pending(usize),
    History(usize),
}

impl UserJobBoard {
    pub fn new(user_id: UserId) -> Self {
        Self {
            user_id,
            active: None,
            pending: VecDeque::new(),
            history: VecDeque::new(),
            total_generated: 0,
        }
    }

    fn locate(&self, job_id: JobId) -> Option<Slot> {
        if self.active.as_ref().is_some_and(|j| j.id == job_id) {
            return Some(Slot::Active);
        }
        if let Some(idx) = self.pending.iter().position(|j| j.id == job_id) {
            return Some(Slot::Pending(idx));
        }
        self.history
            .iter()
            .position(|j| j.id == job_id)
            .map(Slot::History)
    }

    fn slot(&self, slot: Slot) -> Option<&JobRecord> {
        match slot {
            Slot::Active => self.active.as_ref(),
            Slot::Pending(idx) => self.pending.get(idx),
            Slot::History(idx) => self.history.get(idx),
        }
    }

    fn slot_mut(&mut self, slot: Slot) -> Option<&mut JobRecord> {
        match slot {
            Slot::Active => self.active.as_mut(),
            Slot::Pending(idx) => self.pending.get_mut(idx),
            Slot::History(idx) => self.history.get_mut(idx),
        }
    }

    fn take(&mut self, slot: Slot) -> Option<JobRecord> {
        match slot {
            Slot::Active => self.active.take(),
            Slot::Pending(idx) => self.pending.remove(idx),
            Slot::History(idx) => self.history.remove(idx),
        }
    }

    /// Append a queued job. Returns its 1-based queue position.
    pub fn enqueue(&mut self, job: JobRecord) -> DomainResult<usize> {
        if job.user_id != self.user_id {
            return Err(DomainError::validation(format!(
                "job {} belongs to user {}, not {}",
                job.id, job.user_id, self.user_id
            )));
        }
        if self.locate(job.id).is_some() {
            return Err(DomainError::JobExists(job.id));
        }
        if job.status != JobStatus::Queued {
            return Err(DomainError::validation(format!(
                "new job {} must be queued, got {}",
                job.id, job.status
            )));
        }
        self.pending.push_back(job);
        Ok(self.awaiting().count())
    }

    pub fn get(&self, job_id: JobId) -> Option<&JobRecord> {
        self.locate(job_id).and_then(|slot| self.slot(slot))
    }

    /// 1-based position among jobs still waiting to start, if the job is one of them.
    pub fn position_of(&self, job_id: JobId) -> Option<usize> {
        self.awaiting().position(|j| j.id == job_id).map(|i| i + 1)
    }

    /// Pending jobs not yet picked up by a worker.
    ///
    /// A job already `processing` while another holds the active slot stays
    /// in `pending` for promotion but is no longer waiting.
    fn awaiting(&self) -> impl Iterator<Item = &JobRecord> {
        self.pending
            .iter()
            .filter(|j| j.status != JobStatus::Processing)
    }

    /// Merge a patch into a job and move it between slots as its status requires.
    ///
    /// Safe to repeat: a terminal patch re-applied to a finalized job changes
    /// nothing and never duplicates the history entry.
    pub fn update(
        &mut self,
        job_id: JobId,
        patch: &JobPatch,
        now: DateTime<Utc>,
    ) -> DomainResult<JobRecord> {
        let slot = self.locate(job_id).ok_or(DomainError::JobNotFound(job_id))?;
        let job = self.slot_mut(slot).ok_or(DomainError::JobNotFound(job_id))?;
        let was_finalized = job.is_finalized();
        job.apply(patch, now)?;
        let updated = job.clone();

        if updated.is_finalized() && !was_finalized {
            if let Some(job) = self.take(slot) {
                if job.status == JobStatus::Completed {
                    self.total_generated += 1;
                }
                self.push_history(job);
            }
            if slot == Slot::Active {
                self.promote_next();
            }
        } else if updated.status == JobStatus::Processing {
            if let Slot::Pending(idx) = slot {
                if self.active.is_none() {
                    self.active = self.pending.remove(idx);
                }
            }
        }

        Ok(updated)
    }

    fn push_history(&mut self, job: JobRecord) {
        self.history.push_front(job);
        self.history.truncate(HISTORY_LIMIT);
    }

    /// Fill a freed active slot with the oldest pending job already being worked on.
    fn promote_next(&mut self) {
        if self.active.is_some() {
            return;
        }
        if let Some(idx) = self
            .pending
            .iter()
            .position(|j| j.status != JobStatus::Queued)
        {
            self.active = self.pending.remove(idx);
        }
    }

    /// Cancel a job that has not started yet.
    ///
    /// Returns `false` once the job has entered `processing`, or if it is unknown.
    pub fn cancel(&mut self, job_id: JobId, now: DateTime<Utc>) -> bool {
        let queued = self
            .pending
            .iter()
            .any(|j| j.id == job_id && j.status == JobStatus::Queued);
        if !queued {
            return false;
        }
        self.update(job_id, &JobPatch::failed(CANCELLED_BY_USER), now)
            .is_ok()
    }

    pub fn active(&self) -> Option<&JobRecord> {
        self.active.as_ref()
    }

    /// Finalized jobs, most recent first.
    pub fn history(&self) -> impl Iterator<Item = &JobRecord> {
        self.history.iter()
    }

    /// Jobs waiting to start, in FIFO order.
    pub fn queue(&self) -> impl Iterator<Item = &JobRecord> {
        self.awaiting()
    }

    /// Jobs the dispatcher still owes work: the active job and everything pending.
    pub fn unfinished(&self) -> impl Iterator<Item = &JobRecord> {
        self.active
            .iter()
            .chain(self.pending.iter())
            .filter(|j| !j.is_finalized())
    }

    /// Every job id this board knows, finalized or not.
    pub fn job_ids(&self) -> impl Iterator<Item = JobId> + '_ {
        self.active
            .iter()
            .chain(self.pending.iter())
            .chain(self.history.iter())
            .map(|j| j.id)
    }

    pub fn stats(&self) -> BoardStats {
        let terminal = self.history.len();
        let completed = self
            .history
            .iter()
            .filter(|j| j.status == JobStatus::Completed)
            .count();
        let success_rate = if terminal == 0 {
            100.0
        } else {
            (completed as f64 * 100.0) / terminal as f64
        };

        BoardStats {
            queue_length: self.awaiting().count(),
            total_generated: self.total_generated,
            success_rate,
        }
    }
}
