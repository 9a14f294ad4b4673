//! Durable job state.
//!
//! The [`JobStore`] trait is the single source of truth for job state and the
//! only synchronization point between workers. Every mutation is a single
//! conditional transition ("move to X only if the job is currently Y and owned
//! by Z"), which is what keeps two workers from leasing or completing the same
//! job.
//!
//! Two backends are provided: [`MemoryStore`] for single-process use and
//! tests, and `PostgresStore` behind the `postgres` feature.

use crate::{
    BacklotError, Result,
    handler::JobError,
    job::{Job, JobId, JobState, Payload, WorkerId},
    monitor::QueueStats,
    retry::{RetryDecision, RetryPolicy},
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;

pub mod memory;

#[cfg(feature = "postgres")]
pub mod postgres;

pub use memory::MemoryStore;

#[cfg(feature = "postgres")]
pub use postgres::PostgresStore;

/// Last-error text recorded when the reaper recovers an expired lease.
pub const LEASE_EXPIRED_ERROR: &str = "lease expired before the job reported a result";

/// Where a failed job goes next. Produced from a [`RetryDecision`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureOutcome {
    /// Back to `Scheduled`, due at the given time.
    Retry { due_at: DateTime<Utc> },
    Dead,
    Failed,
}

impl FailureOutcome {
    pub fn from_decision(decision: RetryDecision, now: DateTime<Utc>) -> Self {
        match decision {
            RetryDecision::Retry(delay) => FailureOutcome::Retry {
                due_at: chrono::Duration::from_std(delay)
                    .ok()
                    .and_then(|delay| now.checked_add_signed(delay))
                    .unwrap_or(DateTime::<Utc>::MAX_UTC),
            },
            RetryDecision::Dead => FailureOutcome::Dead,
            RetryDecision::Fail => FailureOutcome::Failed,
        }
    }

    pub fn state(&self) -> JobState {
        match self {
            FailureOutcome::Retry { .. } => JobState::Scheduled,
            FailureOutcome::Dead => JobState::Dead,
            FailureOutcome::Failed => JobState::Failed,
        }
    }
}

/// Selection for job listings. Empty fields match everything.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobFilter {
    pub queue_name: Option<String>,
    pub state: Option<JobState>,
    pub limit: Option<u32>,
    pub offset: Option<u32>,
}

impl JobFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn queue(mut self, queue_name: impl Into<String>) -> Self {
        self.queue_name = Some(queue_name.into());
        self
    }

    pub fn state(mut self, state: JobState) -> Self {
        self.state = Some(state);
        self
    }

    pub fn limit(mut self, limit: u32) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn offset(mut self, offset: u32) -> Self {
        self.offset = Some(offset);
        self
    }

    pub fn matches(&self, job: &Job) -> bool {
        self.queue_name
            .as_deref()
            .is_none_or(|queue| queue == job.queue_name)
            && self.state.is_none_or(|state| state == job.state)
    }
}

#[async_trait]
pub trait JobStore: Send + Sync {
    /// The store's notion of the current time.
    fn now(&self) -> DateTime<Utc>;

    /// Wakes idle workers when new work becomes visible, for stores that can
    /// tell.
    fn notifier(&self) -> Option<Arc<Notify>> {
        None
    }

    // Job records

    /// Persists a new job. It starts `Scheduled` when `due_at` is in the
    /// future and `Enqueued` otherwise; `None` means now.
    async fn create(
        &self,
        queue_name: &str,
        payload: Payload,
        due_at: Option<DateTime<Utc>>,
    ) -> Result<JobId>;

    async fn fetch(&self, job_id: JobId) -> Result<Job>;

    /// `Leased` by `worker` → `Succeeded`. A job that already succeeded is
    /// left alone.
    async fn mark_succeeded(&self, job_id: JobId, worker: &WorkerId) -> Result<JobState>;

    /// `Leased` by `worker` → the outcome's state, incrementing the attempt
    /// count and recording `error`. Jobs already in a terminal state are
    /// left alone.
    async fn record_failure(
        &self,
        job_id: JobId,
        worker: &WorkerId,
        error: &str,
        outcome: FailureOutcome,
    ) -> Result<JobState>;

    /// Records a failed execution, letting `policy` pick the next state.
    async fn mark_failed(
        &self,
        job_id: JobId,
        worker: &WorkerId,
        error: &JobError,
        policy: &RetryPolicy,
    ) -> Result<JobState> {
        let job = self.fetch(job_id).await?;
        if job.state.is_terminal() {
            return Ok(job.state);
        }
        let outcome = FailureOutcome::from_decision(policy.decide(&job, error), self.now());
        self.record_failure(job_id, worker, error.message(), outcome)
            .await
    }

    /// Deletes terminal jobs that finished more than `retention` ago.
    async fn purge_expired(&self, retention: Duration) -> Result<u64>;

    // Visibility

    /// `Scheduled` → `Enqueued` for one job whose due time has arrived.
    /// Returns false while the job is not yet due or not scheduled.
    async fn enqueue_visible(&self, job_id: JobId) -> Result<bool>;

    /// `Scheduled` → `Enqueued` for every job whose due time has arrived.
    async fn promote_due(&self) -> Result<u64>;

    /// Earliest visible job in the queue by (due time, sequence).
    async fn peek_next(&self, queue_name: &str) -> Result<Option<JobId>>;

    // Leases

    /// `Enqueued` → `Leased` by `worker` until now + `duration`. False when
    /// the job is not currently enqueued.
    async fn try_lease(&self, job_id: JobId, worker: &WorkerId, duration: Duration)
    -> Result<bool>;

    /// Pushes the expiry of `worker`'s lease to now + `duration`.
    async fn renew_lease(
        &self,
        job_id: JobId,
        worker: &WorkerId,
        duration: Duration,
    ) -> Result<DateTime<Utc>>;

    /// Clears `worker`'s lease fields. A job still `Leased` goes back to
    /// `Enqueued`.
    async fn release_lease(&self, job_id: JobId, worker: &WorkerId) -> Result<()>;

    /// Every `Leased` job whose lease expired goes back to `Enqueued` with
    /// its attempt count incremented.
    async fn requeue_expired(&self) -> Result<Vec<JobId>>;

    // Inspection and operator actions

    async fn list_jobs(&self, filter: &JobFilter) -> Result<Vec<Job>>;

    async fn queue_stats(&self) -> Result<Vec<QueueStats>>;

    /// Manual retry: any state except `Leased` → `Enqueued`, due now, with
    /// the attempt count reset.
    async fn requeue(&self, job_id: JobId) -> Result<()>;

    /// Removes a job that is not currently leased.
    async fn delete(&self, job_id: JobId) -> Result<()>;
}

/// Explains why a conditional transition on `job` did not apply.
///
/// Callers use this after their guarded update matched nothing, with the
/// freshly read record. `settled` lists states in which the request is a
/// harmless duplicate and the current state is returned instead of an
/// error.
pub(crate) fn explain_rejection(
    job: &Job,
    worker: &WorkerId,
    action: &'static str,
    settled: &[JobState],
) -> Result<JobState> {
    if settled.contains(&job.state) {
        return Ok(job.state);
    }
    match (&job.state, &job.lease_owner) {
        (JobState::Leased, Some(owner)) if owner != worker => Err(BacklotError::NotOwner {
            id: job.id,
            worker: worker.to_string(),
        }),
        (state, _) => Err(BacklotError::InvalidTransition {
            id: job.id,
            from: *state,
            action,
        }),
    }
}

pub(crate) fn lease_expiry(now: DateTime<Utc>, duration: Duration) -> Result<DateTime<Utc>> {
    if duration.is_zero() {
        return Err(BacklotError::InvalidArgument {
            message: "lease duration must be greater than zero".to_string(),
        });
    }
    chrono::Duration::from_std(duration)
        .ok()
        .and_then(|delta| now.checked_add_signed(delta))
        .ok_or_else(|| BacklotError::InvalidArgument {
            message: format!("lease duration {:?} is out of range", duration),
        })
}
