//! In-process job store.
//!
//! All state lives behind one `RwLock`, so every operation is a single
//! atomic step with respect to the others. Visible jobs are indexed per queue
//! in a `BTreeSet` keyed by (due time, sequence, id), which makes
//! `peek_next` a first-element lookup; scheduled jobs sit in a second set
//! ordered the same way so promotion only walks the due prefix.
//!
//! ```rust
//! # #[tokio::main]
//! # async fn main() -> backlot::Result<()> {
//! use backlot::{JobStore, MemoryStore, Payload};
//!
//! let store = MemoryStore::new();
//! let id = store.create("default", Payload::new("noop", vec![1, 2, 3]), None).await?;
//! assert_eq!(store.peek_next("default").await?, Some(id));
//! # Ok(())
//! # }
//! ```

use super::{
    FailureOutcome, JobFilter, JobStore, LEASE_EXPIRED_ERROR, explain_rejection, lease_expiry,
};
use crate::{
    BacklotError, Result,
    clock::{Clock, SystemClock},
    job::{Job, JobId, JobState, Payload, WorkerId},
    monitor::QueueStats,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Notify, RwLock};
use tracing::debug;

type IndexKey = (DateTime<Utc>, i64, JobId);

fn index_key(job: &Job) -> IndexKey {
    (job.due_at, job.sequence, job.id)
}

#[derive(Debug, Default)]
struct MemoryState {
    jobs: HashMap<JobId, Job>,
    /// Enqueued jobs per queue.
    visible: HashMap<String, BTreeSet<IndexKey>>,
    /// Scheduled jobs across all queues.
    scheduled: BTreeSet<IndexKey>,
    next_sequence: i64,
}

impl MemoryState {
    fn next_sequence(&mut self) -> i64 {
        self.next_sequence += 1;
        self.next_sequence
    }

    fn get(&self, job_id: JobId) -> Result<&Job> {
        self.jobs
            .get(&job_id)
            .ok_or(BacklotError::NotFound { id: job_id })
    }

    fn insert(&mut self, job: Job) {
        Self::index(&mut self.visible, &mut self.scheduled, &job);
        self.jobs.insert(job.id, job);
    }

    fn remove(&mut self, job_id: JobId) -> Option<Job> {
        let job = self.jobs.remove(&job_id)?;
        Self::unindex(&mut self.visible, &mut self.scheduled, &job);
        Some(job)
    }

    /// Applies `mutate` to a job, keeping the indexes in step with its new
    /// state and ordering key.
    fn update<F>(&mut self, job_id: JobId, mutate: F) -> Result<JobState>
    where
        F: FnOnce(&mut Job),
    {
        let job = self
            .jobs
            .get_mut(&job_id)
            .ok_or(BacklotError::NotFound { id: job_id })?;
        Self::unindex(&mut self.visible, &mut self.scheduled, job);
        mutate(job);
        Self::index(&mut self.visible, &mut self.scheduled, job);
        Ok(job.state)
    }

    fn index(
        visible: &mut HashMap<String, BTreeSet<IndexKey>>,
        scheduled: &mut BTreeSet<IndexKey>,
        job: &Job,
    ) {
        match job.state {
            JobState::Enqueued => {
                visible
                    .entry(job.queue_name.clone())
                    .or_default()
                    .insert(index_key(job));
            }
            JobState::Scheduled => {
                scheduled.insert(index_key(job));
            }
            _ => {}
        }
    }

    fn unindex(
        visible: &mut HashMap<String, BTreeSet<IndexKey>>,
        scheduled: &mut BTreeSet<IndexKey>,
        job: &Job,
    ) {
        match job.state {
            JobState::Enqueued => {
                if let Some(keys) = visible.get_mut(&job.queue_name) {
                    keys.remove(&index_key(job));
                    if keys.is_empty() {
                        visible.remove(&job.queue_name);
                    }
                }
            }
            JobState::Scheduled => {
                scheduled.remove(&index_key(job));
            }
            _ => {}
        }
    }
}

#[derive(Debug, Clone)]
pub struct MemoryStore {
    state: Arc<RwLock<MemoryState>>,
    clock: Arc<dyn Clock>,
    notify: Arc<Notify>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::with_clock(SystemClock)
    }

    /// Store reading time from `clock`, typically a
    /// [`MockClock`](crate::clock::MockClock) in tests.
    pub fn with_clock(clock: impl Clock + 'static) -> Self {
        Self {
            state: Arc::new(RwLock::new(MemoryState::default())),
            clock: Arc::new(clock),
            notify: Arc::new(Notify::new()),
        }
    }

    pub async fn len(&self) -> usize {
        self.state.read().await.jobs.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.state.read().await.jobs.is_empty()
    }

    fn wake_workers(&self) {
        self.notify.notify_waiters();
    }
}

#[async_trait]
impl JobStore for MemoryStore {
    fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    fn notifier(&self) -> Option<Arc<Notify>> {
        Some(Arc::clone(&self.notify))
    }

    async fn create(
        &self,
        queue_name: &str,
        payload: Payload,
        due_at: Option<DateTime<Utc>>,
    ) -> Result<JobId> {
        let now = self.now();
        let mut state = self.state.write().await;
        let sequence = state.next_sequence();
        let job = Job::new(queue_name, payload, now, due_at.unwrap_or(now), sequence);
        let (job_id, visible) = (job.id, job.state == JobState::Enqueued);
        state.insert(job);
        drop(state);

        if visible {
            self.wake_workers();
        }
        Ok(job_id)
    }

    async fn fetch(&self, job_id: JobId) -> Result<Job> {
        self.state.read().await.get(job_id).cloned()
    }

    async fn mark_succeeded(&self, job_id: JobId, worker: &WorkerId) -> Result<JobState> {
        let now = self.now();
        let mut state = self.state.write().await;
        let job = state.get(job_id)?;
        if !job.is_leased_by(worker) {
            return explain_rejection(job, worker, "complete", &[JobState::Succeeded]);
        }
        state.update(job_id, |job| {
            job.state = JobState::Succeeded;
            job.finished_at = Some(now);
        })
    }

    async fn record_failure(
        &self,
        job_id: JobId,
        worker: &WorkerId,
        error: &str,
        outcome: FailureOutcome,
    ) -> Result<JobState> {
        let now = self.now();
        let mut state = self.state.write().await;
        let job = state.get(job_id)?;
        if !job.is_leased_by(worker) {
            return explain_rejection(
                job,
                worker,
                "fail",
                &[JobState::Succeeded, JobState::Failed, JobState::Dead],
            );
        }
        let sequence = state.next_sequence();
        state.update(job_id, |job| {
            job.attempts = job.attempts.saturating_add(1);
            job.last_error = Some(error.to_string());
            job.state = outcome.state();
            match outcome {
                FailureOutcome::Retry { due_at } => {
                    job.due_at = due_at;
                    job.sequence = sequence;
                }
                FailureOutcome::Dead | FailureOutcome::Failed => {
                    job.finished_at = Some(now);
                }
            }
        })
    }

    async fn purge_expired(&self, retention: Duration) -> Result<u64> {
        let now = self.now();
        let Some(cutoff) = chrono::Duration::from_std(retention)
            .ok()
            .and_then(|retention| now.checked_sub_signed(retention))
        else {
            return Ok(0);
        };

        let mut state = self.state.write().await;
        let expired: Vec<JobId> = state
            .jobs
            .values()
            .filter(|job| {
                job.state.is_terminal() && job.finished_at.is_some_and(|at| at <= cutoff)
            })
            .map(|job| job.id)
            .collect();
        for job_id in &expired {
            state.remove(*job_id);
        }
        Ok(expired.len() as u64)
    }

    async fn enqueue_visible(&self, job_id: JobId) -> Result<bool> {
        let now = self.now();
        let mut state = self.state.write().await;
        let job = state.get(job_id)?;
        if job.state != JobState::Scheduled || !job.is_due(now) {
            return Ok(false);
        }
        state.update(job_id, |job| job.state = JobState::Enqueued)?;
        drop(state);

        self.wake_workers();
        Ok(true)
    }

    async fn promote_due(&self) -> Result<u64> {
        let now = self.now();
        let mut state = self.state.write().await;
        let due: Vec<JobId> = state
            .scheduled
            .iter()
            .take_while(|(due_at, _, _)| *due_at <= now)
            .map(|(_, _, job_id)| *job_id)
            .collect();
        for job_id in &due {
            state.update(*job_id, |job| job.state = JobState::Enqueued)?;
        }
        drop(state);

        if !due.is_empty() {
            debug!("Promoted {} scheduled jobs", due.len());
            self.wake_workers();
        }
        Ok(due.len() as u64)
    }

    async fn peek_next(&self, queue_name: &str) -> Result<Option<JobId>> {
        let state = self.state.read().await;
        Ok(state
            .visible
            .get(queue_name)
            .and_then(|keys| keys.first())
            .map(|(_, _, job_id)| *job_id))
    }

    async fn try_lease(
        &self,
        job_id: JobId,
        worker: &WorkerId,
        duration: Duration,
    ) -> Result<bool> {
        let expires_at = lease_expiry(self.now(), duration)?;
        let mut state = self.state.write().await;
        if state.get(job_id)?.state != JobState::Enqueued {
            return Ok(false);
        }
        state.update(job_id, |job| {
            job.state = JobState::Leased;
            job.lease_owner = Some(worker.clone());
            job.lease_expires_at = Some(expires_at);
        })?;
        Ok(true)
    }

    async fn renew_lease(
        &self,
        job_id: JobId,
        worker: &WorkerId,
        duration: Duration,
    ) -> Result<DateTime<Utc>> {
        let expires_at = lease_expiry(self.now(), duration)?;
        let mut state = self.state.write().await;
        if !state.get(job_id)?.is_leased_by(worker) {
            return Err(BacklotError::NotOwner {
                id: job_id,
                worker: worker.to_string(),
            });
        }
        state.update(job_id, |job| job.lease_expires_at = Some(expires_at))?;
        Ok(expires_at)
    }

    async fn release_lease(&self, job_id: JobId, worker: &WorkerId) -> Result<()> {
        let mut state = self.state.write().await;
        let job = state.get(job_id)?;
        match &job.lease_owner {
            None => return Ok(()),
            Some(owner) if owner != worker => {
                return Err(BacklotError::NotOwner {
                    id: job_id,
                    worker: worker.to_string(),
                });
            }
            Some(_) => {}
        }
        let next = state.update(job_id, |job| {
            if job.state == JobState::Leased {
                job.state = JobState::Enqueued;
            }
            job.lease_owner = None;
            job.lease_expires_at = None;
        })?;
        drop(state);

        if next == JobState::Enqueued {
            self.wake_workers();
        }
        Ok(())
    }

    async fn requeue_expired(&self) -> Result<Vec<JobId>> {
        let now = self.now();
        let mut state = self.state.write().await;
        let expired: Vec<JobId> = state
            .jobs
            .values()
            .filter(|job| job.lease_expired(now))
            .map(|job| job.id)
            .collect();
        for job_id in &expired {
            state.update(*job_id, |job| {
                job.state = JobState::Enqueued;
                job.attempts = job.attempts.saturating_add(1);
                job.last_error = Some(LEASE_EXPIRED_ERROR.to_string());
                job.lease_owner = None;
                job.lease_expires_at = None;
            })?;
        }
        drop(state);

        if !expired.is_empty() {
            self.wake_workers();
        }
        Ok(expired)
    }

    async fn list_jobs(&self, filter: &JobFilter) -> Result<Vec<Job>> {
        let state = self.state.read().await;
        let mut jobs: Vec<&Job> = state.jobs.values().filter(|job| filter.matches(job)).collect();
        jobs.sort_by_key(|job| (job.created_at, job.sequence));

        let offset = filter.offset.unwrap_or(0) as usize;
        let limit = filter.limit.map_or(usize::MAX, |limit| limit as usize);
        Ok(jobs.into_iter().skip(offset).take(limit).cloned().collect())
    }

    async fn queue_stats(&self) -> Result<Vec<QueueStats>> {
        let state = self.state.read().await;
        let mut by_queue: BTreeMap<&str, QueueStats> = BTreeMap::new();
        for job in state.jobs.values() {
            by_queue
                .entry(job.queue_name.as_str())
                .or_insert_with(|| QueueStats::new(job.queue_name.clone()))
                .add(job.state, 1);
        }
        Ok(by_queue.into_values().collect())
    }

    async fn requeue(&self, job_id: JobId) -> Result<()> {
        let now = self.now();
        let mut state = self.state.write().await;
        match state.get(job_id)?.state {
            JobState::Enqueued => return Ok(()),
            JobState::Leased => {
                return Err(BacklotError::InvalidTransition {
                    id: job_id,
                    from: JobState::Leased,
                    action: "requeue",
                });
            }
            _ => {}
        }
        let sequence = state.next_sequence();
        state.update(job_id, |job| {
            job.state = JobState::Enqueued;
            job.due_at = now;
            job.sequence = sequence;
            job.attempts = 0;
            job.finished_at = None;
            job.lease_owner = None;
            job.lease_expires_at = None;
        })?;
        drop(state);

        self.wake_workers();
        Ok(())
    }

    async fn delete(&self, job_id: JobId) -> Result<()> {
        let mut state = self.state.write().await;
        let current = state.get(job_id)?.state;
        if current == JobState::Leased {
            return Err(BacklotError::InvalidTransition {
                id: job_id,
                from: current,
                action: "delete",
            });
        }
        state.remove(job_id);
        Ok(())
    }
}
