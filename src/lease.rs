//! Leases: exclusive, expiring ownership of a job by one worker.
//!
//! A worker leases a job before running it and releases it after reporting
//! the result. If the worker crashes or hangs, the lease runs out and the
//! reaper puts the job back on its queue with one more attempt counted, so
//! every job is delivered at least once. Job bodies must therefore tolerate
//! running more than once.

use crate::{
    Result,
    job::{Job, JobId, WorkerId},
    queue::{QueueManager, QueuePriority},
    store::JobStore,
};
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// How many times `lease_next` re-peeks after losing a race for the same
/// job before giving up until the next poll.
const MAX_LEASE_RACES: usize = 8;

#[derive(Clone)]
pub struct LeaseController {
    store: Arc<dyn JobStore>,
    queues: QueueManager,
}

impl LeaseController {
    pub fn new(store: Arc<dyn JobStore>) -> Self {
        Self {
            queues: QueueManager::new(Arc::clone(&store)),
            store,
        }
    }

    /// Claims an enqueued job for `worker`. False if it is not enqueued,
    /// which includes being leased by someone else.
    pub async fn try_lease(
        &self,
        job_id: JobId,
        worker: &WorkerId,
        duration: Duration,
    ) -> Result<bool> {
        self.store.try_lease(job_id, worker, duration).await
    }

    /// Extends `worker`'s lease; `NotOwner` once the lease is lost.
    pub async fn renew(
        &self,
        job_id: JobId,
        worker: &WorkerId,
        duration: Duration,
    ) -> Result<DateTime<Utc>> {
        self.store.renew_lease(job_id, worker, duration).await
    }

    pub async fn release(&self, job_id: JobId, worker: &WorkerId) -> Result<()> {
        self.store.release_lease(job_id, worker).await
    }

    /// Leases the next job across `queues` in priority order.
    pub async fn lease_next(
        &self,
        queues: &QueuePriority,
        worker: &WorkerId,
        duration: Duration,
    ) -> Result<Option<Job>> {
        for _ in 0..MAX_LEASE_RACES {
            let Some((queue_name, job_id)) = self.queues.peek_next(queues).await? else {
                return Ok(None);
            };
            if self.store.try_lease(job_id, worker, duration).await? {
                debug!("Worker {} leased job {} from {}", worker, job_id, queue_name);
                return self.store.fetch(job_id).await.map(Some);
            }
            debug!("Worker {} lost the race for job {}", worker, job_id);
        }
        Ok(None)
    }

    /// Returns every job with an expired lease to its queue.
    pub async fn reap_expired(&self) -> Result<Vec<JobId>> {
        let requeued = self.store.requeue_expired().await?;
        for job_id in &requeued {
            warn!("Lease on job {} expired; job re-enqueued", job_id);
        }
        Ok(requeued)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        BacklotError,
        clock::{Clock, MockClock},
        job::{JobState, Payload},
        store::MemoryStore,
    };

    fn setup() -> (Arc<MemoryStore>, LeaseController, MockClock) {
        let clock = MockClock::new();
        let store = Arc::new(MemoryStore::with_clock(clock.clone()));
        let leases = LeaseController::new(store.clone());
        (store, leases, clock)
    }

    #[tokio::test]
    async fn test_only_one_worker_can_hold_a_lease() {
        let (store, leases, _) = setup();
        let id = store
            .create("default", Payload::new("noop", Vec::new()), None)
            .await
            .unwrap();
        let a = WorkerId::new("a");
        let b = WorkerId::new("b");

        assert!(leases.try_lease(id, &a, Duration::from_secs(10)).await.unwrap());
        assert!(!leases.try_lease(id, &b, Duration::from_secs(10)).await.unwrap());

        let job = store.fetch(id).await.unwrap();
        assert_eq!(job.lease().unwrap().worker_id, a);
    }

    #[tokio::test]
    async fn test_renew_requires_ownership() {
        let (store, leases, clock) = setup();
        let id = store
            .create("default", Payload::new("noop", Vec::new()), None)
            .await
            .unwrap();
        let owner = WorkerId::new("owner");
        leases
            .try_lease(id, &owner, Duration::from_secs(10))
            .await
            .unwrap();

        clock.advance(chrono::Duration::seconds(5));
        let expires = leases
            .renew(id, &owner, Duration::from_secs(10))
            .await
            .unwrap();
        assert_eq!(expires, clock.now() + chrono::Duration::seconds(10));

        let err = leases
            .renew(id, &WorkerId::new("intruder"), Duration::from_secs(10))
            .await
            .unwrap_err();
        assert!(matches!(err, BacklotError::NotOwner { .. }));
    }

    #[tokio::test]
    async fn test_reaper_requeues_expired_lease_once() {
        let (store, leases, clock) = setup();
        let id = store
            .create("default", Payload::new("noop", Vec::new()), None)
            .await
            .unwrap();
        let worker = WorkerId::new("w");
        leases
            .try_lease(id, &worker, Duration::from_secs(1))
            .await
            .unwrap();

        assert!(leases.reap_expired().await.unwrap().is_empty());

        clock.advance(chrono::Duration::seconds(2));
        assert_eq!(leases.reap_expired().await.unwrap(), vec![id]);
        assert!(leases.reap_expired().await.unwrap().is_empty());

        let job = store.fetch(id).await.unwrap();
        assert_eq!(job.state, JobState::Enqueued);
        assert_eq!(job.attempts, 1);
        assert!(job.lease_owner.is_none());
    }

    #[tokio::test]
    async fn test_lease_next_skips_empty_queues() {
        let (store, leases, _) = setup();
        let queues = QueuePriority::new(["critical", "default"]).unwrap();
        let id = store
            .create("default", Payload::new("noop", vec![42]), None)
            .await
            .unwrap();

        let worker = WorkerId::new("w");
        let job = leases
            .lease_next(&queues, &worker, Duration::from_secs(30))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(job.id, id);
        assert!(job.is_leased_by(&worker));

        assert!(
            leases
                .lease_next(&queues, &worker, Duration::from_secs(30))
                .await
                .unwrap()
                .is_none()
        );
    }
}
