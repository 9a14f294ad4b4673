//! Producer side: putting jobs on queues.

use crate::{
    BacklotError, Result,
    handler::BackgroundJob,
    job::{JobId, Payload},
    queue::{QueuePriority, validate_queue_name},
    store::JobStore,
};
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Enqueues jobs into a [`JobStore`].
///
/// ```rust,no_run
/// use backlot::{Client, MemoryStore, Payload};
/// use std::sync::Arc;
/// use std::time::Duration;
///
/// # async fn example() -> backlot::Result<()> {
/// let client = Client::new(Arc::new(MemoryStore::new()));
/// client.enqueue("critical", Payload::new("send_email", b"{}".to_vec())).await?;
/// client
///     .enqueue_in("default", Payload::new("cleanup", Vec::new()), Duration::from_secs(60))
///     .await?;
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct Client {
    store: Arc<dyn JobStore>,
    known_queues: Option<QueuePriority>,
}

impl Client {
    pub fn new(store: Arc<dyn JobStore>) -> Self {
        Self {
            store,
            known_queues: None,
        }
    }

    /// Rejects enqueues onto any queue outside `queues` with
    /// [`BacklotError::UnknownQueue`].
    pub fn with_known_queues(mut self, queues: QueuePriority) -> Self {
        self.known_queues = Some(queues);
        self
    }

    pub fn store(&self) -> &Arc<dyn JobStore> {
        &self.store
    }

    /// Enqueues a job that is visible immediately.
    pub async fn enqueue(&self, queue_name: &str, payload: Payload) -> Result<JobId> {
        self.create(queue_name, payload, None).await
    }

    /// Enqueues a job that becomes visible after `delay`.
    pub async fn enqueue_in(
        &self,
        queue_name: &str,
        payload: Payload,
        delay: Duration,
    ) -> Result<JobId> {
        let delay = chrono::Duration::from_std(delay).map_err(|_| BacklotError::InvalidArgument {
            message: format!("delay {:?} is out of range", delay),
        })?;
        let due_at = self
            .store
            .now()
            .checked_add_signed(delay)
            .ok_or_else(|| BacklotError::InvalidArgument {
                message: format!("delay {} is out of range", delay),
            })?;
        self.create(queue_name, payload, Some(due_at)).await
    }

    /// Enqueues a job that becomes visible at `due_at`. Times in the past
    /// are visible immediately.
    pub async fn enqueue_at(
        &self,
        queue_name: &str,
        payload: Payload,
        due_at: DateTime<Utc>,
    ) -> Result<JobId> {
        self.create(queue_name, payload, Some(due_at)).await
    }

    pub async fn enqueue_job<J: BackgroundJob>(&self, queue_name: &str, job: &J) -> Result<JobId> {
        self.enqueue(queue_name, job.to_payload()?).await
    }

    pub async fn schedule_job<J: BackgroundJob>(
        &self,
        queue_name: &str,
        job: &J,
        delay: Duration,
    ) -> Result<JobId> {
        self.enqueue_in(queue_name, job.to_payload()?, delay).await
    }

    async fn create(
        &self,
        queue_name: &str,
        payload: Payload,
        due_at: Option<DateTime<Utc>>,
    ) -> Result<JobId> {
        validate_queue_name(queue_name)?;
        if let Some(known) = &self.known_queues {
            if !known.contains(queue_name) {
                return Err(BacklotError::UnknownQueue {
                    name: queue_name.to_string(),
                });
            }
        }

        let job_type = payload.job_type.clone();
        let job_id = self.store.create(queue_name, payload, due_at).await?;
        debug!("Enqueued {} job {} on {}", job_type, job_id, queue_name);
        Ok(job_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        clock::{Clock, MockClock},
        handler::{JobContext, JobError},
        job::JobState,
        store::MemoryStore,
    };
    use serde::{Deserialize, Serialize};

    #[derive(Serialize, Deserialize)]
    struct Report {
        account: u32,
    }

    #[async_trait::async_trait]
    impl BackgroundJob for Report {
        const JOB_TYPE: &'static str = "report";

        async fn perform(self, _ctx: &JobContext) -> std::result::Result<(), JobError> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_enqueue_variants() {
        let clock = MockClock::new();
        let store = Arc::new(MemoryStore::with_clock(clock.clone()));
        let client = Client::new(store.clone());

        let now_id = client
            .enqueue("default", Payload::new("noop", Vec::new()))
            .await
            .unwrap();
        let later_id = client
            .enqueue_in("default", Payload::new("noop", Vec::new()), Duration::from_secs(30))
            .await
            .unwrap();
        let past_id = client
            .enqueue_at(
                "default",
                Payload::new("noop", Vec::new()),
                clock.now() - chrono::Duration::seconds(5),
            )
            .await
            .unwrap();

        assert_eq!(store.fetch(now_id).await.unwrap().state, JobState::Enqueued);
        assert_eq!(store.fetch(past_id).await.unwrap().state, JobState::Enqueued);

        let later = store.fetch(later_id).await.unwrap();
        assert_eq!(later.state, JobState::Scheduled);
        assert_eq!(later.due_at, clock.now() + chrono::Duration::seconds(30));
    }

    #[tokio::test]
    async fn test_typed_jobs_carry_their_type() {
        let store = Arc::new(MemoryStore::new());
        let client = Client::new(store.clone());

        let id = client
            .enqueue_job("critical", &Report { account: 7 })
            .await
            .unwrap();
        let job = store.fetch(id).await.unwrap();
        assert_eq!(job.payload.job_type, "report");
        assert_eq!(job.queue_name, "critical");

        let scheduled = client
            .schedule_job("critical", &Report { account: 8 }, Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(
            store.fetch(scheduled).await.unwrap().state,
            JobState::Scheduled
        );
    }

    #[tokio::test]
    async fn test_queue_restrictions() {
        let client = Client::new(Arc::new(MemoryStore::new()))
            .with_known_queues(QueuePriority::new(["critical", "default"]).unwrap());

        assert!(
            client
                .enqueue("default", Payload::new("noop", Vec::new()))
                .await
                .is_ok()
        );
        assert!(matches!(
            client
                .enqueue("low-priority", Payload::new("noop", Vec::new()))
                .await,
            Err(BacklotError::UnknownQueue { .. })
        ));
        assert!(matches!(
            client
                .enqueue("Not Valid", Payload::new("noop", Vec::new()))
                .await,
            Err(BacklotError::InvalidQueueName { .. })
        ));
    }
}
