//! Queue names, queue priority and visibility.
//!
//! Workers consume an ordered list of queues. Whenever a worker is free it
//! takes the earliest visible job from the first non-empty queue in that
//! list, so "critical" is always drained before "default", and "default"
//! before "low-priority". Lower queues can starve under sustained load on
//! higher ones.

use crate::{
    BacklotError, Result,
    job::JobId,
    store::JobStore,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

pub const DEFAULT_QUEUE: &str = "default";

const MAX_QUEUE_NAME_LEN: usize = 255;

/// Queue names are lowercase ASCII letters, digits, `_` and `-`.
pub fn validate_queue_name(name: &str) -> Result<()> {
    let invalid = |reason: &str| BacklotError::InvalidQueueName {
        name: name.to_string(),
        reason: reason.to_string(),
    };

    if name.is_empty() {
        return Err(invalid("queue name cannot be empty"));
    }
    if name.len() > MAX_QUEUE_NAME_LEN {
        return Err(invalid("queue name cannot exceed 255 characters"));
    }
    if !name
        .chars()
        .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_' || c == '-')
    {
        return Err(invalid(
            "use only lowercase letters, digits, underscores and dashes",
        ));
    }
    Ok(())
}

/// Validated queue names, highest priority first.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "Vec<String>", into = "Vec<String>")]
pub struct QueuePriority(Vec<String>);

impl QueuePriority {
    pub fn new<I, S>(names: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let names: Vec<String> = names.into_iter().map(Into::into).collect();
        if names.is_empty() {
            return Err(BacklotError::Config(
                "at least one queue must be configured".to_string(),
            ));
        }
        for (index, name) in names.iter().enumerate() {
            validate_queue_name(name)?;
            if names[..index].contains(name) {
                return Err(BacklotError::Config(format!(
                    "queue '{}' is listed more than once",
                    name
                )));
            }
        }
        Ok(Self(names))
    }

    pub fn single(name: impl Into<String>) -> Result<Self> {
        Self::new([name.into()])
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.0.iter().map(String::as_str)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.0.iter().any(|queue| queue == name)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn names(&self) -> &[String] {
        &self.0
    }
}

impl Default for QueuePriority {
    fn default() -> Self {
        Self(vec![DEFAULT_QUEUE.to_string()])
    }
}

impl TryFrom<Vec<String>> for QueuePriority {
    type Error = BacklotError;

    fn try_from(names: Vec<String>) -> Result<Self> {
        Self::new(names)
    }
}

impl From<QueuePriority> for Vec<String> {
    fn from(queues: QueuePriority) -> Self {
        queues.0
    }
}

impl fmt::Display for QueuePriority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0.join(" > "))
    }
}

/// Visibility and selection across queues.
#[derive(Clone)]
pub struct QueueManager {
    store: Arc<dyn JobStore>,
}

impl QueueManager {
    pub fn new(store: Arc<dyn JobStore>) -> Self {
        Self { store }
    }

    /// Makes a scheduled job visible on `queue_name` once `due_at` has
    /// passed. Returns false while the job is still in the future; the
    /// promoter picks it up later. A job stored on another queue is
    /// rejected with [`BacklotError::InvalidArgument`].
    pub async fn enqueue_visible(
        &self,
        job_id: JobId,
        queue_name: &str,
        due_at: DateTime<Utc>,
    ) -> Result<bool> {
        validate_queue_name(queue_name)?;
        let job = self.store.fetch(job_id).await?;
        if job.queue_name != queue_name {
            return Err(BacklotError::InvalidArgument {
                message: format!(
                    "job {} belongs to queue '{}', not '{}'",
                    job_id, job.queue_name, queue_name
                ),
            });
        }
        if due_at > self.store.now() {
            return Ok(false);
        }
        self.store.enqueue_visible(job_id).await
    }

    /// Earliest visible job from the highest-priority non-empty queue.
    pub async fn peek_next(&self, queues: &QueuePriority) -> Result<Option<(String, JobId)>> {
        for queue_name in queues.iter() {
            if let Some(job_id) = self.store.peek_next(queue_name).await? {
                return Ok(Some((queue_name.to_string(), job_id)));
            }
        }
        Ok(None)
    }

    /// Moves every due scheduled job into its queue.
    pub async fn promote_due(&self) -> Result<u64> {
        self.store.promote_due().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{Clock, MockClock};
    use crate::job::{JobState, Payload};
    use crate::store::MemoryStore;

    #[test]
    fn test_queue_name_validation() {
        assert!(validate_queue_name("critical").is_ok());
        assert!(validate_queue_name("low-priority").is_ok());
        assert!(validate_queue_name("batch_2").is_ok());
        assert!(validate_queue_name("").is_err());
        assert!(validate_queue_name("Default").is_err());
        assert!(validate_queue_name("has space").is_err());
        assert!(validate_queue_name(&"q".repeat(256)).is_err());
    }

    #[test]
    fn test_priority_rejects_duplicates_and_empty() {
        assert!(QueuePriority::new(Vec::<String>::new()).is_err());
        assert!(QueuePriority::new(["default", "default"]).is_err());

        let queues = QueuePriority::new(["critical", "default", "low-priority"]).unwrap();
        assert_eq!(queues.to_string(), "critical > default > low-priority");
        assert!(queues.contains("default"));
        assert!(!queues.contains("other"));
    }

    #[test]
    fn test_priority_deserialization_validates() {
        let ok: QueuePriority = serde_json::from_str(r#"["critical","default"]"#).unwrap();
        assert_eq!(ok.len(), 2);
        assert!(serde_json::from_str::<QueuePriority>(r#"["Bad Name"]"#).is_err());
    }

    #[tokio::test]
    async fn test_peek_next_follows_priority_order() {
        let store = Arc::new(MemoryStore::new());
        let manager = QueueManager::new(store.clone());
        let queues = QueuePriority::new(["critical", "default", "low-priority"]).unwrap();

        let low = store
            .create("low-priority", Payload::new("noop", Vec::new()), None)
            .await
            .unwrap();
        let default = store
            .create("default", Payload::new("noop", Vec::new()), None)
            .await
            .unwrap();

        assert_eq!(
            manager.peek_next(&queues).await.unwrap(),
            Some(("default".to_string(), default))
        );

        store.delete(default).await.unwrap();
        assert_eq!(
            manager.peek_next(&queues).await.unwrap(),
            Some(("low-priority".to_string(), low))
        );

        let only_critical = QueuePriority::single("critical").unwrap();
        assert_eq!(manager.peek_next(&only_critical).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_enqueue_visible_waits_for_due_time() {
        let clock = MockClock::new();
        let store = Arc::new(MemoryStore::with_clock(clock.clone()));
        let manager = QueueManager::new(store.clone());
        let due = clock.now() + chrono::Duration::seconds(10);
        let job_id = store
            .create("default", Payload::new("noop", Vec::new()), Some(due))
            .await
            .unwrap();

        assert!(!manager.enqueue_visible(job_id, "default", due).await.unwrap());
        clock.advance(chrono::Duration::seconds(10));
        assert!(manager.enqueue_visible(job_id, "default", due).await.unwrap());
        assert_eq!(store.peek_next("default").await.unwrap(), Some(job_id));
    }

    #[tokio::test]
    async fn test_enqueue_visible_rejects_other_queue() {
        let clock = MockClock::new();
        let store = Arc::new(MemoryStore::with_clock(clock.clone()));
        let manager = QueueManager::new(store.clone());
        let due = clock.now() + chrono::Duration::seconds(5);
        let job_id = store
            .create("default", Payload::new("noop", Vec::new()), Some(due))
            .await
            .unwrap();
        clock.advance(chrono::Duration::seconds(5));

        let err = manager
            .enqueue_visible(job_id, "critical", due)
            .await
            .unwrap_err();
        assert!(matches!(err, BacklotError::InvalidArgument { .. }));
        assert_eq!(store.fetch(job_id).await.unwrap().state, JobState::Scheduled);
        assert_eq!(store.peek_next("critical").await.unwrap(), None);
    }
}
