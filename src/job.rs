use crate::{BacklotError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

pub type JobId = Uuid;

/// Where a job sits in its lifecycle. A job is in exactly one state at a time.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    /// Waiting for its due time.
    Scheduled,
    /// Visible and eligible for leasing.
    Enqueued,
    /// Exclusively owned by a worker until the lease expires.
    Leased,
    Succeeded,
    /// Permanently failed by the job body; never retried automatically.
    Failed,
    /// Retries exhausted.
    Dead,
}

impl JobState {
    pub const ALL: [JobState; 6] = [
        JobState::Scheduled,
        JobState::Enqueued,
        JobState::Leased,
        JobState::Succeeded,
        JobState::Failed,
        JobState::Dead,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Scheduled => "scheduled",
            JobState::Enqueued => "enqueued",
            JobState::Leased => "leased",
            JobState::Succeeded => "succeeded",
            JobState::Failed => "failed",
            JobState::Dead => "dead",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobState::Succeeded | JobState::Failed | JobState::Dead
        )
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobState {
    type Err = BacklotError;

    fn from_str(s: &str) -> Result<Self> {
        JobState::ALL
            .into_iter()
            .find(|state| state.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| BacklotError::InvalidJobState {
                value: s.to_string(),
            })
    }
}

/// Opaque job body: a type tag used for handler dispatch plus raw bytes.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Payload {
    pub job_type: String,
    pub data: Vec<u8>,
}

impl Payload {
    pub fn new(job_type: impl Into<String>, data: impl Into<Vec<u8>>) -> Self {
        Self {
            job_type: job_type.into(),
            data: data.into(),
        }
    }

    /// Encodes `value` as JSON under the given type tag.
    pub fn json<T: Serialize>(job_type: impl Into<String>, value: &T) -> Result<Self> {
        Ok(Self::new(job_type, serde_json::to_vec(value)?))
    }

    pub fn decode_json<T: DeserializeOwned>(&self) -> Result<T> {
        Ok(serde_json::from_slice(&self.data)?)
    }
}

/// Identity of a worker task for the lifetime of a pool run.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WorkerId(String);

impl WorkerId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Builds `<server>:<pid>:<nonce>:<index>`, unique across processes.
    pub fn generate(server_name: &str, index: usize) -> Self {
        let nonce = Uuid::new_v4().simple().to_string();
        Self(format!(
            "{}:{}:{}:{}",
            server_name,
            std::process::id(),
            &nonce[..8],
            index
        ))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for WorkerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A worker's claim on a leased job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Lease {
    pub job_id: JobId,
    pub worker_id: WorkerId,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Job {
    pub id: JobId,
    pub queue_name: String,
    pub payload: Payload,
    pub state: JobState,
    pub created_at: DateTime<Utc>,
    pub due_at: DateTime<Utc>,
    /// Insertion order; breaks ties between jobs with equal due time.
    pub sequence: i64,
    pub attempts: u32,
    pub last_error: Option<String>,
    pub lease_owner: Option<WorkerId>,
    pub lease_expires_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl Job {
    /// Fresh record for a job created at `now`.
    pub fn new(
        queue_name: impl Into<String>,
        payload: Payload,
        now: DateTime<Utc>,
        due_at: DateTime<Utc>,
        sequence: i64,
    ) -> Self {
        let state = if due_at > now {
            JobState::Scheduled
        } else {
            JobState::Enqueued
        };
        Self {
            id: Uuid::new_v4(),
            queue_name: queue_name.into(),
            payload,
            state,
            created_at: now,
            due_at,
            sequence,
            attempts: 0,
            last_error: None,
            lease_owner: None,
            lease_expires_at: None,
            finished_at: None,
        }
    }

    pub fn lease(&self) -> Option<Lease> {
        if self.state != JobState::Leased {
            return None;
        }
        match (&self.lease_owner, self.lease_expires_at) {
            (Some(owner), Some(expires_at)) => Some(Lease {
                job_id: self.id,
                worker_id: owner.clone(),
                expires_at,
            }),
            _ => None,
        }
    }

    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.due_at <= now
    }

    pub fn is_leased_by(&self, worker: &WorkerId) -> bool {
        self.state == JobState::Leased && self.lease_owner.as_ref() == Some(worker)
    }

    pub fn lease_expired(&self, now: DateTime<Utc>) -> bool {
        self.state == JobState::Leased && self.lease_expires_at.is_some_and(|at| at < now)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn test_state_round_trip_through_strings() {
        for state in JobState::ALL {
            assert_eq!(state.as_str().parse::<JobState>().unwrap(), state);
        }
        assert_eq!("DEAD".parse::<JobState>().unwrap(), JobState::Dead);
        assert!(matches!(
            "running".parse::<JobState>(),
            Err(BacklotError::InvalidJobState { .. })
        ));
    }

    #[test]
    fn test_terminal_states() {
        assert!(JobState::Succeeded.is_terminal());
        assert!(JobState::Failed.is_terminal());
        assert!(JobState::Dead.is_terminal());
        assert!(!JobState::Leased.is_terminal());
        assert!(!JobState::Scheduled.is_terminal());
    }

    #[test]
    fn test_new_job_state_depends_on_due_time() {
        let now = Utc::now();
        let payload = Payload::new("noop", Vec::new());

        let immediate = Job::new("default", payload.clone(), now, now, 1);
        assert_eq!(immediate.state, JobState::Enqueued);
        assert!(immediate.is_due(now));

        let delayed = Job::new("default", payload, now, now + Duration::seconds(10), 2);
        assert_eq!(delayed.state, JobState::Scheduled);
        assert!(!delayed.is_due(now));
    }

    #[test]
    fn test_payload_json_helpers() {
        #[derive(Serialize, Deserialize, PartialEq, Debug)]
        struct Email {
            to: String,
        }

        let payload = Payload::json(
            "send_email",
            &Email {
                to: "ops@example.com".to_string(),
            },
        )
        .unwrap();
        assert_eq!(payload.job_type, "send_email");
        let decoded: Email = payload.decode_json().unwrap();
        assert_eq!(decoded.to, "ops@example.com");
    }

    #[test]
    fn test_lease_view() {
        let now = Utc::now();
        let mut job = Job::new("default", Payload::new("noop", vec![1]), now, now, 1);
        assert!(job.lease().is_none());

        let worker = WorkerId::new("w-1");
        job.state = JobState::Leased;
        job.lease_owner = Some(worker.clone());
        job.lease_expires_at = Some(now + Duration::seconds(30));

        let lease = job.lease().unwrap();
        assert_eq!(lease.worker_id, worker);
        assert!(job.is_leased_by(&worker));
        assert!(!job.lease_expired(now));
        assert!(job.lease_expired(now + Duration::seconds(31)));
    }

    #[test]
    fn test_generated_worker_ids_are_unique() {
        let a = WorkerId::generate("server", 0);
        let b = WorkerId::generate("server", 0);
        assert_ne!(a, b);
        assert!(a.as_str().starts_with("server:"));
        assert!(a.as_str().ends_with(":0"));
    }
}
