use crate::job::{JobId, JobState};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum BacklotError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Job not found: {id}")]
    NotFound { id: JobId },

    #[error("Invalid transition for job {id}: cannot {action} a job in state {from}")]
    InvalidTransition {
        id: JobId,
        from: JobState,
        action: &'static str,
    },

    #[error("Worker {worker} does not own the lease on job {id}")]
    NotOwner { id: JobId, worker: String },

    #[error("Job execution failed: {0}")]
    ExecutionFault(String),

    #[error("Store unavailable: {message}")]
    StoreUnavailable { message: String },

    #[error("Unknown queue: {name}")]
    UnknownQueue { name: String },

    #[error("Invalid queue name '{name}': {reason}")]
    InvalidQueueName { name: String, reason: String },

    #[error("Invalid job state: {value}")]
    InvalidJobState { value: String },

    #[error("Job type already registered: {job_type}")]
    DuplicateJobType { job_type: String },

    #[error("Invalid argument: {message}")]
    InvalidArgument { message: String },

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl BacklotError {
    /// Whether the failure is an infrastructure hiccup worth retrying the
    /// store operation for, rather than a problem with the request itself.
    pub fn is_transient(&self) -> bool {
        match self {
            BacklotError::StoreUnavailable { .. } | BacklotError::Io(_) => true,
            BacklotError::Database(err) => matches!(
                err,
                sqlx::Error::Io(_)
                    | sqlx::Error::Tls(_)
                    | sqlx::Error::PoolTimedOut
                    | sqlx::Error::PoolClosed
                    | sqlx::Error::WorkerCrashed
            ),
            _ => false,
        }
    }

    /// Errors that mean another party already moved the job on, so the
    /// caller's report is stale and can be dropped.
    pub fn is_stale_report(&self) -> bool {
        matches!(
            self,
            BacklotError::NotOwner { .. } | BacklotError::InvalidTransition { .. }
        )
    }
}

impl From<toml::de::Error> for BacklotError {
    fn from(err: toml::de::Error) -> Self {
        BacklotError::Config(format!("TOML deserialization error: {}", err))
    }
}

impl From<toml::ser::Error> for BacklotError {
    fn from(err: toml::ser::Error) -> Self {
        BacklotError::Config(format!("TOML serialization error: {}", err))
    }
}
