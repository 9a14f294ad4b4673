//! Job handlers and type-tag dispatch.
//!
//! A job's payload carries a type tag. Workers look the tag up in a
//! [`HandlerRegistry`] and run the registered handler with a [`JobContext`].
//! Handlers are either closures registered with
//! [`HandlerRegistry::register_fn`] or types implementing [`BackgroundJob`].
//!
//! ```rust
//! use backlot::handler::{BackgroundJob, HandlerRegistry, JobContext, JobError};
//! use async_trait::async_trait;
//! use serde::{Deserialize, Serialize};
//!
//! #[derive(Serialize, Deserialize)]
//! struct SendEmail {
//!     to: String,
//! }
//!
//! #[async_trait]
//! impl BackgroundJob for SendEmail {
//!     const JOB_TYPE: &'static str = "send_email";
//!
//!     async fn perform(self, ctx: &JobContext) -> Result<(), JobError> {
//!         tracing::info!("sending email to {} (attempt {})", self.to, ctx.attempt);
//!         Ok(())
//!     }
//! }
//!
//! let mut registry = HandlerRegistry::new();
//! registry.register::<SendEmail>().unwrap();
//! assert!(registry.contains("send_email"));
//! ```

use crate::job::{Job, JobId, Payload, WorkerId};
use crate::{BacklotError, Result};
use async_trait::async_trait;
use serde::{Serialize, de::DeserializeOwned};
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

/// Error returned by a job body.
///
/// Retryable errors go through the retry policy. Permanent errors move the
/// job straight to `Failed`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobError {
    message: String,
    retryable: bool,
}

impl JobError {
    pub fn retryable(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            retryable: true,
        }
    }

    pub fn permanent(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            retryable: false,
        }
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn is_retryable(&self) -> bool {
        self.retryable
    }
}

impl fmt::Display for JobError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

impl std::error::Error for JobError {}

impl From<String> for JobError {
    fn from(message: String) -> Self {
        JobError::retryable(message)
    }
}

impl From<&str> for JobError {
    fn from(message: &str) -> Self {
        JobError::retryable(message)
    }
}

impl From<serde_json::Error> for JobError {
    fn from(err: serde_json::Error) -> Self {
        JobError::permanent(format!("invalid payload: {}", err))
    }
}

impl From<BacklotError> for JobError {
    fn from(err: BacklotError) -> Self {
        match err {
            BacklotError::Serialization(err) => err.into(),
            other => JobError::retryable(other.to_string()),
        }
    }
}

/// Everything a handler learns about the job it is running.
#[derive(Debug, Clone)]
pub struct JobContext {
    pub job_id: JobId,
    pub queue_name: String,
    /// 1-based number of this execution.
    pub attempt: u32,
    pub worker_id: WorkerId,
    pub payload: Payload,
}

impl JobContext {
    pub fn for_job(job: &Job, worker_id: WorkerId) -> Self {
        Self {
            job_id: job.id,
            queue_name: job.queue_name.clone(),
            attempt: job.attempts.saturating_add(1),
            worker_id,
            payload: job.payload.clone(),
        }
    }

    pub fn job_type(&self) -> &str {
        &self.payload.job_type
    }

    /// Decodes the payload as JSON; decode failures are permanent.
    pub fn json<T: DeserializeOwned>(&self) -> std::result::Result<T, JobError> {
        Ok(serde_json::from_slice(&self.payload.data)?)
    }
}

pub type JobFuture = Pin<Box<dyn Future<Output = std::result::Result<(), JobError>> + Send>>;

pub type JobHandler = Arc<dyn Fn(JobContext) -> JobFuture + Send + Sync>;

/// A job type with a JSON-encoded body.
#[async_trait]
pub trait BackgroundJob: Serialize + DeserializeOwned + Send + 'static {
    const JOB_TYPE: &'static str;

    async fn perform(self, ctx: &JobContext) -> std::result::Result<(), JobError>;

    fn to_payload(&self) -> Result<Payload> {
        Payload::json(Self::JOB_TYPE, self)
    }
}

#[derive(Clone, Default)]
pub struct HandlerRegistry {
    handlers: HashMap<String, JobHandler>,
}

impl fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandlerRegistry")
            .field("job_types", &self.job_types())
            .finish()
    }
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<J: BackgroundJob>(&mut self) -> Result<()> {
        self.insert(
            J::JOB_TYPE.to_string(),
            Arc::new(|ctx: JobContext| {
                Box::pin(async move {
                    let job: J = ctx.json()?;
                    job.perform(&ctx).await
                }) as JobFuture
            }),
        )
    }

    pub fn register_fn<F, Fut>(&mut self, job_type: impl Into<String>, handler: F) -> Result<()>
    where
        F: Fn(JobContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = std::result::Result<(), JobError>> + Send + 'static,
    {
        self.insert(
            job_type.into(),
            Arc::new(move |ctx: JobContext| Box::pin(handler(ctx)) as JobFuture),
        )
    }

    fn insert(&mut self, job_type: String, handler: JobHandler) -> Result<()> {
        if self.handlers.contains_key(&job_type) {
            return Err(BacklotError::DuplicateJobType { job_type });
        }
        self.handlers.insert(job_type, handler);
        Ok(())
    }

    pub fn contains(&self, job_type: &str) -> bool {
        self.handlers.contains_key(job_type)
    }

    pub fn job_types(&self) -> Vec<&str> {
        let mut types: Vec<&str> = self.handlers.keys().map(String::as_str).collect();
        types.sort_unstable();
        types
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    /// Runs the handler registered for the context's job type. An
    /// unregistered type is a retryable fault, so a deploy that adds the
    /// handler later can still pick the job up.
    pub async fn dispatch(&self, ctx: JobContext) -> std::result::Result<(), JobError> {
        let handler = match self.handlers.get(ctx.job_type()) {
            Some(handler) => Arc::clone(handler),
            None => {
                return Err(JobError::retryable(
                    BacklotError::ExecutionFault(format!(
                        "no handler registered for job type '{}'",
                        ctx.job_type()
                    ))
                    .to_string(),
                ));
            }
        };
        handler(ctx).await
    }
}
