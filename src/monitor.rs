//! Read access for dashboards and operators.
//!
//! [`Monitor`] exposes per-queue counts, job detail and failure summaries.
//! Its only mutations are operator retry and delete, which go through the
//! same conditional transitions the workers use.

use crate::{
    Result,
    job::{Job, JobId, JobState},
    store::{JobFilter, JobStore},
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::info;

/// Job counts per state for one queue.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueStats {
    pub queue_name: String,
    pub scheduled: u64,
    pub enqueued: u64,
    pub leased: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub dead: u64,
}

impl QueueStats {
    pub fn new(queue_name: impl Into<String>) -> Self {
        Self {
            queue_name: queue_name.into(),
            ..Default::default()
        }
    }

    pub fn add(&mut self, state: JobState, count: u64) {
        *self.slot(state) += count;
    }

    pub fn count(&self, state: JobState) -> u64 {
        match state {
            JobState::Scheduled => self.scheduled,
            JobState::Enqueued => self.enqueued,
            JobState::Leased => self.leased,
            JobState::Succeeded => self.succeeded,
            JobState::Failed => self.failed,
            JobState::Dead => self.dead,
        }
    }

    pub fn total(&self) -> u64 {
        JobState::ALL.iter().map(|state| self.count(*state)).sum()
    }

    fn slot(&mut self, state: JobState) -> &mut u64 {
        match state {
            JobState::Scheduled => &mut self.scheduled,
            JobState::Enqueued => &mut self.enqueued,
            JobState::Leased => &mut self.leased,
            JobState::Succeeded => &mut self.succeeded,
            JobState::Failed => &mut self.failed,
            JobState::Dead => &mut self.dead,
        }
    }
}

/// Overview of jobs that need operator attention.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FailureSummary {
    pub total_dead: u64,
    pub total_failed: u64,
    pub by_queue: HashMap<String, u64>,
    pub oldest_failure: Option<DateTime<Utc>>,
    pub newest_failure: Option<DateTime<Utc>>,
    /// Last error message -> number of jobs.
    pub error_patterns: HashMap<String, u64>,
}

#[derive(Clone)]
pub struct Monitor {
    store: Arc<dyn JobStore>,
}

impl Monitor {
    pub fn new(store: Arc<dyn JobStore>) -> Self {
        Self { store }
    }

    pub async fn queue_stats(&self) -> Result<Vec<QueueStats>> {
        self.store.queue_stats().await
    }

    /// Counts for one queue; zeroes if the queue has no jobs.
    pub async fn queue(&self, queue_name: &str) -> Result<QueueStats> {
        Ok(self
            .store
            .queue_stats()
            .await?
            .into_iter()
            .find(|stats| stats.queue_name == queue_name)
            .unwrap_or_else(|| QueueStats::new(queue_name)))
    }

    pub async fn job(&self, job_id: JobId) -> Result<Job> {
        self.store.fetch(job_id).await
    }

    pub async fn jobs(&self, filter: &JobFilter) -> Result<Vec<Job>> {
        self.store.list_jobs(filter).await
    }

    pub async fn dead_jobs(&self, queue_name: Option<&str>, limit: u32) -> Result<Vec<Job>> {
        let mut filter = JobFilter::new().state(JobState::Dead).limit(limit);
        filter.queue_name = queue_name.map(str::to_string);
        self.store.list_jobs(&filter).await
    }

    pub async fn failure_summary(&self) -> Result<FailureSummary> {
        let mut summary = FailureSummary::default();
        for state in [JobState::Dead, JobState::Failed] {
            for job in self.store.list_jobs(&JobFilter::new().state(state)).await? {
                match state {
                    JobState::Dead => summary.total_dead += 1,
                    _ => summary.total_failed += 1,
                }
                *summary.by_queue.entry(job.queue_name.clone()).or_insert(0) += 1;
                if let Some(error) = &job.last_error {
                    *summary.error_patterns.entry(error.clone()).or_insert(0) += 1;
                }
                if let Some(at) = job.finished_at {
                    summary.oldest_failure = Some(summary.oldest_failure.map_or(at, |o| o.min(at)));
                    summary.newest_failure = Some(summary.newest_failure.map_or(at, |n| n.max(at)));
                }
            }
        }
        Ok(summary)
    }

    /// Puts a job back on its queue to run now, resetting its attempts.
    pub async fn retry(&self, job_id: JobId) -> Result<()> {
        self.store.requeue(job_id).await?;
        info!("Job {} requeued by operator", job_id);
        Ok(())
    }

    pub async fn delete(&self, job_id: JobId) -> Result<()> {
        self.store.delete(job_id).await?;
        info!("Job {} deleted by operator", job_id);
        Ok(())
    }
}
