//! PostgreSQL job store.
//!
//! Each state change is one `UPDATE ... WHERE id = $1 AND state = ...`
//! statement, so concurrent workers and reapers race on row locks inside
//! Postgres rather than in application code. When a guarded update matches
//! no row, the current record is read back to tell a stale report apart from
//! a missing job.

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
use sqlx::postgres::PgPoolOptions;
use sqlx::{FromRow, PgPool, Row};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

/// DDL run by [`PostgresStore::create_tables`].
pub const SCHEMA: &str = r#"
CREATE SEQUENCE IF NOT EXISTS backlot_job_sequence;

CREATE TABLE IF NOT EXISTS backlot_jobs (
    id UUID PRIMARY KEY,
    queue_name VARCHAR(255) NOT NULL,
    job_type VARCHAR(255) NOT NULL,
    payload BYTEA NOT NULL,
    state VARCHAR(16) NOT NULL,
    sequence BIGINT NOT NULL,
    attempts INTEGER NOT NULL DEFAULT 0,
    last_error TEXT,
    lease_owner VARCHAR(255),
    lease_expires_at TIMESTAMPTZ,
    created_at TIMESTAMPTZ NOT NULL,
    due_at TIMESTAMPTZ NOT NULL,
    finished_at TIMESTAMPTZ
);

CREATE INDEX IF NOT EXISTS idx_backlot_jobs_visible
    ON backlot_jobs (queue_name, due_at, sequence) WHERE state = 'enqueued';
CREATE INDEX IF NOT EXISTS idx_backlot_jobs_scheduled
    ON backlot_jobs (due_at) WHERE state = 'scheduled';
CREATE INDEX IF NOT EXISTS idx_backlot_jobs_leased
    ON backlot_jobs (lease_expires_at) WHERE state = 'leased';
CREATE INDEX IF NOT EXISTS idx_backlot_jobs_finished
    ON backlot_jobs (finished_at) WHERE finished_at IS NOT NULL;
CREATE INDEX IF NOT EXISTS idx_backlot_jobs_queue_state
    ON backlot_jobs (queue_name, state);
"#;

const JOB_COLUMNS: &str = "id, queue_name, job_type, payload, state, sequence, attempts, \
     last_error, lease_owner, lease_expires_at, created_at, due_at, finished_at";

#[derive(FromRow, Clone)]
pub(crate) struct JobRow {
    pub id: uuid::Uuid,
    pub queue_name: String,
    pub job_type: String,
    pub payload: Vec<u8>,
    pub state: String,
    pub sequence: i64,
    pub attempts: i32,
    pub last_error: Option<String>,
    pub lease_owner: Option<String>,
    pub lease_expires_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub due_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl JobRow {
    pub fn into_job(self) -> Result<Job> {
        Ok(Job {
            id: self.id,
            queue_name: self.queue_name,
            payload: Payload::new(self.job_type, self.payload),
            state: self.state.parse()?,
            created_at: self.created_at,
            due_at: self.due_at,
            sequence: self.sequence,
            attempts: u32::try_from(self.attempts).unwrap_or(0),
            last_error: self.last_error,
            lease_owner: self.lease_owner.map(WorkerId::new),
            lease_expires_at: self.lease_expires_at,
            finished_at: self.finished_at,
        })
    }
}

#[derive(Debug, Clone)]
pub struct PostgresStore {
    pool: PgPool,
    clock: Arc<dyn Clock>,
}

impl PostgresStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            clock: Arc::new(SystemClock),
        }
    }

    pub fn with_clock(mut self, clock: impl Clock + 'static) -> Self {
        self.clock = Arc::new(clock);
        self
    }

    pub async fn connect(database_url: &str, max_connections: u32) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await?;
        Ok(Self::new(pool))
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Installs the jobs table, its sequence and indexes. Safe to rerun.
    pub async fn create_tables(&self) -> Result<()> {
        sqlx::raw_sql(SCHEMA).execute(&self.pool).await?;
        info!("Job store schema is up to date");
        Ok(())
    }

    async fn fetch_optional(&self, job_id: JobId) -> Result<Option<Job>> {
        let query = format!("SELECT {} FROM backlot_jobs WHERE id = $1", JOB_COLUMNS);
        sqlx::query_as::<_, JobRow>(&query)
            .bind(job_id)
            .fetch_optional(&self.pool)
            .await?
            .map(JobRow::into_job)
            .transpose()
    }

    async fn exists(&self, job_id: JobId) -> Result<bool> {
        let row = sqlx::query("SELECT 1 FROM backlot_jobs WHERE id = $1")
            .bind(job_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.is_some())
    }
}

#[async_trait]
impl JobStore for PostgresStore {
    fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    async fn create(
        &self,
        queue_name: &str,
        payload: Payload,
        due_at: Option<DateTime<Utc>>,
    ) -> Result<JobId> {
        let now = self.now();
        let due_at = due_at.unwrap_or(now);
        let state = if due_at > now {
            JobState::Scheduled
        } else {
            JobState::Enqueued
        };
        let job_id = uuid::Uuid::new_v4();

        sqlx::query(
            r#"
            INSERT INTO backlot_jobs
                (id, queue_name, job_type, payload, state, sequence, attempts, created_at, due_at)
            VALUES ($1, $2, $3, $4, $5, nextval('backlot_job_sequence'), 0, $6, $7)
            "#,
        )
        .bind(job_id)
        .bind(queue_name)
        .bind(&payload.job_type)
        .bind(&payload.data)
        .bind(state.as_str())
        .bind(now)
        .bind(due_at)
        .execute(&self.pool)
        .await?;

        Ok(job_id)
    }

    async fn fetch(&self, job_id: JobId) -> Result<Job> {
        self.fetch_optional(job_id)
            .await?
            .ok_or(BacklotError::NotFound { id: job_id })
    }

    async fn mark_succeeded(&self, job_id: JobId, worker: &WorkerId) -> Result<JobState> {
        let result = sqlx::query(
            r#"
            UPDATE backlot_jobs
            SET state = 'succeeded', finished_at = $3
            WHERE id = $1 AND state = 'leased' AND lease_owner = $2
            "#,
        )
        .bind(job_id)
        .bind(worker.as_str())
        .bind(self.now())
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 1 {
            return Ok(JobState::Succeeded);
        }
        let job = self.fetch(job_id).await?;
        explain_rejection(&job, worker, "complete", &[JobState::Succeeded])
    }

    async fn record_failure(
        &self,
        job_id: JobId,
        worker: &WorkerId,
        error: &str,
        outcome: FailureOutcome,
    ) -> Result<JobState> {
        let result = match outcome {
            FailureOutcome::Retry { due_at } => {
                sqlx::query(
                    r#"
                    UPDATE backlot_jobs
                    SET state = 'scheduled', attempts = attempts + 1, last_error = $3,
                        due_at = $4, sequence = nextval('backlot_job_sequence')
                    WHERE id = $1 AND state = 'leased' AND lease_owner = $2
                    "#,
                )
                .bind(job_id)
                .bind(worker.as_str())
                .bind(error)
                .bind(due_at)
                .execute(&self.pool)
                .await?
            }
            FailureOutcome::Dead | FailureOutcome::Failed => {
                sqlx::query(
                    r#"
                    UPDATE backlot_jobs
                    SET state = $3, attempts = attempts + 1, last_error = $4, finished_at = $5
                    WHERE id = $1 AND state = 'leased' AND lease_owner = $2
                    "#,
                )
                .bind(job_id)
                .bind(worker.as_str())
                .bind(outcome.state().as_str())
                .bind(error)
                .bind(self.now())
                .execute(&self.pool)
                .await?
            }
        };

        if result.rows_affected() == 1 {
            return Ok(outcome.state());
        }
        let job = self.fetch(job_id).await?;
        explain_rejection(
            &job,
            worker,
            "fail",
            &[JobState::Succeeded, JobState::Failed, JobState::Dead],
        )
    }

    async fn purge_expired(&self, retention: Duration) -> Result<u64> {
        let now = self.now();
        let Some(cutoff) = chrono::Duration::from_std(retention)
            .ok()
            .and_then(|retention| now.checked_sub_signed(retention))
        else {
            return Ok(0);
        };

        let result = sqlx::query(
            r#"
            DELETE FROM backlot_jobs
            WHERE state IN ('succeeded', 'failed', 'dead') AND finished_at <= $1
            "#,
        )
        .bind(cutoff)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }

    async fn enqueue_visible(&self, job_id: JobId) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE backlot_jobs
            SET state = 'enqueued'
            WHERE id = $1 AND state = 'scheduled' AND due_at <= $2
            "#,
        )
        .bind(job_id)
        .bind(self.now())
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 1 {
            return Ok(true);
        }
        if !self.exists(job_id).await? {
            return Err(BacklotError::NotFound { id: job_id });
        }
        Ok(false)
    }

    async fn promote_due(&self) -> Result<u64> {
        let result = sqlx::query(
            r#"
            UPDATE backlot_jobs
            SET state = 'enqueued'
            WHERE state = 'scheduled' AND due_at <= $1
            "#,
        )
        .bind(self.now())
        .execute(&self.pool)
        .await?;

        if result.rows_affected() > 0 {
            debug!("Promoted {} scheduled jobs", result.rows_affected());
        }
        Ok(result.rows_affected())
    }

    async fn peek_next(&self, queue_name: &str) -> Result<Option<JobId>> {
        let row = sqlx::query(
            r#"
            SELECT id FROM backlot_jobs
            WHERE queue_name = $1 AND state = 'enqueued'
            ORDER BY due_at ASC, sequence ASC
            LIMIT 1
            "#,
        )
        .bind(queue_name)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|row| row.get("id")))
    }

    async fn try_lease(
        &self,
        job_id: JobId,
        worker: &WorkerId,
        duration: Duration,
    ) -> Result<bool> {
        let expires_at = lease_expiry(self.now(), duration)?;
        let result = sqlx::query(
            r#"
            UPDATE backlot_jobs
            SET state = 'leased', lease_owner = $2, lease_expires_at = $3
            WHERE id = $1 AND state = 'enqueued'
            "#,
        )
        .bind(job_id)
        .bind(worker.as_str())
        .bind(expires_at)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 1 {
            return Ok(true);
        }
        if !self.exists(job_id).await? {
            return Err(BacklotError::NotFound { id: job_id });
        }
        Ok(false)
    }

    async fn renew_lease(
        &self,
        job_id: JobId,
        worker: &WorkerId,
        duration: Duration,
    ) -> Result<DateTime<Utc>> {
        let expires_at = lease_expiry(self.now(), duration)?;
        let result = sqlx::query(
            r#"
            UPDATE backlot_jobs
            SET lease_expires_at = $3
            WHERE id = $1 AND state = 'leased' AND lease_owner = $2
            "#,
        )
        .bind(job_id)
        .bind(worker.as_str())
        .bind(expires_at)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 1 {
            return Ok(expires_at);
        }
        if !self.exists(job_id).await? {
            return Err(BacklotError::NotFound { id: job_id });
        }
        Err(BacklotError::NotOwner {
            id: job_id,
            worker: worker.to_string(),
        })
    }

    async fn release_lease(&self, job_id: JobId, worker: &WorkerId) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE backlot_jobs
            SET state = CASE WHEN state = 'leased' THEN 'enqueued' ELSE state END,
                lease_owner = NULL,
                lease_expires_at = NULL
            WHERE id = $1 AND lease_owner = $2
            "#,
        )
        .bind(job_id)
        .bind(worker.as_str())
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 1 {
            return Ok(());
        }
        let job = self.fetch(job_id).await?;
        match job.lease_owner {
            None => Ok(()),
            Some(_) => Err(BacklotError::NotOwner {
                id: job_id,
                worker: worker.to_string(),
            }),
        }
    }

    async fn requeue_expired(&self) -> Result<Vec<JobId>> {
        let rows = sqlx::query(
            r#"
            UPDATE backlot_jobs
            SET state = 'enqueued', attempts = attempts + 1, last_error = $2,
                lease_owner = NULL, lease_expires_at = NULL
            WHERE state = 'leased' AND lease_expires_at < $1
            RETURNING id
            "#,
        )
        .bind(self.now())
        .bind(LEASE_EXPIRED_ERROR)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(|row| row.get("id")).collect())
    }

    async fn list_jobs(&self, filter: &JobFilter) -> Result<Vec<Job>> {
        let query = format!(
            r#"
            SELECT {} FROM backlot_jobs
            WHERE ($1::TEXT IS NULL OR queue_name = $1)
              AND ($2::TEXT IS NULL OR state = $2)
            ORDER BY created_at ASC, sequence ASC
            LIMIT $3 OFFSET $4
            "#,
            JOB_COLUMNS
        );
        let rows = sqlx::query_as::<_, JobRow>(&query)
            .bind(filter.queue_name.as_deref())
            .bind(filter.state.map(|state| state.as_str()))
            .bind(filter.limit.map(i64::from))
            .bind(i64::from(filter.offset.unwrap_or(0)))
            .fetch_all(&self.pool)
            .await?;

        rows.into_iter().map(JobRow::into_job).collect()
    }

    async fn queue_stats(&self) -> Result<Vec<QueueStats>> {
        let rows = sqlx::query(
            r#"
            SELECT queue_name, state, COUNT(*) AS count
            FROM backlot_jobs
            GROUP BY queue_name, state
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        let mut by_queue: BTreeMap<String, QueueStats> = BTreeMap::new();
        for row in rows {
            let queue_name: String = row.get("queue_name");
            let state: String = row.get("state");
            let count: i64 = row.get("count");
            by_queue
                .entry(queue_name.clone())
                .or_insert_with(|| QueueStats::new(queue_name))
                .add(state.parse()?, u64::try_from(count).unwrap_or(0));
        }
        Ok(by_queue.into_values().collect())
    }

    async fn requeue(&self, job_id: JobId) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE backlot_jobs
            SET state = 'enqueued', due_at = $2, sequence = nextval('backlot_job_sequence'),
                attempts = 0, finished_at = NULL, lease_owner = NULL, lease_expires_at = NULL
            WHERE id = $1 AND state NOT IN ('leased', 'enqueued')
            "#,
        )
        .bind(job_id)
        .bind(self.now())
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 1 {
            return Ok(());
        }
        let job = self.fetch(job_id).await?;
        match job.state {
            JobState::Enqueued => Ok(()),
            from => Err(BacklotError::InvalidTransition {
                id: job_id,
                from,
                action: "requeue",
            }),
        }
    }

    async fn delete(&self, job_id: JobId) -> Result<()> {
        let result = sqlx::query("DELETE FROM backlot_jobs WHERE id = $1 AND state <> 'leased'")
            .bind(job_id)
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 1 {
            return Ok(());
        }
        let job = self.fetch(job_id).await?;
        Err(BacklotError::InvalidTransition {
            id: job_id,
            from: job.state,
            action: "delete",
        })
    }
}
