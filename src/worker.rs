//! Workers and the worker pool.
//!
//! A [`Worker`] loops over its queues in priority order: lease the next job,
//! run its handler inside a failure boundary, report the result, release the
//! lease. The [`WorkerPool`] starts a fixed number of workers plus the
//! maintenance loops and hands back a [`PoolHandle`] for graceful shutdown.

use crate::{
    BacklotError, Result,
    config::ServerConfig,
    handler::{HandlerRegistry, JobContext, JobError},
    job::{Job, JobId, JobState, WorkerId},
    lease::LeaseController,
    maintenance::Maintenance,
    queue::QueuePriority,
    retry::RetryPolicy,
    stats::{JobEvent, JobEventType, StatisticsCollector},
    store::JobStore,
};
use rand::Rng;
use std::future::Future;
use std::{sync::Arc, time::Duration, time::Instant};
use tokio::sync::{Notify, watch};
use tokio::task::{JoinError, JoinHandle};
use tracing::{debug, error, info, warn};

/// First delay after a store error; doubles per consecutive failure.
const STORE_BACKOFF_BASE: Duration = Duration::from_millis(100);
const STORE_BACKOFF_MAX: Duration = Duration::from_secs(30);
/// Extra attempts for a result report that hits a transient store error.
const REPORT_RETRIES: u32 = 3;

pub struct Worker {
    id: WorkerId,
    store: Arc<dyn JobStore>,
    leases: LeaseController,
    registry: Arc<HandlerRegistry>,
    queues: QueuePriority,
    lease_duration: Duration,
    poll_interval: Duration,
    poll_jitter: Duration,
    job_timeout: Option<Duration>,
    heartbeat_interval: Option<Duration>,
    retry_policy: RetryPolicy,
    stats_collector: Option<Arc<dyn StatisticsCollector>>,
}

impl Worker {
    pub fn new(
        id: WorkerId,
        store: Arc<dyn JobStore>,
        registry: Arc<HandlerRegistry>,
        queues: QueuePriority,
    ) -> Self {
        let defaults = ServerConfig::default();
        Self {
            id,
            leases: LeaseController::new(Arc::clone(&store)),
            store,
            registry,
            queues,
            lease_duration: defaults.lease_duration,
            poll_interval: defaults.poll_interval,
            poll_jitter: defaults.poll_jitter,
            job_timeout: None,
            heartbeat_interval: None,
            retry_policy: RetryPolicy::default(),
            stats_collector: None,
        }
    }

    /// Worker with every timing taken from `config`.
    pub fn from_config(
        id: WorkerId,
        store: Arc<dyn JobStore>,
        registry: Arc<HandlerRegistry>,
        config: &ServerConfig,
    ) -> Self {
        let mut worker = Self::new(id, store, registry, config.queues.clone())
            .with_lease_duration(config.lease_duration)
            .with_poll_interval(config.poll_interval)
            .with_poll_jitter(config.poll_jitter);
        worker.job_timeout = config.job_timeout;
        worker.heartbeat_interval = config.heartbeat_interval;
        worker
    }

    pub fn with_stats_collector(mut self, stats_collector: Arc<dyn StatisticsCollector>) -> Self {
        self.stats_collector = Some(stats_collector);
        self
    }

    pub fn with_retry_policy(mut self, retry_policy: RetryPolicy) -> Self {
        self.retry_policy = retry_policy;
        self
    }

    pub fn with_lease_duration(mut self, duration: Duration) -> Self {
        self.lease_duration = duration;
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_poll_jitter(mut self, jitter: Duration) -> Self {
        self.poll_jitter = jitter;
        self
    }

    pub fn with_job_timeout(mut self, timeout: Duration) -> Self {
        self.job_timeout = Some(timeout);
        self
    }

    pub fn with_heartbeat(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = Some(interval);
        self
    }

    pub fn id(&self) -> &WorkerId {
        &self.id
    }

    /// Processes jobs until `shutdown` turns true or its sender goes away.
    /// A job that is already running is finished first.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        info!("Worker {} started on queues {}", self.id, self.queues);
        let notify = self.store.notifier();
        let mut store_failures = 0u32;

        while !*shutdown.borrow() {
            let wait = match self.run_once().await {
                Ok(true) => {
                    store_failures = 0;
                    continue;
                }
                Ok(false) => {
                    store_failures = 0;
                    self.idle_delay()
                }
                Err(e) => {
                    store_failures = store_failures.saturating_add(1);
                    let delay = store_backoff(store_failures);
                    error!(
                        "Worker {} could not reach the job store ({} consecutive failures): {}; retrying in {:?}",
                        self.id, store_failures, e, delay
                    );
                    delay
                }
            };

            if wait_for_work(&mut shutdown, notify.as_deref(), wait).await {
                break;
            }
        }

        info!("Worker {} shutting down", self.id);
        Ok(())
    }

    /// Leases and processes at most one job. False when nothing was visible.
    pub async fn run_once(&self) -> Result<bool> {
        let Some(job) = self
            .leases
            .lease_next(&self.queues, &self.id, self.lease_duration)
            .await?
        else {
            return Ok(false);
        };

        self.process_job(job).await;
        Ok(true)
    }

    async fn process_job(&self, job: Job) {
        let job_id = job.id;
        let queue_name = job.queue_name.clone();
        debug!(
            "Worker {} processing job {} ({}) attempt {}",
            self.id,
            job_id,
            job.payload.job_type,
            job.attempts + 1
        );
        self.record_event(JobEvent::new(job_id, &queue_name, JobEventType::Started))
            .await;

        let started = Instant::now();
        let outcome = self.execute(&job).await;
        let elapsed = started.elapsed();

        let event = match outcome {
            Ok(()) => match self.report_success(job_id).await {
                Some(_) => {
                    debug!("Job {} completed successfully", job_id);
                    Some(JobEvent::new(job_id, &queue_name, JobEventType::Succeeded))
                }
                None => None,
            },
            Err(job_error) => {
                error!("Job {} failed: {}", job_id, job_error);
                self.report_failure(job_id, &job_error)
                    .await
                    .and_then(|state| match state {
                        JobState::Scheduled => Some(JobEventType::Retried),
                        JobState::Failed => Some(JobEventType::Failed),
                        JobState::Dead => Some(JobEventType::Dead),
                        _ => None,
                    })
                    .map(|kind| {
                        JobEvent::new(job_id, &queue_name, kind).with_error(job_error.message())
                    })
            }
        };

        self.release(job_id).await;

        if let Some(event) = event {
            self.record_event(event.with_processing_time(elapsed)).await;
        }
    }

    /// Runs the handler as its own task so a panic or a timeout cannot take
    /// the worker down.
    async fn execute(&self, job: &Job) -> std::result::Result<(), JobError> {
        let ctx = JobContext::for_job(job, self.id.clone());
        let registry = Arc::clone(&self.registry);
        let mut task = tokio::spawn(async move { registry.dispatch(ctx).await });
        let heartbeat = self
            .heartbeat_interval
            .map(|interval| self.spawn_heartbeat(job.id, interval));

        let outcome = match self.job_timeout {
            Some(timeout) => match tokio::time::timeout(timeout, &mut task).await {
                Ok(joined) => flatten_join(joined),
                Err(_) => {
                    task.abort();
                    warn!("Job {} timed out after {:?}", job.id, timeout);
                    Err(JobError::retryable(format!(
                        "job timed out after {:?}",
                        timeout
                    )))
                }
            },
            None => flatten_join(task.await),
        };

        if let Some(heartbeat) = heartbeat {
            heartbeat.abort();
        }
        outcome
    }

    fn spawn_heartbeat(&self, job_id: JobId, interval: Duration) -> JoinHandle<()> {
        let store = Arc::clone(&self.store);
        let worker = self.id.clone();
        let lease_duration = self.lease_duration;
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(interval).await;
                match store.renew_lease(job_id, &worker, lease_duration).await {
                    Ok(expires_at) => {
                        debug!("Worker {} renewed lease on job {} until {}", worker, job_id, expires_at)
                    }
                    Err(e) if e.is_stale_report() => {
                        warn!("Worker {} lost the lease on job {}: {}", worker, job_id, e);
                        break;
                    }
                    Err(e) => warn!("Failed to renew lease on job {}: {}", job_id, e),
                }
            }
        })
    }

    async fn report_success(&self, job_id: JobId) -> Option<JobState> {
        let store = &self.store;
        let worker = &self.id;
        self.report("success", job_id, move || {
            store.mark_succeeded(job_id, worker)
        })
        .await
    }

    async fn report_failure(&self, job_id: JobId, job_error: &JobError) -> Option<JobState> {
        let store = &self.store;
        let worker = &self.id;
        let policy = &self.retry_policy;
        let state = self
            .report("failure", job_id, move || {
                store.mark_failed(job_id, worker, job_error, policy)
            })
            .await?;
        match state {
            JobState::Scheduled => info!("Job {} scheduled for retry", job_id),
            JobState::Dead => warn!("Job {} exhausted its attempts and is dead", job_id),
            JobState::Failed => warn!("Job {} failed permanently", job_id),
            _ => {}
        }
        Some(state)
    }

    /// Sends a result to the store, retrying transient store errors a few
    /// times. Stale reports are logged and dropped.
    async fn report<F, Fut>(&self, what: &str, job_id: JobId, mut send: F) -> Option<JobState>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<JobState>>,
    {
        let mut retries = 0;
        loop {
            match send().await {
                Ok(state) => return Some(state),
                Err(e) if e.is_stale_report() => {
                    warn!(
                        "Worker {} dropped stale {} report for job {}: {}",
                        self.id, what, job_id, e
                    );
                    return None;
                }
                Err(e) if e.is_transient() && retries < REPORT_RETRIES => {
                    retries += 1;
                    warn!(
                        "Retrying {} report for job {} after store error: {}",
                        what, job_id, e
                    );
                    tokio::time::sleep(store_backoff(retries)).await;
                }
                Err(e) => {
                    error!(
                        "Failed to report {} for job {}: {}; the lease will expire and the job will run again",
                        what, job_id, e
                    );
                    return None;
                }
            }
        }
    }

    async fn release(&self, job_id: JobId) {
        match self.leases.release(job_id, &self.id).await {
            Ok(()) => {}
            Err(BacklotError::NotFound { .. }) => {}
            Err(e) if e.is_stale_report() => {
                debug!("Worker {} no longer holds job {}: {}", self.id, job_id, e)
            }
            Err(e) => warn!("Failed to release lease on job {}: {}", job_id, e),
        }
    }

    fn idle_delay(&self) -> Duration {
        let jitter_ms = self.poll_jitter.as_millis().min(u64::MAX as u128) as u64;
        if jitter_ms == 0 {
            return self.poll_interval;
        }
        let jitter = Duration::from_millis(rand::thread_rng().gen_range(0..=jitter_ms));
        self.poll_interval.saturating_add(jitter)
    }

    async fn record_event(&self, event: JobEvent) {
        if let Some(stats_collector) = &self.stats_collector {
            let event = event.with_worker(self.id.clone());
            if let Err(e) = stats_collector.record_event(event).await {
                warn!("Failed to record statistics event: {}", e);
            }
        }
    }
}

/// Waits for `delay`, a wake-up from the store or shutdown. True when the
/// worker should stop.
async fn wait_for_work(
    shutdown: &mut watch::Receiver<bool>,
    notify: Option<&Notify>,
    delay: Duration,
) -> bool {
    let woken = async {
        match notify {
            Some(notify) => notify.notified().await,
            None => std::future::pending().await,
        }
    };

    tokio::select! {
        _ = tokio::time::sleep(delay) => false,
        _ = woken => false,
        changed = shutdown.changed() => changed.is_err() || *shutdown.borrow(),
    }
}

fn store_backoff(consecutive_failures: u32) -> Duration {
    let exponent = consecutive_failures.saturating_sub(1).min(16);
    STORE_BACKOFF_BASE
        .saturating_mul(1 << exponent)
        .min(STORE_BACKOFF_MAX)
}

fn flatten_join(
    joined: std::result::Result<std::result::Result<(), JobError>, JoinError>,
) -> std::result::Result<(), JobError> {
    match joined {
        Ok(result) => result,
        Err(e) if e.is_panic() => {
            let panic = e.into_panic();
            let message = panic
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| panic.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "unknown panic payload".to_string());
            Err(JobError::retryable(format!("job panicked: {}", message)))
        }
        Err(_) => Err(JobError::retryable("job task was cancelled")),
    }
}

/// Fixed-size set of workers sharing one store, plus the maintenance loops.
pub struct WorkerPool {
    store: Arc<dyn JobStore>,
    registry: Arc<HandlerRegistry>,
    config: ServerConfig,
    retry_policy: RetryPolicy,
    stats_collector: Option<Arc<dyn StatisticsCollector>>,
}

impl WorkerPool {
    /// Fails with a configuration error for zero workers, a zero lease or
    /// similar settings.
    pub fn new(
        store: Arc<dyn JobStore>,
        registry: HandlerRegistry,
        config: ServerConfig,
    ) -> Result<Self> {
        config.validate()?;
        if registry.is_empty() {
            warn!("Worker pool created without any job handlers");
        }
        Ok(Self {
            store,
            registry: Arc::new(registry),
            config,
            retry_policy: RetryPolicy::default(),
            stats_collector: None,
        })
    }

    pub fn with_retry_policy(mut self, retry_policy: RetryPolicy) -> Self {
        self.retry_policy = retry_policy;
        self
    }

    pub fn with_stats_collector(mut self, stats_collector: Arc<dyn StatisticsCollector>) -> Self {
        self.stats_collector = Some(stats_collector);
        self
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Get the statistics collector for the worker pool
    pub fn stats_collector(&self) -> Option<Arc<dyn StatisticsCollector>> {
        self.stats_collector.clone()
    }

    /// Spawns the workers and maintenance loops on the current runtime.
    pub fn start(&self) -> PoolHandle {
        info!(
            "Starting worker pool with {} workers on queues {}",
            self.config.worker_count, self.config.queues
        );

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let mut worker_ids = Vec::with_capacity(self.config.worker_count);
        let mut workers = Vec::with_capacity(self.config.worker_count);

        for index in 0..self.config.worker_count {
            let id = WorkerId::generate(&self.config.server_name, index);
            let mut worker = Worker::from_config(
                id.clone(),
                Arc::clone(&self.store),
                Arc::clone(&self.registry),
                &self.config,
            )
            .with_retry_policy(self.retry_policy.clone());
            if let Some(stats_collector) = &self.stats_collector {
                worker = worker.with_stats_collector(Arc::clone(stats_collector));
            }

            let shutdown = shutdown_rx.clone();
            workers.push(tokio::spawn(async move {
                let id = worker.id().clone();
                if let Err(e) = worker.run(shutdown).await {
                    error!("Worker {} error: {}", id, e);
                }
            }));
            worker_ids.push(id);
        }

        let mut maintenance = Maintenance::new(Arc::clone(&self.store), &self.config);
        if let Some(stats_collector) = &self.stats_collector {
            maintenance = maintenance.with_stats_collector(Arc::clone(stats_collector));
        }
        let maintenance = maintenance.spawn(shutdown_rx);

        PoolHandle {
            shutdown_tx,
            workers,
            maintenance,
            worker_ids,
        }
    }
}

/// Running pool. Dropping it without [`PoolHandle::shutdown`] also stops
/// the tasks, but without waiting for in-flight jobs.
pub struct PoolHandle {
    shutdown_tx: watch::Sender<bool>,
    workers: Vec<JoinHandle<()>>,
    maintenance: Vec<JoinHandle<()>>,
    worker_ids: Vec<WorkerId>,
}

impl PoolHandle {
    pub fn worker_ids(&self) -> &[WorkerId] {
        &self.worker_ids
    }

    /// Stops leasing, lets in-flight jobs finish and joins every task.
    pub async fn shutdown(self) -> Result<()> {
        info!("Shutting down worker pool");
        if self.shutdown_tx.send(true).is_err() {
            debug!("All pool tasks already stopped");
        }

        let mut failure = None;
        for handle in self.workers.into_iter().chain(self.maintenance) {
            if let Err(e) = handle.await {
                error!("Pool task failed: {}", e);
                failure.get_or_insert_with(|| {
                    BacklotError::ExecutionFault(format!("Worker task failed: {}", e))
                });
            }
        }

        info!("Worker pool stopped");
        failure.map_or(Ok(()), Err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::Payload;
    use crate::store::MemoryStore;

    fn quiet_config(worker_count: usize) -> ServerConfig {
        ServerConfig {
            worker_count,
            poll_interval: Duration::from_millis(10),
            poll_jitter: Duration::ZERO,
            ..Default::default()
        }
    }

    #[test]
    fn test_store_backoff_grows_and_caps() {
        assert_eq!(store_backoff(1), Duration::from_millis(100));
        assert_eq!(store_backoff(2), Duration::from_millis(200));
        assert_eq!(store_backoff(4), Duration::from_millis(800));
        assert_eq!(store_backoff(100), STORE_BACKOFF_MAX);
    }

    #[test]
    fn test_pool_rejects_zero_workers() {
        let store = Arc::new(MemoryStore::new());
        let result = WorkerPool::new(store, HandlerRegistry::new(), quiet_config(0));
        assert!(matches!(result, Err(BacklotError::Config(_))));
    }

    #[test]
    fn test_idle_delay_stays_within_jitter() {
        let store = Arc::new(MemoryStore::new());
        let worker = Worker::new(
            WorkerId::new("w"),
            store,
            Arc::new(HandlerRegistry::new()),
            QueuePriority::default(),
        )
        .with_poll_interval(Duration::from_millis(50))
        .with_poll_jitter(Duration::from_millis(20));

        for _ in 0..50 {
            let delay = worker.idle_delay();
            assert!(delay >= Duration::from_millis(50));
            assert!(delay <= Duration::from_millis(70));
        }
    }

    #[tokio::test]
    async fn test_run_once_reports_success_and_releases() {
        let store = Arc::new(MemoryStore::new());
        let mut registry = HandlerRegistry::new();
        registry
            .register_fn("noop", |_ctx| async { Ok(()) })
            .unwrap();
        let worker = Worker::new(
            WorkerId::new("w"),
            store.clone(),
            Arc::new(registry),
            QueuePriority::default(),
        );

        assert!(!worker.run_once().await.unwrap());

        let id = store
            .create("default", Payload::new("noop", Vec::new()), None)
            .await
            .unwrap();
        assert!(worker.run_once().await.unwrap());

        let job = store.fetch(id).await.unwrap();
        assert_eq!(job.state, JobState::Succeeded);
        assert!(job.lease_owner.is_none());
    }

    #[tokio::test]
    async fn test_panicking_handler_becomes_retryable_failure() {
        let store = Arc::new(MemoryStore::new());
        let mut registry = HandlerRegistry::new();
        registry
            .register_fn("explode", |ctx| async move {
                if ctx.attempt > 0 {
                    panic!("kaboom");
                }
                Ok(())
            })
            .unwrap();
        let worker = Worker::new(
            WorkerId::new("w"),
            store.clone(),
            Arc::new(registry),
            QueuePriority::default(),
        );

        let id = store
            .create("default", Payload::new("explode", Vec::new()), None)
            .await
            .unwrap();
        assert!(worker.run_once().await.unwrap());

        let job = store.fetch(id).await.unwrap();
        assert_eq!(job.state, JobState::Scheduled);
        assert_eq!(job.attempts, 1);
        assert!(job.last_error.unwrap().contains("kaboom"));
    }

    #[tokio::test]
    async fn test_timeout_aborts_slow_handler() {
        let store = Arc::new(MemoryStore::new());
        let mut registry = HandlerRegistry::new();
        registry
            .register_fn("slow", |_ctx| async {
                tokio::time::sleep(Duration::from_secs(30)).await;
                Ok(())
            })
            .unwrap();
        let worker = Worker::new(
            WorkerId::new("w"),
            store.clone(),
            Arc::new(registry),
            QueuePriority::default(),
        )
        .with_job_timeout(Duration::from_millis(20));

        let id = store
            .create("default", Payload::new("slow", Vec::new()), None)
            .await
            .unwrap();
        worker.run_once().await.unwrap();

        let job = store.fetch(id).await.unwrap();
        assert_eq!(job.state, JobState::Scheduled);
        assert!(job.last_error.unwrap().contains("timed out"));
    }

    #[tokio::test]
    async fn test_heartbeat_keeps_lease_alive() {
        let store = Arc::new(MemoryStore::new());
        let mut registry = HandlerRegistry::new();
        registry
            .register_fn("steady", |_ctx| async {
                tokio::time::sleep(Duration::from_millis(300)).await;
                Ok(())
            })
            .unwrap();
        let worker = Worker::new(
            WorkerId::new("w"),
            store.clone(),
            Arc::new(registry),
            QueuePriority::default(),
        )
        .with_lease_duration(Duration::from_millis(100))
        .with_heartbeat(Duration::from_millis(30));

        let id = store
            .create("default", Payload::new("steady", Vec::new()), None)
            .await
            .unwrap();

        let reaper = {
            let store = store.clone();
            tokio::spawn(async move {
                let mut reaped = Vec::new();
                for _ in 0..20 {
                    reaped.extend(store.requeue_expired().await.unwrap());
                    tokio::time::sleep(Duration::from_millis(20)).await;
                }
                reaped
            })
        };

        worker.run_once().await.unwrap();
        assert!(reaper.await.unwrap().is_empty());
        assert_eq!(store.fetch(id).await.unwrap().state, JobState::Succeeded);
    }

    #[tokio::test]
    async fn test_pool_start_and_shutdown() {
        let store = Arc::new(MemoryStore::new());
        let pool = WorkerPool::new(store, HandlerRegistry::new(), quiet_config(3)).unwrap();
        let handle = pool.start();
        assert_eq!(handle.worker_ids().len(), 3);
        assert!(handle.worker_ids()[0].as_str().starts_with("backlot:"));
        tokio::time::timeout(Duration::from_secs(5), handle.shutdown())
            .await
            .unwrap()
            .unwrap();
    }
}
