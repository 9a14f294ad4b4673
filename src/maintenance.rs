//! Background loops that keep the store moving: promoting scheduled jobs,
//! recovering expired leases and purging old finished jobs.

use crate::{
    Result,
    config::ServerConfig,
    job::JobId,
    lease::LeaseController,
    queue::QueueManager,
    stats::{JobEvent, JobEventType, StatisticsCollector},
    store::{JobStore, LEASE_EXPIRED_ERROR},
};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info};

/// Floor for every maintenance period.
const MIN_INTERVAL: Duration = Duration::from_millis(10);

pub struct Maintenance {
    store: Arc<dyn JobStore>,
    queues: QueueManager,
    leases: LeaseController,
    promote_interval: Duration,
    reap_interval: Duration,
    purge_interval: Duration,
    retention: Duration,
    stats_collector: Option<Arc<dyn StatisticsCollector>>,
}

impl Maintenance {
    pub fn new(store: Arc<dyn JobStore>, config: &ServerConfig) -> Self {
        Self {
            queues: QueueManager::new(Arc::clone(&store)),
            leases: LeaseController::new(Arc::clone(&store)),
            store,
            promote_interval: config.promote_interval,
            reap_interval: config.reap_interval,
            purge_interval: config.purge_interval,
            retention: config.retention,
            stats_collector: None,
        }
    }

    pub fn with_stats_collector(mut self, stats_collector: Arc<dyn StatisticsCollector>) -> Self {
        self.stats_collector = Some(stats_collector);
        self
    }

    pub async fn promote_once(&self) -> Result<u64> {
        let promoted = self.queues.promote_due().await?;
        if promoted > 0 {
            debug!("Promoted {} scheduled jobs", promoted);
        }
        Ok(promoted)
    }

    /// Requeues every job whose lease has expired.
    pub async fn reap_once(&self) -> Result<Vec<JobId>> {
        let requeued = self.leases.reap_expired().await?;
        if let Some(stats_collector) = &self.stats_collector {
            for job_id in &requeued {
                let Ok(job) = self.store.fetch(*job_id).await else {
                    continue;
                };
                let event = JobEvent::new(*job_id, job.queue_name, JobEventType::LeaseExpired)
                    .with_error(LEASE_EXPIRED_ERROR);
                if let Err(e) = stats_collector.record_event(event).await {
                    debug!("Failed to record lease expiry for job {}: {}", job_id, e);
                }
            }
        }
        Ok(requeued)
    }

    pub async fn purge_once(&self) -> Result<u64> {
        let purged = self.store.purge_expired(self.retention).await?;
        if purged > 0 {
            info!("Purged {} finished jobs", purged);
        }
        Ok(purged)
    }

    /// Starts the promoter, reaper and purger. Each stops when `shutdown`
    /// turns true or its sender is dropped.
    pub fn spawn(self, shutdown: watch::Receiver<bool>) -> Vec<JoinHandle<()>> {
        let this = Arc::new(self);

        let promoter = Arc::clone(&this);
        let reaper = Arc::clone(&this);
        let purger = Arc::clone(&this);

        vec![
            tokio::spawn(run_periodic(
                "promoter",
                this.promote_interval,
                shutdown.clone(),
                move || {
                    let promoter = Arc::clone(&promoter);
                    async move {
                        if let Err(e) = promoter.promote_once().await {
                            error!("Failed to promote scheduled jobs: {}", e);
                        }
                    }
                },
            )),
            tokio::spawn(run_periodic(
                "reaper",
                this.reap_interval,
                shutdown.clone(),
                move || {
                    let reaper = Arc::clone(&reaper);
                    async move {
                        if let Err(e) = reaper.reap_once().await {
                            error!("Failed to reap expired leases: {}", e);
                        }
                    }
                },
            )),
            tokio::spawn(run_periodic(
                "purger",
                this.purge_interval,
                shutdown,
                move || {
                    let purger = Arc::clone(&purger);
                    async move {
                        if let Err(e) = purger.purge_once().await {
                            error!("Failed to purge finished jobs: {}", e);
                        }
                    }
                },
            )),
        ]
    }
}

async fn run_periodic<F, Fut>(
    name: &'static str,
    period: Duration,
    mut shutdown: watch::Receiver<bool>,
    mut tick: F,
) where
    F: FnMut() -> Fut,
    Fut: Future<Output = ()>,
{
    let mut interval = tokio::time::interval(period.max(MIN_INTERVAL));
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    debug!("Maintenance task {} started", name);

    while !*shutdown.borrow() {
        tokio::select! {
            _ = interval.tick() => tick().await,
            changed = shutdown.changed() => {
                if changed.is_err() {
                    break;
                }
            }
        }
    }

    debug!("Maintenance task {} stopped", name);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        clock::{Clock, MockClock},
        job::{JobState, Payload, WorkerId},
        stats::InMemoryStatsCollector,
        store::MemoryStore,
    };

    fn config() -> ServerConfig {
        ServerConfig {
            promote_interval: Duration::from_millis(10),
            reap_interval: Duration::from_millis(10),
            purge_interval: Duration::from_millis(10),
            retention: Duration::from_secs(60),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_reap_records_lease_expired_events() {
        let clock = MockClock::new();
        let store = Arc::new(MemoryStore::with_clock(clock.clone()));
        let stats = Arc::new(InMemoryStatsCollector::default());
        let maintenance =
            Maintenance::new(store.clone(), &config()).with_stats_collector(stats.clone());

        let id = store
            .create("default", Payload::new("noop", Vec::new()), None)
            .await
            .unwrap();
        store
            .try_lease(id, &WorkerId::new("w"), Duration::from_secs(1))
            .await
            .unwrap();
        clock.advance(chrono::Duration::seconds(2));

        assert_eq!(maintenance.reap_once().await.unwrap(), vec![id]);
        let system = stats
            .get_system_statistics(Duration::from_secs(60))
            .await
            .unwrap();
        assert_eq!(system.lease_expired, 1);
    }

    #[tokio::test]
    async fn test_purge_respects_retention() {
        let clock = MockClock::new();
        let store = Arc::new(MemoryStore::with_clock(clock.clone()));
        let maintenance = Maintenance::new(store.clone(), &config());
        let worker = WorkerId::new("w");

        let id = store
            .create("default", Payload::new("noop", Vec::new()), None)
            .await
            .unwrap();
        store
            .try_lease(id, &worker, Duration::from_secs(30))
            .await
            .unwrap();
        store.mark_succeeded(id, &worker).await.unwrap();

        assert_eq!(maintenance.purge_once().await.unwrap(), 0);
        clock.advance(chrono::Duration::seconds(61));
        assert_eq!(maintenance.purge_once().await.unwrap(), 1);
        assert!(store.is_empty().await);
    }

    #[tokio::test]
    async fn test_spawned_loops_promote_and_stop() {
        let clock = MockClock::new();
        let store = Arc::new(MemoryStore::with_clock(clock.clone()));
        let due = clock.now() + chrono::Duration::seconds(5);
        let id = store
            .create("default", Payload::new("noop", Vec::new()), Some(due))
            .await
            .unwrap();

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let handles = Maintenance::new(store.clone(), &config()).spawn(shutdown_rx);

        clock.advance(chrono::Duration::seconds(5));
        let mut promoted = false;
        for _ in 0..100 {
            if store.fetch(id).await.unwrap().state == JobState::Enqueued {
                promoted = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(promoted);

        shutdown_tx.send(true).unwrap();
        for handle in handles {
            tokio::time::timeout(Duration::from_secs(1), handle)
                .await
                .unwrap()
                .unwrap();
        }
    }
}
