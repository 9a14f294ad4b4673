use crate::job::{JobId, WorkerId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::{collections::HashMap, sync::Arc, time::Duration};

/// Processing statistics over a time window
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobStatistics {
    /// Executions that finished (succeeded, retried, failed or dead)
    pub total_processed: u64,
    pub succeeded: u64,
    /// Executions that failed and were rescheduled
    pub retried: u64,
    /// Executions that failed permanently
    pub failed: u64,
    pub dead: u64,
    /// Leases recovered by the reaper
    pub lease_expired: u64,
    /// Executions started in the window
    pub started: u64,
    pub avg_processing_time_ms: f64,
    pub min_processing_time_ms: u64,
    pub max_processing_time_ms: u64,
    pub throughput_per_minute: f64,
    /// Share of finished executions that did not succeed
    pub error_rate: f64,
    pub time_window: Duration,
    pub calculated_at: DateTime<Utc>,
}

impl Default for JobStatistics {
    fn default() -> Self {
        Self {
            total_processed: 0,
            succeeded: 0,
            retried: 0,
            failed: 0,
            dead: 0,
            lease_expired: 0,
            started: 0,
            avg_processing_time_ms: 0.0,
            min_processing_time_ms: 0,
            max_processing_time_ms: 0,
            throughput_per_minute: 0.0,
            error_rate: 0.0,
            time_window: Duration::from_secs(60),
            calculated_at: Utc::now(),
        }
    }
}

/// Job processing event for statistics collection
#[derive(Debug, Clone)]
pub struct JobEvent {
    pub job_id: JobId,
    pub queue_name: String,
    pub worker_id: Option<WorkerId>,
    pub event_type: JobEventType,
    pub processing_time_ms: Option<u64>,
    pub error_message: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl JobEvent {
    pub fn new(job_id: JobId, queue_name: impl Into<String>, event_type: JobEventType) -> Self {
        Self {
            job_id,
            queue_name: queue_name.into(),
            worker_id: None,
            event_type,
            processing_time_ms: None,
            error_message: None,
            timestamp: Utc::now(),
        }
    }

    pub fn with_worker(mut self, worker_id: WorkerId) -> Self {
        self.worker_id = Some(worker_id);
        self
    }

    pub fn with_processing_time(mut self, elapsed: Duration) -> Self {
        self.processing_time_ms = Some(elapsed.as_millis().min(u64::MAX as u128) as u64);
        self
    }

    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error_message = Some(error.into());
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum JobEventType {
    Started,
    Succeeded,
    Retried,
    Failed,
    Dead,
    LeaseExpired,
}

impl JobEventType {
    fn is_outcome(&self) -> bool {
        !matches!(self, JobEventType::Started | JobEventType::LeaseExpired)
    }
}

/// Trait for collecting and storing job statistics
#[async_trait::async_trait]
pub trait StatisticsCollector: Send + Sync {
    async fn record_event(&self, event: JobEvent) -> crate::Result<()>;

    async fn get_queue_statistics(
        &self,
        queue_name: &str,
        window: Duration,
    ) -> crate::Result<JobStatistics>;

    /// Statistics per queue name
    async fn get_all_statistics(
        &self,
        window: Duration,
    ) -> crate::Result<HashMap<String, JobStatistics>>;

    async fn get_system_statistics(&self, window: Duration) -> crate::Result<JobStatistics>;

    /// Drops events older than `older_than`, returning how many went
    async fn cleanup_old_statistics(&self, older_than: Duration) -> crate::Result<u64>;
}

/// Configuration for statistics collection
#[derive(Debug, Clone)]
pub struct StatsConfig {
    /// Maximum number of events to keep in memory
    pub max_events: usize,
}

impl Default for StatsConfig {
    fn default() -> Self {
        Self {
            max_events: 100_000,
        }
    }
}

/// In-memory statistics collector with time-windowed data
pub struct InMemoryStatsCollector {
    events: Arc<std::sync::RwLock<Vec<JobEvent>>>,
    config: StatsConfig,
}

impl Default for InMemoryStatsCollector {
    fn default() -> Self {
        Self::new(StatsConfig::default())
    }
}

impl InMemoryStatsCollector {
    pub fn new(config: StatsConfig) -> Self {
        Self {
            events: Arc::new(std::sync::RwLock::new(Vec::new())),
            config,
        }
    }

    fn events_since(&self, window: Duration) -> Vec<JobEvent> {
        let cutoff = window_start(window);
        let events = self
            .events
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        events
            .iter()
            .filter(|event| event.timestamp >= cutoff)
            .cloned()
            .collect()
    }

    fn calculate_statistics(events: &[JobEvent], window: Duration) -> JobStatistics {
        let count = |kind: JobEventType| {
            events
                .iter()
                .filter(|event| event.event_type == kind)
                .count() as u64
        };

        let succeeded = count(JobEventType::Succeeded);
        let retried = count(JobEventType::Retried);
        let failed = count(JobEventType::Failed);
        let dead = count(JobEventType::Dead);
        let total_processed = events
            .iter()
            .filter(|event| event.event_type.is_outcome())
            .count() as u64;

        let processing_times: Vec<u64> = events
            .iter()
            .filter(|event| event.event_type.is_outcome())
            .filter_map(|event| event.processing_time_ms)
            .collect();
        let (avg, min, max) = match (processing_times.iter().min(), processing_times.iter().max()) {
            (Some(min), Some(max)) => {
                let sum: u64 = processing_times.iter().sum();
                (sum as f64 / processing_times.len() as f64, *min, *max)
            }
            _ => (0.0, 0, 0),
        };

        let error_rate = if total_processed > 0 {
            (retried + failed + dead) as f64 / total_processed as f64
        } else {
            0.0
        };
        let throughput_per_minute = if window.as_secs() > 0 {
            total_processed as f64 * 60.0 / window.as_secs() as f64
        } else {
            0.0
        };

        JobStatistics {
            total_processed,
            succeeded,
            retried,
            failed,
            dead,
            lease_expired: count(JobEventType::LeaseExpired),
            started: count(JobEventType::Started),
            avg_processing_time_ms: avg,
            min_processing_time_ms: min,
            max_processing_time_ms: max,
            throughput_per_minute,
            error_rate,
            time_window: window,
            calculated_at: Utc::now(),
        }
    }
}

fn window_start(window: Duration) -> DateTime<Utc> {
    let now = Utc::now();
    chrono::Duration::from_std(window)
        .ok()
        .and_then(|window| now.checked_sub_signed(window))
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

#[async_trait::async_trait]
impl StatisticsCollector for InMemoryStatsCollector {
    async fn record_event(&self, event: JobEvent) -> crate::Result<()> {
        let mut events = self
            .events
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        events.push(event);

        if events.len() > self.config.max_events {
            let excess = events.len() - self.config.max_events;
            events.drain(0..excess);
        }
        Ok(())
    }

    async fn get_queue_statistics(
        &self,
        queue_name: &str,
        window: Duration,
    ) -> crate::Result<JobStatistics> {
        let events: Vec<JobEvent> = self
            .events_since(window)
            .into_iter()
            .filter(|event| event.queue_name == queue_name)
            .collect();
        Ok(Self::calculate_statistics(&events, window))
    }

    async fn get_all_statistics(
        &self,
        window: Duration,
    ) -> crate::Result<HashMap<String, JobStatistics>> {
        let mut by_queue: HashMap<String, Vec<JobEvent>> = HashMap::new();
        for event in self.events_since(window) {
            by_queue
                .entry(event.queue_name.clone())
                .or_default()
                .push(event);
        }
        Ok(by_queue
            .into_iter()
            .map(|(queue, events)| (queue, Self::calculate_statistics(&events, window)))
            .collect())
    }

    async fn get_system_statistics(&self, window: Duration) -> crate::Result<JobStatistics> {
        Ok(Self::calculate_statistics(&self.events_since(window), window))
    }

    async fn cleanup_old_statistics(&self, older_than: Duration) -> crate::Result<u64> {
        let cutoff = window_start(older_than);
        let mut events = self
            .events
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let original_len = events.len();
        events.retain(|event| event.timestamp >= cutoff);
        Ok((original_len - events.len()) as u64)
    }
}
