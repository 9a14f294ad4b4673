//! # Backlot
//!
//! A multi-queue background job engine for Rust applications.
//!
//! ## Features
//!
//! - **Named queues with priority**: workers drain queues in a configured order
//!   ("critical" before "default" before "low-priority")
//! - **Delayed jobs**: enqueue now, after a delay or at a fixed time
//! - **Leases**: each running job is owned by exactly one worker until its
//!   lease expires; expired leases are reaped and the job runs again
//! - **Retries**: fixed, linear or exponential backoff, with dead jobs kept for
//!   operators to inspect and requeue
//! - **Pluggable storage**: an in-memory store and a PostgreSQL store behind the
//!   `postgres` feature
//! - **Monitoring**: per-queue counts, job listings and failure summaries
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use backlot::{
//!     Client, HandlerRegistry, JobContext, JobError, MemoryStore, Payload, WorkerPool,
//!     config::ServerConfig, queue::QueuePriority,
//! };
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> backlot::Result<()> {
//!     let store = Arc::new(MemoryStore::new());
//!
//!     let mut registry = HandlerRegistry::new();
//!     registry.register_fn("send_email", |ctx: JobContext| async move {
//!         println!("{} sending email for job {}", ctx.worker_id, ctx.job_id);
//!         Ok::<(), JobError>(())
//!     })?;
//!
//!     let config = ServerConfig {
//!         queues: QueuePriority::new(["critical", "default"])?,
//!         worker_count: 4,
//!         ..Default::default()
//!     };
//!     let handle = WorkerPool::new(store.clone(), registry, config)?.start();
//!
//!     Client::new(store)
//!         .enqueue("critical", Payload::new("send_email", b"{}".to_vec()))
//!         .await?;
//!
//!     tokio::signal::ctrl_c().await?;
//!     handle.shutdown().await
//! }
//! ```
//!
//! ## Delivery guarantees
//!
//! Delivery is at-least-once. A job whose worker dies or stalls past its
//! lease is handed to another worker, so job bodies should be idempotent.

pub mod client;
pub mod clock;
pub mod config;
pub mod error;
pub mod handler;
pub mod job;
pub mod lease;
pub mod logging;
pub mod maintenance;
pub mod monitor;
pub mod queue;
pub mod retry;
pub mod stats;
pub mod store;
pub mod worker;

pub use client::Client;
pub use clock::{Clock, MockClock, SystemClock};
pub use config::BacklotConfig;
pub use error::BacklotError;
pub use handler::{BackgroundJob, HandlerRegistry, JobContext, JobError, JobHandler};
pub use job::{Job, JobId, JobState, Lease, Payload, WorkerId};
pub use lease::LeaseController;
pub use monitor::{FailureSummary, Monitor, QueueStats};
pub use queue::{QueueManager, QueuePriority};
pub use retry::{BackoffStrategy, RetryDecision, RetryPolicy};
pub use stats::{InMemoryStatsCollector, JobEvent, JobEventType, JobStatistics, StatisticsCollector};
pub use store::{FailureOutcome, JobFilter, JobStore, MemoryStore};
pub use worker::{PoolHandle, Worker, WorkerPool};

#[cfg(feature = "postgres")]
pub use store::PostgresStore;

pub type Result<T> = std::result::Result<T, BacklotError>;
