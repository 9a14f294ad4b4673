use anyhow::Result;
use backlot::{
    Client, HandlerRegistry, InMemoryStatsCollector, JobContext, JobError, Payload,
    QueuePriority, StatisticsCollector, WorkerPool,
};
use clap::Subcommand;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

use crate::config::Config;
use crate::utils::store::open_store;

/// Job type registered by `server run --demo`.
pub const DEMO_JOB_TYPE: &str = "demo";
pub const DEMO_QUEUES: [&str; 3] = ["critical", "default", "low-priority"];

#[derive(Subcommand, Debug)]
pub enum ServerCommand {
    #[command(about = "Run a worker pool until interrupted")]
    Run {
        #[arg(short = 'u', long, env = "DATABASE_URL", help = "Database connection URL")]
        database_url: Option<String>,
        #[arg(
            short = 'n',
            long = "queue",
            help = "Queue to consume, highest priority first (repeatable)"
        )]
        queues: Vec<String>,
        #[arg(short, long, help = "Number of workers")]
        workers: Option<usize>,
        #[arg(long, value_name = "N", help = "Enqueue N demo jobs and register a demo handler")]
        demo: Option<usize>,
    },
}

impl ServerCommand {
    pub async fn execute(&self, config: &Config) -> Result<()> {
        match self {
            ServerCommand::Run {
                database_url,
                queues,
                workers,
                demo,
            } => {
                run_server(config, database_url.as_deref(), queues, *workers, *demo).await?;
            }
        }
        Ok(())
    }
}

/// Registry holding the demo handler, which logs its worker and sleeps a
/// second.
pub fn demo_registry() -> Result<HandlerRegistry> {
    let mut registry = HandlerRegistry::new();
    registry.register_fn(DEMO_JOB_TYPE, |ctx: JobContext| async move {
        info!(
            "Worker {} running demo job {} from {} (attempt {})",
            ctx.worker_id, ctx.job_id, ctx.queue_name, ctx.attempt
        );
        tokio::time::sleep(Duration::from_secs(1)).await;
        Ok::<(), JobError>(())
    })?;
    Ok(registry)
}

async fn run_server(
    config: &Config,
    database_url: Option<&str>,
    queues: &[String],
    workers: Option<usize>,
    demo: Option<usize>,
) -> Result<()> {
    let mut server = config.settings.server.clone();
    if !queues.is_empty() {
        server.queues = QueuePriority::new(queues.iter().cloned())?;
    } else if demo.is_some() {
        server.queues = QueuePriority::new(DEMO_QUEUES)?;
    }
    if let Some(workers) = workers {
        server.worker_count = workers;
    }

    let store = open_store(config, database_url).await?;
    let registry = if demo.is_some() {
        demo_registry()?
    } else {
        HandlerRegistry::new()
    };

    let stats = Arc::new(InMemoryStatsCollector::default());
    let pool = WorkerPool::new(Arc::clone(&store), registry, server)?
        .with_retry_policy(config.settings.retry.clone())
        .with_stats_collector(stats.clone());
    let handle = pool.start();

    if let Some(count) = demo {
        let client = Client::new(store);
        for index in 0..count {
            let queue = DEMO_QUEUES[index % DEMO_QUEUES.len()];
            let payload = Payload::json(DEMO_JOB_TYPE, &serde_json::json!({ "index": index }))?;
            client.enqueue(queue, payload).await?;
        }
        println!("📥 Enqueued {} demo jobs", count);
    }

    println!(
        "🚀 Running {} workers on {} (Ctrl-C to stop)",
        handle.worker_ids().len(),
        pool.config().queues
    );
    tokio::signal::ctrl_c().await?;

    println!("🛑 Draining in-flight jobs...");
    handle.shutdown().await?;

    let summary = stats.get_system_statistics(Duration::from_secs(24 * 60 * 60)).await?;
    println!(
        "📊 Processed {} jobs: {} succeeded, {} retried, {} failed, {} dead",
        summary.total_processed, summary.succeeded, summary.retried, summary.failed, summary.dead
    );
    Ok(())
}
