use anyhow::Result;
use backlot::{JobStore, Monitor};
use clap::Subcommand;
use std::sync::Arc;

use crate::config::Config;
use crate::utils::display::StatsTable;
use crate::utils::store::open_postgres;

#[derive(Subcommand, Debug)]
pub enum QueueCommand {
    #[command(about = "Show job counts per queue and state")]
    Stats {
        #[arg(short = 'u', long, env = "DATABASE_URL", help = "Database connection URL")]
        database_url: Option<String>,
        #[arg(short = 'n', long, help = "Only show this queue")]
        queue: Option<String>,
        #[arg(long, help = "Also summarize failed and dead jobs")]
        failures: bool,
    },
}

impl QueueCommand {
    pub async fn execute(&self, config: &Config) -> Result<()> {
        let QueueCommand::Stats { database_url, .. } = self;
        let store: Arc<dyn JobStore> =
            Arc::new(open_postgres(config, database_url.as_deref()).await?);
        self.execute_with(store).await
    }

    pub async fn execute_with(&self, store: Arc<dyn JobStore>) -> Result<()> {
        let monitor = Monitor::new(store);
        match self {
            QueueCommand::Stats {
                queue, failures, ..
            } => {
                let stats = match queue {
                    Some(queue) => vec![monitor.queue(queue).await?],
                    None => monitor.queue_stats().await?,
                };

                if stats.is_empty() {
                    println!("No jobs in any queue");
                } else {
                    let mut table = StatsTable::new();
                    for queue_stats in &stats {
                        table.add_queue(queue_stats);
                    }
                    println!("{}", table);
                }

                if *failures {
                    let summary = monitor.failure_summary().await?;
                    println!(
                        "\n💀 {} dead, 🔴 {} failed",
                        summary.total_dead, summary.total_failed
                    );
                    let mut patterns: Vec<_> = summary.error_patterns.into_iter().collect();
                    patterns.sort_by(|a, b| b.1.cmp(&a.1));
                    for (error, count) in patterns.iter().take(10) {
                        println!("  {:>5}  {}", count, error);
                    }
                }
            }
        }
        Ok(())
    }
}
