use anyhow::Result;
use backlot::JobStore;
use backlot::config::format_duration;
use backlot::maintenance::Maintenance;
use clap::Subcommand;
use std::sync::Arc;
use tracing::info;

use crate::config::Config;
use crate::utils::store::open_postgres;
use crate::utils::validation::parse_duration;

#[derive(Subcommand, Debug)]
pub enum MaintenanceCommand {
    #[command(about = "Delete succeeded, failed and dead jobs older than the retention window")]
    Purge {
        #[arg(short = 'u', long, env = "DATABASE_URL", help = "Database connection URL")]
        database_url: Option<String>,
        #[arg(long, help = "Retention window, e.g. 24h or 7d (defaults to the configured one)")]
        retention: Option<String>,
    },
    #[command(about = "Return jobs with expired leases to their queues")]
    Reap {
        #[arg(short = 'u', long, env = "DATABASE_URL", help = "Database connection URL")]
        database_url: Option<String>,
    },
    #[command(about = "Make scheduled jobs whose due time has passed visible")]
    Promote {
        #[arg(short = 'u', long, env = "DATABASE_URL", help = "Database connection URL")]
        database_url: Option<String>,
    },
}

impl MaintenanceCommand {
    fn database_url(&self) -> Option<&str> {
        match self {
            MaintenanceCommand::Purge { database_url, .. }
            | MaintenanceCommand::Reap { database_url }
            | MaintenanceCommand::Promote { database_url } => database_url.as_deref(),
        }
    }

    pub async fn execute(&self, config: &Config) -> Result<()> {
        let store: Arc<dyn JobStore> = Arc::new(open_postgres(config, self.database_url()).await?);
        self.execute_with(config, store).await
    }

    pub async fn execute_with(&self, config: &Config, store: Arc<dyn JobStore>) -> Result<()> {
        let mut server = config.settings.server.clone();

        match self {
            MaintenanceCommand::Purge { retention, .. } => {
                if let Some(retention) = retention {
                    server.retention = parse_duration(retention)?;
                }
                let maintenance = Maintenance::new(store, &server);
                let purged = maintenance.purge_once().await?;
                info!("Purged {} jobs", purged);
                println!(
                    "🧹 Purged {} finished jobs older than {}",
                    purged,
                    format_duration(server.retention)
                );
            }
            MaintenanceCommand::Reap { .. } => {
                let maintenance = Maintenance::new(store, &server);
                let reaped = maintenance.reap_once().await?;
                println!("⏰ Reaped {} expired leases", reaped.len());
                for job_id in reaped {
                    println!("  {}", job_id);
                }
            }
            MaintenanceCommand::Promote { .. } => {
                let maintenance = Maintenance::new(store, &server);
                let promoted = maintenance.promote_once().await?;
                println!("📅 Promoted {} scheduled jobs", promoted);
            }
        }
        Ok(())
    }
}
