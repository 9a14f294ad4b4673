use anyhow::Result;
use backlot::{Client, JobFilter, JobStore, Monitor, Payload};
use clap::Subcommand;
use std::sync::Arc;
use tracing::info;

use crate::config::Config;
use crate::utils::display::{JobTable, job_details};
use crate::utils::store::open_postgres;
use crate::utils::validation::{
    parse_duration, parse_job_id, validate_json_payload, validate_queue, validate_state,
};

#[derive(Subcommand, Debug)]
pub enum JobCommand {
    #[command(about = "Enqueue a new job")]
    Enqueue {
        #[arg(short = 'u', long, env = "DATABASE_URL", help = "Database connection URL")]
        database_url: Option<String>,
        #[arg(short = 'n', long, default_value = "default", help = "Queue name")]
        queue: String,
        #[arg(short = 't', long, help = "Job type the handler is registered under")]
        job_type: String,
        #[arg(short = 'j', long, default_value = "{}", help = "Job payload as JSON")]
        payload: String,
        #[arg(long, help = "Delay before the job becomes visible, e.g. 30s or 5m")]
        delay: Option<String>,
    },
    #[command(about = "Show details of a specific job")]
    Show {
        #[arg(short = 'u', long, env = "DATABASE_URL", help = "Database connection URL")]
        database_url: Option<String>,
        #[arg(help = "Job ID")]
        job_id: String,
    },
    #[command(about = "List jobs")]
    List {
        #[arg(short = 'u', long, env = "DATABASE_URL", help = "Database connection URL")]
        database_url: Option<String>,
        #[arg(short = 'n', long, help = "Queue name to filter by")]
        queue: Option<String>,
        #[arg(short = 's', long, help = "Job state to filter by")]
        state: Option<String>,
        #[arg(short, long, default_value_t = 50, help = "Maximum number of jobs to display")]
        limit: u32,
        #[arg(long, default_value_t = 0, help = "Number of jobs to skip")]
        offset: u32,
    },
    #[command(about = "Requeue a failed, dead, scheduled or finished job to run now")]
    Retry {
        #[arg(short = 'u', long, env = "DATABASE_URL", help = "Database connection URL")]
        database_url: Option<String>,
        #[arg(help = "Job ID")]
        job_id: String,
    },
    #[command(about = "Delete a job that is not currently leased")]
    Delete {
        #[arg(short = 'u', long, env = "DATABASE_URL", help = "Database connection URL")]
        database_url: Option<String>,
        #[arg(help = "Job ID")]
        job_id: String,
    },
}

impl JobCommand {
    fn database_url(&self) -> Option<&str> {
        match self {
            JobCommand::Enqueue { database_url, .. }
            | JobCommand::Show { database_url, .. }
            | JobCommand::List { database_url, .. }
            | JobCommand::Retry { database_url, .. }
            | JobCommand::Delete { database_url, .. } => database_url.as_deref(),
        }
    }

    pub async fn execute(&self, config: &Config) -> Result<()> {
        let store: Arc<dyn JobStore> = Arc::new(open_postgres(config, self.database_url()).await?);
        self.execute_with(store).await
    }

    /// Runs the command against an already opened store.
    pub async fn execute_with(&self, store: Arc<dyn JobStore>) -> Result<()> {
        let monitor = Monitor::new(Arc::clone(&store));

        match self {
            JobCommand::Enqueue {
                queue,
                job_type,
                payload,
                delay,
                ..
            } => {
                validate_queue(queue)?;
                let value = validate_json_payload(payload)?;
                let payload = Payload::json(job_type.clone(), &value)?;
                let client = Client::new(store);
                let job_id = match delay {
                    Some(delay) => {
                        client
                            .enqueue_in(queue, payload, parse_duration(delay)?)
                            .await?
                    }
                    None => client.enqueue(queue, payload).await?,
                };
                info!("Enqueued job {} on {}", job_id, queue);
                println!("✅ Enqueued job {}", job_id);
            }
            JobCommand::Show { job_id, .. } => {
                let job = monitor.job(parse_job_id(job_id)?).await?;
                println!("{}", job_details(&job));
            }
            JobCommand::List {
                queue,
                state,
                limit,
                offset,
                ..
            } => {
                let mut filter = JobFilter::new().limit(*limit).offset(*offset);
                if let Some(queue) = queue {
                    filter = filter.queue(queue.clone());
                }
                if let Some(state) = state {
                    filter = filter.state(validate_state(state)?);
                }

                let jobs = monitor.jobs(&filter).await?;
                if jobs.is_empty() {
                    println!("No jobs found");
                    return Ok(());
                }
                let mut table = JobTable::new();
                for job in &jobs {
                    table.add_job(job);
                }
                println!("{}", table);
                println!("Showing {} jobs", jobs.len());
            }
            JobCommand::Retry { job_id, .. } => {
                let job_id = parse_job_id(job_id)?;
                monitor.retry(job_id).await?;
                println!("🔄 Job {} requeued", job_id);
            }
            JobCommand::Delete { job_id, .. } => {
                let job_id = parse_job_id(job_id)?;
                monitor.delete(job_id).await?;
                println!("🗑️  Job {} deleted", job_id);
            }
        }
        Ok(())
    }
}
