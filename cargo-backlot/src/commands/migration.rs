use anyhow::Result;
use clap::Args;
use tracing::info;

use crate::config::Config;
use crate::utils::store::open_postgres;

#[derive(Args, Debug)]
pub struct MigrateArgs {
    #[arg(short = 'u', long, env = "DATABASE_URL", help = "Database connection URL")]
    pub database_url: Option<String>,
    #[arg(long, help = "Print the schema instead of applying it")]
    pub print: bool,
}

impl MigrateArgs {
    pub async fn execute(&self, config: &Config) -> Result<()> {
        if self.print {
            println!("{}", backlot::store::postgres::SCHEMA.trim());
            return Ok(());
        }

        let store = open_postgres(config, self.database_url.as_deref()).await?;
        info!("Creating job store schema");
        store.create_tables().await?;
        println!("✅ Job store schema is up to date");
        Ok(())
    }
}
