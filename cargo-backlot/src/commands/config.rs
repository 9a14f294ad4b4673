use anyhow::Result;
use backlot::BacklotConfig;
use backlot::config::format_duration;
use clap::Subcommand;
use comfy_table::Table;
use tracing::info;

use crate::config::Config;

#[derive(Subcommand, Debug)]
pub enum ConfigCommand {
    #[command(about = "Show the effective configuration")]
    Show {
        #[arg(long = "toml", help = "Print as TOML instead of a table")]
        as_toml: bool,
    },
    #[command(about = "Write a configuration file with default settings")]
    Init {
        #[arg(long, help = "Overwrite an existing configuration file")]
        force: bool,
    },
    #[command(about = "Show configuration file path")]
    Path,
}

impl ConfigCommand {
    pub async fn execute(&self, config: &Config) -> Result<()> {
        match self {
            ConfigCommand::Show { as_toml } => {
                if *as_toml {
                    print!("{}", toml::to_string_pretty(&config.settings)?);
                } else {
                    println!("⚙️  Backlot Configuration");
                    println!("════════════════════════");
                    println!("{}", settings_table(config));
                }
            }
            ConfigCommand::Init { force } => {
                if config.path.exists() && !force {
                    anyhow::bail!(
                        "{} already exists; pass --force to overwrite it",
                        config.path.display()
                    );
                }
                Config::with_settings(BacklotConfig::default(), config.path.clone()).save()?;
                info!("Wrote default configuration");
                println!("✅ Wrote {}", config.path.display());
            }
            ConfigCommand::Path => {
                println!("📁 {}", config.path.display());
                if !config.from_file {
                    println!("   (file does not exist; defaults and environment are in effect)");
                }
            }
        }
        Ok(())
    }
}

/// The settings an operator most often checks, one row each.
pub fn settings_table(config: &Config) -> Table {
    let settings = &config.settings;
    let source = if config.from_file {
        "config file + env"
    } else {
        "defaults + env"
    };

    let mut table = Table::new();
    table.set_header(vec!["Setting", "Value"]);
    table.add_row(vec!["source".to_string(), source.to_string()]);
    table.add_row(vec![
        "store.backend".to_string(),
        format!("{:?}", settings.store.backend).to_lowercase(),
    ]);
    table.add_row(vec![
        "store.database_url".to_string(),
        settings.store.database_url.clone(),
    ]);
    table.add_row(vec![
        "store.pool_size".to_string(),
        settings.store.pool_size.to_string(),
    ]);
    table.add_row(vec![
        "server.queues".to_string(),
        settings.server.queues.to_string(),
    ]);
    table.add_row(vec![
        "server.worker_count".to_string(),
        settings.server.worker_count.to_string(),
    ]);
    table.add_row(vec![
        "server.lease_duration".to_string(),
        format_duration(settings.server.lease_duration),
    ]);
    table.add_row(vec![
        "server.poll_interval".to_string(),
        format_duration(settings.server.poll_interval),
    ]);
    table.add_row(vec![
        "server.retention".to_string(),
        format_duration(settings.server.retention),
    ]);
    table.add_row(vec![
        "server.job_timeout".to_string(),
        settings
            .server
            .job_timeout
            .map(format_duration)
            .unwrap_or_else(|| "none".to_string()),
    ]);
    table.add_row(vec![
        "retry.max_attempts".to_string(),
        settings.retry.max_attempts.to_string(),
    ]);
    table.add_row(vec![
        "logging.level".to_string(),
        settings.logging.level.clone(),
    ]);
    table
}
