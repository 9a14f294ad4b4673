use anyhow::Result;
use backlot::config::LoggingConfig;
use clap::{Parser, Subcommand};
use std::env;
use std::path::PathBuf;
use tracing::{error, info};

use cargo_backlot::commands::*;
use cargo_backlot::config::{Config, log_directives};

#[derive(Parser)]
#[command(name = "cargo-backlot")]
#[command(bin_name = "cargo-backlot")]
#[command(about = "Run Backlot workers and operate Backlot job queues")]
#[command(version, propagate_version = true)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    #[arg(short, long, global = true, help = "Enable verbose logging")]
    verbose: bool,

    #[arg(short, long, global = true, help = "Suppress output except errors")]
    quiet: bool,

    #[arg(
        short,
        long,
        global = true,
        env = "BACKLOT_CONFIG",
        help = "Path to the configuration file"
    )]
    config: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    #[command(about = "Create or update the Postgres job store schema")]
    Migrate(MigrateArgs),

    #[command(about = "Run worker pools")]
    Server {
        #[command(subcommand)]
        command: ServerCommand,
    },

    #[command(about = "Job management operations")]
    Job {
        #[command(subcommand)]
        command: JobCommand,
    },

    #[command(about = "Queue inspection")]
    Queue {
        #[command(subcommand)]
        command: QueueCommand,
    },

    #[command(about = "Promote, reap and purge jobs by hand")]
    Maintenance {
        #[command(subcommand)]
        command: MaintenanceCommand,
    },

    #[command(about = "Configuration management")]
    Config {
        #[command(subcommand)]
        command: ConfigCommand,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    // `cargo backlot ...` passes "backlot" as the first argument
    let args = env::args_os().collect::<Vec<_>>();
    let is_cargo_subcommand = args.get(1).map(|s| s == "backlot").unwrap_or(false);

    let cli = if is_cargo_subcommand {
        Cli::parse_from(args.into_iter().skip(1))
    } else {
        Cli::parse()
    };

    // A missing file means defaults; anything unreadable or invalid is fatal
    let config = match Config::load(cli.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("❌ Invalid configuration: {:#}", e);
            std::process::exit(1);
        }
    };

    setup_logging(&cli, &config)?;

    match execute_command(&cli.command, &config).await {
        Ok(()) => {
            if cli.verbose {
                info!("✅ Command completed successfully");
            }
        }
        Err(e) => {
            error!("❌ Command failed: {:#}", e);
            std::process::exit(1);
        }
    }

    Ok(())
}

fn setup_logging(cli: &Cli, config: &Config) -> Result<()> {
    let configured = &config.settings.logging;
    let log_level = if cli.quiet {
        "error"
    } else if cli.verbose {
        "debug"
    } else {
        configured.level.as_str()
    };

    let logging = LoggingConfig {
        level: log_directives(log_level),
        json_format: configured.json_format,
        include_target: false,
    };
    backlot::logging::init_logging(&logging)?;
    Ok(())
}

async fn execute_command(command: &Commands, config: &Config) -> Result<()> {
    match command {
        Commands::Migrate(args) => args.execute(config).await,
        Commands::Server { command } => command.execute(config).await,
        Commands::Job { command } => command.execute(config).await,
        Commands::Queue { command } => command.execute(config).await,
        Commands::Maintenance { command } => command.execute(config).await,
        Commands::Config { command } => command.execute(config).await,
    }
}
