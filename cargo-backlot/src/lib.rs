//! # Cargo Backlot CLI
//!
//! Command-line interface for running and operating Backlot job queues.
//!
//! The CLI can be invoked either as a cargo subcommand or directly:
//!
//! ```bash
//! # As cargo subcommand
//! cargo backlot migrate --database-url postgresql://localhost/mydb
//!
//! # Direct invocation
//! cargo-backlot migrate --database-url postgresql://localhost/mydb
//! ```
//!
//! ## Common Commands
//!
//! ```bash
//! # Run a worker pool with demo jobs on an in-memory store
//! cargo backlot server run --demo 20
//!
//! # Enqueue a job
//! cargo backlot job enqueue --queue critical --job-type send_email \
//!   --payload '{"to": "user@example.com"}'
//!
//! # Inspect and recover
//! cargo backlot queue stats
//! cargo backlot job list --state dead
//! cargo backlot job retry <job-id>
//!
//! # Housekeeping
//! cargo backlot maintenance reap
//! cargo backlot maintenance purge --retention 7d
//! ```
//!
//! ## Configuration
//!
//! Settings are read from `~/.config/backlot/config.toml` (or the path in
//! `BACKLOT_CONFIG`), then overridden by `BACKLOT_*` environment variables.
//! `DATABASE_URL` is accepted wherever `--database-url` is.
//!
//! ```bash
//! cargo backlot config init
//! cargo backlot config show
//! ```

pub mod commands;
pub mod config;
pub mod utils;

pub use commands::*;
pub use config::*;
pub use utils::*;
