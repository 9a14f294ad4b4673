pub mod config;
pub mod job;
pub mod maintenance;
pub mod migration;
pub mod queue;
pub mod server;

pub use config::ConfigCommand;
pub use job::JobCommand;
pub use maintenance::MaintenanceCommand;
pub use migration::MigrateArgs;
pub use queue::QueueCommand;
pub use server::ServerCommand;
