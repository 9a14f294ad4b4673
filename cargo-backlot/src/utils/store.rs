//! Opening job stores from CLI settings.

use anyhow::{Context, Result};
use backlot::{JobStore, MemoryStore, PostgresStore};
use std::sync::Arc;
use tracing::{info, warn};

use crate::config::Config;
use crate::utils::validation::validate_database_url;

/// Connects to the Postgres store named by `database_url` or the
/// configuration. Commands that inspect or change existing jobs need this.
pub async fn open_postgres(config: &Config, database_url: Option<&str>) -> Result<PostgresStore> {
    let url = config.database_url(database_url).ok_or_else(|| {
        anyhow::anyhow!(
            "No database URL. Pass --database-url, set DATABASE_URL, or set [store] backend = \"postgres\" in {}",
            config.path.display()
        )
    })?;
    validate_database_url(&url)?;

    let store = PostgresStore::connect(&url, config.pool_size())
        .await
        .context("Failed to connect to the job store")?;
    info!("Connected to Postgres job store");
    Ok(store)
}

/// Postgres when a URL is available, otherwise an in-process memory store.
pub async fn open_store(config: &Config, database_url: Option<&str>) -> Result<Arc<dyn JobStore>> {
    if config.database_url(database_url).is_some() {
        let store = open_postgres(config, database_url).await?;
        store.create_tables().await?;
        return Ok(Arc::new(store));
    }

    warn!("No database configured; using an in-memory store. Jobs will not survive a restart.");
    Ok(Arc::new(MemoryStore::new()))
}
