use anyhow::{Context, Result};
use backlot::{BacklotConfig, config::StoreBackend};
use std::env;
use std::fs;
use std::path::{Path, PathBuf};

pub const CONFIG_PATH_ENV: &str = "BACKLOT_CONFIG";

/// Engine settings plus where they were loaded from.
#[derive(Debug, Clone)]
pub struct Config {
    pub settings: BacklotConfig,
    pub path: PathBuf,
    pub from_file: bool,
}

impl Config {
    /// Reads `path` or the default config file if it exists, then applies
    /// environment overrides and validates.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let path = match path {
            Some(path) => path.to_path_buf(),
            None => Self::config_file_path()?,
        };
        let from_file = path.exists();
        let settings = BacklotConfig::load(Some(&path))
            .with_context(|| format!("Failed to load configuration from {}", path.display()))?;
        Ok(Self {
            settings,
            path,
            from_file,
        })
    }

    pub fn with_settings(settings: BacklotConfig, path: PathBuf) -> Self {
        Self {
            settings,
            path,
            from_file: false,
        }
    }

    pub fn save(&self) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        self.settings.save_to_file(&self.path)?;
        Ok(())
    }

    /// `BACKLOT_CONFIG`, else `<config dir>/backlot/config.toml`.
    pub fn config_file_path() -> Result<PathBuf> {
        if let Some(path) = env::var_os(CONFIG_PATH_ENV).filter(|p| !p.is_empty()) {
            return Ok(PathBuf::from(path));
        }

        let mut path = dirs::config_dir()
            .or_else(dirs::home_dir)
            .ok_or_else(|| anyhow::anyhow!("Cannot find config directory"))?;
        path.push("backlot");
        path.push("config.toml");
        Ok(path)
    }

    /// The explicit URL if given, otherwise the configured one when the
    /// configured backend is Postgres.
    pub fn database_url(&self, explicit: Option<&str>) -> Option<String> {
        explicit
            .map(str::to_string)
            .or_else(|| match self.settings.store.backend {
                StoreBackend::Postgres => Some(self.settings.store.database_url.clone()),
                StoreBackend::Memory => None,
            })
    }

    pub fn pool_size(&self) -> u32 {
        self.settings.store.pool_size
    }
}

/// Filter directives for a bare level such as `debug`, scoped to the CLI and
/// engine crates. Strings that already hold directives pass through.
pub fn log_directives(level: &str) -> String {
    let level = level.trim();
    if level.contains('=') || level.contains(',') {
        level.to_string()
    } else {
        format!("cargo_backlot={},backlot={}", level, level)
    }
}
