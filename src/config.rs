//! Configuration for stores, worker pools, retries and logging.
//!
//! Configuration is plain serde data. It can be loaded from TOML, overridden
//! from `BACKLOT_*` environment variables, and must pass
//! [`BacklotConfig::validate`] before a pool is started. Durations are written
//! as human strings such as `"500ms"`, `"30s"`, `"5m"`, `"1h"` or `"1d"`.
//!
//! ```toml
//! [store]
//! backend = "postgres"
//! database_url = "postgresql://localhost/backlot"
//!
//! [server]
//! queues = ["critical", "default", "low-priority"]
//! worker_count = 20
//! lease_duration = "5m"
//! poll_interval = "0s"
//!
//! [retry]
//! max_attempts = 10
//!
//! [retry.backoff]
//! type = "exponential"
//! base = "1s"
//! multiplier = 2.0
//! ```

use crate::{BacklotError, Result, queue::QueuePriority, retry::RetryPolicy};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Parses `"250ms"`, `"30s"`, `"5m"`, `"1h"`, `"2d"`, or a bare number of
/// seconds. `"us"` and `"ns"` are accepted for sub-millisecond values.
pub fn parse_duration(s: &str) -> Result<Duration> {
    let s = s.trim();
    if let Ok(secs) = s.parse::<u64>() {
        return Ok(Duration::from_secs(secs));
    }

    let split = s
        .find(|c: char| !c.is_ascii_digit())
        .filter(|&index| index > 0)
        .ok_or_else(|| BacklotError::Config(format!("Invalid duration format: {}", s)))?;
    let (number, unit) = s.split_at(split);
    let value: u64 = number
        .parse()
        .map_err(|_| BacklotError::Config(format!("Invalid number in duration: {}", s)))?;

    let out_of_range = || BacklotError::Config(format!("Duration out of range: {}", s));
    let multiplier = match unit.trim() {
        "ns" => return Ok(Duration::from_nanos(value)),
        "us" => return Ok(Duration::from_micros(value)),
        "ms" => return Ok(Duration::from_millis(value)),
        "s" => 1,
        "m" => 60,
        "h" => 3600,
        "d" => 86400,
        other => {
            return Err(BacklotError::Config(format!(
                "Invalid duration suffix '{}' in {}. Use ns, us, ms, s, m, h, or d",
                other, s
            )));
        }
    };
    value
        .checked_mul(multiplier)
        .map(Duration::from_secs)
        .ok_or_else(out_of_range)
}

/// Shortest exact rendering of `duration` in the units `parse_duration`
/// accepts.
pub fn format_duration(duration: Duration) -> String {
    let nanos = duration.subsec_nanos();
    if nanos % 1_000 != 0 {
        return format!("{}ns", duration.as_nanos());
    }
    if nanos % 1_000_000 != 0 {
        return format!("{}us", duration.as_micros());
    }
    if nanos != 0 {
        return format!("{}ms", duration.as_millis());
    }
    let secs = duration.as_secs();
    if secs == 0 {
        "0s".to_string()
    } else if secs % 86400 == 0 {
        format!("{}d", secs / 86400)
    } else if secs % 3600 == 0 {
        format!("{}h", secs / 3600)
    } else if secs % 60 == 0 {
        format!("{}m", secs / 60)
    } else {
        format!("{}s", secs)
    }
}

/// Serde adapter for `Duration` fields as human-readable strings.
pub(crate) mod duration_str {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&super::format_duration(*duration))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        use serde::de::Error;

        let s = String::deserialize(deserializer)?;
        super::parse_duration(&s).map_err(D::Error::custom)
    }
}

/// Like `duration_str`, for optional fields.
pub(crate) mod option_duration_str {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match duration {
            Some(duration) => serializer.serialize_str(&super::format_duration(*duration)),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
    where
        D: Deserializer<'de>,
    {
        use serde::de::Error;

        Option::<String>::deserialize(deserializer)?
            .map(|s| super::parse_duration(&s).map_err(D::Error::custom))
            .transpose()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum StoreBackend {
    /// In-process store; jobs do not survive a restart.
    #[default]
    Memory,
    Postgres,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    pub backend: StoreBackend,
    pub database_url: String,
    pub pool_size: u32,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: StoreBackend::Memory,
            database_url: "postgresql://localhost/backlot".to_string(),
            pool_size: 10,
        }
    }
}

/// Worker pool settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Prefix for worker ids.
    pub server_name: String,
    /// Queues to consume, highest priority first.
    pub queues: QueuePriority,
    pub worker_count: usize,
    #[serde(with = "duration_str")]
    pub lease_duration: Duration,
    /// Idle wait between polls when no job is visible.
    #[serde(with = "duration_str")]
    pub poll_interval: Duration,
    /// Upper bound of the random delay added to each idle wait.
    #[serde(with = "duration_str")]
    pub poll_jitter: Duration,
    /// How often scheduled jobs are checked for promotion.
    #[serde(with = "duration_str")]
    pub promote_interval: Duration,
    /// How often expired leases are recovered.
    #[serde(with = "duration_str")]
    pub reap_interval: Duration,
    /// How often finished jobs past retention are purged.
    #[serde(with = "duration_str")]
    pub purge_interval: Duration,
    /// How long finished jobs are kept.
    #[serde(with = "duration_str")]
    pub retention: Duration,
    /// Executions running longer than this are aborted and counted as
    /// failures.
    #[serde(
        with = "option_duration_str",
        skip_serializing_if = "Option::is_none"
    )]
    pub job_timeout: Option<Duration>,
    /// Renew the lease this often while a job runs.
    #[serde(
        with = "option_duration_str",
        skip_serializing_if = "Option::is_none"
    )]
    pub heartbeat_interval: Option<Duration>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        let parallelism = std::thread::available_parallelism().map_or(1, |n| n.get());
        Self {
            server_name: "backlot".to_string(),
            queues: QueuePriority::default(),
            worker_count: parallelism * 5,
            lease_duration: Duration::from_secs(5 * 60),
            poll_interval: Duration::from_secs(1),
            poll_jitter: Duration::from_millis(100),
            promote_interval: Duration::from_millis(50),
            reap_interval: Duration::from_secs(1),
            purge_interval: Duration::from_secs(5 * 60),
            retention: Duration::from_secs(24 * 60 * 60),
            job_timeout: None,
            heartbeat_interval: None,
        }
    }
}

impl ServerConfig {
    pub fn validate(&self) -> Result<()> {
        if self.server_name.trim().is_empty() {
            return Err(BacklotError::Config(
                "server name cannot be empty".to_string(),
            ));
        }
        if self.worker_count == 0 {
            return Err(BacklotError::Config(
                "worker count must be at least 1".to_string(),
            ));
        }
        if self.lease_duration.is_zero() {
            return Err(BacklotError::Config(
                "lease duration must be greater than zero".to_string(),
            ));
        }
        if self.job_timeout.is_some_and(|timeout| timeout.is_zero()) {
            return Err(BacklotError::Config(
                "job timeout must be greater than zero".to_string(),
            ));
        }
        if let Some(heartbeat) = self.heartbeat_interval {
            if heartbeat.is_zero() || heartbeat >= self.lease_duration {
                return Err(BacklotError::Config(format!(
                    "heartbeat interval {} must be non-zero and shorter than the lease duration {}",
                    format_duration(heartbeat),
                    format_duration(self.lease_duration)
                )));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Default filter directive; `RUST_LOG` takes precedence.
    pub level: String,
    pub json_format: bool,
    pub include_target: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json_format: false,
            include_target: true,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BacklotConfig {
    pub store: StoreConfig,
    pub server: ServerConfig,
    pub retry: RetryPolicy,
    pub logging: LoggingConfig,
}

impl BacklotConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load configuration from a TOML file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Self = toml::from_str(&content)?;
        Ok(config)
    }

    /// Save configuration to a TOML file
    pub fn save_to_file(&self, path: impl AsRef<Path>) -> Result<()> {
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Defaults overridden by `BACKLOT_*` environment variables.
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();
        config.apply_env_overrides()?;
        Ok(config)
    }

    /// The file at `path` if given and present, else defaults; then
    /// environment overrides; then validation.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) if path.exists() => Self::from_file(path)?,
            _ => Self::default(),
        };
        config.apply_env_overrides()?;
        config.validate()?;
        Ok(config)
    }

    pub fn apply_env_overrides(&mut self) -> Result<()> {
        if let Some(backend) = env_var("BACKLOT_STORE") {
            self.store.backend = match backend.to_ascii_lowercase().as_str() {
                "memory" => StoreBackend::Memory,
                "postgres" | "postgresql" => StoreBackend::Postgres,
                other => {
                    return Err(BacklotError::Config(format!(
                        "BACKLOT_STORE must be 'memory' or 'postgres', got '{}'",
                        other
                    )));
                }
            };
        }
        if let Some(url) = env_var("BACKLOT_DATABASE_URL") {
            self.store.database_url = url;
        }
        if let Some(pool_size) = env_var("BACKLOT_POOL_SIZE") {
            self.store.pool_size = parse_number("BACKLOT_POOL_SIZE", &pool_size)?;
        }

        if let Some(name) = env_var("BACKLOT_SERVER_NAME") {
            self.server.server_name = name;
        }
        if let Some(queues) = env_var("BACKLOT_QUEUES") {
            self.server.queues =
                QueuePriority::new(queues.split(',').map(str::trim).filter(|q| !q.is_empty()))?;
        }
        if let Some(count) = env_var("BACKLOT_WORKER_COUNT") {
            self.server.worker_count = parse_number("BACKLOT_WORKER_COUNT", &count)?;
        }
        if let Some(lease) = env_var("BACKLOT_LEASE_DURATION") {
            self.server.lease_duration = parse_duration(&lease)?;
        }
        if let Some(poll) = env_var("BACKLOT_POLL_INTERVAL") {
            self.server.poll_interval = parse_duration(&poll)?;
        }
        if let Some(retention) = env_var("BACKLOT_RETENTION") {
            self.server.retention = parse_duration(&retention)?;
        }
        if let Some(timeout) = env_var("BACKLOT_JOB_TIMEOUT") {
            self.server.job_timeout = Some(parse_duration(&timeout)?);
        }

        if let Some(attempts) = env_var("BACKLOT_MAX_ATTEMPTS") {
            self.retry.max_attempts = parse_number("BACKLOT_MAX_ATTEMPTS", &attempts)?;
        }
        if let Some(delay) = env_var("BACKLOT_RETRY_BASE_DELAY") {
            let delay = parse_duration(&delay)?;
            match &mut self.retry.backoff {
                crate::retry::BackoffStrategy::Fixed { delay: base }
                | crate::retry::BackoffStrategy::Linear { base, .. }
                | crate::retry::BackoffStrategy::Exponential { base, .. } => *base = delay,
            }
        }

        if let Some(level) = env_var("BACKLOT_LOG_LEVEL") {
            self.logging.level = level;
        }
        if let Some(json) = env_var("BACKLOT_LOG_JSON") {
            self.logging.json_format = matches!(json.as_str(), "1" | "true" | "yes");
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        self.server.validate()?;
        if self.retry.max_attempts == 0 {
            return Err(BacklotError::Config(
                "retry max_attempts must be at least 1".to_string(),
            ));
        }
        if self.store.backend == StoreBackend::Postgres && self.store.database_url.is_empty() {
            return Err(BacklotError::Config(
                "a database URL is required for the postgres store".to_string(),
            ));
        }
        if self.store.pool_size == 0 {
            return Err(BacklotError::Config(
                "store pool size must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    pub fn with_store(mut self, backend: StoreBackend) -> Self {
        self.store.backend = backend;
        self
    }

    pub fn with_database_url(mut self, url: impl Into<String>) -> Self {
        self.store.backend = StoreBackend::Postgres;
        self.store.database_url = url.into();
        self
    }

    pub fn with_queues(mut self, queues: QueuePriority) -> Self {
        self.server.queues = queues;
        self
    }

    pub fn with_worker_count(mut self, worker_count: usize) -> Self {
        self.server.worker_count = worker_count;
        self
    }

    pub fn with_lease_duration(mut self, lease_duration: Duration) -> Self {
        self.server.lease_duration = lease_duration;
        self
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.server.poll_interval = poll_interval;
        self
    }

    pub fn with_retention(mut self, retention: Duration) -> Self {
        self.server.retention = retention;
        self
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }
}

fn env_var(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|value| !value.trim().is_empty())
}

fn parse_number<T: std::str::FromStr>(name: &str, value: &str) -> Result<T> {
    value
        .trim()
        .parse()
        .map_err(|_| BacklotError::Config(format!("{} must be a number, got '{}'", name, value)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::retry::BackoffStrategy;
    use tempfile::tempdir;

    #[test]
    fn test_parse_duration_units() {
        assert_eq!(parse_duration("250ms").unwrap(), Duration::from_millis(250));
        assert_eq!(parse_duration("30s").unwrap(), Duration::from_secs(30));
        assert_eq!(parse_duration("5m").unwrap(), Duration::from_secs(300));
        assert_eq!(parse_duration("1h").unwrap(), Duration::from_secs(3600));
        assert_eq!(parse_duration("2d").unwrap(), Duration::from_secs(172_800));
        assert_eq!(parse_duration("90").unwrap(), Duration::from_secs(90));
        assert_eq!(parse_duration(" 0s ").unwrap(), Duration::ZERO);
        assert!(parse_duration("5w").is_err());
        assert!(parse_duration("s").is_err());
        assert!(parse_duration("abc").is_err());
        assert_eq!(parse_duration("1500us").unwrap(), Duration::from_micros(1500));
        assert_eq!(parse_duration("7ns").unwrap(), Duration::from_nanos(7));
    }

    #[test]
    fn test_parse_duration_rejects_multibyte_suffix() {
        for input in ["1µ", "5é", "10µs", "µ"] {
            match parse_duration(input) {
                Err(BacklotError::Config(message)) => assert!(message.contains(input.trim())),
                other => panic!("expected config error for {input}, got {other:?}"),
            }
        }
    }

    #[test]
    fn test_format_duration_picks_largest_exact_unit() {
        assert_eq!(format_duration(Duration::ZERO), "0s");
        assert_eq!(format_duration(Duration::from_millis(1500)), "1500ms");
        assert_eq!(format_duration(Duration::from_secs(45)), "45s");
        assert_eq!(format_duration(Duration::from_secs(300)), "5m");
        assert_eq!(format_duration(Duration::from_secs(7200)), "2h");
        assert_eq!(format_duration(Duration::from_secs(86400)), "1d");
        assert_eq!(format_duration(Duration::from_micros(1500)), "1500us");
        assert_eq!(format_duration(Duration::from_nanos(2_000_000_001)), "2000000001ns");
    }

    #[test]
    fn test_format_duration_round_trips() {
        for duration in [
            Duration::from_nanos(1),
            Duration::from_micros(250),
            Duration::from_millis(1500),
            Duration::new(90, 123_456_789),
            Duration::from_secs(3 * 86400),
        ] {
            assert_eq!(parse_duration(&format_duration(duration)).unwrap(), duration);
        }
    }

    #[test]
    fn test_defaults_are_valid() {
        let config = BacklotConfig::default();
        config.validate().unwrap();
        assert_eq!(config.server.queues.names(), ["default"]);
        assert!(config.server.worker_count >= 5);
        assert_eq!(config.server.lease_duration, Duration::from_secs(300));
        assert_eq!(config.store.backend, StoreBackend::Memory);
    }

    #[test]
    fn test_config_file_round_trip() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("backlot.toml");

        let mut config = BacklotConfig::new()
            .with_database_url("postgresql://localhost/jobs")
            .with_queues(QueuePriority::new(["critical", "default", "low-priority"]).unwrap())
            .with_worker_count(12)
            .with_poll_interval(Duration::ZERO);
        config.server.job_timeout = Some(Duration::from_secs(120));

        config.save_to_file(&path).unwrap();
        let content = std::fs::read_to_string(&path).unwrap();
        assert!(content.contains("poll_interval = \"0s\""));
        assert!(content.contains("job_timeout = \"2m\""));
        assert!(!content.contains("heartbeat_interval"));

        let loaded = BacklotConfig::from_file(&path).unwrap();
        assert_eq!(loaded, config);
    }

    #[test]
    fn test_partial_file_uses_defaults() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("partial.toml");
        std::fs::write(
            &path,
            r#"
            [server]
            queues = ["critical", "default"]
            lease_duration = "1s"

            [retry]
            max_attempts = 3

            [retry.backoff]
            type = "fixed"
            delay = "500ms"
            "#,
        )
        .unwrap();

        let config = BacklotConfig::from_file(&path).unwrap();
        assert_eq!(config.server.queues.len(), 2);
        assert_eq!(config.server.lease_duration, Duration::from_secs(1));
        assert_eq!(config.server.poll_interval, Duration::from_secs(1));
        assert_eq!(config.retry.max_attempts, 3);
        assert_eq!(
            config.retry.backoff,
            BackoffStrategy::fixed(Duration::from_millis(500))
        );
    }

    #[test]
    fn test_invalid_queue_in_file_is_rejected() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("bad.toml");
        std::fs::write(&path, "[server]\nqueues = [\"Critical Jobs\"]\n").unwrap();
        assert!(BacklotConfig::from_file(&path).is_err());
    }

    #[test]
    fn test_multibyte_duration_in_file_is_rejected() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("bad.toml");
        std::fs::write(&path, "[server]\nlease_duration = \"5µ\"\n").unwrap();

        let err = BacklotConfig::from_file(&path).unwrap_err();
        assert!(err.to_string().contains("5µ"));
        assert!(BacklotConfig::load(Some(&path)).is_err());
    }

    #[test]
    fn test_validation_errors() {
        let zero_workers = BacklotConfig::new().with_worker_count(0);
        assert!(matches!(
            zero_workers.validate(),
            Err(BacklotError::Config(_))
        ));

        let zero_lease = BacklotConfig::new().with_lease_duration(Duration::ZERO);
        assert!(zero_lease.validate().is_err());

        let mut slow_heartbeat = BacklotConfig::new().with_lease_duration(Duration::from_secs(10));
        slow_heartbeat.server.heartbeat_interval = Some(Duration::from_secs(10));
        assert!(slow_heartbeat.validate().is_err());

        let no_attempts = BacklotConfig::new().with_retry_policy(RetryPolicy::new(0));
        assert!(no_attempts.validate().is_err());
    }

    #[test]
    fn test_env_config() {
        unsafe {
            std::env::set_var("BACKLOT_STORE", "postgres");
            std::env::set_var("BACKLOT_DATABASE_URL", "postgresql://env/test");
            std::env::set_var("BACKLOT_QUEUES", "critical, default ,low-priority");
            std::env::set_var("BACKLOT_WORKER_COUNT", "12");
            std::env::set_var("BACKLOT_LEASE_DURATION", "90s");
            std::env::set_var("BACKLOT_RETRY_BASE_DELAY", "250ms");
        }

        let config = BacklotConfig::from_env().unwrap();

        assert_eq!(config.store.backend, StoreBackend::Postgres);
        assert_eq!(config.store.database_url, "postgresql://env/test");
        assert_eq!(
            config.server.queues.names(),
            ["critical", "default", "low-priority"]
        );
        assert_eq!(config.server.worker_count, 12);
        assert_eq!(config.server.lease_duration, Duration::from_secs(90));
        assert_eq!(config.retry.backoff.base_delay(), Duration::from_millis(250));

        unsafe {
            std::env::remove_var("BACKLOT_STORE");
            std::env::remove_var("BACKLOT_DATABASE_URL");
            std::env::remove_var("BACKLOT_QUEUES");
            std::env::remove_var("BACKLOT_WORKER_COUNT");
            std::env::remove_var("BACKLOT_LEASE_DURATION");
            std::env::remove_var("BACKLOT_RETRY_BASE_DELAY");
        }
    }
}
