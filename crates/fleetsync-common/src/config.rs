//! Configuration management for FleetSync
//!
//! Settings are layered, lowest priority first:
//! 1. Built-in defaults
//! 2. `conf/application.yml` (or an explicit file), if present
//! 3. Environment variables prefixed with `FLEETSYNC_`, using `__` between
//!    sections (e.g. `FLEETSYNC_LOCK__LEASE_DURATION_MS=5000`)
//! 4. Explicit overrides, typically from command line arguments

use std::path::Path;
use std::time::Duration;

use config::{Config, Environment, File};
use serde::Deserialize;

use crate::error::FleetSyncError;

pub const DEFAULT_CONFIG_FILE: &str = "conf/application.yml";

pub const DEFAULT_REDIS_HOST: &str = "127.0.0.1";
pub const DEFAULT_REDIS_PORT: u16 = 6379;
pub const DEFAULT_REDIS_POOL_SIZE: usize = 8;
pub const DEFAULT_DOMAIN: &str = "fleetsync";
pub const DEFAULT_LEASE_DURATION_MS: u64 = 10_000;
pub const DEFAULT_REFRESH_INTERVAL_MS: u64 = 100;
pub const DEFAULT_BACKGROUND_THREADS: usize = 2;
pub const DEFAULT_MAX_REFRESH_TASKS: usize = 1024;

/// Store connection settings
#[derive(Clone, Debug, Deserialize)]
pub struct RedisSettings {
    pub host: String,
    pub port: u16,
    pub pool_size: usize,
}

impl RedisSettings {
    pub fn url(&self) -> String {
        format!("redis://{}:{}/", self.host, self.port)
    }
}

/// Identity of this process within the fleet
#[derive(Clone, Debug, Deserialize)]
pub struct FleetSettings {
    /// Prefix shared by every key written by fleet collaborators
    pub domain: String,
    /// Name of this shard; stored as the value of every lease it holds
    pub shard: String,
}

/// Default lease parameters and background executor sizing
#[derive(Clone, Debug, Deserialize)]
pub struct LockSettings {
    pub lease_duration_ms: u64,
    pub refresh_interval_ms: u64,
    pub background_threads: usize,
    pub max_refresh_tasks: usize,
}

impl LockSettings {
    pub fn lease_duration(&self) -> Duration {
        Duration::from_millis(self.lease_duration_ms)
    }

    pub fn refresh_interval(&self) -> Duration {
        Duration::from_millis(self.refresh_interval_ms)
    }
}

/// Logging settings, consumed by [`crate::logging::LoggingConfig::from_settings`]
#[derive(Clone, Debug, Deserialize)]
pub struct LogSettings {
    pub dir: Option<String>,
    pub level: String,
    pub console: bool,
    pub file: bool,
    pub rotation: String,
}

/// Application configuration
#[derive(Clone, Debug, Deserialize)]
pub struct FleetSyncConfig {
    pub redis: RedisSettings,
    pub fleet: FleetSettings,
    pub lock: LockSettings,
    pub log: LogSettings,
}

impl FleetSyncConfig {
    /// Load configuration from the default file location and the environment.
    pub fn load() -> Result<Self, FleetSyncError> {
        Self::load_from(Some(Path::new(DEFAULT_CONFIG_FILE)), &[])
    }

    /// Load configuration from `file` (optional, may be missing on disk), the
    /// environment, and `overrides` given as `(key, value)` pairs.
    pub fn load_from(
        file: Option<&Path>,
        overrides: &[(&str, String)],
    ) -> Result<Self, FleetSyncError> {
        let mut builder = Config::builder()
            .set_default("redis.host", DEFAULT_REDIS_HOST)?
            .set_default("redis.port", DEFAULT_REDIS_PORT as i64)?
            .set_default("redis.pool_size", DEFAULT_REDIS_POOL_SIZE as i64)?
            .set_default("fleet.domain", DEFAULT_DOMAIN)?
            .set_default("fleet.shard", default_shard_name())?
            .set_default("lock.lease_duration_ms", DEFAULT_LEASE_DURATION_MS as i64)?
            .set_default(
                "lock.refresh_interval_ms",
                DEFAULT_REFRESH_INTERVAL_MS as i64,
            )?
            .set_default("lock.background_threads", DEFAULT_BACKGROUND_THREADS as i64)?
            .set_default("lock.max_refresh_tasks", DEFAULT_MAX_REFRESH_TASKS as i64)?
            .set_default("log.level", "info")?
            .set_default("log.console", true)?
            .set_default("log.file", false)?
            .set_default("log.rotation", "daily")?;

        if let Some(path) = file {
            builder = builder.add_source(File::from(path).required(false));
        }

        builder = builder.add_source(
            Environment::with_prefix("FLEETSYNC")
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        );

        for (key, value) in overrides {
            builder = builder.set_override(*key, value.as_str())?;
        }

        let config: FleetSyncConfig = builder.build()?.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Reject settings the lock cannot operate with.
    pub fn validate(&self) -> Result<(), FleetSyncError> {
        if self.fleet.domain.trim().is_empty() {
            return Err(FleetSyncError::ConfigError(
                "fleet.domain must not be empty".to_string(),
            ));
        }
        if self.fleet.shard.trim().is_empty() {
            return Err(FleetSyncError::ConfigError(
                "fleet.shard must not be empty".to_string(),
            ));
        }
        if self.lock.lease_duration_ms == 0 || self.lock.refresh_interval_ms == 0 {
            return Err(FleetSyncError::ConfigError(
                "lock.lease_duration_ms and lock.refresh_interval_ms must be positive".to_string(),
            ));
        }
        if self.lock.background_threads == 0 {
            return Err(FleetSyncError::ConfigError(
                "lock.background_threads must be positive".to_string(),
            ));
        }
        if self.lock.refresh_interval_ms >= self.lock.lease_duration_ms {
            tracing::warn!(
                lease_duration_ms = self.lock.lease_duration_ms,
                refresh_interval_ms = self.lock.refresh_interval_ms,
                "Refresh interval is not shorter than the lease duration; leases may expire mid-critical-section"
            );
        }
        Ok(())
    }
}

fn default_shard_name() -> String {
    hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .filter(|h| !h.is_empty())
        .unwrap_or_else(|| "shard".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let config = FleetSyncConfig::load_from(None, &[]).unwrap();
        assert_eq!(config.redis.port, DEFAULT_REDIS_PORT);
        assert_eq!(config.fleet.domain, DEFAULT_DOMAIN);
        assert!(!config.fleet.shard.is_empty());
        assert_eq!(config.lock.lease_duration(), Duration::from_secs(10));
        assert_eq!(config.lock.refresh_interval(), Duration::from_millis(100));
        assert_eq!(config.redis.url(), "redis://127.0.0.1:6379/");
    }

    #[test]
    fn test_file_and_overrides() {
        let mut file = tempfile::Builder::new().suffix(".yml").tempfile().unwrap();
        writeln!(
            file,
            "fleet:\n  domain: play\n  shard: lobby-1\nlock:\n  lease_duration_ms: 3000"
        )
        .unwrap();

        let config = FleetSyncConfig::load_from(
            Some(file.path()),
            &[("fleet.shard", "lobby-2".to_string())],
        )
        .unwrap();

        assert_eq!(config.fleet.domain, "play");
        assert_eq!(config.fleet.shard, "lobby-2");
        assert_eq!(config.lock.lease_duration_ms, 3000);
        assert_eq!(config.lock.refresh_interval_ms, DEFAULT_REFRESH_INTERVAL_MS);
    }

    #[test]
    fn test_missing_file_is_ignored() {
        let config =
            FleetSyncConfig::load_from(Some(Path::new("does/not/exist.yml")), &[]).unwrap();
        assert_eq!(config.fleet.domain, DEFAULT_DOMAIN);
    }

    #[test]
    fn test_rejects_empty_domain() {
        let result = FleetSyncConfig::load_from(None, &[("fleet.domain", " ".to_string())]);
        assert!(matches!(result, Err(FleetSyncError::ConfigError(_))));
    }

    #[test]
    fn test_rejects_zero_lease() {
        let result = FleetSyncConfig::load_from(
            None,
            &[("lock.lease_duration_ms", "0".to_string())],
        );
        assert!(result.is_err());
    }
}
