//! Logging setup with per-component log files.
//!
//! | Log File        | Component                     | Target Prefixes   |
//! |-----------------|-------------------------------|-------------------|
//! | fleetsync.log   | Root logger (all components)  | (all)             |
//! | lock.log        | Distributed lock              | fleetsync_lock    |
//! | store.log       | Store clients and pub/sub     | fleetsync_store   |
//!
//! Log files are stored in `~/fleetsync/logs` by default.
//! Override with `FLEETSYNC_LOG_DIR` or the `log.dir` config key.

use std::path::PathBuf;

use tracing::Level;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::filter::{LevelFilter, Targets};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer, Registry, fmt};

use crate::config::LogSettings;
use crate::error::FleetSyncError;

/// A component log file and the targets routed to it.
struct ComponentLogDef {
    file_name: &'static str,
    targets: &'static [&'static str],
}

const ROOT_LOG_FILE: &str = "fleetsync.log";

const COMPONENT_LOGS: &[ComponentLogDef] = &[
    ComponentLogDef {
        file_name: "lock.log",
        targets: &["fleetsync_lock"],
    },
    ComponentLogDef {
        file_name: "store.log",
        targets: &["fleetsync_store"],
    },
];

/// Log rotation policy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogRotation {
    Daily,
    Hourly,
    Never,
}

impl From<LogRotation> for Rotation {
    fn from(rotation: LogRotation) -> Self {
        match rotation {
            LogRotation::Daily => Rotation::DAILY,
            LogRotation::Hourly => Rotation::HOURLY,
            LogRotation::Never => Rotation::NEVER,
        }
    }
}

impl std::str::FromStr for LogRotation {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "daily" => Ok(LogRotation::Daily),
            "hourly" => Ok(LogRotation::Hourly),
            "never" => Ok(LogRotation::Never),
            _ => Err(format!("Invalid log rotation: {}", s)),
        }
    }
}

/// Logging configuration for the entire application.
#[derive(Debug, Clone)]
pub struct LoggingConfig {
    pub log_dir: PathBuf,
    pub console_output: bool,
    pub level: Level,
    pub file_logging: bool,
    pub rotation: LogRotation,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            log_dir: default_log_dir(),
            console_output: true,
            level: Level::INFO,
            file_logging: false,
            rotation: LogRotation::Daily,
        }
    }
}

impl LoggingConfig {
    /// Build from the `log` section of [`crate::FleetSyncConfig`].
    ///
    /// `FLEETSYNC_LOG_DIR` takes precedence over `log.dir`. Unparseable levels
    /// and rotations fall back to `INFO` and daily rotation.
    pub fn from_settings(settings: &LogSettings) -> Self {
        let log_dir = std::env::var("FLEETSYNC_LOG_DIR")
            .ok()
            .or_else(|| settings.dir.clone())
            .map(PathBuf::from)
            .unwrap_or_else(default_log_dir);

        Self {
            log_dir,
            console_output: settings.console,
            level: settings.level.parse().unwrap_or(Level::INFO),
            file_logging: settings.file,
            rotation: settings.rotation.parse().unwrap_or(LogRotation::Daily),
        }
    }
}

fn default_log_dir() -> PathBuf {
    let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
    PathBuf::from(format!("{}/fleetsync/logs", home))
}

/// Keeps the non-blocking file writers alive; buffered output is flushed on drop.
pub struct LoggingGuard {
    _file_guards: Vec<WorkerGuard>,
}

/// Initialize the global tracing subscriber.
///
/// `RUST_LOG` overrides the configured level for the console and root file.
/// Component files capture everything from their targets.
pub fn init_logging(config: &LoggingConfig) -> Result<LoggingGuard, FleetSyncError> {
    let (layers, guards) = build_layers(config)?;

    Registry::default()
        .with(layers)
        .try_init()
        .map_err(|e| FleetSyncError::LoggingError(format!("Failed to initialize logging: {}", e)))?;

    if config.file_logging {
        tracing::info!(
            log_dir = %config.log_dir.display(),
            "File logging initialized: {} (root) + {} component log files",
            ROOT_LOG_FILE,
            COMPONENT_LOGS.len()
        );
    }

    Ok(LoggingGuard {
        _file_guards: guards,
    })
}

type BoxedLayer = Box<dyn Layer<Registry> + Send + Sync>;

fn build_layers(
    config: &LoggingConfig,
) -> Result<(Vec<BoxedLayer>, Vec<WorkerGuard>), FleetSyncError> {
    let mut guards: Vec<WorkerGuard> = Vec::new();
    let mut layers: Vec<BoxedLayer> = Vec::new();

    if config.console_output {
        let filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(config.level.to_string()));
        let console_layer = fmt::layer()
            .with_target(true)
            .with_thread_names(true)
            .with_filter(filter);
        layers.push(Box::new(console_layer));
    }

    if config.file_logging {
        std::fs::create_dir_all(&config.log_dir)?;

        let root_appender =
            RollingFileAppender::new(config.rotation.into(), &config.log_dir, ROOT_LOG_FILE);
        let (root_nb, root_guard) = tracing_appender::non_blocking(root_appender);
        guards.push(root_guard);

        let root_filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(config.level.to_string()));
        let root_layer = fmt::layer()
            .with_writer(root_nb)
            .with_target(true)
            .with_thread_names(true)
            .with_ansi(false)
            .with_filter(root_filter);
        layers.push(Box::new(root_layer));

        for component in COMPONENT_LOGS {
            let appender = RollingFileAppender::new(
                config.rotation.into(),
                &config.log_dir,
                component.file_name,
            );
            let (nb, guard) = tracing_appender::non_blocking(appender);
            guards.push(guard);

            let mut targets = Targets::new();
            for target in component.targets {
                targets = targets.with_target(*target, LevelFilter::TRACE);
            }

            let layer = fmt::layer()
                .with_writer(nb)
                .with_target(true)
                .with_thread_names(true)
                .with_ansi(false)
                .with_filter(targets);
            layers.push(Box::new(layer));
        }
    }

    Ok((layers, guards))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_logging_config_default() {
        let config = LoggingConfig::default();
        assert!(config.console_output);
        assert!(!config.file_logging);
        assert_eq!(config.level, Level::INFO);
        assert_eq!(config.rotation, LogRotation::Daily);
    }

    #[test]
    fn test_logging_config_from_settings() {
        let settings = LogSettings {
            dir: Some("/tmp/fleetsync-test-logs".to_string()),
            level: "debug".to_string(),
            console: false,
            file: true,
            rotation: "hourly".to_string(),
        };
        let config = LoggingConfig::from_settings(&settings);
        if std::env::var("FLEETSYNC_LOG_DIR").is_err() {
            assert_eq!(config.log_dir, PathBuf::from("/tmp/fleetsync-test-logs"));
        }
        assert!(!config.console_output);
        assert!(config.file_logging);
        assert_eq!(config.level, Level::DEBUG);
        assert_eq!(config.rotation, LogRotation::Hourly);
    }

    #[test]
    fn test_invalid_level_falls_back_to_info() {
        let settings = LogSettings {
            dir: None,
            level: "loud".to_string(),
            console: true,
            file: false,
            rotation: "weekly".to_string(),
        };
        let config = LoggingConfig::from_settings(&settings);
        assert_eq!(config.level, Level::INFO);
        assert_eq!(config.rotation, LogRotation::Daily);
    }

    #[test]
    fn test_file_layers_create_log_dir() {
        let dir = tempfile::tempdir().unwrap();
        let log_dir = dir.path().join("nested").join("logs");
        let config = LoggingConfig {
            log_dir: log_dir.clone(),
            console_output: false,
            level: Level::INFO,
            file_logging: true,
            rotation: LogRotation::Never,
        };

        let (layers, guards) = build_layers(&config).unwrap();
        assert!(log_dir.is_dir());
        assert_eq!(layers.len(), 1 + COMPONENT_LOGS.len());
        assert_eq!(guards.len(), 1 + COMPONENT_LOGS.len());
    }

    #[test]
    fn test_component_log_definitions() {
        for component in COMPONENT_LOGS {
            assert!(component.file_name.ends_with(".log"));
            assert!(!component.targets.is_empty());
        }
    }
}
