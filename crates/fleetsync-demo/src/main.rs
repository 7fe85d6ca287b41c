//! FleetSync demo: exercises the distributed lock from the command line.
//!
//! Run several instances against one Redis server with different `--shard`
//! names to watch them contend, or use the in-memory backend, which runs two
//! shards inside one process.

mod commands;
mod fleet;

use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};
use fleetsync_common::config::DEFAULT_CONFIG_FILE;
use fleetsync_common::{FleetSyncConfig, LoggingConfig, init_logging};
use tracing::info;

use crate::fleet::Fleet;

/// Store backend for the demo
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Backend {
    /// Redis server from the configuration
    Redis,
    /// In-process store shared by two simulated shards
    Memory,
}

/// Command line arguments for the demo
#[derive(Debug, Parser)]
#[command(name = "fleetsync-demo", version, about)]
struct Cli {
    #[arg(short = 'c', long = "config", default_value = DEFAULT_CONFIG_FILE)]
    config: PathBuf,
    #[arg(short = 'b', long = "backend", value_enum, default_value_t = Backend::Memory)]
    backend: Backend,
    #[arg(short = 's', long = "shard")]
    shard: Option<String>,
    #[arg(short = 'd', long = "domain")]
    domain: Option<String>,
    #[arg(long = "redis-host")]
    redis_host: Option<String>,
    #[arg(long = "redis-port")]
    redis_port: Option<u16>,
    #[arg(long = "lease-ms")]
    lease_ms: Option<u64>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Global counter guarded by the lock
    Counter {
        #[command(subcommand)]
        action: CounterAction,
    },
    /// Nested lock/unlock on one thread while another shard waits
    Reentrant,
    /// Several holders taking turns on one lock
    Toy {
        /// How long the last holder keeps the lock
        #[arg(long = "hold-ms", default_value_t = 15_000)]
        hold_ms: u64,
    },
    /// Both unlock errors: wrong thread and lost lease
    Exceptions,
}

#[derive(Debug, Clone, Copy, Subcommand)]
enum CounterAction {
    Increment,
    Decrement,
    Get,
}

impl Cli {
    fn overrides(&self) -> Vec<(&'static str, String)> {
        let mut overrides = Vec::new();
        if let Some(v) = &self.shard {
            overrides.push(("fleet.shard", v.clone()));
        }
        if let Some(v) = &self.domain {
            overrides.push(("fleet.domain", v.clone()));
        }
        if let Some(v) = &self.redis_host {
            overrides.push(("redis.host", v.clone()));
        }
        if let Some(v) = self.redis_port {
            overrides.push(("redis.port", v.to_string()));
        }
        if let Some(v) = self.lease_ms {
            overrides.push(("lock.lease_duration_ms", v.to_string()));
        }
        overrides
    }
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config = FleetSyncConfig::load_from(Some(cli.config.as_path()), &cli.overrides())?;
    let _logging_guard = init_logging(&LoggingConfig::from_settings(&config.log))?;
    fleetsync_lock::describe_metrics();

    info!(
        domain = %config.fleet.domain,
        shard = %config.fleet.shard,
        backend = ?cli.backend,
        "FleetSync demo starting"
    );

    let fleet = Fleet::connect(cli.backend, &config)?;
    let result = match cli.command {
        Command::Counter { action } => commands::counter(&fleet, action),
        Command::Reentrant => commands::reentrant(&fleet),
        Command::Toy { hold_ms } => commands::toy(&fleet, hold_ms),
        Command::Exceptions => commands::exceptions(&fleet),
    };
    fleet.shutdown();
    result
}
