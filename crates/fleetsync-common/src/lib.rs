//! FleetSync Common - configuration, error types, and logging
//!
//! Shared by the store clients, the distributed lock, and the demo binary.

pub mod config;
pub mod error;
pub mod logging;

pub use config::{FleetSyncConfig, FleetSettings, LockSettings, LogSettings, RedisSettings};
pub use error::FleetSyncError;
pub use logging::{LoggingConfig, LoggingGuard, init_logging};

/// Separator between the domain prefix and a lock name in store keys
pub const LOCK_KEY_SEGMENT: &str = ":locks:";

/// Build the store key for the lock `name` within `domain`.
pub fn lock_key(domain: &str, name: &str) -> String {
    format!("{}{}{}", domain, LOCK_KEY_SEGMENT, name)
}
