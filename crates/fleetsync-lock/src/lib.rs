//! FleetSync Lock - distributed reentrant lock over a shared key-value store
//!
//! This crate provides:
//! - [`LockRegistry`]: one per shard, hands out lock handles by name
//! - [`ReentrantLock`]: a lock held locally by one thread and fleet-wide by
//!   one shard, through a lease kept alive while held
//! - [`RefreshScheduler`]: the seam through which lease refresh is scheduled
//!
//! ```no_run
//! use std::sync::Arc;
//! use fleetsync_lock::{LockRegistry, RegistryConfig};
//! use fleetsync_store::MemoryStore;
//!
//! # fn main() -> Result<(), fleetsync_lock::LockError> {
//! let store = MemoryStore::new();
//! let registry = LockRegistry::new(
//!     Arc::new(store.connect()),
//!     RegistryConfig::new("play", "lobby-1"),
//! )?;
//!
//! let lock = registry.lock("globalCounter");
//! let guard = lock.acquire()?;
//! // critical section
//! guard.release()?;
//! # Ok(())
//! # }
//! ```

mod error;
mod executor;
mod lock;
mod metrics;
mod refresher;
mod registry;
mod subscriber;

pub use error::{LockError, SchedulingRejected};
pub use lock::{LockGuard, ReentrantLock};
pub use crate::metrics::describe_metrics;
pub use refresher::{RefreshHandle, RefreshScheduler, RefreshTick, TokioRefreshScheduler};
pub use registry::{
    DEFAULT_LEASE_DURATION, DEFAULT_REFRESH_INTERVAL, LeaseConfig, LockRegistry, RegistryConfig,
};
