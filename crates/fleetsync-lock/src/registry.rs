//! Per-shard lock registry.
//!
//! Each lock name maps to one [`LockEntry`] holding its synchronizers, its
//! lease configuration and its ownership state. Entries are created on first
//! use and never removed, so every handle for a name shares the same entry for
//! the lifetime of the registry.

use std::sync::Arc;
use std::thread::ThreadId;
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::{Condvar, Mutex};
use tracing::{debug, info};

use fleetsync_common::{FleetSyncConfig, lock_key};
use fleetsync_store::{StoreClient, keyspace_channel};

use crate::error::LockError;
use crate::executor::BackgroundExecutor;
use crate::lock::ReentrantLock;
use crate::refresher::{RefreshHandle, RefreshScheduler, TokioRefreshScheduler};
use crate::subscriber::spawn_lease_subscriber;

pub const DEFAULT_LEASE_DURATION: Duration = Duration::from_millis(10_000);
pub const DEFAULT_REFRESH_INTERVAL: Duration = Duration::from_millis(100);

/// Lease timing for one lock name
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LeaseConfig {
    /// Time-to-live of the lease in the store
    pub lease_duration: Duration,
    /// How often the holder extends the lease
    pub refresh_interval: Duration,
}

impl Default for LeaseConfig {
    fn default() -> Self {
        Self {
            lease_duration: DEFAULT_LEASE_DURATION,
            refresh_interval: DEFAULT_REFRESH_INTERVAL,
        }
    }
}

impl LeaseConfig {
    pub fn new(lease_duration: Duration, refresh_interval: Duration) -> Self {
        Self {
            lease_duration,
            refresh_interval,
        }
    }

    pub fn from_millis(lease_duration_ms: u64, refresh_interval_ms: u64) -> Self {
        Self::new(
            Duration::from_millis(lease_duration_ms),
            Duration::from_millis(refresh_interval_ms),
        )
    }

    /// Why this configuration cannot hold a lease, if it cannot
    pub fn problem(&self) -> Option<&'static str> {
        if self.lease_duration.is_zero() {
            Some("lease duration must be non-zero")
        } else if self.refresh_interval.is_zero() {
            Some("refresh interval must be non-zero")
        } else {
            None
        }
    }
}

/// Registry settings
#[derive(Debug, Clone)]
pub struct RegistryConfig {
    /// Key prefix shared by the fleet
    pub domain: String,
    /// This shard's identity, stored as the lease value
    pub shard: String,
    /// Lease timing for handles created without an explicit configuration
    pub default_lease: LeaseConfig,
    pub background_threads: usize,
    pub max_refresh_tasks: usize,
}

impl RegistryConfig {
    pub fn new(domain: impl Into<String>, shard: impl Into<String>) -> Self {
        Self {
            domain: domain.into(),
            shard: shard.into(),
            default_lease: LeaseConfig::default(),
            background_threads: 2,
            max_refresh_tasks: 1024,
        }
    }

    pub fn with_default_lease(mut self, lease: LeaseConfig) -> Self {
        self.default_lease = lease;
        self
    }
}

impl From<&FleetSyncConfig> for RegistryConfig {
    fn from(config: &FleetSyncConfig) -> Self {
        Self {
            domain: config.fleet.domain.clone(),
            shard: config.fleet.shard.clone(),
            default_lease: LeaseConfig::new(
                config.lock.lease_duration(),
                config.lock.refresh_interval(),
            ),
            background_threads: config.lock.background_threads,
            max_refresh_tasks: config.lock.max_refresh_tasks,
        }
    }
}

/// Mutable ownership of one lock name, guarded by [`Synchronizers::state`]
#[derive(Debug, Default)]
pub(crate) struct OwnershipState {
    pub owner: Option<ThreadId>,
    pub count: u32,
    pub refresh: Option<RefreshHandle>,
}

impl OwnershipState {
    /// Release local ownership, cancelling the refresher first.
    pub(crate) fn clear(&mut self) {
        if let Some(refresh) = self.refresh.take() {
            refresh.cancel();
        }
        self.owner = None;
        self.count = 0;
    }
}

pub(crate) struct Synchronizers {
    pub state: Mutex<OwnershipState>,
    /// Signalled when the local owner releases the lock
    pub local_free: Condvar,
    /// Signalled when the remote lease is deleted or expires
    pub remote_free: Condvar,
}

/// Everything the registry keeps per lock name
pub(crate) struct LockEntry {
    pub name: String,
    pub key: String,
    pub channel: String,
    pub lease: LeaseConfig,
    pub sync: Synchronizers,
}

/// Lock registry for one shard.
///
/// Several registries may share one store (as separate shards would); each
/// needs its own store client so subscriptions stay separate.
pub struct LockRegistry {
    store: Arc<dyn StoreClient>,
    config: RegistryConfig,
    entries: DashMap<String, Arc<LockEntry>>,
    executor: Arc<BackgroundExecutor>,
    scheduler: Arc<dyn RefreshScheduler>,
}

impl LockRegistry {
    /// Create a registry refreshing leases on its own background runtime.
    pub fn new(store: Arc<dyn StoreClient>, config: RegistryConfig) -> Result<Arc<Self>, LockError> {
        let executor = Arc::new(BackgroundExecutor::new(config.background_threads)?);
        let scheduler = Arc::new(TokioRefreshScheduler::new(
            executor.clone(),
            config.max_refresh_tasks,
        ));
        Ok(Self::build(store, config, executor, scheduler))
    }

    /// Create a registry that schedules lease refresh with `scheduler`.
    pub fn with_scheduler(
        store: Arc<dyn StoreClient>,
        config: RegistryConfig,
        scheduler: Arc<dyn RefreshScheduler>,
    ) -> Result<Arc<Self>, LockError> {
        let executor = Arc::new(BackgroundExecutor::new(config.background_threads)?);
        Ok(Self::build(store, config, executor, scheduler))
    }

    fn build(
        store: Arc<dyn StoreClient>,
        config: RegistryConfig,
        executor: Arc<BackgroundExecutor>,
        scheduler: Arc<dyn RefreshScheduler>,
    ) -> Arc<Self> {
        info!(domain = %config.domain, shard = %config.shard, "Lock registry initialized");
        Arc::new(Self {
            store,
            config,
            entries: DashMap::new(),
            executor,
            scheduler,
        })
    }

    /// Handle for `name` using the registry's default lease configuration.
    pub fn lock(self: &Arc<Self>, name: &str) -> ReentrantLock {
        self.lock_with(name, self.config.default_lease)
    }

    /// Handle for `name`. `lease` only takes effect if this is the first
    /// handle ever created for `name` in this registry.
    pub fn lock_with(self: &Arc<Self>, name: &str, lease: LeaseConfig) -> ReentrantLock {
        let entry = self.get_or_create(name, lease);
        ReentrantLock::new(self.clone(), entry)
    }

    pub(crate) fn get_or_create(&self, name: &str, lease: LeaseConfig) -> Arc<LockEntry> {
        let key = lock_key(&self.config.domain, name);

        if let Some(entry) = self.entries.get(&key) {
            if entry.lease != lease {
                debug!(key = %key, requested = ?lease, active = ?entry.lease, "Lock already configured; ignoring lease settings");
            }
            return entry.clone();
        }

        // The map's write guard makes creation and subscriber registration
        // atomic with the absence check
        self.entries
            .entry(key.clone())
            .or_insert_with(|| {
                let entry = Arc::new(LockEntry {
                    name: name.to_string(),
                    channel: keyspace_channel(&key),
                    key: key.clone(),
                    lease,
                    sync: Synchronizers {
                        state: Mutex::new(OwnershipState::default()),
                        local_free: Condvar::new(),
                        remote_free: Condvar::new(),
                    },
                });
                spawn_lease_subscriber(&self.executor, entry.clone(), self.store.messages());
                debug!(key = %key, lease = ?lease, "Registered lock");
                entry
            })
            .clone()
    }

    pub fn domain(&self) -> &str {
        &self.config.domain
    }

    pub fn shard(&self) -> &str {
        &self.config.shard
    }

    /// Number of lock names registered so far
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub(crate) fn store(&self) -> &Arc<dyn StoreClient> {
        &self.store
    }

    pub(crate) fn scheduler(&self) -> &Arc<dyn RefreshScheduler> {
        &self.scheduler
    }

    /// Stop subscriber dispatch and lease refresh.
    ///
    /// Leases still held are not released; they expire on their own. Waiters
    /// blocked on a remote lease are no longer woken by notifications.
    pub fn shutdown(&self) {
        self.executor.shutdown();
        info!(shard = %self.config.shard, "Lock registry shut down");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fleetsync_store::MemoryStore;

    fn registry(store: &MemoryStore) -> Arc<LockRegistry> {
        LockRegistry::new(
            Arc::new(store.connect()),
            RegistryConfig::new("test", "shard-a"),
        )
        .unwrap()
    }

    #[test]
    fn test_entry_created_once_per_name() {
        let store = MemoryStore::new();
        let registry = registry(&store);

        let a = registry.get_or_create("counter", LeaseConfig::default());
        let b = registry.get_or_create("counter", LeaseConfig::from_millis(1, 1));
        let c = registry.get_or_create("other", LeaseConfig::default());

        assert!(Arc::ptr_eq(&a, &b));
        assert!(!Arc::ptr_eq(&a, &c));
        assert_eq!(registry.len(), 2);
        assert_eq!(a.key, "test:locks:counter");
        assert_eq!(a.channel, "__keyspace@0__:test:locks:counter");
    }

    #[test]
    fn test_first_lease_config_wins() {
        let store = MemoryStore::new();
        let registry = registry(&store);

        let first = LeaseConfig::from_millis(5000, 50);
        registry.lock_with("counter", first);
        let later = registry.lock_with("counter", LeaseConfig::from_millis(100, 10));

        assert_eq!(later.lease_config(), first);
    }

    #[test]
    fn test_concurrent_first_use_creates_one_entry() {
        let store = MemoryStore::new();
        let registry = registry(&store);

        let entries: Vec<Arc<LockEntry>> = std::thread::scope(|s| {
            let handles: Vec<_> = (0..8)
                .map(|_| s.spawn(|| registry.get_or_create("race", LeaseConfig::default())))
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });

        for entry in &entries[1..] {
            assert!(Arc::ptr_eq(&entries[0], entry));
        }
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_lease_config_problem() {
        assert_eq!(LeaseConfig::default().problem(), None);
        assert_eq!(
            LeaseConfig::from_millis(0, 100).problem(),
            Some("lease duration must be non-zero")
        );
        assert_eq!(
            LeaseConfig::from_millis(200, 0).problem(),
            Some("refresh interval must be non-zero")
        );
    }

    #[test]
    fn test_registration_after_shutdown() {
        let store = MemoryStore::new();
        let registry = registry(&store);
        registry.shutdown();

        let lock = registry.lock("late");
        assert_eq!(lock.key(), "test:locks:late");
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_registry_config_from_fleet_config() {
        let config = FleetSyncConfig::load_from(
            None,
            &[
                ("fleet.domain", "play".to_string()),
                ("fleet.shard", "lobby-1".to_string()),
                ("lock.lease_duration_ms", "2000".to_string()),
            ],
        )
        .unwrap();

        let registry_config = RegistryConfig::from(&config);
        assert_eq!(registry_config.domain, "play");
        assert_eq!(registry_config.shard, "lobby-1");
        assert_eq!(
            registry_config.default_lease.lease_duration,
            Duration::from_secs(2)
        );
    }
}
