use std::sync::Arc;

use anyhow::Context;
use fleetsync_common::FleetSyncConfig;
use fleetsync_lock::{LockRegistry, RegistryConfig};
use fleetsync_store::{MemoryStore, RedisStore, StoreClient};
use tracing::{info, warn};

use crate::Backend;

/// The shards taking part in a demo run, plus a client for plain data keys
pub struct Fleet {
    pub domain: String,
    pub data: Arc<dyn StoreClient>,
    shards: Vec<Arc<LockRegistry>>,
}

impl Fleet {
    pub fn connect(backend: Backend, config: &FleetSyncConfig) -> anyhow::Result<Self> {
        let registry_config = RegistryConfig::from(config);

        let (data, shards): (Arc<dyn StoreClient>, Vec<Arc<LockRegistry>>) = match backend {
            Backend::Redis => {
                let store = RedisStore::from_settings(&config.redis).with_context(|| {
                    format!("failed to connect to redis at {}", config.redis.url())
                })?;
                if !store.check_keyspace_notifications()? {
                    warn!("Waiting shards will only notice released locks once their leases expire");
                }
                let store: Arc<dyn StoreClient> = Arc::new(store);
                let registry = LockRegistry::new(store.clone(), registry_config)?;
                (store, vec![registry])
            }
            Backend::Memory => {
                let store = MemoryStore::new();
                let peer_config = RegistryConfig {
                    shard: format!("{}-peer", registry_config.shard),
                    ..registry_config.clone()
                };
                let shards = vec![
                    LockRegistry::new(Arc::new(store.connect()), registry_config)?,
                    LockRegistry::new(Arc::new(store.connect()), peer_config)?,
                ];
                (Arc::new(store.connect()), shards)
            }
        };

        let names: Vec<&str> = shards.iter().map(|s| s.shard()).collect();
        info!(shards = ?names, "Fleet connected");

        Ok(Self {
            domain: config.fleet.domain.clone(),
            data,
            shards,
        })
    }

    /// The shard for actor `index`; with a single shard every actor shares it.
    pub fn shard(&self, index: usize) -> &Arc<LockRegistry> {
        &self.shards[index % self.shards.len()]
    }

    /// Store key for demo data
    pub fn data_key(&self, name: &str) -> String {
        format!("{}:tests:{}", self.domain, name)
    }

    pub fn shutdown(&self) {
        for shard in &self.shards {
            shard.shutdown();
        }
    }
}
