//! In-memory store shared by simulated shards.
//!
//! `MemoryStore` plays the role of the store server; every shard gets its own
//! [`MemoryClient`] from [`MemoryStore::connect`], with its own subscriptions.
//! Keys expire on access and through a reaper thread, which publishes the
//! `expired` keyspace event the same way a real server does.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::sync::broadcast;
use tracing::{debug, trace, warn};

use crate::client::{StoreClient, TxDecision};
use crate::error::StoreResult;
use crate::model::{ChannelMessage, KeyspaceEvent, TxOp, TxOutcome, keyspace_channel};

const REAP_INTERVAL: Duration = Duration::from_millis(5);
const MESSAGE_BUFFER: usize = 1024;

struct Entry {
    value: String,
    expires_at: Option<Instant>,
}

impl Entry {
    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|at| now >= at)
    }
}

#[derive(Default)]
struct Keyspace {
    entries: HashMap<String, Entry>,
    /// Bumped on every modification of a key, including expiry; WATCH compares these
    versions: HashMap<String, u64>,
}

impl Keyspace {
    fn version(&self, key: &str) -> u64 {
        self.versions.get(key).copied().unwrap_or(0)
    }

    fn bump(&mut self, key: &str) {
        *self.versions.entry(key.to_string()).or_insert(0) += 1;
    }
}

struct ClientChannel {
    subscriptions: Mutex<HashSet<String>>,
    tx: broadcast::Sender<ChannelMessage>,
}

/// Command counters, for asserting how much traffic an operation caused
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StoreStats {
    pub set_if_absent: u64,
    pub get: u64,
    pub set: u64,
    pub transactions: u64,
    pub committed: u64,
    pub subscribe: u64,
    pub unsubscribe: u64,
}

impl StoreStats {
    pub fn total(&self) -> u64 {
        self.set_if_absent
            + self.get
            + self.set
            + self.transactions
            + self.subscribe
            + self.unsubscribe
    }
}

#[derive(Default)]
struct StatsCollector {
    set_if_absent: AtomicU64,
    get: AtomicU64,
    set: AtomicU64,
    transactions: AtomicU64,
    committed: AtomicU64,
    subscribe: AtomicU64,
    unsubscribe: AtomicU64,
}

struct Inner {
    keyspace: Mutex<Keyspace>,
    clients: Mutex<Vec<Weak<ClientChannel>>>,
    keyspace_events: AtomicBool,
    stats: StatsCollector,
}

impl Inner {
    fn publish(&self, key: &str, event: KeyspaceEvent) {
        if !self.keyspace_events.load(Ordering::Acquire) {
            return;
        }
        let channel = keyspace_channel(key);
        let mut clients = self.clients.lock();
        clients.retain(|weak| weak.strong_count() > 0);
        for client in clients.iter().filter_map(Weak::upgrade) {
            if client.subscriptions.lock().contains(&channel) {
                // No receivers is not an error for pub/sub
                let _ = client
                    .tx
                    .send(ChannelMessage::new(channel.clone(), event.as_str()));
            }
        }
        trace!(key = %key, event = %event, "Published keyspace event");
    }

    fn expire_if_due(&self, keyspace: &mut Keyspace, key: &str, now: Instant) {
        if keyspace.entries.get(key).is_some_and(|e| e.is_expired(now)) {
            keyspace.entries.remove(key);
            keyspace.bump(key);
            self.publish(key, KeyspaceEvent::Expired);
        }
    }

    fn reap(&self) {
        let now = Instant::now();
        let mut keyspace = self.keyspace.lock();
        let expired: Vec<String> = keyspace
            .entries
            .iter()
            .filter(|(_, entry)| entry.is_expired(now))
            .map(|(key, _)| key.clone())
            .collect();
        for key in expired {
            self.expire_if_due(&mut keyspace, &key, now);
        }
    }

    fn read(&self, key: &str) -> (Option<String>, u64) {
        let mut keyspace = self.keyspace.lock();
        self.expire_if_due(&mut keyspace, key, Instant::now());
        let value = keyspace.entries.get(key).map(|e| e.value.clone());
        (value, keyspace.version(key))
    }
}

/// Shared in-process store
#[derive(Clone)]
pub struct MemoryStore {
    inner: Arc<Inner>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    /// Create a store with keyspace notifications enabled and start its reaper.
    pub fn new() -> Self {
        let inner = Arc::new(Inner {
            keyspace: Mutex::new(Keyspace::default()),
            clients: Mutex::new(Vec::new()),
            keyspace_events: AtomicBool::new(true),
            stats: StatsCollector::default(),
        });

        let weak = Arc::downgrade(&inner);
        let spawned = std::thread::Builder::new()
            .name("fleetsync-memory-reaper".to_string())
            .spawn(move || {
                loop {
                    std::thread::sleep(REAP_INTERVAL);
                    match weak.upgrade() {
                        Some(inner) => inner.reap(),
                        None => break,
                    }
                }
            });
        if let Err(e) = spawned {
            // Keys still expire lazily on access
            warn!("Failed to start memory store reaper: {}", e);
        }

        debug!("MemoryStore initialized with background expiry reaper");
        Self { inner }
    }

    /// Open a client connection, as one shard would.
    pub fn connect(&self) -> MemoryClient {
        let (tx, _) = broadcast::channel(MESSAGE_BUFFER);
        let channel = Arc::new(ClientChannel {
            subscriptions: Mutex::new(HashSet::new()),
            tx,
        });
        self.inner.clients.lock().push(Arc::downgrade(&channel));
        MemoryClient {
            inner: self.inner.clone(),
            channel,
        }
    }

    /// Toggle keyspace notifications, like `CONFIG SET notify-keyspace-events`.
    pub fn set_keyspace_events(&self, enabled: bool) {
        self.inner.keyspace_events.store(enabled, Ordering::Release);
    }

    /// Current value of `key`, without counting as a command.
    pub fn peek(&self, key: &str) -> Option<String> {
        self.inner.read(key).0
    }

    /// Remaining time-to-live of `key`; `None` if absent or persistent.
    pub fn ttl(&self, key: &str) -> Option<Duration> {
        let mut keyspace = self.inner.keyspace.lock();
        let now = Instant::now();
        self.inner.expire_if_due(&mut keyspace, key, now);
        keyspace
            .entries
            .get(key)
            .and_then(|e| e.expires_at)
            .map(|at| at.saturating_duration_since(now))
    }

    /// Expire `key` immediately, as if its time-to-live had elapsed.
    pub fn force_expire(&self, key: &str) -> bool {
        let mut keyspace = self.inner.keyspace.lock();
        if keyspace.entries.remove(key).is_some() {
            keyspace.bump(key);
            self.inner.publish(key, KeyspaceEvent::Expired);
            true
        } else {
            false
        }
    }

    pub fn stats(&self) -> StoreStats {
        let s = &self.inner.stats;
        StoreStats {
            set_if_absent: s.set_if_absent.load(Ordering::Relaxed),
            get: s.get.load(Ordering::Relaxed),
            set: s.set.load(Ordering::Relaxed),
            transactions: s.transactions.load(Ordering::Relaxed),
            committed: s.committed.load(Ordering::Relaxed),
            subscribe: s.subscribe.load(Ordering::Relaxed),
            unsubscribe: s.unsubscribe.load(Ordering::Relaxed),
        }
    }
}

/// One shard's connection to a [`MemoryStore`]
pub struct MemoryClient {
    inner: Arc<Inner>,
    channel: Arc<ClientChannel>,
}

impl StoreClient for MemoryClient {
    fn set_if_absent(&self, key: &str, value: &str, ttl: Duration) -> StoreResult<bool> {
        self.inner.stats.set_if_absent.fetch_add(1, Ordering::Relaxed);
        let now = Instant::now();
        let mut keyspace = self.inner.keyspace.lock();
        self.inner.expire_if_due(&mut keyspace, key, now);
        if keyspace.entries.contains_key(key) {
            return Ok(false);
        }
        keyspace.entries.insert(
            key.to_string(),
            Entry {
                value: value.to_string(),
                expires_at: Some(now + ttl),
            },
        );
        keyspace.bump(key);
        self.inner.publish(key, KeyspaceEvent::Set);
        Ok(true)
    }

    fn get(&self, key: &str) -> StoreResult<Option<String>> {
        self.inner.stats.get.fetch_add(1, Ordering::Relaxed);
        Ok(self.inner.read(key).0)
    }

    fn set(&self, key: &str, value: &str) -> StoreResult<()> {
        self.inner.stats.set.fetch_add(1, Ordering::Relaxed);
        let mut keyspace = self.inner.keyspace.lock();
        keyspace.entries.insert(
            key.to_string(),
            Entry {
                value: value.to_string(),
                expires_at: None,
            },
        );
        keyspace.bump(key);
        self.inner.publish(key, KeyspaceEvent::Set);
        Ok(())
    }

    fn watch_and_commit(&self, key: &str, decide: TxDecision<'_>) -> StoreResult<TxOutcome> {
        self.inner.stats.transactions.fetch_add(1, Ordering::Relaxed);
        let (current, watched_version) = self.inner.read(key);

        // The decision runs without the keyspace lock, like a client round-trip
        let Some(ops) = decide(current.as_deref()) else {
            return Ok(TxOutcome::Abandoned);
        };

        let now = Instant::now();
        let mut keyspace = self.inner.keyspace.lock();
        self.inner.expire_if_due(&mut keyspace, key, now);
        if keyspace.version(key) != watched_version {
            return Ok(TxOutcome::Discarded);
        }

        for op in ops {
            match op {
                TxOp::PExpire(ttl) => {
                    if let Some(entry) = keyspace.entries.get_mut(key) {
                        entry.expires_at = Some(now + ttl);
                        keyspace.bump(key);
                        self.inner.publish(key, KeyspaceEvent::Expire);
                    }
                }
                TxOp::Del => {
                    if keyspace.entries.remove(key).is_some() {
                        keyspace.bump(key);
                        self.inner.publish(key, KeyspaceEvent::Del);
                    }
                }
            }
        }
        self.inner.stats.committed.fetch_add(1, Ordering::Relaxed);
        Ok(TxOutcome::Committed)
    }

    fn subscribe(&self, channel: &str) -> StoreResult<()> {
        self.inner.stats.subscribe.fetch_add(1, Ordering::Relaxed);
        self.channel.subscriptions.lock().insert(channel.to_string());
        Ok(())
    }

    fn unsubscribe(&self, channel: &str) -> StoreResult<()> {
        self.inner.stats.unsubscribe.fetch_add(1, Ordering::Relaxed);
        self.channel.subscriptions.lock().remove(channel);
        Ok(())
    }

    fn messages(&self) -> broadcast::Receiver<ChannelMessage> {
        self.channel.tx.subscribe()
    }
}
