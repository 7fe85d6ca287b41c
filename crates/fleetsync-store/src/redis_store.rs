//! Redis-backed store client.
//!
//! Commands and transactions run on pooled connections; every watched
//! transaction holds one connection from `WATCH` to `EXEC`/`UNWATCH`.
//! Pub/sub runs on a dedicated worker thread owning its own connection, and
//! subscription changes are handed to it over a command channel.

use std::collections::HashMap;
use std::sync::mpsc;
use std::thread::JoinHandle;
use std::time::Duration;

use parking_lot::Mutex;
use redis::{Commands, Connection, ConnectionLike};
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

use fleetsync_common::RedisSettings;

use crate::client::{StoreClient, TxDecision};
use crate::error::{StoreError, StoreResult};
use crate::model::{ChannelMessage, TxOp, TxOutcome};

/// How long the pub/sub worker blocks on a read before checking for commands
const PUBSUB_POLL_INTERVAL: Duration = Duration::from_millis(20);
const MESSAGE_BUFFER: usize = 1024;

enum PubSubCommand {
    Subscribe(String, mpsc::Sender<StoreResult<()>>),
    Unsubscribe(String, mpsc::Sender<StoreResult<()>>),
}

/// Store client over a Redis server
pub struct RedisStore {
    client: redis::Client,
    pool: IdlePool<Connection>,
    commands: Mutex<Option<mpsc::Sender<PubSubCommand>>>,
    events: broadcast::Sender<ChannelMessage>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl RedisStore {
    /// Connect to `url` and start the pub/sub worker.
    pub fn connect(url: &str, pool_size: usize) -> StoreResult<Self> {
        let client = redis::Client::open(url)?;
        let pubsub_connection = client.get_connection()?;

        let (events, _) = broadcast::channel(MESSAGE_BUFFER);
        let (command_tx, command_rx) = mpsc::channel();

        let worker_events = events.clone();
        let worker = std::thread::Builder::new()
            .name("fleetsync-pubsub".to_string())
            .spawn(move || run_pubsub(pubsub_connection, command_rx, worker_events))
            .map_err(|e| StoreError::Connection(format!("failed to start pub/sub worker: {}", e)))?;

        info!(url = %url, pool_size, "Connected to redis");

        Ok(Self {
            client,
            pool: IdlePool::new(pool_size),
            commands: Mutex::new(Some(command_tx)),
            events,
            worker: Mutex::new(Some(worker)),
        })
    }

    pub fn from_settings(settings: &RedisSettings) -> StoreResult<Self> {
        Self::connect(&settings.url(), settings.pool_size)
    }

    /// Check that the server publishes the keyspace events the lock waits on.
    ///
    /// Without `K` (keyspace channel), `g` (`del`) and `x` (`expired`) in
    /// `notify-keyspace-events`, waiters are never woken by releases.
    /// Returns whether the configuration is sufficient.
    pub fn check_keyspace_notifications(&self) -> StoreResult<bool> {
        let config: HashMap<String, String> = self.with_connection(|con| {
            redis::cmd("CONFIG")
                .arg("GET")
                .arg("notify-keyspace-events")
                .query(con)
        })?;
        let flags = config
            .get("notify-keyspace-events")
            .cloned()
            .unwrap_or_default();
        let has_generic = flags.contains('g') || flags.contains('A');
        let has_expired = flags.contains('x') || flags.contains('A');
        let sufficient = flags.contains('K') && has_generic && has_expired;
        if !sufficient {
            warn!(
                flags = %flags,
                "Redis notify-keyspace-events lacks K, g or x; lock waiters will not be woken on release"
            );
        }
        Ok(sufficient)
    }

    /// Stop the pub/sub worker. Pooled connections are closed on drop.
    pub fn close(&self) {
        self.commands.lock().take();
        if let Some(worker) = self.worker.lock().take()
            && worker.join().is_err()
        {
            error!("Redis pub/sub worker panicked");
        }
    }

    /// Run `f` on a pooled connection. A connection is pooled again only
    /// after `f` succeeds, since a failed call may leave a `WATCH` active or
    /// a reply unread.
    fn with_connection<T>(
        &self,
        f: impl FnOnce(&mut Connection) -> redis::RedisResult<T>,
    ) -> StoreResult<T> {
        let mut con = match self.pool.take() {
            Some(con) => con,
            None => self.client.get_connection()?,
        };
        let result = f(&mut con);
        let reusable = result.is_ok() && con.is_open();
        if !reusable {
            debug!("Dropping redis connection after failed command");
        }
        self.pool.give_back(con, reusable);
        Ok(result?)
    }

    fn send_pubsub(
        &self,
        build: impl FnOnce(mpsc::Sender<StoreResult<()>>) -> PubSubCommand,
    ) -> StoreResult<()> {
        let (ack_tx, ack_rx) = mpsc::channel();
        {
            let commands = self.commands.lock();
            let sender = commands.as_ref().ok_or(StoreError::Closed)?;
            sender.send(build(ack_tx)).map_err(|_| StoreError::Closed)?;
        }
        ack_rx.recv().map_err(|_| StoreError::Closed)?
    }
}

impl Drop for RedisStore {
    fn drop(&mut self) {
        self.close();
    }
}

impl StoreClient for RedisStore {
    fn set_if_absent(&self, key: &str, value: &str, ttl: Duration) -> StoreResult<bool> {
        let reply: Option<String> = self.with_connection(|con| {
            redis::cmd("SET")
                .arg(key)
                .arg(value)
                .arg("NX")
                .arg("PX")
                .arg(ttl.as_millis() as u64)
                .query(con)
        })?;
        Ok(reply.as_deref() == Some("OK"))
    }

    fn get(&self, key: &str) -> StoreResult<Option<String>> {
        self.with_connection(|con| con.get(key))
    }

    fn set(&self, key: &str, value: &str) -> StoreResult<()> {
        self.with_connection(|con| con.set(key, value))
    }

    fn watch_and_commit(&self, key: &str, decide: TxDecision<'_>) -> StoreResult<TxOutcome> {
        self.with_connection(|con| {
            redis::cmd("WATCH").arg(key).query::<()>(con)?;
            let current: Option<String> = con.get(key)?;

            let Some(ops) = decide(current.as_deref()) else {
                redis::cmd("UNWATCH").query::<()>(con)?;
                return Ok(TxOutcome::Abandoned);
            };

            let mut pipe = redis::pipe();
            pipe.atomic();
            for op in &ops {
                match op {
                    TxOp::PExpire(ttl) => {
                        pipe.cmd("PEXPIRE").arg(key).arg(ttl.as_millis() as u64);
                    }
                    TxOp::Del => {
                        pipe.cmd("DEL").arg(key);
                    }
                }
            }
            // EXEC replies nil when the watched key changed
            let reply: Option<Vec<redis::Value>> = pipe.query(con)?;
            Ok(match reply {
                Some(_) => TxOutcome::Committed,
                None => TxOutcome::Discarded,
            })
        })
    }

    fn subscribe(&self, channel: &str) -> StoreResult<()> {
        self.send_pubsub(|ack| PubSubCommand::Subscribe(channel.to_string(), ack))
    }

    fn unsubscribe(&self, channel: &str) -> StoreResult<()> {
        self.send_pubsub(|ack| PubSubCommand::Unsubscribe(channel.to_string(), ack))
    }

    fn messages(&self) -> broadcast::Receiver<ChannelMessage> {
        self.events.subscribe()
    }
}

/// Bounded stack of idle connections
struct IdlePool<C> {
    idle: Mutex<Vec<C>>,
    capacity: usize,
}

impl<C> IdlePool<C> {
    fn new(capacity: usize) -> Self {
        Self {
            idle: Mutex::new(Vec::with_capacity(capacity)),
            capacity,
        }
    }

    fn take(&self) -> Option<C> {
        self.idle.lock().pop()
    }

    /// Keep `con` for reuse if it is `reusable` and there is room; drop it otherwise.
    fn give_back(&self, con: C, reusable: bool) {
        if !reusable {
            return;
        }
        let mut idle = self.idle.lock();
        if idle.len() < self.capacity {
            idle.push(con);
        }
    }

    #[cfg(test)]
    fn idle(&self) -> usize {
        self.idle.lock().len()
    }
}

fn run_pubsub(
    mut connection: Connection,
    commands: mpsc::Receiver<PubSubCommand>,
    events: broadcast::Sender<ChannelMessage>,
) {
    let mut pubsub = connection.as_pubsub();
    if let Err(e) = pubsub.set_read_timeout(Some(PUBSUB_POLL_INTERVAL)) {
        error!("Failed to configure pub/sub connection: {}", e);
        return;
    }
    debug!("Redis pub/sub worker started");

    loop {
        loop {
            match commands.try_recv() {
                Ok(PubSubCommand::Subscribe(channel, ack)) => {
                    let result = pubsub.subscribe(channel.as_str()).map_err(StoreError::from);
                    let _ = ack.send(result);
                }
                Ok(PubSubCommand::Unsubscribe(channel, ack)) => {
                    let result = pubsub.unsubscribe(channel.as_str()).map_err(StoreError::from);
                    let _ = ack.send(result);
                }
                Err(mpsc::TryRecvError::Empty) => break,
                Err(mpsc::TryRecvError::Disconnected) => {
                    debug!("Redis pub/sub worker stopped");
                    return;
                }
            }
        }

        match pubsub.get_message() {
            Ok(msg) => {
                let payload: String = match msg.get_payload() {
                    Ok(payload) => payload,
                    Err(e) => {
                        warn!(channel = %msg.get_channel_name(), "Undecodable pub/sub payload: {}", e);
                        continue;
                    }
                };
                let _ = events.send(ChannelMessage::new(msg.get_channel_name(), payload));
            }
            Err(e) if e.is_timeout() => {}
            Err(e) => {
                error!("Redis pub/sub connection failed: {}", e);
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_idle_pool_drops_unusable_connections() {
        let pool = IdlePool::new(2);
        pool.give_back("failed", false);
        assert_eq!(pool.idle(), 0);
        assert_eq!(pool.take(), None);

        pool.give_back("a", true);
        pool.give_back("b", true);
        pool.give_back("c", true);
        assert_eq!(pool.idle(), 2);
        assert_eq!(pool.take(), Some("b"));
        assert_eq!(pool.take(), Some("a"));
        assert_eq!(pool.take(), None);
    }

    // Requires a redis server on localhost with notify-keyspace-events=Kgx
    #[test]
    #[ignore]
    fn test_redis_set_if_absent_and_transaction() {
        let store = RedisStore::connect("redis://127.0.0.1:6379/", 2).unwrap();
        let key = "fleetsync:test:redis-store";
        let _ = store.watch_and_commit(key, &mut |_| Some(vec![TxOp::Del]));

        assert!(store.set_if_absent(key, "a", Duration::from_secs(5)).unwrap());
        assert!(!store.set_if_absent(key, "b", Duration::from_secs(5)).unwrap());

        let outcome = store
            .watch_and_commit(key, &mut |current| {
                (current == Some("a")).then(|| vec![TxOp::Del])
            })
            .unwrap();
        assert_eq!(outcome, TxOutcome::Committed);
        assert_eq!(store.get(key).unwrap(), None);
    }
}
