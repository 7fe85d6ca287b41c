//! The store operations fleet coordination relies on

use std::time::Duration;

use tokio::sync::broadcast;

use crate::error::StoreResult;
use crate::model::{ChannelMessage, TxOp, TxOutcome};

/// Decides, from the watched key's current value, which writes to commit.
///
/// Returning `None` releases the watch without writing (`UNWATCH`).
pub type TxDecision<'a> = &'a mut dyn FnMut(Option<&str>) -> Option<Vec<TxOp>>;

/// Blocking client for a shared key-value store with pub/sub.
///
/// One client represents one shard's connection(s): subscriptions are scoped
/// to the client, and [`StoreClient::messages`] only yields messages for
/// channels this client is subscribed to.
pub trait StoreClient: Send + Sync {
    /// `SET key value NX PX ttl`; returns whether the key was created.
    fn set_if_absent(&self, key: &str, value: &str, ttl: Duration) -> StoreResult<bool>;

    /// `GET key`
    fn get(&self, key: &str) -> StoreResult<Option<String>>;

    /// `SET key value`, without expiry
    fn set(&self, key: &str, value: &str) -> StoreResult<()>;

    /// `WATCH key`, `GET key`, then either `MULTI ... EXEC` with the writes
    /// chosen by `decide`, or `UNWATCH` when `decide` returns `None`.
    ///
    /// The writes are applied only if `key` did not change since it was read.
    fn watch_and_commit(&self, key: &str, decide: TxDecision<'_>) -> StoreResult<TxOutcome>;

    /// Subscribe to `channel`. Subscribing twice is a no-op. The subscription
    /// is active when this returns.
    fn subscribe(&self, channel: &str) -> StoreResult<()>;

    /// Unsubscribe from `channel`. Unsubscribing an unknown channel is a no-op.
    fn unsubscribe(&self, channel: &str) -> StoreResult<()>;

    /// A new receiver for messages on this client's subscribed channels.
    ///
    /// Only messages published after this call are received.
    fn messages(&self) -> broadcast::Receiver<ChannelMessage>;
}
