//! FleetSync Store - key-value store clients for fleet coordination
//!
//! This crate provides:
//! - The [`StoreClient`] trait: the store primitives the distributed lock needs
//!   (create-if-absent with expiry, get, watched transactions, keyspace pub/sub)
//! - [`RedisStore`]: a Redis implementation
//! - [`MemoryStore`]: an in-process store for tests and single-process fleets

mod client;
mod error;
mod memory;
mod model;
mod redis_store;

pub use client::{StoreClient, TxDecision};
pub use error::{StoreError, StoreResult};
pub use memory::{MemoryClient, MemoryStore, StoreStats};
pub use model::{
    ChannelMessage, KEYSPACE_CHANNEL_PREFIX, KeyspaceEvent, TxOp, TxOutcome, keyspace_channel,
};
pub use redis_store::RedisStore;
