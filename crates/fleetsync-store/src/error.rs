//! Store error types

/// Errors raised by store clients
#[derive(thiserror::Error, Debug)]
pub enum StoreError {
    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("connection error: {0}")]
    Connection(String),

    #[error("store client is closed")]
    Closed,
}

pub type StoreResult<T> = Result<T, StoreError>;
