//! Lock error types

use fleetsync_store::StoreError;

/// Errors raised by [`crate::ReentrantLock`] and [`crate::LockRegistry`]
#[derive(thiserror::Error, Debug)]
pub enum LockError {
    /// `unlock()` was called by a thread that does not hold the lock.
    /// Lock state is untouched.
    #[error("lock '{key}' is not owned by this thread")]
    NotOwnedByThread { key: String },

    /// The lease was absent or held by another shard at unlock time, most
    /// likely because it expired during the critical section. The local lock
    /// has still been released.
    #[error("lock '{key}' is not owned by this shard (lease holder: {})", .holder.as_deref().unwrap_or("none"))]
    NotOwnedByShard { key: String, holder: Option<String> },

    /// The lease refresher could not be scheduled. The acquisition has been
    /// unwound and no lock is held.
    #[error("lease refresh for lock '{key}' could not be scheduled: {reason}")]
    RefreshSchedulingRejected { key: String, reason: String },

    /// The lock's lease configuration cannot be used; nothing was acquired.
    #[error("lock '{key}' has an invalid lease configuration: {reason}")]
    InvalidLease { key: String, reason: String },

    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("background runtime error: {0}")]
    Runtime(String),
}

impl LockError {
    /// Whether exclusivity may have been lost during the critical section
    pub fn is_lease_lost(&self) -> bool {
        matches!(self, LockError::NotOwnedByShard { .. })
    }
}

/// Returned by a [`crate::RefreshScheduler`] that cannot take more work
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
#[error("{0}")]
pub struct SchedulingRejected(pub String);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_not_owned_by_shard_display() {
        let err = LockError::NotOwnedByShard {
            key: "play:locks:counter".to_string(),
            holder: Some("lobby-2".to_string()),
        };
        assert_eq!(
            err.to_string(),
            "lock 'play:locks:counter' is not owned by this shard (lease holder: lobby-2)"
        );
        assert!(err.is_lease_lost());

        let err = LockError::NotOwnedByShard {
            key: "k".to_string(),
            holder: None,
        };
        assert!(err.to_string().ends_with("(lease holder: none)"));
    }

    #[test]
    fn test_not_owned_by_thread_is_not_lease_loss() {
        let err = LockError::NotOwnedByThread {
            key: "k".to_string(),
        };
        assert!(!err.is_lease_lost());
    }
}
