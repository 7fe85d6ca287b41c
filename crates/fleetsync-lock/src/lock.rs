//! Reentrant lock handle.
//!
//! A lock is held at two levels: locally by one thread of this shard, and
//! remotely by this shard through a lease key whose value is the shard name.
//! Threads of the same shard queue on the local level, so at most one thread
//! per shard ever contends for the lease.

use std::sync::Arc;
use std::thread::{self, ThreadId};
use std::time::Instant;

use fleetsync_store::{TxOp, TxOutcome};
use parking_lot::MutexGuard;
use tracing::{debug, warn};

use crate::error::LockError;
use crate::metrics::{record_acquired, record_released, record_schedule_rejected};
use crate::refresher::{RefreshTick, refresh_lease};
use crate::registry::{LeaseConfig, LockEntry, LockRegistry, OwnershipState};

/// Handle to a fleet-wide reentrant lock.
///
/// Handles are cheap to clone; all handles for one name in a registry share
/// the same state. The thread that calls [`lock`](Self::lock) must be the one
/// that calls [`unlock`](Self::unlock).
#[derive(Clone)]
pub struct ReentrantLock {
    registry: Arc<LockRegistry>,
    entry: Arc<LockEntry>,
}

impl ReentrantLock {
    pub(crate) fn new(registry: Arc<LockRegistry>, entry: Arc<LockEntry>) -> Self {
        Self { registry, entry }
    }

    /// Block until the current thread holds the lock.
    ///
    /// Reentrant calls only increment the hold count. On the first
    /// acquisition this waits for any other local holder, then for the remote
    /// lease, and starts refreshing it. There is no timeout.
    pub fn lock(&self) -> Result<(), LockError> {
        if let Some(reason) = self.entry.lease.problem() {
            return Err(LockError::InvalidLease {
                key: self.entry.key.clone(),
                reason: reason.to_string(),
            });
        }
        let me = thread::current().id();
        let sync = &self.entry.sync;
        let mut state = sync.state.lock();

        if state.owner == Some(me) {
            state.count += 1;
            return Ok(());
        }
        while state.owner.is_some() {
            sync.local_free.wait(&mut state);
        }
        state.owner = Some(me);
        state.count = 1;

        let started = Instant::now();
        if let Err(e) = self.acquire_lease(&mut state) {
            warn!(key = %self.entry.key, "Lease acquisition failed: {}", e);
            if let Err(unsub) = self.registry.store().unsubscribe(&self.entry.channel) {
                debug!(key = %self.entry.key, "Unsubscribe after failed acquisition failed: {}", unsub);
            }
            self.release_local(&mut state);
            return Err(e);
        }

        // Lease held from here on; a failed unsubscribe only leaves spurious
        // wake-ups behind
        if let Err(e) = self.registry.store().unsubscribe(&self.entry.channel) {
            warn!(key = %self.entry.key, "Unsubscribe after acquisition failed: {}", e);
        }

        match self
            .registry
            .scheduler()
            .schedule(self.entry.lease.refresh_interval, self.refresh_tick())
        {
            Ok(handle) => {
                state.refresh = Some(handle);
            }
            Err(rejected) => {
                warn!(key = %self.entry.key, reason = %rejected, "Lease refresh rejected; releasing lease");
                record_schedule_rejected(&self.entry.key);
                let deleted = MutexGuard::unlocked(&mut state, || self.delete_lease());
                if let Err(e) = deleted {
                    debug!(key = %self.entry.key, "Lease cleanup after rejection failed: {}", e);
                }
                self.release_local(&mut state);
                return Err(LockError::RefreshSchedulingRejected {
                    key: self.entry.key.clone(),
                    reason: rejected.0,
                });
            }
        }

        record_acquired(&self.entry.key, started.elapsed().as_secs_f64());
        debug!(key = %self.entry.key, shard = %self.registry.shard(), "Lock acquired");
        Ok(())
    }

    /// Release one hold of the lock.
    ///
    /// The final release deletes the lease if this shard still holds it. The
    /// local lock is released even when that fails; `NotOwnedByShard` then
    /// reports that exclusivity may have been lost during the critical section.
    pub fn unlock(&self) -> Result<(), LockError> {
        let me = thread::current().id();
        let sync = &self.entry.sync;
        {
            let mut state = sync.state.lock();
            if state.owner != Some(me) {
                return Err(LockError::NotOwnedByThread {
                    key: self.entry.key.clone(),
                });
            }
            if state.count > 1 {
                state.count -= 1;
                return Ok(());
            }
        }

        // Other local threads keep waiting: ownership is still recorded
        let result = self.delete_lease();

        {
            let mut state = sync.state.lock();
            self.release_local(&mut state);
        }

        match &result {
            Ok(()) => {
                record_released(&self.entry.key, false);
                debug!(key = %self.entry.key, shard = %self.registry.shard(), "Lock released");
            }
            Err(LockError::NotOwnedByShard { holder, .. }) => {
                record_released(&self.entry.key, true);
                warn!(key = %self.entry.key, holder = ?holder, "Lease lost before unlock");
            }
            Err(e) => {
                warn!(key = %self.entry.key, "Lease release failed: {}", e);
            }
        }
        result
    }

    /// Lock and return a guard that unlocks when dropped.
    pub fn acquire(&self) -> Result<LockGuard<'_>, LockError> {
        self.lock()?;
        Ok(LockGuard {
            lock: self,
            released: false,
        })
    }

    /// Holds of the current thread; 0 if another thread or nobody holds it
    pub fn hold_count(&self) -> u32 {
        let state = self.entry.sync.state.lock();
        if state.owner == Some(thread::current().id()) {
            state.count
        } else {
            0
        }
    }

    pub fn is_held_by_current_thread(&self) -> bool {
        self.owner() == Some(thread::current().id())
    }

    /// Whether some thread of this shard holds or is acquiring the lock
    pub fn is_locked(&self) -> bool {
        self.owner().is_some()
    }

    /// The lease key in the store
    pub fn key(&self) -> &str {
        &self.entry.key
    }

    pub fn name(&self) -> &str {
        &self.entry.name
    }

    pub fn lease_config(&self) -> LeaseConfig {
        self.entry.lease
    }

    fn owner(&self) -> Option<ThreadId> {
        self.entry.sync.state.lock().owner
    }

    /// Subscribe, then retry SETNX until it succeeds, parking on
    /// "remote-free" between attempts. The mutex is held except while parked.
    fn acquire_lease(&self, state: &mut MutexGuard<'_, OwnershipState>) -> Result<(), LockError> {
        let store = self.registry.store();
        store.subscribe(&self.entry.channel)?;
        loop {
            if store.set_if_absent(
                &self.entry.key,
                self.registry.shard(),
                self.entry.lease.lease_duration,
            )? {
                return Ok(());
            }
            debug!(key = %self.entry.key, "Lease held elsewhere; waiting for release");
            self.entry.sync.remote_free.wait(state);
        }
    }

    /// Delete the lease only if this shard still holds it.
    fn delete_lease(&self) -> Result<(), LockError> {
        let shard = self.registry.shard();
        let mut holder = None;
        let outcome = self
            .registry
            .store()
            .watch_and_commit(&self.entry.key, &mut |current| {
                holder = current.map(str::to_string);
                (current == Some(shard)).then(|| vec![TxOp::Del])
            })?;

        match outcome {
            TxOutcome::Committed => Ok(()),
            TxOutcome::Abandoned | TxOutcome::Discarded => Err(LockError::NotOwnedByShard {
                key: self.entry.key.clone(),
                holder,
            }),
        }
    }

    fn release_local(&self, state: &mut OwnershipState) {
        state.clear();
        self.entry.sync.local_free.notify_one();
    }

    fn refresh_tick(&self) -> RefreshTick {
        let store = self.registry.store().clone();
        let key = self.entry.key.clone();
        let shard = self.registry.shard().to_string();
        let lease = self.entry.lease.lease_duration;
        Arc::new(move || refresh_lease(store.as_ref(), &key, &shard, lease))
    }
}

impl std::fmt::Debug for ReentrantLock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReentrantLock")
            .field("key", &self.entry.key)
            .field("shard", &self.registry.shard())
            .field("lease", &self.entry.lease)
            .finish()
    }
}

/// Scoped hold of a [`ReentrantLock`].
///
/// Dropping the guard unlocks and logs any error; call
/// [`release`](Self::release) to observe it instead.
#[must_use = "the lock is released as soon as the guard is dropped"]
pub struct LockGuard<'a> {
    lock: &'a ReentrantLock,
    released: bool,
}

impl LockGuard<'_> {
    pub fn release(mut self) -> Result<(), LockError> {
        self.released = true;
        self.lock.unlock()
    }
}

impl Drop for LockGuard<'_> {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        if let Err(e) = self.lock.unlock() {
            warn!(key = %self.lock.key(), "Unlock on guard drop failed: {}", e);
        }
    }
}
