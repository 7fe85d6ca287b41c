//! Lease subscriber: wakes the local waiter when a lease is deleted or expires.

use std::sync::Arc;

use fleetsync_store::ChannelMessage;
use tokio::sync::broadcast::Receiver;
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, warn};

use crate::executor::BackgroundExecutor;
use crate::registry::LockEntry;

/// Start the dispatcher for `entry`'s keyspace channel.
///
/// `messages` must be obtained before the entry is published so no release is
/// missed between registration and the first `lock()`.
pub(crate) fn spawn_lease_subscriber(
    executor: &BackgroundExecutor,
    entry: Arc<LockEntry>,
    mut messages: Receiver<ChannelMessage>,
) {
    let key = entry.key.clone();
    let spawned = executor.spawn(async move {
        loop {
            match messages.recv().await {
                Ok(message) => {
                    if message.channel != entry.channel {
                        continue;
                    }
                    let event = message.event();
                    if event.is_removal() {
                        debug!(key = %entry.key, event = %event, "Lease released remotely");
                        signal_remote_free(&entry);
                    }
                }
                Err(RecvError::Lagged(skipped)) => {
                    // A release may be among the dropped messages
                    warn!(key = %entry.key, skipped, "Lease subscriber lagged; waking waiter");
                    signal_remote_free(&entry);
                }
                Err(RecvError::Closed) => {
                    debug!(key = %entry.key, "Notification stream closed; lease subscriber stopped");
                    break;
                }
            }
        }
    });
    if spawned.is_none() {
        warn!(key = %key, "Background executor is shut down; lease subscriber not started");
    }
}

/// Signal "remote-free" under the lock mutex.
///
/// Holding the mutex means the signal cannot fall between a waiter's failed
/// acquisition attempt and its wait. Acquiring it may block behind a waiter's
/// store round-trip, so it runs on the blocking pool.
fn signal_remote_free(entry: &Arc<LockEntry>) {
    let entry = entry.clone();
    tokio::task::spawn_blocking(move || {
        let _state = entry.sync.state.lock();
        entry.sync.remote_free.notify_one();
    });
}

