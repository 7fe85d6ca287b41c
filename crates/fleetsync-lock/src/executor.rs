//! Background executor shared by a registry's subscribers and refreshers.
//!
//! Lease refresh and notification dispatch run here, never on lock callers'
//! threads, so a slow critical section cannot delay lease renewal.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;
use tokio::runtime::{Builder, Handle, Runtime};
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::error::LockError;

pub(crate) struct BackgroundExecutor {
    runtime: Mutex<Option<Runtime>>,
    handle: Handle,
    shut_down: AtomicBool,
}

impl BackgroundExecutor {
    pub(crate) fn new(worker_threads: usize) -> Result<Self, LockError> {
        let runtime = Builder::new_multi_thread()
            .worker_threads(worker_threads.max(1))
            .thread_name("fleetsync-lock-bg")
            .enable_time()
            .build()
            .map_err(|e| LockError::Runtime(e.to_string()))?;
        let handle = runtime.handle().clone();
        debug!(worker_threads, "Lock background executor started");
        Ok(Self {
            runtime: Mutex::new(Some(runtime)),
            handle,
            shut_down: AtomicBool::new(false),
        })
    }

    pub(crate) fn is_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::Acquire)
    }

    /// Spawn `future` unless the executor has been shut down.
    pub(crate) fn spawn<F>(&self, future: F) -> Option<JoinHandle<F::Output>>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        if self.is_shut_down() {
            return None;
        }
        Some(self.handle.spawn(future))
    }

    /// Stop all background work without waiting for in-flight blocking tasks.
    pub(crate) fn shutdown(&self) {
        if self.shut_down.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Some(runtime) = self.runtime.lock().take() {
            runtime.shutdown_background();
        }
        info!("Lock background executor shut down");
    }
}

impl Drop for BackgroundExecutor {
    fn drop(&mut self) {
        self.shutdown();
    }
}
