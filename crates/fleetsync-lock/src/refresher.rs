//! Lease refresh: periodic expiry extension while this shard holds a lease.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use fleetsync_store::{StoreClient, TxOp, TxOutcome};
use tokio::sync::Semaphore;
use tokio::time::{Instant, MissedTickBehavior, interval_at};
use tracing::{trace, warn};

use crate::error::SchedulingRejected;
use crate::executor::BackgroundExecutor;
use crate::metrics::record_refresh;

/// Work performed on every refresh tick
pub type RefreshTick = Arc<dyn Fn() + Send + Sync>;

/// Schedules periodic lease refresh.
///
/// The registry's default is [`TokioRefreshScheduler`]; alternative
/// schedulers can be supplied through [`crate::LockRegistry::with_scheduler`].
pub trait RefreshScheduler: Send + Sync {
    /// Run `tick` every `period`, first after one period, until the returned
    /// handle is cancelled or dropped.
    fn schedule(&self, period: Duration, tick: RefreshTick)
    -> Result<RefreshHandle, SchedulingRejected>;
}

/// Cancels a scheduled refresh when cancelled or dropped.
///
/// Cancellation does not wait for a tick that is already running.
pub struct RefreshHandle {
    cancel: Option<Box<dyn FnOnce() + Send>>,
}

impl RefreshHandle {
    pub fn new(cancel: impl FnOnce() + Send + 'static) -> Self {
        Self {
            cancel: Some(Box::new(cancel)),
        }
    }

    pub fn cancel(mut self) {
        self.run_cancel();
    }

    fn run_cancel(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }
}

impl Drop for RefreshHandle {
    fn drop(&mut self) {
        self.run_cancel();
    }
}

impl std::fmt::Debug for RefreshHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RefreshHandle")
            .field("active", &self.cancel.is_some())
            .finish()
    }
}

/// Runs refresh timers on the registry's background runtime and each tick on
/// its blocking pool, so ticks never queue behind a critical section.
///
/// At most one tick per refresher is in flight; a tick that comes due while
/// the previous one is still running is skipped. Rejects a zero period, and
/// rejects work once the executor is shut down or `max_tasks` refreshers are
/// active.
pub struct TokioRefreshScheduler {
    executor: Arc<BackgroundExecutor>,
    permits: Arc<Semaphore>,
    max_tasks: usize,
}

impl TokioRefreshScheduler {
    pub(crate) fn new(executor: Arc<BackgroundExecutor>, max_tasks: usize) -> Self {
        Self {
            executor,
            permits: Arc::new(Semaphore::new(max_tasks)),
            max_tasks,
        }
    }
}

impl RefreshScheduler for TokioRefreshScheduler {
    fn schedule(
        &self,
        period: Duration,
        tick: RefreshTick,
    ) -> Result<RefreshHandle, SchedulingRejected> {
        if period.is_zero() {
            return Err(SchedulingRejected(
                "refresh interval must be non-zero".to_string(),
            ));
        }
        if self.executor.is_shut_down() {
            return Err(SchedulingRejected(
                "background executor is shut down".to_string(),
            ));
        }
        let permit = self.permits.clone().try_acquire_owned().map_err(|_| {
            SchedulingRejected(format!(
                "refresh capacity exhausted ({} active refreshers)",
                self.max_tasks
            ))
        })?;

        let task = self
            .executor
            .spawn(async move {
                let _permit = permit;
                let in_flight = Arc::new(AtomicBool::new(false));
                let mut ticker = interval_at(Instant::now() + period, period);
                ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
                loop {
                    ticker.tick().await;
                    if in_flight.swap(true, Ordering::AcqRel) {
                        trace!("Previous refresh tick still running; skipping");
                        continue;
                    }
                    let tick = tick.clone();
                    let running = InFlight(in_flight.clone());
                    tokio::task::spawn_blocking(move || {
                        let _running = running;
                        tick();
                    });
                }
            })
            .ok_or_else(|| SchedulingRejected("background executor is shut down".to_string()))?;

        Ok(RefreshHandle::new(move || task.abort()))
    }
}

/// Clears the in-flight flag when a tick finishes, even by panicking
struct InFlight(Arc<AtomicBool>);

impl Drop for InFlight {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// One refresh tick: extend the lease only if this shard still holds it.
///
/// The watched read closes the race where the lease expired and another shard
/// took it before this tick ran; that shard's lease must never be extended.
pub(crate) fn refresh_lease(store: &dyn StoreClient, key: &str, shard: &str, lease: Duration) {
    let result = store.watch_and_commit(key, &mut |holder| {
        (holder == Some(shard)).then(|| vec![TxOp::PExpire(lease)])
    });

    let outcome = match result {
        Ok(TxOutcome::Committed) => {
            trace!(key = %key, shard = %shard, "Lease refreshed");
            "refreshed"
        }
        Ok(TxOutcome::Abandoned) => {
            trace!(key = %key, shard = %shard, "Lease not held by this shard; refresh skipped");
            "skipped"
        }
        Ok(TxOutcome::Discarded) => {
            trace!(key = %key, shard = %shard, "Lease changed during refresh; refresh discarded");
            "discarded"
        }
        Err(e) => {
            warn!(key = %key, shard = %shard, "Lease refresh failed: {}", e);
            "error"
        }
    };
    record_refresh(key, outcome);
}

#[cfg(test)]
mod tests {
    use super::*;
    use fleetsync_store::MemoryStore;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn test_refresh_extends_own_lease() {
        let store = MemoryStore::new();
        let client = store.connect();
        client
            .set_if_absent("k", "shard-a", Duration::from_millis(100))
            .unwrap();

        refresh_lease(&client, "k", "shard-a", Duration::from_secs(30));

        assert!(store.ttl("k").unwrap() > Duration::from_secs(20));
    }

    #[test]
    fn test_refresh_skips_foreign_lease() {
        let store = MemoryStore::new();
        let client = store.connect();
        client
            .set_if_absent("k", "shard-b", Duration::from_secs(1))
            .unwrap();

        refresh_lease(&client, "k", "shard-a", Duration::from_secs(30));

        assert!(store.ttl("k").unwrap() <= Duration::from_secs(1));
        assert_eq!(store.stats().committed, 0);
    }

    #[test]
    fn test_refresh_of_absent_lease_does_not_create_it() {
        let store = MemoryStore::new();
        let client = store.connect();

        refresh_lease(&client, "k", "shard-a", Duration::from_secs(30));

        assert_eq!(store.peek("k"), None);
    }

    #[test]
    fn test_scheduler_runs_ticks_until_cancelled() {
        let executor = Arc::new(BackgroundExecutor::new(1).unwrap());
        let scheduler = TokioRefreshScheduler::new(executor, 4);
        let ticks = Arc::new(AtomicUsize::new(0));

        let counted = ticks.clone();
        let handle = scheduler
            .schedule(
                Duration::from_millis(10),
                Arc::new(move || {
                    counted.fetch_add(1, Ordering::SeqCst);
                }),
            )
            .unwrap();

        std::thread::sleep(Duration::from_millis(150));
        handle.cancel();
        std::thread::sleep(Duration::from_millis(30));
        let after_cancel = ticks.load(Ordering::SeqCst);
        assert!(after_cancel >= 3, "only {} ticks ran", after_cancel);

        std::thread::sleep(Duration::from_millis(100));
        assert_eq!(ticks.load(Ordering::SeqCst), after_cancel);
    }

    #[test]
    fn test_scheduler_rejects_over_capacity() {
        let executor = Arc::new(BackgroundExecutor::new(1).unwrap());
        let scheduler = TokioRefreshScheduler::new(executor, 1);
        let tick: RefreshTick = Arc::new(|| {});

        let first = scheduler.schedule(Duration::from_secs(60), tick.clone()).unwrap();
        assert!(scheduler.schedule(Duration::from_secs(60), tick.clone()).is_err());

        first.cancel();
        // The permit is returned once the aborted task is dropped
        std::thread::sleep(Duration::from_millis(50));
        assert!(scheduler.schedule(Duration::from_secs(60), tick).is_ok());
    }

    #[test]
    fn test_scheduler_rejects_after_shutdown() {
        let executor = Arc::new(BackgroundExecutor::new(1).unwrap());
        let scheduler = TokioRefreshScheduler::new(executor.clone(), 4);
        executor.shutdown();

        let result = scheduler.schedule(Duration::from_secs(1), Arc::new(|| {}));
        assert!(result.is_err());
    }

    #[test]
    fn test_scheduler_rejects_zero_period() {
        let executor = Arc::new(BackgroundExecutor::new(1).unwrap());
        let scheduler = TokioRefreshScheduler::new(executor, 4);

        let result = scheduler.schedule(Duration::ZERO, Arc::new(|| {}));
        assert_eq!(
            result.unwrap_err(),
            SchedulingRejected("refresh interval must be non-zero".to_string())
        );
    }

    #[test]
    fn test_slow_ticks_do_not_overlap() {
        let executor = Arc::new(BackgroundExecutor::new(1).unwrap());
        let scheduler = TokioRefreshScheduler::new(executor, 4);
        let active = Arc::new(AtomicUsize::new(0));
        let max_active = Arc::new(AtomicUsize::new(0));
        let started = Arc::new(AtomicUsize::new(0));

        let (a, m, st) = (active.clone(), max_active.clone(), started.clone());
        let handle = scheduler
            .schedule(
                Duration::from_millis(5),
                Arc::new(move || {
                    st.fetch_add(1, Ordering::SeqCst);
                    let now = a.fetch_add(1, Ordering::SeqCst) + 1;
                    m.fetch_max(now, Ordering::SeqCst);
                    std::thread::sleep(Duration::from_millis(50));
                    a.fetch_sub(1, Ordering::SeqCst);
                }),
            )
            .unwrap();

        std::thread::sleep(Duration::from_millis(300));
        handle.cancel();

        assert_eq!(max_active.load(Ordering::SeqCst), 1);
        let ticks = started.load(Ordering::SeqCst);
        assert!((2..=8).contains(&ticks), "{} ticks started", ticks);
    }
}
