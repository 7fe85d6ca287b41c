//! Demo scenarios.
//!
//! Each scenario runs "actors": threads that take a lock on one of the fleet's
//! shards, touch a shared data key and log what they observe.

use std::sync::mpsc;
use std::thread;
use std::time::Duration;

use anyhow::{Context, anyhow, bail};
use fleetsync_lock::{LeaseConfig, LockError, ReentrantLock};
use tracing::info;

use crate::CounterAction;
use crate::fleet::Fleet;

const COUNTER_LOCK: &str = "globalCounter";
const REENTRANT_LOCK: &str = "reentrantLock";
const TOY_LOCK: &str = "toyLock";
const EXCEPTION_LOCK: &str = "exceptionLock";
const LEASE_LOSS_LOCK: &str = "leaseLossLock";

/// Simulated work inside the counter's critical section
const COUNTER_WORK: Duration = Duration::from_millis(500);

/// One scheduled actor: which shard it runs on, when it starts, how long it
/// holds the lock
struct ActorPlan {
    shard: usize,
    start_after: Duration,
    hold: Duration,
}

impl ActorPlan {
    fn new(shard: usize, start_after_ms: u64, hold_ms: u64) -> Self {
        Self {
            shard,
            start_after: Duration::from_millis(start_after_ms),
            hold: Duration::from_millis(hold_ms),
        }
    }
}

struct Actor<'a> {
    fleet: &'a Fleet,
    lock: ReentrantLock,
    shard: String,
    entry_key: String,
}

impl<'a> Actor<'a> {
    fn new(fleet: &'a Fleet, shard: usize, lock_name: &str, entry_key: &str) -> Self {
        let registry = fleet.shard(shard);
        Self {
            fleet,
            lock: registry.lock(lock_name),
            shard: registry.shard().to_string(),
            entry_key: entry_key.to_string(),
        }
    }

    fn report(&self, message: &str) {
        info!(
            shard = %self.shard,
            lock = %self.lock.name(),
            holds = self.lock.hold_count(),
            "{}",
            message
        );
    }

    /// Read the lease and the shared entry, claim the entry, hold, read again.
    fn critical_section(&self, hold: Duration) -> anyhow::Result<()> {
        self.report("Lock acquired");
        let holder = self.fleet.data.get(self.lock.key())?;
        self.report(&format!(
            "Reading shard holding lock: {}",
            holder.as_deref().unwrap_or("None")
        ));
        self.report_entry()?;
        self.report("Setting common entry...");
        self.fleet.data.set(&self.entry_key, &self.shard)?;
        thread::sleep(hold);
        self.report_entry()
    }

    fn report_entry(&self) -> anyhow::Result<()> {
        let entry = self.fleet.data.get(&self.entry_key)?;
        self.report(&format!(
            "Reading common entry: {}",
            entry.as_deref().unwrap_or("None")
        ));
        Ok(())
    }

    fn hold(&self, hold: Duration) -> anyhow::Result<()> {
        let guard = self.lock.acquire()?;
        let result = self.critical_section(hold);
        self.report("Releasing lock");
        guard.release()?;
        result
    }
}

/// Start every actor on its own thread and wait for all of them.
fn run_actors<F>(
    fleet: &Fleet,
    plans: &[ActorPlan],
    lock_name: &str,
    entry_key: &str,
    body: F,
) -> anyhow::Result<()>
where
    F: Fn(usize, &Actor<'_>, Duration) -> anyhow::Result<()> + Sync,
{
    thread::scope(|s| {
        let handles: Vec<_> = plans
            .iter()
            .enumerate()
            .map(|(index, plan)| {
                let body = &body;
                s.spawn(move || {
                    thread::sleep(plan.start_after);
                    let actor = Actor::new(fleet, plan.shard, lock_name, entry_key);
                    body(index, &actor, plan.hold)
                })
            })
            .collect();

        handles.into_iter().try_for_each(|handle| {
            handle
                .join()
                .map_err(|_| anyhow!("actor thread panicked"))?
        })
    })
}

pub fn counter(fleet: &Fleet, action: CounterAction) -> anyhow::Result<()> {
    let key = fleet.data_key(COUNTER_LOCK);
    let lock = fleet.shard(0).lock(COUNTER_LOCK);

    let guard = lock.acquire()?;
    let current: i64 = match fleet.data.get(&key)? {
        Some(raw) => raw
            .parse()
            .with_context(|| format!("counter '{}' holds a non-numeric value '{}'", key, raw))?,
        None => 0,
    };
    thread::sleep(COUNTER_WORK);
    let value = match action {
        CounterAction::Increment => current + 1,
        CounterAction::Decrement => current - 1,
        CounterAction::Get => current,
    };
    if value != current {
        fleet.data.set(&key, &value.to_string())?;
    }
    guard.release()?;

    println!("{}", value);
    Ok(())
}

pub fn toy(fleet: &Fleet, hold_ms: u64) -> anyhow::Result<()> {
    let plans = [
        ActorPlan::new(0, 0, 3000),
        ActorPlan::new(1, 250, 1000),
        ActorPlan::new(0, 2000, hold_ms),
    ];
    run_actors(
        fleet,
        &plans,
        TOY_LOCK,
        &fleet.data_key("lock:toy"),
        |_, actor, hold| actor.hold(hold),
    )
}

pub fn reentrant(fleet: &Fleet) -> anyhow::Result<()> {
    let plans = [ActorPlan::new(0, 0, 3000), ActorPlan::new(1, 250, 1000)];
    run_actors(
        fleet,
        &plans,
        REENTRANT_LOCK,
        &fleet.data_key("lock:reentrant"),
        |index, actor, hold| {
            if index > 0 {
                return actor.hold(hold);
            }

            let outer = actor.lock.acquire()?;
            let inner = actor.lock.acquire()?;
            actor.critical_section(hold)?;
            actor.report("-1");
            inner.release()?;
            actor.report("+1");
            let again = actor.lock.acquire()?;
            actor.report("Pausing...");
            thread::sleep(Duration::from_millis(2000));
            actor.report("-1");
            again.release()?;
            actor.report("Releasing lock");
            outer.release()?;
            Ok(())
        },
    )
}

pub fn exceptions(fleet: &Fleet) -> anyhow::Result<()> {
    let registry = fleet.shard(0);
    let lock = registry.lock(EXCEPTION_LOCK);

    match lock.unlock() {
        Err(e @ LockError::NotOwnedByThread { .. }) => {
            info!("Caught unlock with no thread owner: {}", e)
        }
        other => bail!("expected NotOwnedByThread, got {:?}", other),
    }

    let (locked_tx, locked_rx) = mpsc::channel();
    thread::scope(|s| {
        let holder_lock = lock.clone();
        let holder = s.spawn(move || -> anyhow::Result<()> {
            let guard = holder_lock.acquire()?;
            locked_tx
                .send(())
                .context("main thread stopped waiting for the holder")?;
            thread::sleep(Duration::from_secs(1));
            guard.release()?;
            Ok(())
        });

        locked_rx
            .recv()
            .context("holder thread failed to take the lock")?;
        match lock.unlock() {
            Err(e @ LockError::NotOwnedByThread { .. }) => {
                info!("Caught unlock with different thread owner: {}", e)
            }
            other => bail!("expected NotOwnedByThread, got {:?}", other),
        }
        holder
            .join()
            .map_err(|_| anyhow!("holder thread panicked"))?
    })?;

    let short = registry.lock_with(
        LEASE_LOSS_LOCK,
        LeaseConfig::new(Duration::from_millis(300), Duration::from_secs(60)),
    );
    short.lock()?;
    info!(key = %short.key(), "Holding past the lease without refreshing it");
    thread::sleep(Duration::from_millis(800));
    match short.unlock() {
        Err(e) if e.is_lease_lost() => info!("Caught unlock after the lease expired: {}", e),
        other => bail!("expected NotOwnedByShard, got {:?}", other),
    }
    Ok(())
}
