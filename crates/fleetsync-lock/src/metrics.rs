// Lock metrics published through the `metrics` facade
// No exporter is installed here; the embedding application chooses one

use metrics::{counter, describe_counter, describe_histogram, histogram};

/// Register descriptions for all lock metrics.
/// Call once at application startup, after installing a recorder.
pub fn describe_metrics() {
    describe_counter!(
        "fleetsync_lock_acquired_total",
        "Total number of remote lease acquisitions"
    );
    describe_counter!(
        "fleetsync_lock_released_total",
        "Total number of clean lease releases"
    );
    describe_counter!(
        "fleetsync_lock_lease_lost_total",
        "Total number of unlocks that found the lease lost"
    );
    describe_counter!(
        "fleetsync_lock_refresh_total",
        "Total number of lease refresh ticks by outcome"
    );
    describe_counter!(
        "fleetsync_lock_schedule_rejected_total",
        "Total number of acquisitions unwound because refresh could not be scheduled"
    );
    describe_histogram!(
        "fleetsync_lock_acquire_wait_seconds",
        "Time spent waiting for a remote lease"
    );

    tracing::debug!("Lock metrics described");
}

/// Record a remote lease acquisition
pub(crate) fn record_acquired(key: &str, wait_secs: f64) {
    counter!("fleetsync_lock_acquired_total", "lock" => key.to_string()).increment(1);
    histogram!("fleetsync_lock_acquire_wait_seconds", "lock" => key.to_string()).record(wait_secs);
}

/// Record a final unlock; `lease_lost` when the lease was no longer ours
pub(crate) fn record_released(key: &str, lease_lost: bool) {
    if lease_lost {
        counter!("fleetsync_lock_lease_lost_total", "lock" => key.to_string()).increment(1);
    } else {
        counter!("fleetsync_lock_released_total", "lock" => key.to_string()).increment(1);
    }
}

pub(crate) fn record_refresh(key: &str, outcome: &'static str) {
    counter!("fleetsync_lock_refresh_total", "lock" => key.to_string(), "outcome" => outcome)
        .increment(1);
}

pub(crate) fn record_schedule_rejected(key: &str) {
    counter!("fleetsync_lock_schedule_rejected_total", "lock" => key.to_string()).increment(1);
}
