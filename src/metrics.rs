//! Coordination metrics for rslock
//!
//! Cheap atomic counters tracking lock traffic, deadlock resolution and
//! hook behavior, with a serializable snapshot for export.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use serde::{Deserialize, Serialize};

/// Counter set maintained by a lock manager
#[derive(Debug)]
pub struct MetricsCollector {
    /// Successful lock grants (fast path and after a wait)
    pub acquires_total: AtomicU64,
    /// Acquisitions that had to record a wait edge before blocking
    pub contended_waits: AtomicU64,
    /// Lock releases (each reentrance decrement counts)
    pub releases_total: AtomicU64,
    /// Timed acquisitions that expired
    pub timeouts_total: AtomicU64,
    /// Cancellations routed through the manager
    pub interrupts_total: AtomicU64,
    /// Acquisitions granted by the hook without blocking
    pub hook_grants: AtomicU64,
    /// Hook callbacks that panicked and were neutralized
    pub hook_panics: AtomicU64,
    /// Wait cycles found by the detector
    pub deadlocks_detected: AtomicU64,
    /// Locks forcibly released during resolution
    pub locks_suspended: AtomicU64,
    /// Suspension records replayed on victim resume
    pub suspensions_resumed: AtomicU64,
    /// Graph failures that disabled the detector
    pub internal_errors: AtomicU64,
    /// Start time for uptime calculation
    start_time: Instant,
}

impl MetricsCollector {
    pub fn new() -> Self {
        Self {
            acquires_total: AtomicU64::new(0),
            contended_waits: AtomicU64::new(0),
            releases_total: AtomicU64::new(0),
            timeouts_total: AtomicU64::new(0),
            interrupts_total: AtomicU64::new(0),
            hook_grants: AtomicU64::new(0),
            hook_panics: AtomicU64::new(0),
            deadlocks_detected: AtomicU64::new(0),
            locks_suspended: AtomicU64::new(0),
            suspensions_resumed: AtomicU64::new(0),
            internal_errors: AtomicU64::new(0),
            start_time: Instant::now(),
        }
    }

    pub fn record_acquire(&self) {
        self.acquires_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_contended_wait(&self) {
        self.contended_waits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_release(&self) {
        self.releases_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_timeout(&self) {
        self.timeouts_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_interrupt(&self) {
        self.interrupts_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_hook_grant(&self) {
        self.hook_grants.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_hook_panic(&self) {
        self.hook_panics.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_deadlock(&self, suspended_locks: usize) {
        self.deadlocks_detected.fetch_add(1, Ordering::Relaxed);
        self.locks_suspended
            .fetch_add(suspended_locks as u64, Ordering::Relaxed);
    }

    pub fn record_resume(&self) {
        self.suspensions_resumed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_internal_error(&self) {
        self.internal_errors.fetch_add(1, Ordering::Relaxed);
    }

    /// Take a consistent-enough snapshot of all counters.
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            acquires_total: self.acquires_total.load(Ordering::Relaxed),
            contended_waits: self.contended_waits.load(Ordering::Relaxed),
            releases_total: self.releases_total.load(Ordering::Relaxed),
            timeouts_total: self.timeouts_total.load(Ordering::Relaxed),
            interrupts_total: self.interrupts_total.load(Ordering::Relaxed),
            hook_grants: self.hook_grants.load(Ordering::Relaxed),
            hook_panics: self.hook_panics.load(Ordering::Relaxed),
            deadlocks_detected: self.deadlocks_detected.load(Ordering::Relaxed),
            locks_suspended: self.locks_suspended.load(Ordering::Relaxed),
            suspensions_resumed: self.suspensions_resumed.load(Ordering::Relaxed),
            internal_errors: self.internal_errors.load(Ordering::Relaxed),
            uptime_seconds: self.start_time.elapsed().as_secs(),
        }
    }
}

impl Default for MetricsCollector {
    fn default() -> Self {
        Self::new()
    }
}

/// Point-in-time view of the collector
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub acquires_total: u64,
    pub contended_waits: u64,
    pub releases_total: u64,
    pub timeouts_total: u64,
    pub interrupts_total: u64,
    pub hook_grants: u64,
    pub hook_panics: u64,
    pub deadlocks_detected: u64,
    pub locks_suspended: u64,
    pub suspensions_resumed: u64,
    pub internal_errors: u64,
    pub uptime_seconds: u64,
}

/// Shared metrics collector handle
pub type SharedMetricsCollector = Arc<MetricsCollector>;

/// Create a new shared metrics collector
pub fn new_shared_metrics_collector() -> SharedMetricsCollector {
    Arc::new(MetricsCollector::new())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_accumulate() {
        let metrics = MetricsCollector::new();
        metrics.record_acquire();
        metrics.record_acquire();
        metrics.record_release();
        metrics.record_deadlock(3);

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.acquires_total, 2);
        assert_eq!(snapshot.releases_total, 1);
        assert_eq!(snapshot.deadlocks_detected, 1);
        assert_eq!(snapshot.locks_suspended, 3);
        assert_eq!(snapshot.timeouts_total, 0);
    }

    #[test]
    fn test_snapshot_is_detached() {
        let metrics = MetricsCollector::new();
        let before = metrics.snapshot();
        metrics.record_timeout();
        assert_eq!(before.timeouts_total, 0);
        assert_eq!(metrics.snapshot().timeouts_total, 1);
    }
}
