//! Lock manager: the single coordination point
//!
//! The manager owns the wait-for graph, the per-thread stacks of
//! suspended lock states, the cancellation routing table and the
//! optional scheduler hook. All graph mutation is serialized by one
//! mutex; deadlock resolution and suspension-record pops are serialized
//! by a second, so a victim racing its own suspension always observes
//! the pushed record.
//!
//! Any unexpected graph failure disables the detector permanently:
//! subsequent graph operations degrade to no-ops, locks keep working,
//! and deadlock detection is forfeit for the rest of the process.

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread::{self, ThreadId};

use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};

use crate::common::{Config, Result, ThreadRef};
use crate::core::detector::{Deadlock, DeadlockDetector};
use crate::core::hook::LockHook;
use crate::core::ordered_lock::OrderedLock;
use crate::core::rule::Resource;
use crate::core::semaphore::Semaphore;
use crate::metrics::{MetricsCollector, SharedMetricsCollector};

/// Lock depths captured when a victim's locks were forcibly released,
/// replayed in order when the victim resumes.
type SuspensionRecord = Vec<(Arc<OrderedLock>, u32)>;

#[derive(Default)]
struct InterruptEntry {
    pending: bool,
    semaphore: Option<Arc<Semaphore>>,
}

/// Cheaply cloneable handle over the coordinator state. One instance per
/// process is conventional but not enforced.
#[derive(Clone)]
pub struct LockManager {
    inner: Arc<ManagerInner>,
}

pub(crate) struct ManagerInner {
    config: Config,
    graph: Mutex<Option<DeadlockDetector>>,
    suspended: DashMap<ThreadId, Vec<SuspensionRecord>>,
    interrupts: DashMap<ThreadId, InterruptEntry>,
    hook: RwLock<Option<Arc<dyn LockHook>>>,
    /// Serializes deadlock resolution against suspension-record pops.
    resolution: Mutex<()>,
    next_lock_id: AtomicU64,
    pub(crate) metrics: SharedMetricsCollector,
}

impl LockManager {
    /// Create a manager with the default configuration.
    pub fn new() -> Self {
        Self::with_config(Config::default()).expect("default configuration is valid")
    }

    /// Create a manager with an explicit configuration.
    pub fn with_config(config: Config) -> Result<Self> {
        config.validate()?;
        let graph = config.deadlock_detection.then(DeadlockDetector::new);
        Ok(Self {
            inner: Arc::new(ManagerInner {
                config,
                graph: Mutex::new(graph),
                suspended: DashMap::new(),
                interrupts: DashMap::new(),
                hook: RwLock::new(None),
                resolution: Mutex::new(()),
                next_lock_id: AtomicU64::new(0),
                metrics: Arc::new(MetricsCollector::new()),
            }),
        })
    }

    /// Allocate a new ordered lock coordinated by this manager.
    pub fn new_lock(&self) -> Arc<OrderedLock> {
        let id = self.inner.next_lock_id.fetch_add(1, Ordering::Relaxed);
        OrderedLock::create(id, Arc::downgrade(&self.inner))
    }

    /// Install or clear the scheduler hook.
    pub fn set_hook(&self, hook: Option<Arc<dyn LockHook>>) {
        *self.inner.hook.write() = hook;
    }

    /// Whether the calling thread holds or waits for any resource. Any
    /// thread named with the configured worker prefix is always reported
    /// as an owner, so external joiners observe the correct answer for
    /// pool threads whose edges come and go.
    pub fn is_lock_owner(&self) -> bool {
        let current = thread::current();
        let prefix = &self.inner.config.worker_thread_prefix;
        if !prefix.is_empty()
            && current
                .name()
                .is_some_and(|name| name.starts_with(prefix.as_str()))
        {
            return true;
        }
        self.inner
            .graph
            .lock()
            .as_ref()
            .is_some_and(|graph| graph.involves(current.id()))
    }

    /// Whether the graph and the suspension table hold no state. Useful
    /// for tests asserting clean shutdown.
    pub fn is_empty(&self) -> bool {
        self.inner.suspended.is_empty()
            && self
                .inner
                .graph
                .lock()
                .as_ref()
                .is_none_or(|graph| graph.is_empty())
    }

    /// Whether deadlock detection is still active.
    pub fn detection_enabled(&self) -> bool {
        self.inner.graph.lock().is_some()
    }

    /// Deliver a cancellation to `thread`. If it is blocked in a timed
    /// or untimed acquire the wait is woken immediately; otherwise the
    /// cancellation stays pending until the thread's next timed acquire.
    pub fn interrupt(&self, thread: ThreadId) {
        self.inner.metrics.record_interrupt();
        let mut entry = self.inner.interrupts.entry(thread).or_default();
        if let Some(semaphore) = entry.semaphore.clone() {
            semaphore.interrupt();
        } else {
            entry.pending = true;
        }
    }

    /// Shared metrics handle.
    pub fn metrics(&self) -> SharedMetricsCollector {
        self.inner.metrics.clone()
    }

    // Rule-facing graph bookkeeping, on behalf of the calling thread.
    // Embedding schedulers call these when user rules are begun, waited
    // on and ended; ordered locks report through the same paths
    // internally.

    /// Record that the calling thread now holds `resource`.
    pub fn acquired(&self, resource: &Resource) {
        self.inner.record_acquired(&ThreadRef::current(), resource);
    }

    /// Record that the calling thread is about to block on `resource`,
    /// running deadlock detection and resolution.
    pub fn wait_started(&self, resource: &Resource) {
        self.inner.record_wait_started(&ThreadRef::current(), resource);
    }

    /// Record that the calling thread stopped waiting on `resource`
    /// without acquiring it.
    pub fn wait_stopped(&self, resource: &Resource) {
        self.inner
            .record_wait_stopped(thread::current().id(), resource);
    }

    /// Record one reentrance decrement of `resource` by the calling
    /// thread.
    pub fn released(&self, resource: &Resource) {
        self.inner.record_released(thread::current().id(), resource);
    }

    /// Record that the calling thread no longer holds `resource` at any
    /// depth.
    pub fn released_completely(&self, resource: &Resource) {
        self.inner
            .record_released_completely(thread::current().id(), resource);
    }
}

impl Default for LockManager {
    fn default() -> Self {
        Self::new()
    }
}

impl ManagerInner {
    /// Run a graph operation, disabling the detector permanently on any
    /// failure. Returns None when detection is off or was just disabled.
    fn with_graph<T>(
        &self,
        operation: impl FnOnce(&mut DeadlockDetector) -> Result<T>,
    ) -> Option<T> {
        let mut guard = self.graph.lock();
        let graph = guard.as_mut()?;
        match operation(&mut *graph) {
            Ok(value) => Some(value),
            Err(error) => {
                self.metrics.record_internal_error();
                log::error!(
                    "wait graph failure ({}), disabling deadlock detection: {}",
                    error.category(),
                    error
                );
                if self.config.log_wait_graph_on_error {
                    log::error!("final {:?}", graph);
                }
                *guard = None;
                None
            }
        }
    }

    pub(crate) fn record_acquired(&self, thread: &ThreadRef, resource: &Resource) {
        self.metrics.record_acquire();
        self.with_graph(|graph| {
            graph.acquired(thread, resource);
            Ok(())
        });
    }

    /// Graph-only reentrance bump used when a restored depth is replayed.
    pub(crate) fn record_depth_bump(&self, thread: &ThreadRef, resource: &Resource) {
        self.with_graph(|graph| {
            graph.acquired(thread, resource);
            Ok(())
        });
    }

    pub(crate) fn record_wait_started(&self, thread: &ThreadRef, resource: &Resource) {
        self.metrics.record_contended_wait();
        let deadlock = self
            .with_graph(|graph| graph.wait_start(thread, resource))
            .flatten();
        if let Some(deadlock) = deadlock {
            self.resolve_deadlock(deadlock);
        }
    }

    pub(crate) fn record_wait_stopped(&self, thread: ThreadId, resource: &Resource) {
        self.with_graph(|graph| {
            graph.wait_stop(thread, resource);
            Ok(())
        });
    }

    pub(crate) fn record_released(&self, thread: ThreadId, resource: &Resource) {
        self.metrics.record_release();
        self.with_graph(|graph| graph.released(thread, resource));
    }

    pub(crate) fn record_released_completely(&self, thread: ThreadId, resource: &Resource) {
        self.with_graph(|graph| {
            graph.released_completely(thread, resource);
            Ok(())
        });
    }

    /// Suspend the victim's contested locks so the rest of the cycle can
    /// progress. The record is pushed before the locks are handed off;
    /// pops synchronize on the resolution mutex, so the victim cannot
    /// resume past a record that is still being prepared.
    fn resolve_deadlock(&self, deadlock: Deadlock) {
        // The pre-release hook must run outside the resolution mutex and
        // the lock mutexes; a hook that re-enters the coordinator would
        // otherwise self-deadlock on `resolution`. Notify once per lock
        // up front; the forced releases below skip their own
        // notification. A resolution that aborts after this point has
        // notified the hook spuriously, which the hook contract allows.
        for _ in &deadlock.locks {
            self.about_to_release();
        }

        let _resolution = self.resolution.lock();

        // The victim may have timed out of its wait while we dropped the
        // graph mutex; its cycle is already broken then.
        let still_waiting = self
            .with_graph(|graph| Ok(graph.is_waiting(deadlock.victim.id)))
            .unwrap_or(false);
        if !still_waiting {
            log::debug!(
                "deadlock victim {:?} stopped waiting before resolution; nothing to do",
                deadlock.victim
            );
            return;
        }

        let mut record: SuspensionRecord = Vec::with_capacity(deadlock.locks.len());
        for lock in &deadlock.locks {
            let depth = lock.depth();
            // Zero means a concurrent resolution pass already took it.
            if depth > 0 {
                record.push((lock.clone(), depth));
            }
        }
        if record.is_empty() {
            return;
        }

        log::warn!(
            "deadlock among threads {:?}: suspending {} lock(s) held by {:?}",
            deadlock.cycle,
            record.len(),
            deadlock.victim
        );
        self.metrics.record_deadlock(record.len());

        self.suspended
            .entry(deadlock.victim.id)
            .or_default()
            .push(record.clone());
        for (lock, _) in &record {
            lock.force_release();
        }
    }

    /// Pop the victim's most recent suspension record, if any, and
    /// reacquire each lock at its recorded depth. Runs on the victim
    /// thread after every acquire attempt. The nested untimed acquires
    /// can themselves be suspended again; the per-thread stack composes
    /// those suspensions LIFO.
    pub(crate) fn resume_suspended(&self, thread: &ThreadRef) {
        let record = {
            let _resolution = self.resolution.lock();
            self.suspended
                .get_mut(&thread.id)
                .and_then(|mut records| records.pop())
        };
        self.suspended
            .remove_if(&thread.id, |_, records| records.is_empty());
        let Some(record) = record else {
            return;
        };

        self.metrics.record_resume();
        log::debug!(
            "thread {:?} reacquiring {} suspended lock(s)",
            thread,
            record.len()
        );
        for (lock, depth) in record {
            lock.acquire();
            lock.set_depth(thread, depth);
        }
    }

    /// Forward to the hook; a panicking hook is neutralized to `false`.
    pub(crate) fn about_to_wait(&self, lock_owner: Option<ThreadId>) -> bool {
        let Some(hook) = self.hook.read().clone() else {
            return false;
        };
        match catch_unwind(AssertUnwindSafe(|| hook.about_to_wait(lock_owner))) {
            Ok(granted) => granted,
            Err(_) => {
                self.metrics.record_hook_panic();
                log::error!("lock hook panicked in about_to_wait; treated as no grant");
                false
            }
        }
    }

    /// Forward to the hook; a panicking hook is neutralized to a no-op.
    pub(crate) fn about_to_release(&self) {
        let Some(hook) = self.hook.read().clone() else {
            return;
        };
        if catch_unwind(AssertUnwindSafe(|| hook.about_to_release())).is_err() {
            self.metrics.record_hook_panic();
            log::error!("lock hook panicked in about_to_release; ignored");
        }
    }

    /// Consume a pending cancellation for `thread`, if one is set.
    pub(crate) fn take_pending_interrupt(&self, thread: ThreadId) -> bool {
        let taken = match self.interrupts.get_mut(&thread) {
            Some(mut entry) if entry.pending => {
                entry.pending = false;
                true
            }
            _ => false,
        };
        self.prune_interrupt_entry(thread);
        taken
    }

    /// Re-assert a pending cancellation for `thread`.
    pub(crate) fn set_pending_interrupt(&self, thread: ThreadId) {
        self.interrupts.entry(thread).or_default().pending = true;
    }

    /// Route future interrupts for `thread` to `semaphore`. A
    /// cancellation that arrived since the caller's entry check is
    /// delivered through the semaphore right away.
    pub(crate) fn register_waiter(&self, thread: ThreadId, semaphore: Arc<Semaphore>) {
        let mut entry = self.interrupts.entry(thread).or_default();
        if entry.pending {
            entry.pending = false;
            semaphore.interrupt();
        }
        entry.semaphore = Some(semaphore);
    }

    pub(crate) fn unregister_waiter(&self, thread: ThreadId) {
        if let Some(mut entry) = self.interrupts.get_mut(&thread) {
            entry.semaphore = None;
        }
        self.prune_interrupt_entry(thread);
    }

    fn prune_interrupt_entry(&self, thread: ThreadId) {
        self.interrupts
            .remove_if(&thread, |_, entry| !entry.pending && entry.semaphore.is_none());
    }
}
