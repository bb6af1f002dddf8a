//! Reentrant FIFO lock with forced release
//!
//! An ordered lock grants immediately to its owner or to the first
//! arrival on an idle lock; everyone else queues a semaphore and blocks.
//! Ownership moves strictly in queue order, except that deadlock
//! resolution may force the current owner to release so that the next
//! waiter can progress; the owner reacquires and has its reentrance
//! depth restored when it resumes.
//!
//! The lock's own mutex may be held while calling into the manager (lock
//! mutex then graph mutex is the permitted nesting), but never while
//! blocking on a semaphore or while running hook callbacks.

use std::fmt;
use std::sync::{Arc, Weak};
use std::thread;
use std::time::Duration;

use parking_lot::Mutex;

use crate::common::{FOREVER, Result, RsLockError, ThreadRef};
use crate::core::rule::{Resource, SchedulingRule, same_rule};
use crate::core::semaphore::Semaphore;
use crate::core::wait_queue::WaitQueue;
use crate::manager::ManagerInner;

pub struct OrderedLock {
    id: u64,
    manager: Weak<ManagerInner>,
    weak_self: Weak<OrderedLock>,
    state: Mutex<LockState>,
}

struct LockState {
    owner: Option<std::thread::ThreadId>,
    depth: u32,
    queue: WaitQueue,
}

impl LockState {
    fn new() -> Self {
        Self {
            owner: None,
            depth: 0,
            queue: WaitQueue::new(),
        }
    }
}

impl OrderedLock {
    pub(crate) fn create(id: u64, manager: Weak<ManagerInner>) -> Arc<Self> {
        Arc::new_cyclic(|weak_self| Self {
            id,
            manager,
            weak_self: weak_self.clone(),
            state: Mutex::new(LockState::new()),
        })
    }

    pub(crate) fn id(&self) -> u64 {
        self.id
    }

    /// Current reentrance depth; zero iff unowned.
    pub fn depth(&self) -> u32 {
        self.state.lock().depth
    }

    #[cfg(test)]
    pub(crate) fn waiters(&self) -> usize {
        self.state.lock().queue.len()
    }

    /// Acquire, blocking as long as it takes. Cancellations are absorbed
    /// and the pending flag is re-asserted for the thread on return, so
    /// the next timed acquire will observe them.
    pub fn acquire(&self) {
        let mut interrupted = false;
        loop {
            match self.acquire_timeout(FOREVER) {
                Ok(true) => break,
                Ok(false) => continue,
                Err(_) => {
                    interrupted = true;
                    continue;
                }
            }
        }
        if interrupted {
            if let Some(manager) = self.manager() {
                manager.set_pending_interrupt(thread::current().id());
            }
        }
    }

    /// Acquire with a timeout. Returns `Ok(false)` when the timeout
    /// elapses and `Err(Interrupted)` when a cancellation is pending at
    /// entry (consuming it) or delivered during the wait.
    pub fn acquire_timeout(&self, timeout: Duration) -> Result<bool> {
        let me = ThreadRef::current();
        if let Some(manager) = self.manager() {
            if manager.take_pending_interrupt(me.id) {
                return Err(RsLockError::Interrupted);
            }
        }
        let outcome = self.do_acquire(&me, timeout);
        if let Some(manager) = self.manager() {
            manager.resume_suspended(&me);
        }
        outcome
    }

    fn do_acquire(&self, me: &ThreadRef, timeout: Duration) -> Result<bool> {
        // Immediate grant: reentrant, or idle with nobody queued ahead.
        let (semaphore, owner_at_enqueue) = {
            let mut state = self.state.lock();
            if state.owner == Some(me.id) || (state.owner.is_none() && state.queue.is_empty()) {
                self.grant_locked(&mut state, me);
                return Ok(true);
            }
            let semaphore = match state.queue.waiter_for(me.id) {
                Some(existing) => existing,
                None => {
                    let fresh = Arc::new(Semaphore::new(me.clone()));
                    state.queue.enqueue(fresh.clone());
                    fresh
                }
            };
            (semaphore, state.owner)
        };

        // Give the hook a chance to service pending work before we block.
        let manager = self.manager();
        if let Some(manager) = manager.as_ref() {
            if manager.about_to_wait(owner_at_enqueue) {
                let mut state = self.state.lock();
                state.queue.remove(&semaphore);
                self.grant_locked(&mut state, me);
                manager.metrics.record_hook_grant();
                return Ok(true);
            }
        }

        // A hook that re-entered this lock may have pulled our semaphore
        // out of the queue; a re-enqueue lands behind any newcomers.
        {
            let mut state = self.state.lock();
            if state.queue.position(&semaphore).is_none() {
                state.queue.enqueue(semaphore.clone());
            }
        }

        if let Some(manager) = manager.as_ref() {
            if let Some(resource) = self.resource() {
                manager.record_wait_started(me, &resource);
            }
            manager.register_waiter(me.id, semaphore.clone());
        }
        let waited = semaphore.acquire(timeout);
        if let Some(manager) = manager.as_ref() {
            manager.unregister_waiter(me.id);
        }

        match waited {
            Ok(true) => {
                let mut state = self.state.lock();
                state.queue.remove(&semaphore);
                self.grant_locked(&mut state, me);
                Ok(true)
            }
            Ok(false) | Err(_) => {
                let granted = {
                    let mut state = self.state.lock();
                    // The handoff may have raced the timeout or the
                    // interrupt; a delivered permit means we own the lock.
                    if semaphore.try_acquire() {
                        state.queue.remove(&semaphore);
                        self.grant_locked(&mut state, me);
                        true
                    } else {
                        state.queue.remove(&semaphore);
                        false
                    }
                };
                if granted {
                    if waited.is_err() {
                        // The grant wins; keep the cancellation pending.
                        if let Some(manager) = manager.as_ref() {
                            manager.set_pending_interrupt(me.id);
                        }
                    }
                    return Ok(true);
                }
                if let Some(manager) = manager.as_ref() {
                    if let Some(resource) = self.resource() {
                        manager.record_wait_stopped(me.id, &resource);
                    }
                    if waited.is_ok() {
                        manager.metrics.record_timeout();
                    }
                }
                waited
            }
        }
    }

    /// Release one level of reentrance; at depth zero this is a no-op.
    /// Hands ownership to the head of the queue when the depth reaches
    /// zero.
    pub fn release(&self) {
        let me = thread::current().id();
        {
            let mut state = self.state.lock();
            if state.depth == 0 {
                return;
            }
            assert_eq!(
                state.owner,
                Some(me),
                "lock #{} released by a thread that does not own it",
                self.id
            );
            if state.depth > 1 {
                state.depth -= 1;
                drop(state);
                if let Some(manager) = self.manager() {
                    if let Some(resource) = self.resource() {
                        manager.record_released(me, &resource);
                    }
                }
                return;
            }
        }

        // Depth is about to reach zero: run the hook outside the mutex.
        if let Some(manager) = self.manager() {
            manager.about_to_release();
        }

        {
            let mut state = self.state.lock();
            if state.owner != Some(me) {
                // A deadlock resolution forced the lock away while the
                // hook ran; nothing left to hand off.
                return;
            }
            state.owner = None;
            state.depth = 0;
            if let Some(next) = state.queue.peek() {
                next.release();
            }
        }
        if let Some(manager) = self.manager() {
            if let Some(resource) = self.resource() {
                manager.record_released(me, &resource);
            }
        }
    }

    /// Release on behalf of the blocked owner so that a deadlock can be
    /// broken, returning the depth that must be restored on resume.
    /// Returns 0 without side effects when the lock is already unowned.
    ///
    /// Unlike `release`, this does not notify the hook: the resolver
    /// runs this under its resolution mutex and has already notified
    /// the hook before entering that critical section.
    pub(crate) fn force_release(&self) -> u32 {
        let (saved_depth, intended_owner) = {
            let mut state = self.state.lock();
            if state.depth == 0 {
                return 0;
            }
            let saved = state.depth;
            let owner = state.owner.take();
            state.depth = 0;
            if let Some(next) = state.queue.peek() {
                next.release();
            }
            (saved, owner)
        };
        if let (Some(manager), Some(owner), Some(resource)) =
            (self.manager(), intended_owner, self.resource())
        {
            manager.record_released_completely(owner, &resource);
        }
        saved_depth
    }

    /// Restore the reentrance depth after a resume reacquired the lock
    /// at depth 1, keeping the graph's hold multiplicity in step.
    pub(crate) fn set_depth(&self, me: &ThreadRef, depth: u32) {
        let mut state = self.state.lock();
        debug_assert_eq!(state.owner, Some(me.id));
        while state.depth < depth {
            state.depth += 1;
            if let Some(manager) = self.manager() {
                if let Some(resource) = self.resource() {
                    manager.record_depth_bump(me, &resource);
                }
            }
        }
    }

    fn grant_locked(&self, state: &mut LockState, me: &ThreadRef) {
        state.owner = Some(me.id);
        state.depth += 1;
        if let Some(manager) = self.manager() {
            if let Some(resource) = self.resource() {
                manager.record_acquired(me, &resource);
            }
        }
    }

    fn manager(&self) -> Option<Arc<ManagerInner>> {
        self.manager.upgrade()
    }

    fn resource(&self) -> Option<Resource> {
        self.weak_self.upgrade().map(Resource::Lock)
    }
}

impl SchedulingRule for OrderedLock {
    fn contains(&self, other: &dyn SchedulingRule) -> bool {
        same_rule(self, other)
    }

    fn conflicts_with(&self, other: &dyn SchedulingRule) -> bool {
        same_rule(self, other)
    }

    fn as_any(&self) -> &dyn std::any::Any {
        self
    }
}

impl fmt::Debug for OrderedLock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.state.try_lock() {
            Some(state) => write!(
                f,
                "OrderedLock #{} (depth {}, {} queued)",
                self.id,
                state.depth,
                state.queue.len()
            ),
            None => write!(f, "OrderedLock #{} (busy)", self.id),
        }
    }
}
