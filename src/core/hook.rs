//! External scheduler callback surface
//!
//! An embedding scheduler can install a hook on the lock manager to run
//! pending cooperative work right before a thread blocks on a lock, and
//! to observe releases. The hook runs outside the manager and lock
//! mutexes and may be invoked from any thread; it must not block on any
//! manager-owned resource.

use std::thread::ThreadId;

pub trait LockHook: Send + Sync {
    /// Called on the acquiring thread right before it would block,
    /// with the identity of the current lock owner if there is one.
    /// Returning `true` means the host has serviced the pending work
    /// and the lock should be granted immediately without blocking.
    fn about_to_wait(&self, lock_owner: Option<ThreadId>) -> bool {
        let _ = lock_owner;
        false
    }

    /// Called right before a lock's depth reaches zero and ownership is
    /// handed to the next waiter.
    fn about_to_release(&self) {}
}
