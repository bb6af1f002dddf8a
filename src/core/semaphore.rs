//! Per-waiter handoff primitive
//!
//! Each thread queued on an ordered lock blocks on its own binary
//! semaphore. Ownership of the lock is transferred by releasing the
//! semaphore at the head of the queue; the waiter consumes the permit
//! when it wakes. A permit delivered while the waiter is timing out
//! still wins, which keeps the handoff lossless.

use std::fmt;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use crate::common::{Result, RsLockError, ThreadRef};

pub struct Semaphore {
    owner: ThreadRef,
    state: Mutex<SemState>,
    wakeup: Condvar,
}

#[derive(Default)]
struct SemState {
    released: bool,
    interrupted: bool,
}

impl Semaphore {
    pub fn new(owner: ThreadRef) -> Self {
        Self {
            owner,
            state: Mutex::new(SemState::default()),
            wakeup: Condvar::new(),
        }
    }

    /// The thread this semaphore was created for.
    pub fn owner(&self) -> &ThreadRef {
        &self.owner
    }

    /// Deliver the permit. Idempotent; a permit that arrives before the
    /// waiter blocks is consumed by the next `acquire`.
    pub fn release(&self) {
        let mut state = self.state.lock();
        if !state.released {
            state.released = true;
            self.wakeup.notify_one();
        }
    }

    /// Deliver a cancellation to the blocked waiter.
    pub fn interrupt(&self) {
        let mut state = self.state.lock();
        state.interrupted = true;
        self.wakeup.notify_all();
    }

    /// Consume an already-delivered permit without blocking.
    pub fn try_acquire(&self) -> bool {
        let mut state = self.state.lock();
        if state.released {
            state.released = false;
            true
        } else {
            false
        }
    }

    /// Block until the permit arrives, a cancellation is delivered, or
    /// `timeout` elapses. `Duration::MAX` means no deadline.
    pub fn acquire(&self, timeout: Duration) -> Result<bool> {
        let deadline = Instant::now().checked_add(timeout);
        let mut state = self.state.lock();
        loop {
            if state.released {
                state.released = false;
                return Ok(true);
            }
            if state.interrupted {
                state.interrupted = false;
                return Err(RsLockError::Interrupted);
            }
            match deadline {
                None => self.wakeup.wait(&mut state),
                Some(deadline) => {
                    if self.wakeup.wait_until(&mut state, deadline).timed_out() {
                        // The release may have raced the timeout; it wins.
                        if state.released {
                            state.released = false;
                            return Ok(true);
                        }
                        if state.interrupted {
                            state.interrupted = false;
                            return Err(RsLockError::Interrupted);
                        }
                        return Ok(false);
                    }
                }
            }
        }
    }
}

impl fmt::Debug for Semaphore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Semaphore({:?})", self.owner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_release_before_acquire() {
        let sem = Semaphore::new(ThreadRef::current());
        sem.release();
        assert!(sem.acquire(Duration::from_millis(10)).unwrap());
    }

    #[test]
    fn test_release_is_idempotent() {
        let sem = Semaphore::new(ThreadRef::current());
        sem.release();
        sem.release();
        assert!(sem.acquire(Duration::from_millis(10)).unwrap());
        // Only one permit was stored.
        assert!(!sem.acquire(Duration::from_millis(10)).unwrap());
    }

    #[test]
    fn test_timeout_expires() {
        let sem = Semaphore::new(ThreadRef::current());
        assert!(!sem.acquire(Duration::from_millis(20)).unwrap());
    }

    #[test]
    fn test_try_acquire_consumes_permit() {
        let sem = Semaphore::new(ThreadRef::current());
        assert!(!sem.try_acquire());
        sem.release();
        assert!(sem.try_acquire());
        assert!(!sem.try_acquire());
    }

    #[test]
    fn test_cross_thread_handoff() {
        let sem = Arc::new(Semaphore::new(ThreadRef::current()));
        let releaser = {
            let sem = sem.clone();
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(20));
                sem.release();
            })
        };
        assert!(sem.acquire(Duration::from_secs(5)).unwrap());
        releaser.join().unwrap();
    }

    #[test]
    fn test_interrupt_wakes_waiter() {
        let sem = Arc::new(Semaphore::new(ThreadRef::current()));
        let interrupter = {
            let sem = sem.clone();
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(20));
                sem.interrupt();
            })
        };
        let result = sem.acquire(Duration::from_secs(5));
        assert!(matches!(result, Err(RsLockError::Interrupted)));
        interrupter.join().unwrap();
    }
}
