//! Wake/wait primitive.
//!
//! The engine itself has no suspension points; it only *wakes* this
//! primitive when a delivery commits. Blocking on it — and cancelling the
//! block — is entirely the caller's business.

use std::time::Duration;

use parking_lot::{Condvar, Mutex};

/// A wait queue a peer's consumer can block on.
pub struct WaitQueue {
    lock: Mutex<()>,
    cond: Condvar,
}

impl WaitQueue {
    #[must_use]
    pub fn new() -> Self {
        Self {
            lock: Mutex::new(()),
            cond: Condvar::new(),
        }
    }

    /// Wake all waiters.
    ///
    /// Taking the mutex first closes the window between a waiter's
    /// condition check and its wait: a waiter either has not checked yet
    /// (and will observe the new state) or is parked (and gets notified).
    pub fn wake(&self) {
        let _guard = self.lock.lock();
        self.cond.notify_all();
    }

    /// Block until `ready` returns true.
    ///
    /// `ready` is evaluated under the wait lock; it must only inspect
    /// atomics (typically [`Peer::poll`](crate::Peer::poll)).
    pub fn wait_until(&self, mut ready: impl FnMut() -> bool) {
        let mut guard = self.lock.lock();
        while !ready() {
            self.cond.wait(&mut guard);
        }
    }

    /// Block until `ready` returns true or `timeout` elapses. Returns the
    /// final evaluation of `ready`.
    pub fn wait_for(&self, timeout: Duration, mut ready: impl FnMut() -> bool) -> bool {
        let deadline = std::time::Instant::now() + timeout;
        let mut guard = self.lock.lock();
        while !ready() {
            if self.cond.wait_until(&mut guard, deadline).timed_out() {
                return ready();
            }
        }
        true
    }
}

impl Default for WaitQueue {
    fn default() -> Self {
        Self::new()
    }
}
