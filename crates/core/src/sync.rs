//! Small synchronization helpers shared by the session loops.

use std::time::Duration;

use parking_lot::{Condvar, Mutex};

/// A resettable rendezvous latch.
///
/// One side [`arm`]s it before the handoff matters, the producing side
/// [`release`]s it, and the consuming side [`wait`]s until released. An
/// unarmed latch releases waiters immediately, so an early exit on either
/// side cannot strand the other.
///
/// [`arm`]: SyncPoint::arm
/// [`release`]: SyncPoint::release
/// [`wait`]: SyncPoint::wait
pub struct SyncPoint {
    armed: Mutex<bool>,
    released: Condvar,
}

impl SyncPoint {
    pub fn new() -> Self {
        SyncPoint {
            armed: Mutex::new(false),
            released: Condvar::new(),
        }
    }

    /// Require the next [`wait`](Self::wait) to block until released.
    pub fn arm(&self) {
        *self.armed.lock() = true;
    }

    pub fn is_armed(&self) -> bool {
        *self.armed.lock()
    }

    /// Let waiters through and disarm.
    pub fn release(&self) {
        *self.armed.lock() = false;
        self.released.notify_all();
    }

    /// Block while armed.
    pub fn wait(&self) {
        let mut armed = self.armed.lock();
        while *armed {
            self.released.wait(&mut armed);
        }
    }

    /// Block while armed, up to `timeout`. Returns false on timeout.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let mut armed = self.armed.lock();
        while *armed {
            if self.released.wait_for(&mut armed, timeout).timed_out() {
                return !*armed;
            }
        }
        true
    }
}

impl Default for SyncPoint {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn unarmed_wait_passes() {
        let latch = SyncPoint::new();
        latch.wait();
    }

    #[test]
    fn armed_wait_blocks_until_release() {
        let latch = Arc::new(SyncPoint::new());
        latch.arm();
        let releaser = latch.clone();
        let handle = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(50));
            releaser.release();
        });
        latch.wait();
        assert!(!latch.is_armed());
        handle.join().unwrap();
    }

    #[test]
    fn wait_timeout_reports_failure() {
        let latch = SyncPoint::new();
        latch.arm();
        assert!(!latch.wait_timeout(Duration::from_millis(20)));
        latch.release();
        assert!(latch.wait_timeout(Duration::from_millis(20)));
    }
}
