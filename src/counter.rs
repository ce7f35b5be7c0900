//! Live-connection counter shared by every connection handler.
//!
//! The value equals the number of handlers currently between accept and
//! close. It is only mutated under the lock, and the lock is never held
//! across I/O.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::trace;

/// Process-wide count of open connections.
#[derive(Debug, Default)]
pub struct ConnectionCounter {
    active: Mutex<usize>,
}

impl ConnectionCounter {
    /// Create a counter starting at zero.
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Increment and return the new value.
    pub fn increment(&self) -> usize {
        let mut active = self.lock();
        *active += 1;
        *active
    }

    /// Decrement and return the new value. Never goes below zero.
    pub fn decrement(&self) -> usize {
        let mut active = self.lock();
        *active = active.saturating_sub(1);
        *active
    }

    /// Snapshot of the current value; may be stale by the time it is used.
    pub fn current(&self) -> usize {
        *self.lock()
    }

    /// Count a connection until the returned guard is dropped.
    pub fn track(self: &Arc<Self>) -> ConnectionGuard {
        let active = self.increment();
        ConnectionGuard {
            counter: Arc::clone(self),
            active,
        }
    }

    // The guarded value is a plain integer, so a panic elsewhere can't
    // leave it half-written.
    fn lock(&self) -> MutexGuard<'_, usize> {
        self.active.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Holds one slot in the [`ConnectionCounter`]; releases it on drop.
#[derive(Debug)]
pub struct ConnectionGuard {
    counter: Arc<ConnectionCounter>,
    active: usize,
}

impl ConnectionGuard {
    /// Counter value observed right after this connection was counted.
    pub fn active_at_entry(&self) -> usize {
        self.active
    }
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        let remaining = self.counter.decrement();
        trace!(active = remaining, "Connection slot released");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_increment_decrement() {
        let counter = ConnectionCounter::new();
        assert_eq!(counter.current(), 0);
        assert_eq!(counter.increment(), 1);
        assert_eq!(counter.increment(), 2);
        assert_eq!(counter.decrement(), 1);
        assert_eq!(counter.current(), 1);
    }

    #[test]
    fn test_decrement_saturates() {
        let counter = ConnectionCounter::new();
        assert_eq!(counter.decrement(), 0);
    }

    #[test]
    fn test_guard_releases_on_drop() {
        let counter = ConnectionCounter::new();
        let first = counter.track();
        let second = counter.track();
        assert_eq!(first.active_at_entry(), 1);
        assert_eq!(second.active_at_entry(), 2);

        drop(first);
        assert_eq!(counter.current(), 1);
        drop(second);
        assert_eq!(counter.current(), 0);
    }

    #[test]
    fn test_guard_released_on_panic() {
        let counter = ConnectionCounter::new();
        let shared = Arc::clone(&counter);
        let result = thread::spawn(move || {
            let _guard = shared.track();
            panic!("handler blew up");
        })
        .join();

        assert!(result.is_err());
        assert_eq!(counter.current(), 0);
    }

    #[test]
    fn test_concurrent_tracking() {
        let counter = ConnectionCounter::new();
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let counter = Arc::clone(&counter);
                thread::spawn(move || {
                    for _ in 0..1000 {
                        let _guard = counter.track();
                    }
                })
            })
            .collect();

        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(counter.current(), 0);
    }
}
