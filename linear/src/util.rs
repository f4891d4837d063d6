//! Small synchronization utilities shared by the storage and queue layers.

use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};


/// A one-shot completion slot shared between the producer of a result and any
/// number of waiters. Cloning the handle shares the same slot, which is what
/// allows two deduplicated submissions to observe a single result.
#[derive(Debug)]
pub struct Completion<T> {
    inner: Arc<CompletionInner<T>>,
}

#[derive(Debug)]
struct CompletionInner<T> {
    value: Mutex<Option<T>>,
    cond: Condvar,
}

impl<T: Clone> Completion<T> {

    pub fn new() -> Self {
        Self {
            inner: Arc::new(CompletionInner {
                value: Mutex::new(None),
                cond: Condvar::new(),
            }),
        }
    }

    /// Create a completion that is already resolved with the given value.
    pub fn resolved(value: T) -> Self {
        let ret = Self::new();
        ret.complete(value);
        ret
    }

    /// Resolve the slot. The first call wins, later calls return false and
    /// leave the original value in place.
    pub fn complete(&self, value: T) -> bool {
        let mut guard = self.inner.value.lock().unwrap();
        if guard.is_some() {
            return false;
        }
        *guard = Some(value);
        self.inner.cond.notify_all();
        true
    }

    /// Return the value if the slot has been resolved.
    pub fn try_get(&self) -> Option<T> {
        self.inner.value.lock().unwrap().clone()
    }

    pub fn is_complete(&self) -> bool {
        self.inner.value.lock().unwrap().is_some()
    }

    /// Block the calling thread until the slot is resolved.
    pub fn wait(&self) -> T {
        let mut guard = self.inner.value.lock().unwrap();
        loop {
            if let Some(value) = &*guard {
                return value.clone();
            }
            guard = self.inner.cond.wait(guard).unwrap();
        }
    }

    /// Block until the slot is resolved or the timeout elapses.
    pub fn wait_timeout(&self, timeout: Duration) -> Option<T> {
        let deadline = Instant::now() + timeout;
        let mut guard = self.inner.value.lock().unwrap();
        loop {
            if let Some(value) = &*guard {
                return Some(value.clone());
            }
            let remaining = deadline.checked_duration_since(Instant::now())?;
            let (new_guard, result) = self.inner.cond.wait_timeout(guard, remaining).unwrap();
            guard = new_guard;
            if result.timed_out() && guard.is_none() {
                return None;
            }
        }
    }

    /// True if both handles refer to the same underlying slot.
    pub fn same_slot(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

}

impl<T> Clone for Completion<T> {
    fn clone(&self) -> Self {
        Self { inner: Arc::clone(&self.inner) }
    }
}


/// Time source used by components with time-dependent behavior, injectable so
/// that cache expiry and queue aging can be driven from tests.
pub trait Clock: Send + Sync {
    fn now(&self) -> Instant;
}

/// The default clock, reading the OS monotonic clock.
#[derive(Debug, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }
}


#[cfg(test)]
mod tests {

    use super::*;
    use std::thread;

    #[test]
    fn completion_single_resolution() {
        let c = Completion::new();
        assert!(c.try_get().is_none());
        assert!(c.complete(1u32));
        assert!(!c.complete(2u32));
        assert_eq!(c.try_get(), Some(1));
        assert_eq!(c.wait(), 1);
    }

    #[test]
    fn completion_shared_across_threads() {
        let c = Completion::new();
        let c2 = c.clone();
        assert!(c.same_slot(&c2));
        let handle = thread::spawn(move || c2.wait());
        thread::sleep(Duration::from_millis(10));
        c.complete(42u32);
        assert_eq!(handle.join().unwrap(), 42);
    }

    #[test]
    fn completion_wait_timeout_expires() {
        let c: Completion<u32> = Completion::new();
        assert_eq!(c.wait_timeout(Duration::from_millis(10)), None);
        c.complete(7);
        assert_eq!(c.wait_timeout(Duration::from_millis(10)), Some(7));
    }

}
