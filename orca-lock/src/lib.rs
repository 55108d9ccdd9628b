//! Fair mutual exclusion for the connection core.
//!
//! Standard mutexes proved too slow on the per-reply hot path, so client state is guarded by a
//! ticket lock: acquisition order is strict FIFO by ticket number, the owning execution context
//! may re-acquire recursively, and contended waiters spin briefly before parking on their ticket
//! slot. A process-wide wait-for graph turns lock-ordering bugs into an immediate panic instead
//! of a silent hang.

mod raw;
mod wait_graph;

use std::cell::UnsafeCell;
use std::ops::{Deref, DerefMut};

pub use raw::{RawFairLock, current_context_id, long_wait_count};

/// Data guarded by a [`RawFairLock`], with RAII guards in the `parking_lot` style.
///
/// Unlike the raw lock, guards are deliberately non-recursive: creating a second guard from the
/// owning context would alias the `&mut` borrow, so `lock()` asserts against it and `try_lock()`
/// reports failure. Recursive acquisition remains available on [`RawFairLock`] itself for code
/// that manages critical sections manually.
pub struct FairMutex<T> {
    raw: RawFairLock,
    data: UnsafeCell<T>,
}

// SAFETY: access to `data` is serialized by `raw`; guards hand out `&mut T` only while the
// calling context holds the lock exactly once.
unsafe impl<T: Send> Send for FairMutex<T> {}
unsafe impl<T: Send> Sync for FairMutex<T> {}

impl<T> FairMutex<T> {
    /// Wraps a value in a fair mutex.
    pub fn new(value: T) -> Self {
        Self {
            raw: RawFairLock::new(),
            data: UnsafeCell::new(value),
        }
    }

    /// Acquires the lock, blocking in ticket order, and returns an access guard.
    ///
    /// # Panics
    ///
    /// Panics when the calling context already holds this mutex: guard re-entry would create
    /// two live `&mut T` borrows.
    pub fn lock(&self) -> FairMutexGuard<'_, T> {
        assert!(
            !self.raw.is_held_by_caller(),
            "fair mutex guard re-entered by the owning context"
        );
        self.raw.lock();
        FairMutexGuard { mutex: self }
    }

    /// Attempts a non-blocking acquisition.
    ///
    /// Returns `None` when the lock is held elsewhere, when another acquisition is in flight,
    /// or when the caller already holds it (re-entry would alias the guard borrow).
    pub fn try_lock(&self) -> Option<FairMutexGuard<'_, T>> {
        if self.raw.is_held_by_caller() {
            return None;
        }
        if !self.raw.try_lock() {
            return None;
        }
        Some(FairMutexGuard { mutex: self })
    }

    /// Returns the underlying raw lock, e.g. for held-by-caller assertions.
    pub fn raw(&self) -> &RawFairLock {
        &self.raw
    }

    /// Consumes the mutex and returns the guarded value.
    pub fn into_inner(self) -> T {
        self.data.into_inner()
    }
}

impl<T: std::fmt::Debug> std::fmt::Debug for FairMutex<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FairMutex").finish_non_exhaustive()
    }
}

/// RAII access guard returned by [`FairMutex::lock`].
pub struct FairMutexGuard<'a, T> {
    mutex: &'a FairMutex<T>,
}

impl<T> Deref for FairMutexGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        // SAFETY: the guard proves the calling context holds the lock.
        unsafe { &*self.mutex.data.get() }
    }
}

impl<T> DerefMut for FairMutexGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        // SAFETY: the guard proves the calling context holds the lock exactly once.
        unsafe { &mut *self.mutex.data.get() }
    }
}

impl<T> Drop for FairMutexGuard<'_, T> {
    fn drop(&mut self) {
        self.mutex.raw.unlock();
    }
}

#[cfg(test)]
mod tests {
    use super::FairMutex;
    use googletest::prelude::*;
    use rstest::rstest;
    use std::sync::Arc;
    use std::thread;

    #[rstest]
    fn mutex_serializes_concurrent_increments() {
        let counter = Arc::new(FairMutex::new(0_u64));
        let mut handles = Vec::new();
        for _ in 0..8 {
            let counter = Arc::clone(&counter);
            handles.push(thread::spawn(move || {
                for _ in 0..1_000 {
                    *counter.lock() += 1;
                }
            }));
        }
        for handle in handles {
            handle.join().expect("incrementer thread must not panic");
        }
        assert_that!(*counter.lock(), eq(8_000_u64));
    }

    #[rstest]
    fn try_lock_fails_while_held_elsewhere() {
        let mutex = Arc::new(FairMutex::new(()));
        let guard = mutex.lock();
        let mutex_clone = Arc::clone(&mutex);
        let contender = thread::spawn(move || mutex_clone.try_lock().is_none());
        assert_that!(
            contender.join().expect("contender thread must not panic"),
            eq(true)
        );
        drop(guard);
        assert_that!(mutex.try_lock().is_some(), eq(true));
    }

    #[rstest]
    fn try_lock_refuses_guard_reentry() {
        let mutex = FairMutex::new(7_u32);
        let guard = mutex.lock();
        assert_that!(mutex.try_lock().is_none(), eq(true));
        drop(guard);
    }
}
