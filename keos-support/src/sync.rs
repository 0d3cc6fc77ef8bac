//! Thin, doc-compatible wrappers around `std::sync` primitives.
//!
//! The source project's spinlock requires an explicit `unlock()` call
//! because it is implemented by disabling preemption around a raw memory
//! fence — there is no compiler-enforced RAII without a full page-table- and
//! interrupt-aware guard type. Once the core runs on real OS threads instead
//! of bare metal, RAII is strictly better: forgetting to unlock becomes a
//! compile error instead of a deadlock. `SpinLock<T>` here keeps the
//! source's name and shape (a type parameterized over the protected data)
//! but hands back a guard that unlocks on `Drop`, matching ordinary Rust
//! `Mutex` idiom.

use std::sync::{Mutex, MutexGuard, TryLockError};

/// A mutual-exclusion primitive protecting `T`.
///
/// Named `SpinLock` for continuity with the component design in
/// `storage-core` (global cache lock, per-entry lock, frame lock, swap
/// lock, inode lock all use this type), even though the underlying
/// implementation is an OS mutex rather than a busy-loop: on real hardware,
/// short critical sections spin; this crate only ever runs under a real
/// scheduler, where blocking is correct and cheaper.
pub struct SpinLock<T> {
    inner: Mutex<T>,
}

impl<T> SpinLock<T> {
    pub const fn new(value: T) -> Self {
        SpinLock {
            inner: Mutex::new(value),
        }
    }

    /// Blocks until the lock is acquired.
    pub fn lock(&self) -> MutexGuard<'_, T> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Attempts to acquire the lock without blocking, used by the buffer
    /// cache's second-chance eviction scan (§4.1: "attempting a
    /// non-blocking acquire on each entry lock").
    pub fn try_lock(&self) -> Option<MutexGuard<'_, T>> {
        match self.inner.try_lock() {
            Ok(guard) => Some(guard),
            Err(TryLockError::WouldBlock) => None,
            Err(TryLockError::Poisoned(e)) => Some(e.into_inner()),
        }
    }
}
