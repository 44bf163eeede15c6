//! Preemption-aware spinlock.
//!
//! A thin wrapper over `spin::Mutex` that disables preemption on the
//! executing CPU for as long as the guard lives.  Critical sections under
//! a [`SpinLock`] must stay short and must never suspend.

use core::fmt;
use core::mem::ManuallyDrop;
use core::ops::{Deref, DerefMut};

use crate::sched;

/// Short-held lock for data shared with other CPUs or interrupt handlers.
pub struct SpinLock<T: ?Sized> {
    inner: spin::Mutex<T>,
}

impl<T> SpinLock<T> {
    /// Create a new unlocked spinlock.
    pub const fn new(value: T) -> Self {
        SpinLock {
            inner: spin::Mutex::new(value),
        }
    }
}

impl<T: ?Sized> SpinLock<T> {
    /// Acquire the lock, spinning until it is available.
    ///
    /// Preemption stays disabled until the returned guard is dropped.
    pub fn lock(&self) -> SpinLockGuard<'_, T> {
        sched::preempt_disable();
        SpinLockGuard {
            inner: ManuallyDrop::new(self.inner.lock()),
        }
    }

    /// Acquire the lock only if it is free right now.
    pub fn try_lock(&self) -> Option<SpinLockGuard<'_, T>> {
        sched::preempt_disable();
        match self.inner.try_lock() {
            Some(guard) => Some(SpinLockGuard {
                inner: ManuallyDrop::new(guard),
            }),
            None => {
                sched::preempt_enable();
                None
            }
        }
    }
}

impl<T: ?Sized + fmt::Debug> fmt::Debug for SpinLock<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.inner.try_lock() {
            Some(guard) => f.debug_struct("SpinLock").field("data", &&*guard).finish(),
            None => f.write_str("SpinLock { <locked> }"),
        }
    }
}

/// RAII guard returned by [`SpinLock::lock`].
pub struct SpinLockGuard<'a, T: ?Sized> {
    inner: ManuallyDrop<spin::MutexGuard<'a, T>>,
}

impl<T: ?Sized> Deref for SpinLockGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.inner
    }
}

impl<T: ?Sized> DerefMut for SpinLockGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.inner
    }
}

impl<T: ?Sized> Drop for SpinLockGuard<'_, T> {
    fn drop(&mut self) {
        // The lock must be released before preemption is re-enabled:
        // preempt_enable may run a deferred reschedule.
        // SAFETY: the inner guard is dropped exactly once, here.
        unsafe { ManuallyDrop::drop(&mut self.inner) };
        sched::preempt_enable();
    }
}
