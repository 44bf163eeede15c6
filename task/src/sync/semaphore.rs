//! Counting semaphore and the sleeping mutex built on it.
//!
//! The count never goes negative: a `down` at zero registers the calling
//! task on the semaphore's wait queue and suspends instead.  An `up`
//! wakes one waiter so it can re-test; a wake is a hint, not a grant.

use core::cell::UnsafeCell;
use core::ops::{Deref, DerefMut};

use crate::sched;
use crate::sync::wait::{self, WaitQueue};
use crate::sync::SpinLock;
use crate::task::{table, TaskState};

/// Counting semaphore.
pub struct Semaphore {
    count: SpinLock<usize>,
    queue: WaitQueue,
}

impl Semaphore {
    /// Create a semaphore holding `count` permits.
    pub fn new(count: usize) -> Semaphore {
        Semaphore {
            count: SpinLock::new(count),
            queue: WaitQueue::new(),
        }
    }

    /// Take a permit, suspending the calling task until one is available.
    ///
    /// Requires a current task when it has to block; may not be called
    /// while holding a spinlock.
    pub fn down(&self) {
        if self.try_down() {
            return;
        }
        let task = table::current();
        let node = task.wait_node();
        loop {
            {
                let mut count = self.count.lock();
                if *count > 0 {
                    *count -= 1;
                    break;
                }
                // Register and publish the sleeping state before the
                // count lock is released; up() wakes under the same lock,
                // so the wake cannot slip between re-check and sleep.
                if !node.is_linked() {
                    self.queue.register(node);
                }
                task.set_state(TaskState::Sleeping);
            }
            sched::yield_now();
            task.set_state(TaskState::Running);
        }
        wait::unregister(node);
    }

    /// Take a permit only if one is available right now.  Never suspends.
    pub fn try_down(&self) -> bool {
        let mut count = self.count.lock();
        if *count > 0 {
            *count -= 1;
            true
        } else {
            false
        }
    }

    /// Return a permit and wake one waiter to re-test.
    pub fn up(&self) {
        let mut count = self.count.lock();
        *count += 1;
        self.queue.wake_one();
    }

    /// Current permit count.  Diagnostic only.
    pub fn count(&self) -> usize {
        *self.count.lock()
    }

    /// Whether any task is blocked on this semaphore.  Diagnostic only.
    pub fn waiting(&self) -> bool {
        self.queue.waiting()
    }
}

/// Sleeping mutual-exclusion lock: a binary semaphore plus the data it
/// protects, released on every exit path through the RAII guard.
pub struct Mutex<T> {
    sem: Semaphore,
    value: UnsafeCell<T>,
}

// SAFETY: the binary semaphore serializes access to the cell.
unsafe impl<T: Send> Send for Mutex<T> {}
unsafe impl<T: Send> Sync for Mutex<T> {}

impl<T> Mutex<T> {
    /// Create an unlocked mutex around `value`.
    pub fn new(value: T) -> Mutex<T> {
        Mutex {
            sem: Semaphore::new(1),
            value: UnsafeCell::new(value),
        }
    }

    /// Acquire the lock, suspending the calling task while it is held
    /// elsewhere.
    pub fn lock(&self) -> MutexGuard<'_, T> {
        self.sem.down();
        MutexGuard { mutex: self }
    }

    /// Acquire the lock only if it is free right now.
    pub fn try_lock(&self) -> Option<MutexGuard<'_, T>> {
        if self.sem.try_down() {
            Some(MutexGuard { mutex: self })
        } else {
            None
        }
    }
}

/// RAII guard returned by [`Mutex::lock`].
pub struct MutexGuard<'a, T> {
    mutex: &'a Mutex<T>,
}

impl<T> Deref for MutexGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        // SAFETY: holding the guard means the semaphore permit is ours.
        unsafe { &*self.mutex.value.get() }
    }
}

impl<T> DerefMut for MutexGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        // SAFETY: as above, plus the guard is borrowed mutably.
        unsafe { &mut *self.mutex.value.get() }
    }
}

impl<T> Drop for MutexGuard<'_, T> {
    fn drop(&mut self) {
        self.mutex.sem.up();
    }
}
