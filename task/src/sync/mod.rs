//! Synchronization primitives.
//!
//! Two families with a strict layering rule: short-held spinlocks
//! ([`SpinLock`]) protect small critical sections and disable preemption
//! while held; sleeping locks ([`Semaphore`], [`Mutex`]) suspend the
//! calling task and must never be acquired while a spinlock is held.

pub mod semaphore;
pub mod spinlock;
pub mod wait;

pub use semaphore::{Mutex, MutexGuard, Semaphore};
pub use spinlock::{SpinLock, SpinLockGuard};
pub use wait::{WaitNode, WaitQueue, WakeAction};
