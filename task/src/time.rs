//! Tick counter, one-shot countdown timers, and timed sleep.
//!
//! The embedding kernel's timer interrupt calls [`timer_tick`] once per
//! tick (see `config::TIMER_FREQUENCY`).  Expiry callbacks run from that
//! context and must not suspend; waking a task is the typical action.

use core::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use alloc::boxed::Box;
use alloc::sync::{Arc, Weak};
use alloc::vec::Vec;

use crate::sched;
use crate::sync::SpinLock;
use crate::task::{table, TaskState};

/// Sentinel for "no wake-at deadline".
pub(crate) const NO_DEADLINE: u64 = u64::MAX;

struct TimerEntry {
    deadline: u64,
    cancelled: AtomicBool,
    callback: Box<dyn Fn() + Send + Sync>,
}

/// Handle to an armed timer, used to cancel it.
///
/// Cancelling does not wait for an expiry already in flight; a callback
/// that lost that race may still run one last time.
pub struct Timer {
    entry: Arc<TimerEntry>,
}

impl Timer {
    /// Prevent the callback from running once the current tick (if any)
    /// has finished dispatching.
    pub fn cancel(&self) {
        self.entry.cancelled.store(true, Ordering::SeqCst);
    }
}

/// A tick counter with an attached list of one-shot timers.
pub struct TimerList {
    now: AtomicU64,
    timers: SpinLock<Vec<Arc<TimerEntry>>>,
}

impl TimerList {
    pub const fn new() -> TimerList {
        TimerList {
            now: AtomicU64::new(0),
            timers: SpinLock::new(Vec::new()),
        }
    }

    /// Current tick count.
    pub fn now(&self) -> u64 {
        self.now.load(Ordering::Relaxed)
    }

    /// Advance the counter one tick and fire every timer that came due.
    ///
    /// Due entries are collected under the list lock but dispatched after
    /// it is released, so callbacks may take other short-held locks.
    pub fn tick(&self) {
        let now = self.now.fetch_add(1, Ordering::SeqCst) + 1;
        let mut due = Vec::new();
        {
            let mut timers = self.timers.lock();
            let mut i = 0;
            while i < timers.len() {
                if timers[i].cancelled.load(Ordering::SeqCst) {
                    timers.swap_remove(i);
                } else if timers[i].deadline <= now {
                    due.push(timers.swap_remove(i));
                } else {
                    i += 1;
                }
            }
        }
        for entry in due {
            if !entry.cancelled.load(Ordering::SeqCst) {
                (entry.callback)();
            }
        }
    }

    /// Arm a one-shot timer `after` ticks from now.
    pub fn arm<F>(&self, after: u64, callback: F) -> Timer
    where
        F: Fn() + Send + Sync + 'static,
    {
        let entry = Arc::new(TimerEntry {
            deadline: self.now().saturating_add(after),
            cancelled: AtomicBool::new(false),
            callback: Box::new(callback),
        });
        self.timers.lock().push(entry.clone());
        Timer { entry }
    }
}

/// Global timer list driven by the timer interrupt.
static TIMERS: TimerList = TimerList::new();

/// Ticks elapsed since boot.
pub fn ticks() -> u64 {
    TIMERS.now()
}

/// Timer interrupt entry point.
pub fn timer_tick() {
    TIMERS.tick()
}

/// Arm a one-shot timer on the global list.
pub fn arm<F>(after: u64, callback: F) -> Timer
where
    F: Fn() + Send + Sync + 'static,
{
    TIMERS.arm(after, callback)
}

/// Suspend the current task for at least `n` ticks.
///
/// A wake from another source puts the task back to sleep until the
/// deadline has passed.  Only being killed cuts the sleep short.
pub fn sleep_ticks(n: u64) {
    if n == 0 {
        sched::yield_now();
        return;
    }
    let task = table::current();
    let deadline = ticks() + n;
    task.set_wake_at(Some(deadline));
    let timer = {
        let task = Arc::downgrade(&task);
        arm(n, move || {
            wake_sleeper(&task);
        })
    };
    loop {
        // A task killed while it slept must not dirty the state its
        // destroyer left behind.
        if task.killed() {
            break;
        }
        task.set_state(TaskState::Sleeping);
        // Re-check after publishing the sleeping state: a tick landing
        // between check and publish would otherwise be lost.
        if ticks() >= deadline {
            break;
        }
        sched::yield_now();
        task.set_state(TaskState::Running);
        if ticks() >= deadline {
            break;
        }
    }
    if !task.killed() {
        task.set_state(TaskState::Running);
    }
    task.set_wake_at(None);
    timer.cancel();
}

fn wake_sleeper(task: &Weak<crate::task::Task>) {
    if let Some(task) = task.upgrade() {
        sched::wake(&task);
    }
}
