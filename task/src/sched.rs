//! Scheduler collaborator interface.
//!
//! The run-queue/pick-next algorithm and the context-switch mechanics live
//! outside this crate.  The embedding kernel implements [`Scheduler`] and
//! installs it once at boot, facade-style; until then a no-op default is in
//! effect so early lifecycle code can run.
//!
//! This module also owns the per-CPU preemption nesting counters used by
//! the short-held spinlock wrapper.

use core::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use alloc::sync::Arc;
use spin::Once;

use crate::config;
use crate::task::{Pid, Task};

/// Contract between this subsystem and the physical CPU scheduler.
///
/// All methods take pids rather than task handles; the implementation is
/// expected to consult the task table if it needs more than identity.
pub trait Scheduler: Send + Sync {
    /// Identity of the CPU executing the caller.
    fn cpu_id(&self) -> usize {
        0
    }

    /// Enqueue a freshly created runnable task.
    fn add(&self, pid: Pid);

    /// Enqueue a task whose state was just switched back to runnable.
    fn wake(&self, pid: Pid);

    /// Give up the CPU.  Returns once the caller is scheduled again.
    fn yield_now(&self);

    /// Drop all scheduler references to a reaped task.
    fn mark_dead(&self, pid: Pid);

    /// Stop interrupt delivery to the executing CPU.
    fn interrupts_off(&self) {}

    /// Resume interrupt delivery to the executing CPU.
    fn interrupts_on(&self) {}
}

/// Default scheduler: every operation is a no-op.
struct NullScheduler;

impl Scheduler for NullScheduler {
    fn add(&self, _pid: Pid) {}
    fn wake(&self, _pid: Pid) {}
    fn yield_now(&self) {}
    fn mark_dead(&self, _pid: Pid) {}
}

/// Installed scheduler, if any.
static SCHEDULER: Once<&'static dyn Scheduler> = Once::new();

/// Per-CPU preemption state.
struct PreemptState {
    /// Nesting counter.  When > 0, rescheduling of this CPU is inhibited.
    count: AtomicUsize,
    /// Flag: a reschedule was requested while preemption was disabled.
    pending: AtomicBool,
}

const PREEMPT_INIT: PreemptState = PreemptState {
    count: AtomicUsize::new(0),
    pending: AtomicBool::new(false),
};

// Unit tests hand every helper thread a fresh CPU id; the slot space
// must cover all of them, not just real CPUs.
#[cfg(not(test))]
const PREEMPT_SLOTS: usize = config::MAX_CPUS;
#[cfg(test)]
const PREEMPT_SLOTS: usize = 1024;

static PREEMPT: [PreemptState; PREEMPT_SLOTS] = [PREEMPT_INIT; PREEMPT_SLOTS];

fn preempt_slot() -> &'static PreemptState {
    &PREEMPT[cpu_id() % PREEMPT_SLOTS]
}

/// Install the scheduler implementation.
///
/// The first installation wins; later calls are ignored.
pub fn install(scheduler: &'static dyn Scheduler) {
    SCHEDULER.call_once(|| {
        log::debug!("[sched] scheduler installed");
        scheduler
    });
}

fn active() -> &'static dyn Scheduler {
    match SCHEDULER.get() {
        Some(scheduler) => *scheduler,
        None => &NullScheduler,
    }
}

/// Identity of the executing CPU.
pub fn cpu_id() -> usize {
    active().cpu_id()
}

/// Hand a new runnable task to the scheduler.
pub fn add(pid: Pid) {
    active().add(pid)
}

/// Give up the CPU (may trigger a context switch).
///
/// While preemption is disabled on this CPU the request is recorded
/// instead and serviced by the matching [`preempt_enable`].
pub fn yield_now() {
    let slot = preempt_slot();
    if slot.count.load(Ordering::Relaxed) > 0 {
        slot.pending.store(true, Ordering::Relaxed);
        return;
    }
    active().yield_now()
}

/// Give up the CPU regardless of the preemption gate.
///
/// The exit path uses this for its last yield: a dying task must leave
/// the CPU no matter what the nesting counter says.
pub(crate) fn yield_final() {
    active().yield_now()
}

/// Wake a sleeping task.
///
/// Switches the task RUNNABLE and enqueues it.  A wake is a hint: if the
/// task is not sleeping (already woken, still running, or a zombie) nothing
/// happens.  Returns whether the task was transitioned.
pub fn wake(task: &Arc<Task>) -> bool {
    if task.set_runnable_if_sleeping() {
        active().wake(task.pid());
        true
    } else {
        false
    }
}

/// Drop scheduler references to a reaped task.
pub fn mark_dead(pid: Pid) {
    active().mark_dead(pid)
}

/// Stop interrupt delivery to the executing CPU.
pub fn interrupts_off() {
    active().interrupts_off()
}

/// Resume interrupt delivery to the executing CPU.
pub fn interrupts_on() {
    active().interrupts_on()
}

// ==================== Preemption Guards ====================

/// Disable preemptive scheduling on the executing CPU.
///
/// Increments a nesting counter.  While the counter is > 0, [`yield_now`]
/// records a pending request instead of switching.
pub fn preempt_disable() {
    preempt_slot().count.fetch_add(1, Ordering::SeqCst);
}

/// Re-enable preemptive scheduling on the executing CPU.
///
/// Decrements the nesting counter.  When the counter reaches zero and a
/// reschedule was requested in the meantime, it is performed immediately.
pub fn preempt_enable() {
    let slot = preempt_slot();
    let prev = slot.count.fetch_sub(1, Ordering::SeqCst);
    if prev == 1 && slot.pending.swap(false, Ordering::SeqCst) {
        active().yield_now();
    }
}

/// Returns `true` when preemption is disabled on the executing CPU.
pub fn is_preemption_disabled() -> bool {
    preempt_slot().count.load(Ordering::Relaxed) > 0
}

// ==================== Test Support ====================
