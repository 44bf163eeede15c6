//! Solum task-subsystem conformance checks.
//!
//! Self-contained checks over the subsystem's observable guarantees,
//! runnable from inside the kernel (no_std, no scheduler required: only
//! non-blocking paths are exercised).  The scheduler-backed scenarios
//! live in this crate's integration tests.

#![no_std]
extern crate alloc;

use alloc::boxed::Box;
use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec::Vec;

use hashbrown::HashSet;

use solum_task::config;
use solum_task::error::TaskError;
use solum_task::file::{File, FileOps};
use solum_task::pipe;
use solum_task::signal::{self, SignalState};
use solum_task::sync::{Semaphore, SpinLock, WaitNode, WaitQueue};
use solum_task::task::fd::FdTable;
use solum_task::time::TimerList;

/// Conformance check result
#[derive(Debug, Clone)]
pub enum CheckResult {
    /// Check passed
    Pass,
    /// Check failed with error
    Fail(String),
}

impl CheckResult {
    pub fn passed(&self) -> bool {
        matches!(self, CheckResult::Pass)
    }
}

/// Conformance check trait
pub trait ConformanceCheck {
    fn name(&self) -> &str;
    fn run(&mut self) -> CheckResult;
}

struct NullFile;
impl FileOps for NullFile {}

/// Descriptor slots are distinct and allocated lowest-first
pub struct HandleAllocationCheck;

impl ConformanceCheck for HandleAllocationCheck {
    fn name(&self) -> &str {
        "handle_allocation"
    }

    fn run(&mut self) -> CheckResult {
        let table = FdTable::new();
        let mut seen: HashSet<usize> = HashSet::new();
        for expect in 0..config::MAX_OPEN_FILES {
            match table.install(File::new(NullFile)) {
                Ok(fd) => {
                    if fd != expect {
                        return CheckResult::Fail(String::from("slots not lowest-first"));
                    }
                    if !seen.insert(fd) {
                        return CheckResult::Fail(String::from("duplicate descriptor"));
                    }
                }
                Err(err) => {
                    return CheckResult::Fail(alloc::format!("install failed early: {}", err));
                }
            }
        }

        if table.install(File::new(NullFile)) != Err(TaskError::NoFreeHandle) {
            return CheckResult::Fail(String::from("full table must refuse installs"));
        }

        // A freed slot is the next one handed out.
        if table.close(9).is_err() {
            return CheckResult::Fail(String::from("close of open slot failed"));
        }
        match table.install(File::new(NullFile)) {
            Ok(9) => CheckResult::Pass,
            Ok(fd) => CheckResult::Fail(alloc::format!("expected slot 9, got {}", fd)),
            Err(err) => CheckResult::Fail(alloc::format!("reuse failed: {}", err)),
        }
    }
}

/// Semaphore permits are conserved on the non-blocking paths
pub struct SemaphorePermitCheck;

impl ConformanceCheck for SemaphorePermitCheck {
    fn name(&self) -> &str {
        "semaphore_permits"
    }

    fn run(&mut self) -> CheckResult {
        let sem = Semaphore::new(3);
        for _ in 0..3 {
            if !sem.try_down() {
                return CheckResult::Fail(String::from("permit refused while available"));
            }
        }
        if sem.try_down() {
            return CheckResult::Fail(String::from("acquired more permits than exist"));
        }
        sem.up();
        if sem.count() != 1 {
            return CheckResult::Fail(String::from("release not reflected in count"));
        }
        if !sem.try_down() {
            return CheckResult::Fail(String::from("released permit not reusable"));
        }
        CheckResult::Pass
    }
}

/// Pending signals dequeue lowest-number-first and honor the block mask
pub struct SignalOrderCheck;

impl ConformanceCheck for SignalOrderCheck {
    fn name(&self) -> &str {
        "signal_order"
    }

    fn run(&mut self) -> CheckResult {
        let state = SignalState::new();
        for signum in [signal::SIGTERM, signal::SIGKILL, signal::SIGINT] {
            if state.send(signum).is_err() {
                return CheckResult::Fail(String::from("send of valid signal failed"));
            }
        }
        let drained = [state.dequeue(), state.dequeue(), state.dequeue()];
        if drained != [Some(signal::SIGINT), Some(signal::SIGKILL), Some(signal::SIGTERM)] {
            return CheckResult::Fail(String::from("dequeue order not lowest-first"));
        }
        if state.dequeue().is_some() {
            return CheckResult::Fail(String::from("phantom pending signal"));
        }

        // Blocked signals stay pending but invisible; SIGKILL cannot be
        // blocked at all.
        state.block(signal::sigmask(signal::SIGUSR1) | signal::sigmask(signal::SIGKILL));
        let _ = state.send(signal::SIGUSR1);
        if state.has_pending() {
            return CheckResult::Fail(String::from("blocked signal visible"));
        }
        let _ = state.send(signal::SIGKILL);
        if !state.has_pending() {
            return CheckResult::Fail(String::from("SIGKILL must not be blockable"));
        }
        CheckResult::Pass
    }
}

/// Pipe bytes arrive intact and in order; drops drive EOF and errors
pub struct PipeStreamCheck;

impl ConformanceCheck for PipeStreamCheck {
    fn name(&self) -> &str {
        "pipe_stream"
    }

    fn run(&mut self) -> CheckResult {
        let (read_end, write_end) = pipe::pipe();

        let pattern: Vec<u8> = (0..200u32).map(|i| (i * 7 % 251) as u8).collect();
        if write_end.write(&pattern) != Ok(pattern.len()) {
            return CheckResult::Fail(String::from("short write into empty pipe"));
        }
        let mut buf = [0u8; 64];
        let mut out: Vec<u8> = Vec::new();
        while out.len() < pattern.len() {
            match read_end.read(&mut buf) {
                Ok(n) => out.extend_from_slice(&buf[..n]),
                Err(err) => return CheckResult::Fail(alloc::format!("read failed: {}", err)),
            }
        }
        if out != pattern {
            return CheckResult::Fail(String::from("byte stream corrupted"));
        }

        if read_end.read(&mut buf) != Err(TaskError::WouldBlock) {
            return CheckResult::Fail(String::from("empty pipe with a writer must block"));
        }
        drop(write_end);
        if read_end.read(&mut buf) != Ok(0) {
            return CheckResult::Fail(String::from("no end-of-stream after writer drop"));
        }

        let (read_end, write_end) = pipe::pipe();
        drop(read_end);
        if write_end.write(b"x") != Err(TaskError::BrokenPipe) {
            return CheckResult::Fail(String::from("write without readers must break"));
        }
        CheckResult::Pass
    }
}

/// Timers fire once at their deadline, and cancel sticks
pub struct TimerDeadlineCheck;

impl ConformanceCheck for TimerDeadlineCheck {
    fn name(&self) -> &str {
        "timer_deadline"
    }

    fn run(&mut self) -> CheckResult {
        use core::sync::atomic::{AtomicUsize, Ordering};

        let list = TimerList::new();
        let fired = Arc::new(AtomicUsize::new(0));
        let _armed = {
            let fired = fired.clone();
            list.arm(2, move || {
                fired.fetch_add(1, Ordering::SeqCst);
            })
        };
        let cancelled = {
            let fired = fired.clone();
            list.arm(2, move || {
                fired.fetch_add(100, Ordering::SeqCst);
            })
        };
        cancelled.cancel();

        list.tick();
        if fired.load(Ordering::SeqCst) != 0 {
            return CheckResult::Fail(String::from("timer fired before its deadline"));
        }
        list.tick();
        list.tick();
        match fired.load(Ordering::SeqCst) {
            1 => CheckResult::Pass,
            0 => CheckResult::Fail(String::from("timer never fired")),
            _ => CheckResult::Fail(String::from("cancelled or repeated firing")),
        }
    }
}

/// Woken wait entries are unlinked and dispatched exactly once
pub struct WaitQueueCheck;

impl ConformanceCheck for WaitQueueCheck {
    fn name(&self) -> &str {
        "wait_queue"
    }

    fn run(&mut self) -> CheckResult {
        use core::sync::atomic::{AtomicUsize, Ordering};

        let queue = WaitQueue::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let node = {
            let hits = hits.clone();
            WaitNode::notify(move || {
                hits.fetch_add(1, Ordering::SeqCst);
            })
        };

        queue.register(&node);
        if !queue.waiting() || !node.is_linked() {
            return CheckResult::Fail(String::from("registered entry not linked"));
        }
        if !queue.wake_one() {
            return CheckResult::Fail(String::from("wake found no entry"));
        }
        if hits.load(Ordering::SeqCst) != 1 {
            return CheckResult::Fail(String::from("wake did not dispatch"));
        }
        if node.is_linked() || queue.waiting() {
            return CheckResult::Fail(String::from("woken entry still linked"));
        }
        if queue.wake_one() {
            return CheckResult::Fail(String::from("second wake dispatched a ghost"));
        }
        CheckResult::Pass
    }
}

/// Spinlock guards pin the task to the CPU for exactly their lifetime
pub struct SpinGuardCheck;

impl ConformanceCheck for SpinGuardCheck {
    fn name(&self) -> &str {
        "spin_guard"
    }

    fn run(&mut self) -> CheckResult {
        use solum_task::sched;

        // Other CPUs may share preempt state with this one, so only
        // conditions this CPU's own guard forces are asserted.
        let lock = SpinLock::new(5u32);
        {
            let guard = lock.lock();
            if *guard != 5 {
                return CheckResult::Fail(String::from("guarded value wrong"));
            }
            if !sched::is_preemption_disabled() {
                return CheckResult::Fail(String::from("guard did not disable preemption"));
            }
            if lock.try_lock().is_some() {
                return CheckResult::Fail(String::from("reentry through try_lock"));
            }
        }
        match lock.try_lock() {
            Some(reacquired) => {
                if *reacquired != 5 {
                    return CheckResult::Fail(String::from("value lost across drop"));
                }
            }
            None => {
                return CheckResult::Fail(String::from("guard drop did not release the lock"));
            }
        }
        CheckResult::Pass
    }
}

/// Run every conformance check
pub fn run_all_checks() -> Vec<(String, CheckResult)> {
    let mut results = Vec::new();

    let mut checks: Vec<Box<dyn ConformanceCheck>> = alloc::vec![
        Box::new(HandleAllocationCheck),
        Box::new(SemaphorePermitCheck),
        Box::new(SignalOrderCheck),
        Box::new(PipeStreamCheck),
        Box::new(TimerDeadlineCheck),
        Box::new(WaitQueueCheck),
        Box::new(SpinGuardCheck),
    ];

    for check in checks.iter_mut() {
        let result = check.run();
        results.push((String::from(check.name()), result));
    }

    results
}
