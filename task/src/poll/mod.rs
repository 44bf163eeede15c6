//! Readiness multiplexing: wait on any of several descriptors, with an
//! optional tick-based timeout.
//!
//! The protocol between this module and a resource's
//! [`FileOps::poll`](crate::file::FileOps::poll) implementation is
//! strict: the resource registers the caller's wait entry with its
//! event sources *before* it checks readiness.  A state change landing
//! between the two then still flags the poll call, so nothing is lost;
//! at worst the re-check is spurious.
//!
//! Readiness is level-triggered.  Every pass re-registers and re-checks
//! from scratch, and a wake is only a hint to run another pass.

use alloc::sync::{Arc, Weak};
use alloc::vec::Vec;

use bitflags::bitflags;

use crate::config;
use crate::error::{Result, TaskError};
use crate::file::File;
use crate::sched;
use crate::sync::wait;
use crate::sync::{SpinLock, WaitNode, WaitQueue};
use crate::task::{table, Task, TaskState};
use crate::time::{self, Timer};

bitflags! {
    /// Readiness conditions, with poll(2) bit values.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PollMask: u16 {
        /// Data available to read.
        const IN = 0x0001;
        /// Writable without blocking.
        const OUT = 0x0004;
        /// Error condition.  Always reported, never filtered by
        /// interest.
        const ERR = 0x0008;
        /// Peer hung up.  Always reported, like `ERR`.
        const HUP = 0x0010;
    }
}

/// One descriptor's slot in a poll call: which descriptor, which
/// conditions the caller cares about, and which were observed.
#[derive(Debug, Clone, Copy)]
pub struct PollFd {
    /// Descriptor to watch.  Negative entries are skipped, per poll(2).
    pub fd: i32,
    pub interest: PollMask,
    pub revents: PollMask,
}

impl PollFd {
    pub fn new(fd: i32, interest: PollMask) -> PollFd {
        PollFd {
            fd,
            interest,
            revents: PollMask::empty(),
        }
    }
}

struct PollFlags {
    event: bool,
    timed_out: bool,
}

/// Shared between the polling task and the wake paths (event sources
/// and the timeout timer).
struct PollState {
    flags: SpinLock<PollFlags>,
    task: Weak<Task>,
}

impl PollState {
    /// An event source fired.  Flag and wake under the flags lock; the
    /// sleep loop re-checks the flags under the same lock after
    /// publishing its sleeping state, so the wake cannot fall between
    /// its check and its suspend.
    fn notify_event(&self) {
        let mut flags = self.flags.lock();
        flags.event = true;
        self.wake_owner();
    }

    fn notify_timeout(&self) {
        let mut flags = self.flags.lock();
        flags.timed_out = true;
        self.wake_owner();
    }

    fn wake_owner(&self) {
        if let Some(task) = self.task.upgrade() {
            sched::wake(&task);
        }
    }
}

/// Per-call bookkeeping: the flag state and every wait entry handed out
/// to event sources, so they can all be unlinked between passes.
pub(crate) struct PollTable {
    state: Arc<PollState>,
    entries: Vec<Arc<WaitNode>>,
}

impl PollTable {
    pub(crate) fn new(task: Weak<Task>) -> PollTable {
        PollTable {
            state: Arc::new(PollState {
                flags: SpinLock::new(PollFlags {
                    event: false,
                    timed_out: false,
                }),
                task,
            }),
            entries: Vec::new(),
        }
    }

    pub(crate) fn registration(&mut self) -> PollRegistration<'_> {
        PollRegistration { table: self }
    }

    fn register(&mut self, queue: &WaitQueue) {
        let state = self.state.clone();
        let node = WaitNode::notify(move || state.notify_event());
        queue.register(&node);
        self.entries.push(node);
    }

    /// Unlink every entry registered since the last pass.  Entries a
    /// source already woke are gone from their queues; the rest are
    /// removed here.
    pub(crate) fn unregister_all(&mut self) {
        for node in self.entries.drain(..) {
            wait::unregister(&node);
        }
    }

    /// Reset the event flag for a fresh pass.  Readiness the cleared
    /// flag stood for is caught again by the pass itself.
    fn clear_event(&self) {
        self.state.flags.lock().event = false;
    }

    fn timed_out(&self) -> bool {
        self.state.flags.lock().timed_out
    }

    #[cfg(test)]
    pub(crate) fn has_event(&self) -> bool {
        self.state.flags.lock().event
    }
}

/// Registration handle passed to a resource's poll implementation.
pub struct PollRegistration<'a> {
    table: &'a mut PollTable,
}

impl PollRegistration<'_> {
    /// Hook the polling task onto `queue`.  A later wake on the queue
    /// flags the poll call for another readiness pass.
    pub fn register(&mut self, queue: &WaitQueue) {
        self.table.register(queue);
    }
}

/// Wait until one of `fds` is ready, a signal arrives, or the timeout
/// elapses.
///
/// `timeout` is in timer ticks: negative waits indefinitely, zero does
/// a single non-blocking pass, positive bounds the wait.  Returns how
/// many entries have non-empty `revents`; `Ok(0)` means the timeout
/// elapsed first.  With no ready entry and a pending signal the call
/// reports [`TaskError::Interrupted`].
///
/// An empty `fds` slice with a bounded timeout is an ordinary sleep;
/// with an unbounded one it could never return, so it is rejected.
pub fn poll(fds: &mut [PollFd], timeout: i64) -> Result<usize> {
    if fds.len() > config::MAX_POLL_FDS {
        return Err(TaskError::InvalidArgument("too many poll entries"));
    }
    if fds.is_empty() && timeout < 0 {
        return Err(TaskError::InvalidArgument("nothing to wait for"));
    }
    let task = table::current();
    poll_for(&task, fds, timeout)
}

pub(crate) fn poll_for(task: &Arc<Task>, fds: &mut [PollFd], timeout: i64) -> Result<usize> {
    let mut poll_table = PollTable::new(Arc::downgrade(task));

    if timeout == 0 {
        // Pre-expired timeout: the loop below runs exactly one pass.
        poll_table.state.notify_timeout();
    }
    let timeout_timer: Option<Timer> = if timeout > 0 {
        let state = poll_table.state.clone();
        Some(time::arm(timeout as u64, move || state.notify_timeout()))
    } else {
        None
    };

    // Resolve descriptors once, up front: a bad descriptor fails the
    // whole call before anything is registered.
    let mut files: Vec<Option<Arc<File>>> = Vec::with_capacity(fds.len());
    for entry in fds.iter() {
        if entry.fd < 0 {
            files.push(None);
        } else {
            files.push(Some(task.files().get(entry.fd as usize)?));
        }
    }

    let result = loop {
        poll_table.clear_event();
        let mut ready = 0;
        for (entry, file) in fds.iter_mut().zip(files.iter()) {
            entry.revents = PollMask::empty();
            if let Some(file) = file {
                entry.revents = file.poll(entry.interest, &mut poll_table.registration());
                if !entry.revents.is_empty() {
                    ready += 1;
                }
            }
        }
        if ready > 0 {
            break Ok(ready);
        }
        if poll_table.timed_out() {
            break Ok(0);
        }
        if task.signals().has_pending() {
            break Err(TaskError::Interrupted);
        }
        sleep_until_flagged(task, &poll_table);
        poll_table.unregister_all();
    };
    poll_table.unregister_all();
    if let Some(timer) = &timeout_timer {
        timer.cancel();
    }
    result
}

/// Park the task until an event, the timeout, or a signal is flagged.
fn sleep_until_flagged(task: &Arc<Task>, poll_table: &PollTable) {
    loop {
        task.set_state(TaskState::Sleeping);
        {
            // Flags are checked after the sleeping state is published,
            // so a wake that set a flag first is never lost.
            let flags = poll_table.state.flags.lock();
            if flags.event || flags.timed_out || task.signals().has_pending() {
                break;
            }
        }
        sched::yield_now();
        task.set_state(TaskState::Running);
    }
    task.set_state(TaskState::Running);
}
