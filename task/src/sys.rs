//! The system-call surface.
//!
//! Thin wrappers that resolve the current task and delegate to the
//! lifecycle, descriptor, pipe, poll, and timer modules.  The embedding
//! kernel's trap handler dispatches here after argument decoding; user
//! pointers are already gone by this layer.
//!
//! Everything here is exercised end to end by the conformance crate.

use crate::error::{Result, TaskError};
use crate::pipe;
use crate::poll::{self, PollFd};
use crate::sched;
use crate::task::{table, Pid};
use crate::time;

/// Duplicate the current task.  Returns the child's pid; the child
/// observes a zero syscall return instead.
pub fn sys_fork() -> Result<Pid> {
    let table = table::global();
    let parent = table.current();
    let child = table.fork(&parent)?;
    Ok(child.pid())
}

/// Terminate the current task with `code`.  Never returns.
pub fn sys_exit(code: i32) -> ! {
    table::global().exit(code)
}

/// Reap one exited child, blocking until one exists.  Returns the
/// child's pid and exit code.
pub fn sys_wait() -> Result<(Pid, i32)> {
    table::global().wait()
}

pub fn sys_getpid() -> Pid {
    table::current().pid()
}

/// Parent's pid, `None` for parentless tasks.
pub fn sys_getppid() -> Option<Pid> {
    table::current().parent()
}

/// Duplicate `fd` into the lowest free descriptor slot.
pub fn sys_dup(fd: usize) -> Result<usize> {
    table::current().files().dup(fd)
}

/// Duplicate `oldfd` into `newfd`, closing whatever `newfd` held.
pub fn sys_dup2(oldfd: usize, newfd: usize) -> Result<usize> {
    table::current().files().dup2(oldfd, newfd)
}

pub fn sys_close(fd: usize) -> Result<()> {
    table::current().files().close(fd)
}

/// Create a pipe and return its (read, write) descriptors.
///
/// Both slots are claimed before the pipe exists, so a full table fails
/// cleanly with nothing created and the first claim released.
pub fn sys_pipe() -> Result<(usize, usize)> {
    let task = table::current();
    let files = task.files();
    let read_fd = files.claim()?;
    let write_fd = match files.claim() {
        Ok(fd) => fd,
        Err(err) => {
            files.release_claim(read_fd);
            return Err(err);
        }
    };
    let (read_end, write_end) = pipe::pipe();
    files.assign(read_fd, read_end);
    files.assign(write_fd, write_end);
    Ok((read_fd, write_fd))
}

/// Wait for readiness on any of `fds`; see [`poll::poll`] for the
/// timeout convention.
pub fn sys_poll(fds: &mut [PollFd], timeout: i64) -> Result<usize> {
    poll::poll(fds, timeout)
}

/// Suspend the current task for at least `ticks` timer ticks.
pub fn sys_sleep(ticks: u64) {
    time::sleep_ticks(ticks)
}

/// Give up the processor without blocking.
pub fn sys_yield() {
    sched::yield_now()
}

/// Post `signum` to the task `pid`.  Signal zero posts nothing and just
/// probes that the task exists.
pub fn sys_kill(pid: Pid, signum: u8) -> Result<()> {
    let task = table::global().get(pid).ok_or(TaskError::NoSuchTask)?;
    if signum == 0 {
        return Ok(());
    }
    task.signals().send(signum)?;
    // A sleeping target re-checks its wait condition and sees the
    // pending signal; a running one just keeps going.
    sched::wake(&task);
    Ok(())
}
