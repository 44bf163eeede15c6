//! Error types for the task subsystem.
//!
//! Everything here is reported to the caller; conditions with no safe
//! recovery path (claim-protocol misuse, lifecycle calls with no current
//! task) halt the kernel with a panic instead of appearing in this enum.

use core::fmt;

/// Errors surfaced by task, synchronization, and poll operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskError {
    /// The configured live-task limit has been reached.
    TaskLimit,
    /// No free slot in the handle table.
    NoFreeHandle,
    /// Kernel allocation failed.
    OutOfMemory,
    /// Handle index does not name an open resource.
    BadHandle,
    /// No task with the given pid exists.
    NoSuchTask,
    /// Caller-supplied arguments are invalid.
    InvalidArgument(&'static str),
    /// The calling task has no children to wait for.
    NoChildren,
    /// A blocking call was cut short by a pending signal.
    Interrupted,
    /// The operation would block on a nonblocking resource.
    WouldBlock,
    /// The read side of the pipe has been closed.
    BrokenPipe,
    /// The resource does not support this operation.
    Unsupported,
}

impl fmt::Display for TaskError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TaskError::TaskLimit => write!(f, "task limit reached"),
            TaskError::NoFreeHandle => write!(f, "handle table full"),
            TaskError::OutOfMemory => write!(f, "out of memory"),
            TaskError::BadHandle => write!(f, "bad handle"),
            TaskError::NoSuchTask => write!(f, "no such task"),
            TaskError::InvalidArgument(what) => write!(f, "invalid argument: {}", what),
            TaskError::NoChildren => write!(f, "no child tasks"),
            TaskError::Interrupted => write!(f, "interrupted by signal"),
            TaskError::WouldBlock => write!(f, "operation would block"),
            TaskError::BrokenPipe => write!(f, "broken pipe"),
            TaskError::Unsupported => write!(f, "operation not supported"),
        }
    }
}

/// Result alias used throughout the subsystem.
pub type Result<T> = core::result::Result<T, TaskError>;

// ════════════════════════ Tests ════════════════════════
