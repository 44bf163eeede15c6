//! Subsystem configuration constants.
//!
//! Compile-time limits and sizes. These are configuration, not protocol:
//! changing them does not change any algorithm in this crate.

/// Open-resource handles per task (descriptor table slots).
pub const MAX_OPEN_FILES: usize = 20;

/// Maximum number of live tasks.
pub const MAX_TASKS: usize = 1024;

/// Maximum number of CPUs tracked for per-CPU state.
pub const MAX_CPUS: usize = 16;

/// Kernel stack size per task (16 KB).
pub const KERNEL_STACK_SIZE: usize = 16 * 1024;

/// Maximum entries accepted by a single poll call.
///
/// Entry storage is allocated per call, so this is purely a bound on how
/// much one call may ask the kernel to allocate.
pub const MAX_POLL_FDS: usize = 512;

/// Pipe buffer capacity in bytes.
pub const PIPE_CAPACITY: usize = 4096;

/// Timer interrupt frequency in Hz (one tick per millisecond).
pub const TIMER_FREQUENCY: u32 = 1000;
