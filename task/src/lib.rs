//! Solum task subsystem
//!
//! Task lifecycle (create, fork, exit, wait), blocking synchronization
//! (wait queues, semaphores, sleeping mutexes), per-task resource handle
//! tables, and the poll-style readiness multiplexer.
//!
//! The CPU scheduler proper lives outside this crate; it is consumed
//! through the [`sched::Scheduler`] trait installed at boot. Likewise
//! virtual memory is an opaque handle ([`mm::AddressSpace`]) and signal
//! delivery policy reduces to a pending-signal predicate on [`Task`].

#![cfg_attr(not(test), no_std)]

extern crate alloc;

pub mod config;
pub mod error;
pub mod file;
pub mod mm;
pub mod pipe;
pub mod poll;
pub mod sched;
pub mod signal;
pub mod sync;
pub mod sys;
pub mod task;
pub mod time;

pub use error::{Result, TaskError};
pub use task::{Pid, Task, TaskState};
