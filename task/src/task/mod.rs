//! Tasks: the unit of execution.
//!
//! A [`Task`] bundles identity, scheduling state, the open-resource
//! handle table, family links, and the kernel stack.  Lifecycle: created
//! RUNNABLE, cycles through running/sleeping/runnable, becomes ZOMBIE on
//! exit (resources released, exit code kept for the parent), and is
//! destroyed when the parent reaps it or exits itself.
//!
//! Creation, fork, exit, and wait live in [`table`]; the fixed-slot
//! descriptor table lives in [`fd`].

pub mod fd;
pub mod table;

use core::fmt;
use core::sync::atomic::{AtomicBool, AtomicI32, AtomicU64, AtomicU8, Ordering};

use alloc::string::String;
use alloc::sync::{Arc, Weak};
use alloc::vec::Vec;

use crate::config;
use crate::error::{Result, TaskError};
use crate::file::File;
use crate::mm::AddressSpace;
use crate::signal::SignalState;
use crate::sync::wait::WaitNode;
use crate::sync::SpinLock;
use crate::time;

use fd::FdTable;

static NEXT_PID: AtomicU64 = AtomicU64::new(1);

/// Task identifier.  Unique and monotonically assigned; never reused
/// while any reference to the task exists (in fact never reused at all).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Pid(pub u64);

impl Pid {
    pub(crate) fn allocate() -> Pid {
        Pid(NEXT_PID.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for Pid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Scheduling state of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum TaskState {
    /// Ready to run, waiting for a CPU.
    Runnable = 0,
    /// Executing on some CPU.
    Running = 1,
    /// Suspended until woken.
    Sleeping = 2,
    /// Exited; kept only for the parent to observe the exit code.
    Zombie = 3,
    /// Reaped.  Terminal.
    Dead = 4,
}

impl TaskState {
    fn from_u8(raw: u8) -> TaskState {
        match raw {
            0 => TaskState::Runnable,
            1 => TaskState::Running,
            2 => TaskState::Sleeping,
            3 => TaskState::Zombie,
            4 => TaskState::Dead,
            _ => panic!("invalid task state {}", raw),
        }
    }
}

/// Saved trap/return context, copied to a forked child with the syscall
/// return value forced to zero.
#[derive(Debug, Clone, Copy, Default)]
pub struct TrapFrame {
    pub pc: u64,
    pub sp: u64,
    pub flags: u64,
    pub syscall_ret: u64,
}

/// Owned kernel execution stack.
pub struct KernelStack {
    mem: Vec<u8>,
}

impl KernelStack {
    fn new() -> Result<KernelStack> {
        let mut mem = Vec::new();
        mem.try_reserve_exact(config::KERNEL_STACK_SIZE)
            .map_err(|_| TaskError::OutOfMemory)?;
        mem.resize(config::KERNEL_STACK_SIZE, 0);
        Ok(KernelStack { mem })
    }

    /// Address just past the highest byte, where the stack pointer starts.
    pub fn top(&self) -> usize {
        self.mem.as_ptr() as usize + self.mem.len()
    }

    pub fn size(&self) -> usize {
        self.mem.len()
    }
}

/// One schedulable execution context.
pub struct Task {
    pid: Pid,
    name: SpinLock<String>,
    /// Kernel thread: runs with no user address space.
    kernel: bool,
    state: AtomicU8,
    exit_code: AtomicI32,
    killed: AtomicBool,
    /// Tick deadline for a timed sleep; `time::NO_DEADLINE` when unset.
    wake_at: AtomicU64,
    /// Fixed at creation; valid until this task is reaped.
    parent: Option<Pid>,
    /// Pids of live and zombie children, under their dedicated lock.
    children: SpinLock<Vec<Pid>>,
    files: FdTable,
    cwd: SpinLock<Option<Arc<File>>>,
    space: SpinLock<Option<AddressSpace>>,
    stack: KernelStack,
    frame: SpinLock<TrapFrame>,
    signals: SignalState,
    /// Node used when this task itself blocks on a wait queue.  A task
    /// is in at most one queue at a time.
    wait_node: Arc<WaitNode>,
}

impl Task {
    /// Allocate a task shell: identity, kernel stack, state RUNNABLE.
    ///
    /// The task is inert until the caller hands it to the scheduler.
    pub(crate) fn new(
        name: &str,
        kernel: bool,
        parent: Option<Pid>,
        space: Option<AddressSpace>,
    ) -> Result<Arc<Task>> {
        let stack = KernelStack::new()?;
        let task = Arc::new_cyclic(|weak: &Weak<Task>| Task {
            pid: Pid::allocate(),
            name: SpinLock::new(String::from(name)),
            kernel,
            state: AtomicU8::new(TaskState::Runnable as u8),
            exit_code: AtomicI32::new(0),
            killed: AtomicBool::new(false),
            wake_at: AtomicU64::new(time::NO_DEADLINE),
            parent,
            children: SpinLock::new(Vec::new()),
            files: FdTable::new(),
            cwd: SpinLock::new(None),
            space: SpinLock::new(space),
            stack,
            frame: SpinLock::new(TrapFrame::default()),
            signals: SignalState::new(),
            wait_node: WaitNode::resume(weak.clone()),
        });
        log::debug!("[task] {} '{}' created", task.pid, name);
        Ok(task)
    }

    pub fn pid(&self) -> Pid {
        self.pid
    }

    pub fn name(&self) -> String {
        self.name.lock().clone()
    }

    pub fn set_name(&self, name: &str) {
        let mut slot = self.name.lock();
        slot.clear();
        slot.push_str(name);
    }

    pub fn is_kernel(&self) -> bool {
        self.kernel
    }

    pub fn state(&self) -> TaskState {
        TaskState::from_u8(self.state.load(Ordering::SeqCst))
    }

    /// Overwrite the scheduling state.  The scheduler uses this on
    /// dispatch; blocking paths use it around their suspension points.
    pub fn set_state(&self, state: TaskState) {
        self.state.store(state as u8, Ordering::SeqCst);
    }

    /// SLEEPING -> RUNNABLE, if and only if the task is sleeping.
    pub fn set_runnable_if_sleeping(&self) -> bool {
        self.state
            .compare_exchange(
                TaskState::Sleeping as u8,
                TaskState::Runnable as u8,
                Ordering::SeqCst,
                Ordering::SeqCst,
            )
            .is_ok()
    }

    pub fn exit_code(&self) -> i32 {
        self.exit_code.load(Ordering::SeqCst)
    }

    pub(crate) fn set_exit_code(&self, code: i32) {
        self.exit_code.store(code, Ordering::SeqCst);
    }

    pub fn killed(&self) -> bool {
        self.killed.load(Ordering::SeqCst)
    }

    pub(crate) fn set_killed(&self) {
        self.killed.store(true, Ordering::SeqCst);
    }

    pub fn wake_at(&self) -> Option<u64> {
        match self.wake_at.load(Ordering::SeqCst) {
            time::NO_DEADLINE => None,
            tick => Some(tick),
        }
    }

    pub(crate) fn set_wake_at(&self, deadline: Option<u64>) {
        self.wake_at
            .store(deadline.unwrap_or(time::NO_DEADLINE), Ordering::SeqCst);
    }

    pub fn parent(&self) -> Option<Pid> {
        self.parent
    }

    /// Snapshot of the children pids.
    pub fn children(&self) -> Vec<Pid> {
        self.children.lock().clone()
    }

    /// Run `f` with the children list locked.
    ///
    /// Exit and wait also use this lock to serialize zombie transitions
    /// with the parent's scan-then-sleep.
    pub(crate) fn with_children<R>(&self, f: impl FnOnce(&mut Vec<Pid>) -> R) -> R {
        f(&mut self.children.lock())
    }

    pub fn files(&self) -> &FdTable {
        &self.files
    }

    pub fn cwd(&self) -> Option<Arc<File>> {
        self.cwd.lock().clone()
    }

    pub fn set_cwd(&self, cwd: Option<Arc<File>>) {
        *self.cwd.lock() = cwd;
    }

    pub(crate) fn take_cwd(&self) -> Option<Arc<File>> {
        self.cwd.lock().take()
    }

    pub fn has_address_space(&self) -> bool {
        self.space.lock().is_some()
    }

    pub(crate) fn duplicate_space(&self) -> Option<AddressSpace> {
        self.space.lock().as_ref().map(AddressSpace::duplicate)
    }

    pub(crate) fn take_space(&self) -> Option<AddressSpace> {
        self.space.lock().take()
    }

    pub fn frame(&self) -> TrapFrame {
        *self.frame.lock()
    }

    pub fn set_frame(&self, frame: TrapFrame) {
        *self.frame.lock() = frame;
    }

    pub fn signals(&self) -> &SignalState {
        &self.signals
    }

    pub fn wait_node(&self) -> &Arc<WaitNode> {
        &self.wait_node
    }

    pub fn stack_top(&self) -> usize {
        self.stack.top()
    }

    /// Detached task for unit tests: kernel thread, no parent, not in
    /// any table.
    #[cfg(test)]
    pub(crate) fn stub(name: &str) -> Arc<Task> {
        Task::new(name, true, None, None).unwrap()
    }
}

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task")
            .field("pid", &self.pid)
            .field("name", &*self.name.lock())
            .field("state", &self.state())
            .field("kernel", &self.kernel)
            .finish_non_exhaustive()
    }
}
