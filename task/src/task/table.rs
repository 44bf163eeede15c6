//! The task table: pid-keyed arena, live-task accounting, per-CPU
//! current tasks, and the lifecycle operations built on them.
//!
//! Parent/child edges are pids resolved through the table, so task
//! handles form no reference cycles.  The table is process-wide state
//! with explicit init at kernel start and no teardown.

use core::sync::atomic::{AtomicUsize, Ordering};

use alloc::collections::BTreeMap;
use alloc::format;
use alloc::sync::Arc;
use spin::Once;

use crate::config;
use crate::error::{Result, TaskError};
use crate::mm::{self, AddressSpace};
use crate::sched;
use crate::signal;
use crate::sync::SpinLock;
use crate::task::{Pid, Task, TaskState, TrapFrame};

/// Arena of all live (and zombie) tasks.
pub struct TaskTable {
    tasks: SpinLock<BTreeMap<Pid, Arc<Task>>>,
    /// Tasks holding a slot against `limit`: everything created and not
    /// yet destroyed, zombies included.
    live: AtomicUsize,
    limit: usize,
    /// Task executing on each CPU, keyed by CPU id.
    current: SpinLock<BTreeMap<usize, Arc<Task>>>,
}

impl TaskTable {
    /// Empty table admitting at most `limit` tasks.
    pub fn new(limit: usize) -> TaskTable {
        TaskTable {
            tasks: SpinLock::new(BTreeMap::new()),
            live: AtomicUsize::new(0),
            limit,
            current: SpinLock::new(BTreeMap::new()),
        }
    }

    fn reserve_slot(&self) -> Result<()> {
        self.live
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |live| {
                if live < self.limit {
                    Some(live + 1)
                } else {
                    None
                }
            })
            .map(|_| ())
            .map_err(|_| TaskError::TaskLimit)
    }

    fn release_slot(&self) {
        self.live.fetch_sub(1, Ordering::SeqCst);
    }

    pub fn live_count(&self) -> usize {
        self.live.load(Ordering::SeqCst)
    }

    /// Look up a task by pid.
    pub fn get(&self, pid: Pid) -> Option<Arc<Task>> {
        self.tasks.lock().get(&pid).cloned()
    }

    /// Record which task is executing on `cpu`.  The scheduler calls
    /// this on every dispatch.
    pub fn set_current(&self, cpu: usize, task: Option<Arc<Task>>) {
        let mut current = self.current.lock();
        match task {
            Some(task) => {
                current.insert(cpu, task);
            }
            None => {
                current.remove(&cpu);
            }
        }
    }

    /// Task executing on the calling CPU, if one is registered.
    pub fn try_current(&self) -> Option<Arc<Task>> {
        self.current.lock().get(&sched::cpu_id()).cloned()
    }

    /// Task executing on the calling CPU.
    ///
    /// # Panics
    ///
    /// Lifecycle code with no current task cannot continue; this panics.
    pub fn current(&self) -> Arc<Task> {
        match self.try_current() {
            Some(task) => task,
            None => panic!("no current task on cpu {}", sched::cpu_id()),
        }
    }

    /// Allocate an inert user task: empty address space, empty handle
    /// table, no parent.  The caller decides when to enqueue it.
    pub fn create(&self, name: &str) -> Result<Arc<Task>> {
        self.reserve_slot()?;
        let task = match Task::new(name, false, None, Some(AddressSpace::new_empty())) {
            Ok(task) => task,
            Err(err) => {
                self.release_slot();
                return Err(err);
            }
        };
        self.tasks.lock().insert(task.pid(), task.clone());
        Ok(task)
    }

    /// Spawn a kernel thread starting at `entry` and enqueue it.
    pub fn spawn_kernel(&self, name: &str, entry: fn()) -> Result<Arc<Task>> {
        self.reserve_slot()?;
        let task = match Task::new(name, true, None, None) {
            Ok(task) => task,
            Err(err) => {
                self.release_slot();
                return Err(err);
            }
        };
        task.set_frame(TrapFrame {
            pc: entry as usize as u64,
            sp: task.stack_top() as u64,
            ..TrapFrame::default()
        });
        self.tasks.lock().insert(task.pid(), task.clone());
        sched::add(task.pid());
        log::debug!("[task] kernel thread {} '{}' spawned", task.pid(), name);
        Ok(task)
    }

    /// Register the already-running boot context as a task and make it
    /// current on the calling CPU.  Idempotent per CPU.
    pub fn init_boot(&self) -> Arc<Task> {
        if let Some(current) = self.try_current() {
            return current;
        }
        if self.reserve_slot().is_err() {
            panic!("task limit reached during boot");
        }
        let task = match Task::new("boot", true, None, None) {
            Ok(task) => task,
            Err(err) => panic!("boot task allocation failed: {}", err),
        };
        task.set_state(TaskState::Running);
        self.tasks.lock().insert(task.pid(), task.clone());
        self.set_current(sched::cpu_id(), Some(task.clone()));
        log::info!("[task] boot task {} on cpu {}", task.pid(), sched::cpu_id());
        task
    }

    /// Duplicate `parent` into a new child task and enqueue it.
    ///
    /// The child shares every open resource (reference counts go up, no
    /// deep copies), duplicates the address space and working directory,
    /// and gets the parent's trap frame with the syscall return forced
    /// to zero.
    pub fn fork(&self, parent: &Arc<Task>) -> Result<Arc<Task>> {
        self.reserve_slot()?;
        let name = format!("child:{}", parent.name());
        let child = match Task::new(
            &name,
            parent.is_kernel(),
            Some(parent.pid()),
            parent.duplicate_space(),
        ) {
            Ok(child) => child,
            Err(err) => {
                self.release_slot();
                return Err(err);
            }
        };
        child.set_cwd(parent.cwd());
        parent.files().duplicate_into(child.files());
        let mut frame = parent.frame();
        frame.syscall_ret = 0;
        child.set_frame(frame);
        parent.with_children(|children| children.push(child.pid()));
        self.tasks.lock().insert(child.pid(), child.clone());
        sched::add(child.pid());
        log::debug!("[task] {} forked from {}", child.pid(), parent.pid());
        Ok(child)
    }

    /// Terminate the current task.  Never returns.
    pub fn exit(&self, code: i32) -> ! {
        let task = self.current();
        log::trace!("[task] {} exiting with code {}", task.pid(), code);
        sched::interrupts_off();
        mm::switch_to_kernel();
        // A task freed together with its exiting parent can still reach
        // here; everything was torn down on its behalf already.
        if task.state() != TaskState::Dead {
            self.make_zombie(&task, code);
        }
        sched::yield_final();
        panic!("zombie task {} was scheduled again", task.pid());
    }

    /// Tear a task down to a zombie: resources released, children freed
    /// outright, exit code recorded, parent woken.
    fn make_zombie(&self, task: &Arc<Task>, code: i32) {
        task.set_killed();
        task.set_exit_code(code);
        self.release_children(task);
        self.teardown(task);
        match task.parent().and_then(|pid| self.get(pid)) {
            Some(parent) => parent.with_children(|_| {
                // The zombie transition and the parent wake happen under
                // the parent's children lock, so they serialize with
                // wait()'s scan-then-sleep.
                task.set_state(TaskState::Zombie);
                sched::wake(&parent);
            }),
            None => task.set_state(TaskState::Zombie),
        }
        log::trace!("[task] {} is a zombie (code {})", task.pid(), code);
    }

    /// Close every resource the task holds open.
    fn teardown(&self, task: &Arc<Task>) {
        task.files().close_all();
        drop(task.take_cwd());
        if !task.is_kernel() {
            drop(task.take_space());
        }
    }

    /// Free all children of an exiting task, zombies and live ones
    /// alike.  There is no reparenting: the subtree goes away.
    fn release_children(&self, task: &Arc<Task>) {
        let children = task.with_children(core::mem::take);
        for pid in children {
            let child = match self.get(pid) {
                Some(child) => child,
                None => continue,
            };
            child.set_killed();
            // A child blocked in a signal-aware sleep notices this and
            // stops blocking.
            let _ = child.signals().send(signal::SIGKILL);
            if child.state() != TaskState::Zombie {
                self.release_children(&child);
                self.teardown(&child);
                child.set_state(TaskState::Zombie);
            }
            self.destroy(&child);
            log::trace!("[task] {} freed with exiting parent", pid);
        }
    }

    /// Drop a zombie from the table and the scheduler.
    fn destroy(&self, task: &Arc<Task>) {
        self.tasks.lock().remove(&task.pid());
        task.set_state(TaskState::Dead);
        sched::mark_dead(task.pid());
        self.release_slot();
    }

    /// Reap one zombie child of the current task.
    ///
    /// Blocks until a child exits.  A wake is treated as a hint: the
    /// children are re-scanned every time.  With no children at all this
    /// returns [`TaskError::NoChildren`] immediately.
    pub fn wait(&self) -> Result<(Pid, i32)> {
        let task = self.current();
        loop {
            let mut reaped: Option<Arc<Task>> = None;
            let mut have_children = false;
            task.with_children(|children| {
                have_children = !children.is_empty();
                for i in 0..children.len() {
                    if let Some(child) = self.get(children[i]) {
                        if child.state() == TaskState::Zombie {
                            children.remove(i);
                            reaped = Some(child);
                            break;
                        }
                    }
                }
                if reaped.is_none() && have_children {
                    // Publish the sleep decision under the children
                    // lock; an exiting child wakes under the same lock.
                    task.set_state(TaskState::Sleeping);
                }
            });
            if let Some(child) = reaped {
                let pid = child.pid();
                let code = child.exit_code();
                self.destroy(&child);
                log::trace!("[task] {} reaped {} (code {})", task.pid(), pid, code);
                return Ok((pid, code));
            }
            if !have_children {
                return Err(TaskError::NoChildren);
            }
            sched::yield_now();
            task.set_state(TaskState::Running);
        }
    }
}

// ==================== Global table ====================

static TABLE: Once<TaskTable> = Once::new();

/// Initialize the global table (first call only) and register the boot
/// task on the calling CPU.
pub fn init() -> Arc<Task> {
    let table = TABLE.call_once(|| TaskTable::new(config::MAX_TASKS));
    table.init_boot()
}

/// The global task table.
///
/// # Panics
///
/// Panics when called before [`init`].
pub fn global() -> &'static TaskTable {
    match TABLE.get() {
        Some(table) => table,
        None => panic!("task table used before init"),
    }
}

/// Current task on the calling CPU, from the global table.
pub fn current() -> Arc<Task> {
    global().current()
}

/// Like [`current`], but `None` when nothing is registered (or the
/// table is not initialized yet).
pub fn try_current() -> Option<Arc<Task>> {
    TABLE.get().and_then(|table| table.try_current())
}
