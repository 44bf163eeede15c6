//! Scheduler-backed scenarios.
//!
//! A thread-backed [`Scheduler`] stands in for the real CPU scheduler:
//! every enqueued task runs on its own OS thread, wakes map to unparks,
//! and a ticker thread stands in for the timer interrupt.  Sleeping
//! tasks park with a short timeout, so a missed unpark costs latency,
//! never progress.
//!
//! Scenarios share one process-global task table and run serialized
//! behind a mutex.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{mpsc, Arc, Mutex, MutexGuard, Once, OnceLock};
use std::thread::{self, Thread};
use std::time::{Duration, Instant};

use solum_task::poll::{PollFd, PollMask};
use solum_task::sched::{self, Scheduler};
use solum_task::signal;
use solum_task::sync::Mutex as SleepingMutex;
use solum_task::sync::Semaphore;
use solum_task::sys;
use solum_task::task::table::{self, TaskTable};
use solum_task::task::{Pid, Task, TaskState};
use solum_task::time as ktime;
use solum_task::TaskError;

type QueuedBody = Box<dyn FnOnce() + Send>;

struct ThreadScheduler {
    /// OS thread per enqueued task, for wake-to-unpark.
    threads: Mutex<HashMap<u64, Thread>>,
    /// Entry bodies for tasks about to be enqueued, oldest first.
    bodies: Mutex<VecDeque<QueuedBody>>,
    next_cpu: AtomicUsize,
}

thread_local! {
    static CPU: std::cell::OnceCell<usize> = const { std::cell::OnceCell::new() };
}

impl ThreadScheduler {
    fn new() -> ThreadScheduler {
        ThreadScheduler {
            threads: Mutex::new(HashMap::new()),
            bodies: Mutex::new(VecDeque::new()),
            next_cpu: AtomicUsize::new(0),
        }
    }

    /// Body for the next task this scheduler is handed.  Queue before
    /// forking; a task enqueued with no body just exits zero.
    fn queue_body(&self, body: impl FnOnce() + Send + 'static) {
        self.bodies.lock().unwrap().push_back(Box::new(body));
    }

    fn take_body(&self) -> QueuedBody {
        self.bodies
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Box::new(|| sys::sys_exit(0)))
    }
}

impl Scheduler for ThreadScheduler {
    fn cpu_id(&self) -> usize {
        CPU.with(|cell| *cell.get_or_init(|| self.next_cpu.fetch_add(1, Ordering::SeqCst)))
    }

    fn add(&self, pid: Pid) {
        let body = self.take_body();
        let handle = thread::Builder::new()
            .name(format!("task-{}", pid))
            .spawn(move || run_task(pid, body))
            .expect("spawn task thread");
        self.threads
            .lock()
            .unwrap()
            .insert(pid.0, handle.thread().clone());
    }

    fn wake(&self, pid: Pid) {
        if let Some(thread) = self.threads.lock().unwrap().get(&pid.0) {
            thread.unpark();
        }
    }

    fn yield_now(&self) {
        match table::try_current() {
            Some(task) => match task.state() {
                TaskState::Sleeping => {
                    // Timeout-bounded park: an unpark that slipped past
                    // the threads map only delays the re-check.
                    while task.state() == TaskState::Sleeping {
                        thread::park_timeout(Duration::from_millis(1));
                    }
                }
                TaskState::Zombie | TaskState::Dead => loop {
                    thread::park();
                },
                _ => thread::yield_now(),
            },
            None => thread::yield_now(),
        }
    }

    fn mark_dead(&self, pid: Pid) {
        self.threads.lock().unwrap().remove(&pid.0);
    }
}

/// Thread entry for an enqueued task: become current on this CPU, run
/// the body, and exit if the body did not.
fn run_task(pid: Pid, body: QueuedBody) {
    let task = match table::global().get(pid) {
        Some(task) => task,
        None => return,
    };
    table::global().set_current(sched::cpu_id(), Some(task.clone()));
    task.set_state(TaskState::Running);
    body();
    sys::sys_exit(0);
}

static SCHEDULER: OnceLock<&'static ThreadScheduler> = OnceLock::new();
static SCENARIO: Mutex<()> = Mutex::new(());
static TICKER: Once = Once::new();

fn scheduler() -> &'static ThreadScheduler {
    SCHEDULER.get_or_init(|| {
        let installed: &'static ThreadScheduler = Box::leak(Box::new(ThreadScheduler::new()));
        sched::install(installed);
        installed
    })
}

fn start_ticker() {
    TICKER.call_once(|| {
        thread::Builder::new()
            .name("ticker".into())
            .spawn(|| loop {
                ktime::timer_tick();
                thread::sleep(Duration::from_millis(1));
            })
            .expect("spawn ticker");
    });
}

/// Serialize the scenario, install the scheduler and ticker, and become
/// the boot task on this thread's CPU.
fn setup() -> (MutexGuard<'static, ()>, &'static TaskTable, Arc<Task>) {
    let guard = SCENARIO.lock().unwrap_or_else(|err| err.into_inner());
    scheduler();
    start_ticker();
    let me = table::init();
    (guard, table::global(), me)
}

/// Give a plain worker thread a task identity so it can block.
fn become_task(table: &TaskTable, name: &str) -> Arc<Task> {
    let task = table.create(name).expect("create worker task");
    task.set_state(TaskState::Running);
    table.set_current(sched::cpu_id(), Some(task.clone()));
    task
}

#[test]
fn builtin_checks_pass() {
    let (_guard, _table, _me) = setup();
    for (name, result) in solum_conformance::run_all_checks() {
        assert!(result.passed(), "check {} failed: {:?}", name, result);
    }
}

#[test]
fn semaphore_blocks_until_permit() {
    let (_guard, table, _me) = setup();
    let sem = Arc::new(Semaphore::new(0));
    let entered = Arc::new(AtomicBool::new(false));

    let worker = thread::spawn({
        let sem = sem.clone();
        let entered = entered.clone();
        move || {
            let _task = become_task(table, "downer");
            sem.down();
            entered.store(true, Ordering::SeqCst);
        }
    });

    thread::sleep(Duration::from_millis(30));
    assert!(!entered.load(Ordering::SeqCst), "down acquired without a permit");
    assert!(sem.waiting());

    sem.up();
    worker.join().unwrap();
    assert!(entered.load(Ordering::SeqCst));
    assert_eq!(sem.count(), 0);
}

#[test]
fn fork_exit_wait_roundtrip() {
    let (_guard, table, me) = setup();
    let (tx, rx) = mpsc::channel();

    scheduler().queue_body(move || {
        tx.send((sys::sys_getpid(), sys::sys_getppid())).unwrap();
        sys::sys_exit(7);
    });
    let child_pid = sys::sys_fork().unwrap();

    let child = table.get(child_pid).expect("child in table");
    assert_eq!(child.parent(), Some(me.pid()));
    assert_eq!(child.frame().syscall_ret, 0);

    let (child_self, child_parent) = rx.recv_timeout(Duration::from_secs(10)).unwrap();
    assert_eq!(child_self, child_pid);
    assert_eq!(child_parent, Some(me.pid()));

    assert_eq!(sys::sys_wait().unwrap(), (child_pid, 7));
    assert!(table.get(child_pid).is_none());
    assert_eq!(sys::sys_wait().unwrap_err(), TaskError::NoChildren);
}

#[test]
fn pipe_crosses_fork() {
    let (_guard, _table, _me) = setup();
    let (read_fd, write_fd) = sys::sys_pipe().unwrap();

    scheduler().queue_body(move || {
        sys::sys_close(read_fd).unwrap();
        let out = table::current().files().get(write_fd).unwrap();
        out.write(b"ping").unwrap();
        // The handle must not outlive the task: exit below never
        // returns, and a lingering reference would hold the pipe open.
        drop(out);
        sys::sys_exit(0);
    });
    let child_pid = sys::sys_fork().unwrap();

    // Only the child can produce data now.
    sys::sys_close(write_fd).unwrap();

    let mut fds = [PollFd::new(read_fd as i32, PollMask::IN)];
    assert_eq!(sys::sys_poll(&mut fds, 5_000).unwrap(), 1);
    assert!(fds[0].revents.contains(PollMask::IN));

    let input = table::current().files().get(read_fd).unwrap();
    let mut buf = [0u8; 8];
    assert_eq!(input.read(&mut buf).unwrap(), 4);
    assert_eq!(&buf[..4], b"ping");

    assert_eq!(sys::sys_wait().unwrap(), (child_pid, 0));
    // Exit teardown closed the child's write end; stream is over.
    assert_eq!(input.read(&mut buf).unwrap(), 0);

    drop(input);
    sys::sys_close(read_fd).unwrap();
}

#[test]
fn exit_frees_descendants() {
    let (_guard, table, _me) = setup();
    let (tx, rx) = mpsc::channel();

    scheduler().queue_body(move || {
        let grandchild_pid = sys::sys_fork().unwrap();
        tx.send(grandchild_pid).unwrap();
        sys::sys_exit(3);
    });
    scheduler().queue_body(|| {
        sys::sys_sleep(60_000);
    });

    let child_pid = sys::sys_fork().unwrap();
    let grandchild_pid = rx.recv_timeout(Duration::from_secs(10)).unwrap();

    assert_eq!(sys::sys_wait().unwrap(), (child_pid, 3));
    // The child exited without waiting; its subtree went with it.
    assert!(table.get(grandchild_pid).is_none());
}

#[test]
fn poll_timeout_elapses() {
    let (_guard, _table, _me) = setup();
    let started = Instant::now();
    let mut fds: [PollFd; 0] = [];
    assert_eq!(sys::sys_poll(&mut fds, 50).unwrap(), 0);

    let elapsed = started.elapsed();
    assert!(
        elapsed >= Duration::from_millis(30),
        "timeout returned after only {:?}",
        elapsed
    );
    assert!(elapsed < Duration::from_secs(5), "timeout overslept: {:?}", elapsed);
}

#[test]
fn signal_interrupts_poll() {
    let (_guard, table, _me) = setup();
    let (tx, rx) = mpsc::channel();

    let worker = thread::spawn(move || {
        let task = become_task(table, "poll-waiter");
        let (read_fd, _write_fd) = sys::sys_pipe().unwrap();
        tx.send(task.pid()).unwrap();
        let mut fds = [PollFd::new(read_fd as i32, PollMask::IN)];
        sys::sys_poll(&mut fds, -1)
    });

    let pid = rx.recv_timeout(Duration::from_secs(10)).unwrap();
    thread::sleep(Duration::from_millis(30));

    assert_eq!(sys::sys_kill(pid, 0), Ok(()));
    assert_eq!(
        sys::sys_kill(Pid(u64::MAX), 0).unwrap_err(),
        TaskError::NoSuchTask
    );

    sys::sys_kill(pid, signal::SIGUSR1).unwrap();
    assert_eq!(worker.join().unwrap().unwrap_err(), TaskError::Interrupted);
}

#[test]
fn mutex_serializes_increments() {
    let (_guard, table, _me) = setup();
    let counter = Arc::new(SleepingMutex::new(0u64));

    let workers: Vec<_> = (0..4)
        .map(|i| {
            thread::spawn({
                let counter = counter.clone();
                move || {
                    let _task = become_task(table, &format!("adder-{}", i));
                    for _ in 0..1_000 {
                        *counter.lock() += 1;
                    }
                }
            })
        })
        .collect();

    for worker in workers {
        worker.join().unwrap();
    }
    assert_eq!(*counter.lock(), 4_000);
}

#[test]
fn sleep_holds_for_requested_ticks() {
    let (_guard, _table, _me) = setup();
    let before = ktime::ticks();
    sys::sys_sleep(20);
    assert!(ktime::ticks() - before >= 20);
}
