//! Wait queues.
//!
//! A [`WaitQueue`] is an unordered registration list of [`WaitNode`]s,
//! each pairing a waiter with a wake action.  Waking takes nodes off the
//! list and dispatches their actions while the queue's internal lock is
//! held; [`unregister`] removes a node under that same lock.  The shared
//! lock is what makes the unregister guarantee possible: once
//! `unregister` returns, the node's action is not mid-execution and will
//! never run again.
//!
//! The action indirection exists so that many independent event sources
//! can feed a single waiter: the readiness multiplexer registers
//! [`WakeAction::Notify`] nodes that run table-local bookkeeping instead
//! of unconditionally resuming the task.

use alloc::boxed::Box;
use alloc::collections::VecDeque;
use alloc::sync::{Arc, Weak};

use crate::sched;
use crate::sync::SpinLock;
use crate::task::Task;

/// What happens when a node is taken off its queue by a wake.
pub enum WakeAction {
    /// Mark the owning task runnable and hand it to the scheduler.
    Resume(Weak<Task>),
    /// Invoke a callback; the waiter resumes itself only if the callback
    /// decides so.
    Notify(Box<dyn Fn() + Send + Sync>),
}

/// A waiter's entry in a wait queue.
///
/// Nodes are shared handles: the owner keeps one reference and the queue
/// holds another while the node is linked.
pub struct WaitNode {
    action: WakeAction,
    /// Queue this node is currently linked into, if any.
    linked: SpinLock<Option<Weak<QueueInner>>>,
}

impl WaitNode {
    /// Node that resumes `task` when woken.
    pub fn resume(task: Weak<Task>) -> Arc<WaitNode> {
        Arc::new(WaitNode {
            action: WakeAction::Resume(task),
            linked: SpinLock::new(None),
        })
    }

    /// Node that runs `callback` when woken.
    pub fn notify<F>(callback: F) -> Arc<WaitNode>
    where
        F: Fn() + Send + Sync + 'static,
    {
        Arc::new(WaitNode {
            action: WakeAction::Notify(Box::new(callback)),
            linked: SpinLock::new(None),
        })
    }

    /// Whether the node is linked into a queue.
    pub fn is_linked(&self) -> bool {
        self.linked.lock().is_some()
    }

    /// Clear the backref and dispatch the wake action.
    ///
    /// Called with the owning queue's list lock held.
    fn complete(&self) {
        *self.linked.lock() = None;
        match &self.action {
            WakeAction::Resume(task) => {
                if let Some(task) = task.upgrade() {
                    sched::wake(&task);
                }
            }
            WakeAction::Notify(callback) => callback(),
        }
    }
}

struct QueueInner {
    waiters: SpinLock<VecDeque<Arc<WaitNode>>>,
}

/// Registration list of waiters tied to one condition source.
///
/// Cloning yields another handle to the same queue.
#[derive(Clone)]
pub struct WaitQueue {
    inner: Arc<QueueInner>,
}

impl WaitQueue {
    /// Create an empty queue.
    pub fn new() -> WaitQueue {
        WaitQueue {
            inner: Arc::new(QueueInner {
                waiters: SpinLock::new(VecDeque::new()),
            }),
        }
    }

    /// Append `node` to the queue.
    ///
    /// # Panics
    ///
    /// Registering a node that is already linked into a queue is a
    /// consistency violation and panics.
    pub fn register(&self, node: &Arc<WaitNode>) {
        let mut waiters = self.inner.waiters.lock();
        {
            let mut linked = node.linked.lock();
            if linked.is_some() {
                panic!("wait node registered while already linked");
            }
            *linked = Some(Arc::downgrade(&self.inner));
        }
        waiters.push_back(node.clone());
    }

    /// Wake every registered waiter, in registration order.
    ///
    /// Returns the number of nodes dispatched.  Waking an empty queue is
    /// a no-op.
    pub fn wake_all(&self) -> usize {
        let mut waiters = self.inner.waiters.lock();
        let mut woken = 0;
        while let Some(node) = waiters.pop_front() {
            node.complete();
            woken += 1;
        }
        woken
    }

    /// Wake the first registered waiter, if any.
    pub fn wake_one(&self) -> bool {
        let mut waiters = self.inner.waiters.lock();
        match waiters.pop_front() {
            Some(node) => {
                node.complete();
                true
            }
            None => false,
        }
    }

    /// Whether any waiter is registered.  Diagnostic only: the answer can
    /// be stale by the time the caller acts on it.
    pub fn waiting(&self) -> bool {
        !self.inner.waiters.lock().is_empty()
    }
}

impl Default for WaitQueue {
    fn default() -> WaitQueue {
        WaitQueue::new()
    }
}

/// Remove `node` from whichever queue it is linked into.
///
/// Idempotent: a node that is not linked (never registered, already woken,
/// or its queue dropped) is left alone.  On return the node's action is
/// guaranteed not to be running and not to run again, even against a
/// concurrent wake: actions are dispatched under the queue's list lock,
/// and removal takes that same lock.
pub fn unregister(node: &Arc<WaitNode>) {
    // Snapshot the backref without holding the node lock across the
    // queue-lock acquisition; lock order is always queue then node.
    let queue = match &*node.linked.lock() {
        Some(queue) => queue.clone(),
        None => return,
    };
    let queue = match queue.upgrade() {
        Some(queue) => queue,
        None => {
            // Queue is gone, so the node cannot be linked anymore.
            *node.linked.lock() = None;
            return;
        }
    };

    let mut waiters = queue.waiters.lock();
    let mut linked = node.linked.lock();
    match &*linked {
        Some(current) if core::ptr::eq(current.as_ptr(), Arc::as_ptr(&queue)) => {}
        // A wake dispatched this node (and possibly some other owner
        // relinked it elsewhere) before we took the queue lock.
        _ => return,
    }
    waiters.retain(|entry| !Arc::ptr_eq(entry, node));
    *linked = None;
}
