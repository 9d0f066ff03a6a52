//! Task queues: ordered (serial) and pooled (parallel) dispatch of immediate,
//! delayed, async and blocking work, with hierarchical sub-queues.
//!
//! Every queue is serviced by a thread (or pool of threads) draining one
//! shared core. The core owns the ready FIFO, the deadline-ordered delayed
//! set and the list of child sub-queues; the servicing loop promotes expired
//! delayed tasks, takes one task at a time and executes it outside all locks.

mod errors;
pub use errors::QueueError;

pub(crate) mod task;
pub use task::{TaskHandle, TaskHandleWithFuture};
use task::{Task, promise_task};

#[cfg(test)]
mod tests;

use crate::pool::ThreadPool;
use crate::thread::{Priority, StopToken, ThisThread, ThisThreadInner, Thread, ThreadError};
use parking_lot::{Condvar, Mutex};
use smallvec::SmallVec;
use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::thread::ThreadId;
use std::time::{Duration, Instant};

/// Which thread(s) service a queue, shared between a queue and its
/// sub-queues. `running` distinguishes "the drain loop is live" from
/// "the queue still accepts tasks", which is what the blocking sends need
/// to refuse a guaranteed deadlock.
pub(crate) struct ServicingState {
    ids: Mutex<SmallVec<[ThreadId; 4]>>,
    running: AtomicBool,
}

impl ServicingState {
    fn new() -> Self {
        Self {
            ids: Mutex::new(SmallVec::new()),
            running: AtomicBool::new(false),
        }
    }

    fn set_single(&self, id: ThreadId) {
        let mut ids = self.ids.lock();
        ids.clear();
        ids.push(id);
    }

    fn set_pool(&self, pool_ids: Vec<ThreadId>) {
        *self.ids.lock() = SmallVec::from_vec(pool_ids);
    }

    fn is_current(&self) -> bool {
        self.ids.lock().contains(&std::thread::current().id())
    }

    fn set_running(&self, running: bool) {
        self.running.store(running, Ordering::Release);
    }

    fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }
}

/// Condvar with a woken flag, so a notification that lands between the
/// drain loop's empty poll and its wait is not lost.
pub(crate) struct WaitSignal {
    woken: Mutex<bool>,
    cond: Condvar,
}

impl WaitSignal {
    fn new() -> Self {
        Self {
            woken: Mutex::new(false),
            cond: Condvar::new(),
        }
    }

    fn notify_one(&self) {
        let mut woken = self.woken.lock();
        *woken = true;
        self.cond.notify_one();
    }

    fn notify_all(&self) {
        let mut woken = self.woken.lock();
        *woken = true;
        self.cond.notify_all();
    }

    // Spurious wakeups are fine, the drain loop re-examines its queues on
    // every iteration.
    fn wait(&self) {
        let mut woken = self.woken.lock();
        if !*woken {
            self.cond.wait(&mut woken);
        }
        *woken = false;
    }

    fn wait_until(&self, deadline: Instant) {
        let mut woken = self.woken.lock();
        if !*woken {
            let _ = self.cond.wait_until(&mut woken, deadline);
        }
        *woken = false;
    }
}

type NotifyFn = Box<dyn Fn() + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
struct DelayedKey {
    deadline: Instant,
    seq: u64,
}

#[derive(Default)]
struct CoreInner {
    ready: VecDeque<Arc<Task>>,
    delayed: BTreeMap<DelayedKey, Arc<Task>>,
    children: SmallVec<[Weak<QueueCore>; 2]>,
    delayed_seq: u64,
}

/// The shared state behind every queue type: ready FIFO, delayed set,
/// sub-queue list and the notify callback that wakes the servicing loop.
///
/// Locking discipline: the inner mutex is held only for pop/push bookkeeping,
/// never across user code, and the notify callback is invoked only after the
/// inner lock has been released. The callback lives under its own mutex so a
/// parent queue can sever it while a notification is in flight.
pub(crate) struct QueueCore {
    inner: Mutex<CoreInner>,
    notify: Mutex<Option<NotifyFn>>,
    accepts: AtomicBool,
    servicing: Arc<ServicingState>,
}

impl QueueCore {
    fn new(servicing: Arc<ServicingState>, notify: Option<NotifyFn>) -> Arc<Self> {
        Arc::new(Self {
            inner: Mutex::new(CoreInner::default()),
            notify: Mutex::new(notify),
            accepts: AtomicBool::new(true),
            servicing,
        })
    }

    pub(crate) fn accepts_tasks(&self) -> bool {
        self.accepts.load(Ordering::Acquire)
    }

    pub(crate) fn is_same_thread(&self) -> bool {
        self.servicing.is_current()
    }

    pub(crate) fn is_running(&self) -> bool {
        self.servicing.is_running()
    }

    pub(crate) fn enqueue(&self, task: Arc<Task>) -> Result<(), QueueError> {
        if !self.accepts_tasks() {
            return Err(QueueError::NotAccepting);
        }
        self.inner.lock().ready.push_back(task);
        self.notify_change();
        Ok(())
    }

    fn enqueue_delayed(&self, task: Arc<Task>, delay: Duration) -> Result<(), QueueError> {
        if !self.accepts_tasks() {
            return Err(QueueError::NotAccepting);
        }
        {
            let mut inner = self.inner.lock();
            inner.delayed_seq += 1;
            let key = DelayedKey {
                deadline: Instant::now() + delay,
                seq: inner.delayed_seq,
            };
            inner.delayed.insert(key, task);
        }
        self.notify_change();
        Ok(())
    }

    /// Moves every delayed task whose deadline has passed into the ready
    /// FIFO, recursing into sub-queues. Returns the closest remaining
    /// deadline across the whole tree, or `now` if there is none.
    fn promote_delayed(&self, now: Instant) -> Instant {
        let mut next = now;
        {
            let mut inner = self.inner.lock();
            while let Some((key, task)) = inner.delayed.pop_first() {
                if key.deadline < now {
                    inner.ready.push_back(task);
                } else {
                    next = key.deadline;
                    inner.delayed.insert(key, task);
                    break;
                }
            }
        }
        for child in self.live_children() {
            let child_next = child.promote_delayed(now);
            if child_next != now && (child_next < next || next == now) {
                next = child_next;
            }
        }
        next
    }

    /// Pops one ready task: the own FIFO first, then each sub-queue in
    /// creation order. Creation-order traversal is deliberate; siblings are
    /// not scheduled round-robin.
    fn acquire_next(&self) -> Option<Arc<Task>> {
        if let Some(task) = self.inner.lock().ready.pop_front() {
            return Some(task);
        }
        for child in self.live_children() {
            if let Some(task) = child.acquire_next() {
                return Some(task);
            }
        }
        None
    }

    pub(crate) fn cancel_all(&self) {
        let (ready, delayed) = {
            let mut inner = self.inner.lock();
            (
                std::mem::take(&mut inner.ready),
                std::mem::take(&mut inner.delayed),
            )
        };
        // Dropping the tasks outside the lock cancels them and breaks any
        // promises.
        drop(ready);
        drop(delayed);
        for child in self.live_children() {
            child.cancel_all();
        }
    }

    fn set_accepts(&self, accepts: bool) {
        self.accepts.store(accepts, Ordering::Release);
        for child in self.live_children() {
            child.set_accepts(accepts);
        }
    }

    fn create_child(self: &Arc<Self>) -> Arc<QueueCore> {
        let parent = Arc::downgrade(self);
        let notify: NotifyFn = Box::new(move || {
            if let Some(parent) = parent.upgrade() {
                parent.notify_change();
            }
        });
        let child = QueueCore::new(self.servicing.clone(), Some(notify));
        child.accepts.store(self.accepts_tasks(), Ordering::Release);
        self.inner.lock().children.push(Arc::downgrade(&child));
        child
    }

    fn live_children(&self) -> SmallVec<[Arc<QueueCore>; 2]> {
        self.inner
            .lock()
            .children
            .iter()
            .filter_map(Weak::upgrade)
            .collect()
    }

    fn clear_dead_children(&self) {
        self.inner
            .lock()
            .children
            .retain(|child| child.strong_count() > 0);
        for child in self.live_children() {
            child.clear_dead_children();
        }
    }

    /// Severs the notify callbacks of the immediate children, so nothing
    /// calls back into a queue that is being torn down.
    fn release_children(&self) {
        for child in self.live_children() {
            child.sever_notify();
        }
    }

    fn sever_notify(&self) {
        *self.notify.lock() = None;
    }

    fn notify_change(&self) {
        let notify = self.notify.lock();
        if let Some(notify) = notify.as_ref() {
            notify();
        }
    }
}

/// The servicing loop shared by serial queues and every parallel worker.
fn run_loop(core: &Arc<QueueCore>, wait: &WaitSignal, stop: &StopToken) {
    core.servicing.set_running(true);
    tracing::trace!("task queue servicing loop started");

    while !stop.is_stopping() {
        let now = Instant::now();
        let next_deadline = core.promote_delayed(now);
        if let Some(task) = core.acquire_next() {
            task.execute();
        } else if next_deadline != now {
            // Nothing ready, but a delayed task is due later: sleep until
            // its deadline.
            wait.wait_until(next_deadline);
        } else if core.accepts_tasks() {
            wait.wait();
        }
        core.clear_dead_children();
    }

    core.set_accepts(false);
    // Run the leftovers. Delayed tasks whose deadline never arrived are
    // implicitly cancelled when the core drops them.
    while let Some(task) = core.acquire_next() {
        task.execute();
    }
    core.servicing.set_running(false);
    tracing::trace!("task queue servicing loop stopped");
}

pub(crate) mod sealed {
    use super::QueueCore;
    use std::sync::Arc;

    /// Access to the shared queue core; implementing this seals
    /// [`TaskQueue`](super::TaskQueue).
    pub trait QueueRef: Send + Sync {
        fn core(&self) -> &Arc<QueueCore>;
    }
}

/// The send surface common to [`SerialTaskQueue`], [`ParallelTaskQueue`] and
/// [`SubQueue`].
///
/// All operations are thread-safe. Tasks are executed on the queue's
/// servicing thread; on a serial queue immediate tasks run in send order.
pub trait TaskQueue: sealed::QueueRef {
    /// Enqueues a task for eventual execution on the servicing thread.
    ///
    /// A panic inside the task is caught and logged, never propagated.
    fn send<F>(&self, task: F) -> Result<(), QueueError>
    where
        F: FnOnce() + Send + 'static,
    {
        self.core().enqueue(Task::plain(task))
    }

    /// Enqueues a task to run no earlier than `delay` from now.
    ///
    /// The returned handle can cancel the task until the queue promotes it
    /// into the ready FIFO and starts it.
    fn send_delayed<F>(&self, task: F, delay: Duration) -> Result<TaskHandle, QueueError>
    where
        F: FnOnce() + Send + 'static,
    {
        let task = Task::plain(task);
        let handle = TaskHandle::new(&task);
        self.core().enqueue_delayed(task, delay)?;
        Ok(handle)
    }

    /// Enqueues a task and returns a handle carrying its future result.
    ///
    /// When called from the queue's own servicing thread the task runs
    /// inline instead of being enqueued, so a nested blocking send cannot
    /// deadlock.
    fn send_async<R, F>(&self, task: F) -> Result<TaskHandleWithFuture<R>, QueueError>
    where
        R: Send + 'static,
        F: FnOnce() -> R + Send + 'static,
    {
        let core = self.core();
        if !core.accepts_tasks() {
            return Err(QueueError::NotAccepting);
        }
        let (task, handle) = promise_task(task);
        if core.is_same_thread() {
            task.execute();
        } else {
            core.enqueue(task)?;
        }
        Ok(handle)
    }

    /// Runs a task on the servicing thread and blocks for its result.
    ///
    /// Fails with [`QueueError::NotRunning`] while no servicing thread is
    /// draining the queue, since waiting would deadlock the caller.
    fn send_sync<R, F>(&self, task: F) -> Result<R, QueueError>
    where
        R: Send + 'static,
        F: FnOnce() -> R + Send + 'static,
    {
        let core = self.core();
        if !core.accepts_tasks() {
            return Err(QueueError::NotAccepting);
        }
        if !core.is_running() {
            return Err(QueueError::NotRunning);
        }
        self.send_async(task)?.value()
    }

    /// Runs a task on the servicing thread and waits for it to finish.
    fn send_wait<F>(&self, task: F) -> Result<(), QueueError>
    where
        F: FnOnce() + Send + 'static,
    {
        self.send_sync(task)
    }

    /// Creates a child queue serviced by this queue's thread.
    ///
    /// The child shares the parent's accepts-tasks state and wakes the
    /// parent's loop on every change. Dropping the handle discards the
    /// child's pending tasks.
    fn create_sub_queue(&self) -> SubQueue {
        SubQueue {
            core: self.core().create_child(),
        }
    }

    /// Discards all pending tasks, delayed tasks and the contents of live
    /// sub-queues. Promises of discarded async tasks are broken.
    fn cancel_all(&self) {
        self.core().cancel_all();
    }

    /// True if the caller is on the queue's servicing thread.
    fn is_same_thread(&self) -> bool {
        self.core().is_same_thread()
    }

    /// False once the queue has begun shutting down.
    fn accepts_tasks(&self) -> bool {
        self.core().accepts_tasks()
    }
}

impl<T: sealed::QueueRef> TaskQueue for T {}

enum Backing {
    Owned(Thread),
    Adopted(Arc<ThisThreadInner>),
}

/// A task queue drained strictly in order by a single thread.
///
/// [`SerialTaskQueue::new`] spawns and owns a thread named after the queue;
/// [`SerialTaskQueue::with_this_thread`] installs the drain loop on an
/// adopted thread instead, and the queue only runs once that thread is
/// started. Dropping the queue stops the loop; tasks already in the ready
/// FIFO still run, pending delayed tasks are cancelled.
pub struct SerialTaskQueue {
    core: Arc<QueueCore>,
    wait: Arc<WaitSignal>,
    backing: Backing,
}

impl SerialTaskQueue {
    /// Creates a queue with its own servicing thread.
    pub fn new(name: &str) -> Result<Self, ThreadError> {
        let (core, wait) = make_core_and_signal();

        let loop_core = core.clone();
        let loop_wait = wait.clone();
        let thread = Thread::new(name, Priority::Default, move |stop: &StopToken| {
            run_loop(&loop_core, &loop_wait, stop)
        });
        thread.start()?;
        if let Some(id) = thread.id() {
            core.servicing.set_single(id);
        }
        // The loop will run; let blocking sends through right away.
        core.servicing.set_running(true);

        Ok(Self {
            core,
            wait,
            backing: Backing::Owned(thread),
        })
    }

    /// Creates a queue serviced by an adopted thread.
    ///
    /// The drain loop is installed as the thread's procedure; the caller
    /// decides when to block that thread by starting it.
    pub fn with_this_thread(thread: &ThisThread) -> Result<Self, ThreadError> {
        let (core, wait) = make_core_and_signal();

        let loop_core = core.clone();
        let loop_wait = wait.clone();
        thread.set_procedure(move |stop: &StopToken| run_loop(&loop_core, &loop_wait, stop))?;
        core.servicing.set_single(thread.id());

        Ok(Self {
            core,
            wait,
            backing: Backing::Adopted(thread.inner_handle()),
        })
    }
}

impl sealed::QueueRef for SerialTaskQueue {
    fn core(&self) -> &Arc<QueueCore> {
        &self.core
    }
}

impl Drop for SerialTaskQueue {
    fn drop(&mut self) {
        self.core.set_accepts(false);
        self.core.release_children();
        match &self.backing {
            Backing::Owned(thread) => thread.stop(),
            Backing::Adopted(thread) => thread.stop(),
        }
        self.wait.notify_all();
        // An owned thread is joined when it drops with the queue.
    }
}

impl std::fmt::Debug for SerialTaskQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SerialTaskQueue")
            .field("accepts_tasks", &self.core.accepts_tasks())
            .finish()
    }
}

/// A task queue drained concurrently by a pool of worker threads.
///
/// There is no ordering guarantee between tasks; that is the only reason to
/// choose a parallel queue over a serial one. `is_same_thread` is true on
/// any of the pool's workers.
pub struct ParallelTaskQueue {
    core: Arc<QueueCore>,
    wait: Arc<WaitSignal>,
    pool: ThreadPool,
}

impl ParallelTaskQueue {
    /// Creates a queue drained by `workers` threads named `{name}-{index}`.
    pub fn new(name: &str, workers: usize) -> Result<Self, ThreadError> {
        assert!(workers > 0, "a parallel queue needs at least one worker");
        let (core, wait) = make_core_and_signal();

        let loop_core = core.clone();
        let loop_wait = wait.clone();
        let pool = ThreadPool::new(name, workers, Priority::Default, move |stop: &StopToken| {
            run_loop(&loop_core, &loop_wait, stop)
        });
        pool.start()?;
        core.servicing.set_pool(pool.worker_ids());
        core.servicing.set_running(true);

        Ok(Self { core, wait, pool })
    }

    /// The number of worker threads draining this queue.
    pub fn concurrency(&self) -> usize {
        self.pool.size()
    }
}

impl sealed::QueueRef for ParallelTaskQueue {
    fn core(&self) -> &Arc<QueueCore> {
        &self.core
    }
}

impl Drop for ParallelTaskQueue {
    fn drop(&mut self) {
        self.core.set_accepts(false);
        self.core.release_children();
        self.pool.stop();
        self.wait.notify_all();
        // The pool joins its workers when it drops with the queue.
    }
}

impl std::fmt::Debug for ParallelTaskQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ParallelTaskQueue")
            .field("concurrency", &self.concurrency())
            .field("accepts_tasks", &self.core.accepts_tasks())
            .finish()
    }
}

/// An owned handle to a child queue created with
/// [`TaskQueue::create_sub_queue`].
///
/// Shares the parent's servicing thread and accepts-tasks state. Dropping
/// the handle detaches the child: the parent purges it on its next loop
/// iteration and its pending tasks are cancelled.
pub struct SubQueue {
    core: Arc<QueueCore>,
}

impl sealed::QueueRef for SubQueue {
    fn core(&self) -> &Arc<QueueCore> {
        &self.core
    }
}

impl Drop for SubQueue {
    fn drop(&mut self) {
        self.core.set_accepts(false);
        self.core.release_children();
        // Wake the parent loop so it notices the dead child.
        self.core.notify_change();
    }
}

impl std::fmt::Debug for SubQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubQueue")
            .field("accepts_tasks", &self.core.accepts_tasks())
            .finish()
    }
}

fn make_core_and_signal() -> (Arc<QueueCore>, Arc<WaitSignal>) {
    let wait = Arc::new(WaitSignal::new());
    let signal = wait.clone();
    let core = QueueCore::new(
        Arc::new(ServicingState::new()),
        Some(Box::new(move || signal.notify_one())),
    );
    (core, wait)
}
