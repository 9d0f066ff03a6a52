//! The at-most-once task state machine and the handles sent back to callers.

use crate::queue::QueueError;
use parking_lot::{Condvar, Mutex};
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Weak};

/// Lifecycle of a queued task.
///
/// ```text
/// Queued ──execute──► Started ──run──► Executed (terminal)
/// Queued ──cancel───► Cancelled                 (terminal)
/// ```
///
/// Execute and cancel race through a compare-exchange on the state; the loser
/// becomes a no-op, so a task body runs at most once and a cancelled task
/// never runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub(crate) enum TaskState {
    Queued = 0,
    Started = 1,
    Executed = 2,
    Cancelled = 3,
}

#[derive(Debug)]
pub(crate) struct StateCell(AtomicU8);

impl StateCell {
    fn new() -> Self {
        Self(AtomicU8::new(TaskState::Queued as u8))
    }

    pub(crate) fn load(&self) -> TaskState {
        match self.0.load(Ordering::Acquire) {
            0 => TaskState::Queued,
            1 => TaskState::Started,
            2 => TaskState::Executed,
            _ => TaskState::Cancelled,
        }
    }

    fn try_transition(&self, from: TaskState, to: TaskState) -> bool {
        self.0
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    fn store(&self, state: TaskState) {
        self.0.store(state as u8, Ordering::Release);
    }
}

type Thunk = Box<dyn FnOnce() + Send>;

/// A callable plus its execution state.
///
/// The queue shares tasks behind `Arc`s (the delayed set, the ready FIFO and
/// the caller's handle may all point at one task), so the one-shot payloads
/// live behind mutexes and are taken by whichever of execute/cancel wins the
/// state race.
pub(crate) struct Task {
    state: Arc<StateCell>,
    execute_fn: Mutex<Option<Thunk>>,
    cancel_fn: Mutex<Option<Thunk>>,
}

impl Task {
    fn new(execute_fn: Thunk, cancel_fn: Option<Thunk>) -> Arc<Self> {
        Arc::new(Self {
            state: Arc::new(StateCell::new()),
            execute_fn: Mutex::new(Some(execute_fn)),
            cancel_fn: Mutex::new(cancel_fn),
        })
    }

    /// Wraps a fire-and-forget callable. A panic inside it is logged and
    /// discarded so it cannot kill the servicing thread.
    pub(crate) fn plain<F>(f: F) -> Arc<Self>
    where
        F: FnOnce() + Send + 'static,
    {
        Self::new(
            Box::new(move || {
                if std::panic::catch_unwind(AssertUnwindSafe(f)).is_err() {
                    tracing::warn!("task panicked, nobody is listening for the result");
                }
            }),
            None,
        )
    }

    pub(crate) fn execute(&self) {
        if !self.state.try_transition(TaskState::Queued, TaskState::Started) {
            // Already cancelled or executed.
            return;
        }
        let thunk = self.execute_fn.lock().take();
        if let Some(thunk) = thunk {
            thunk();
        }
        self.state.store(TaskState::Executed);
    }

    pub(crate) fn cancel(&self) {
        if !self
            .state
            .try_transition(TaskState::Queued, TaskState::Cancelled)
        {
            return;
        }
        // Release the captured callable eagerly; only the cancel payload runs.
        self.execute_fn.lock().take();
        let thunk = self.cancel_fn.lock().take();
        if let Some(thunk) = thunk {
            thunk();
        }
    }
}

impl Drop for Task {
    fn drop(&mut self) {
        // A task dropped while still queued (queue shutdown, cancel_all, a
        // sub-queue going away) counts as cancelled, which is what breaks the
        // promise of an abandoned async task.
        self.cancel();
    }
}

/// Handle to a queued task, returned from the delayed send.
///
/// Permits cancellation until the queue promotes and runs the task.
#[derive(Debug, Clone)]
pub struct TaskHandle {
    task: Weak<Task>,
    state: Arc<StateCell>,
}

impl TaskHandle {
    pub(crate) fn new(task: &Arc<Task>) -> Self {
        Self {
            task: Arc::downgrade(task),
            state: task.state.clone(),
        }
    }

    /// Cancels the task if it has not started executing yet.
    ///
    /// After this returns the task is either cancelled for good or had
    /// already started and will run to completion.
    pub fn cancel(&self) {
        if let Some(task) = self.task.upgrade() {
            task.cancel();
        }
    }

    /// True once the task body has run.
    pub fn is_executed(&self) -> bool {
        self.state.load() == TaskState::Executed
    }
}

enum PromiseState<R> {
    Pending,
    Fulfilled(R),
    Panicked(Box<dyn Any + Send>),
    Broken,
}

struct PromiseShared<R> {
    state: Mutex<PromiseState<R>>,
    cond: Condvar,
}

impl<R> PromiseShared<R> {
    fn new() -> Self {
        Self {
            state: Mutex::new(PromiseState::Pending),
            cond: Condvar::new(),
        }
    }

    /// First completion wins; later ones are dropped.
    fn complete(&self, outcome: PromiseState<R>) {
        let mut state = self.state.lock();
        if matches!(*state, PromiseState::Pending) {
            *state = outcome;
            self.cond.notify_all();
        }
    }
}

/// A [`TaskHandle`] that also carries the task's future return value.
pub struct TaskHandleWithFuture<R> {
    handle: TaskHandle,
    shared: Arc<PromiseShared<R>>,
}

impl<R> TaskHandleWithFuture<R> {
    /// Cancels the task if it has not started executing yet. The future then
    /// reports a broken promise.
    pub fn cancel(&self) {
        self.handle.cancel();
    }

    /// True once the task body has run.
    pub fn is_executed(&self) -> bool {
        self.handle.is_executed()
    }

    /// Blocks until the task completes and returns its result.
    ///
    /// Returns [`QueueError::BrokenPromise`] if the task was cancelled or
    /// abandoned before running. If the task body panicked, the panic is
    /// resumed on the caller.
    pub fn value(self) -> Result<R, QueueError> {
        let mut state = self.shared.state.lock();
        while matches!(*state, PromiseState::Pending) {
            self.shared.cond.wait(&mut state);
        }
        match std::mem::replace(&mut *state, PromiseState::Broken) {
            PromiseState::Fulfilled(value) => Ok(value),
            PromiseState::Panicked(payload) => {
                drop(state);
                std::panic::resume_unwind(payload)
            }
            PromiseState::Broken => Err(QueueError::BrokenPromise),
            PromiseState::Pending => unreachable!("waited out of the pending state"),
        }
    }
}

impl<R> std::fmt::Debug for TaskHandleWithFuture<R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskHandleWithFuture")
            .field("is_executed", &self.is_executed())
            .finish()
    }
}

/// Builds a promise-bearing task: the returned task fulfils the handle's
/// future with the callable's value or panic, and breaks it on cancellation.
pub(crate) fn promise_task<R, F>(f: F) -> (Arc<Task>, TaskHandleWithFuture<R>)
where
    R: Send + 'static,
    F: FnOnce() -> R + Send + 'static,
{
    let shared = Arc::new(PromiseShared::new());

    let on_execute = shared.clone();
    let execute_fn: Thunk = Box::new(move || {
        match std::panic::catch_unwind(AssertUnwindSafe(f)) {
            Ok(value) => on_execute.complete(PromiseState::Fulfilled(value)),
            Err(payload) => on_execute.complete(PromiseState::Panicked(payload)),
        }
    });

    let on_cancel = shared.clone();
    let cancel_fn: Thunk = Box::new(move || on_cancel.complete(PromiseState::Broken));

    let task = Task::new(execute_fn, Some(cancel_fn));
    let handle = TaskHandleWithFuture {
        handle: TaskHandle::new(&task),
        shared,
    };
    (task, handle)
}

#[cfg(test)]
mod tests {
    use super::*;
    use static_assertions::assert_impl_all;
    use std::sync::atomic::AtomicUsize;

    assert_impl_all!(TaskHandle: Send, Sync, Clone);
    assert_impl_all!(TaskHandleWithFuture<usize>: Send, Sync);

    #[test]
    fn test_task_executes_once() {
        let hits = Arc::new(AtomicUsize::new(0));
        let hits2 = hits.clone();
        let task = Task::plain(move || {
            hits2.fetch_add(1, Ordering::SeqCst);
        });

        task.execute();
        task.execute();
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert_eq!(task.state.load(), TaskState::Executed);
    }

    #[test]
    fn test_cancel_wins_over_execute() {
        let hits = Arc::new(AtomicUsize::new(0));
        let hits2 = hits.clone();
        let task = Task::plain(move || {
            hits2.fetch_add(1, Ordering::SeqCst);
        });

        task.cancel();
        task.execute();
        assert_eq!(hits.load(Ordering::SeqCst), 0);
        assert_eq!(task.state.load(), TaskState::Cancelled);
    }

    #[test]
    fn test_cancel_after_execute_is_noop() {
        let task = Task::plain(|| {});
        task.execute();
        task.cancel();
        assert_eq!(task.state.load(), TaskState::Executed);
    }

    #[test]
    fn test_handle_reports_outcome_after_task_is_gone() {
        let task = Task::plain(|| {});
        let handle = TaskHandle::new(&task);

        task.cancel();
        drop(task);
        assert!(!handle.is_executed());

        // Cancelling through a dead weak reference is a no-op.
        handle.cancel();
    }

    #[test]
    fn test_promise_task_fulfils() {
        let (task, handle) = promise_task(|| 42);
        task.execute();
        assert!(handle.is_executed());
        assert_eq!(handle.value(), Ok(42));
    }

    #[test]
    fn test_promise_task_breaks_on_cancel() {
        let (task, handle) = promise_task(|| 42);
        task.cancel();
        task.execute();
        assert_eq!(handle.value(), Err(QueueError::BrokenPromise));
    }

    #[test]
    fn test_promise_task_breaks_on_drop() {
        let (task, handle) = promise_task(|| 42);
        drop(task);
        assert_eq!(handle.value(), Err(QueueError::BrokenPromise));
    }

    #[test]
    fn test_promise_task_resumes_panic() {
        let (task, handle) = promise_task(|| -> usize { panic!("boom") });
        task.execute();

        let caught = std::panic::catch_unwind(AssertUnwindSafe(move || handle.value()));
        let payload = caught.expect_err("the task's panic must resurface");
        let message = payload
            .downcast_ref::<&str>()
            .copied()
            .expect("panic payload is a &str");
        assert_eq!(message, "boom");
    }
}
