//! Managed OS threads with a cooperative stop protocol.
//!
//! A [`Thread`] owns one native thread and runs a user procedure until the
//! procedure returns or observes its [`StopToken`]. [`ThisThread`] adopts the
//! calling thread instead of spawning one, which is how a run loop gets
//! installed on the main thread.

mod sys;

use parking_lot::{Condvar, Mutex};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::ThreadId;

/// Errors surfaced by thread and thread-pool lifecycle operations.
#[derive(thiserror::Error, Debug)]
pub enum ThreadError {
    /// Start was requested on a thread or pool that is already running.
    #[error("thread has already been started")]
    AlreadyStarted,

    /// The OS refused to spawn a native thread.
    #[error("failed to spawn native thread")]
    Spawn(#[from] std::io::Error),
}

/// Scheduling priority applied to a thread when it starts.
///
/// The mapping is platform specific and best effort; `Default` leaves the
/// scheduler untouched and `RealTime` requests the highest policy the process
/// is allowed to use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Priority {
    #[default]
    Default,
    Low,
    High,
    RealTime,
}

/// Cooperative-cancellation flag observed by a thread procedure.
///
/// Cloning yields another handle to the same flag.
#[derive(Debug, Clone, Default)]
pub struct StopToken {
    stopping: Arc<AtomicBool>,
}

impl StopToken {
    /// Returns true once the owning thread has been asked to stop.
    pub fn is_stopping(&self) -> bool {
        self.stopping.load(Ordering::Acquire)
    }

    pub(crate) fn notify_stop(&self) {
        self.stopping.store(true, Ordering::Release);
    }

    // Used when an adopted thread is started again after its procedure
    // returned.
    pub(crate) fn rearm(&self) {
        self.stopping.store(false, Ordering::Release);
    }
}

#[derive(Debug, Default)]
struct StartState {
    started: Mutex<bool>,
    cond: Condvar,
}

impl StartState {
    fn mark_started(&self) {
        let mut started = self.started.lock();
        *started = true;
        self.cond.notify_all();
    }
}

/// One-shot synchronisation for "the thread procedure has begun executing".
///
/// Returned from [`Thread::start`]; callers that need the procedure to be
/// live before continuing wait on it.
#[derive(Debug, Clone)]
pub struct StartToken {
    shared: Arc<StartState>,
}

impl StartToken {
    /// Blocks until the procedure has started executing.
    pub fn wait(&self) {
        let mut started = self.shared.started.lock();
        while !*started {
            self.shared.cond.wait(&mut started);
        }
    }

    pub fn is_started(&self) -> bool {
        *self.shared.started.lock()
    }
}

/// A thread procedure, with or without a stop-token parameter.
///
/// Both `Fn()` and `Fn(&StopToken)` closures are accepted; the marker type
/// parameter lets the two blanket impls coexist and is always inferred.
/// Procedures that ignore the token simply run to completion on their own.
pub trait ThreadProcedure<Marker>: Send + Sync + 'static {
    fn run(&self, stop: &StopToken);
}

/// Marker for procedures taking a [`StopToken`].
pub enum WithStopToken {}

/// Marker for procedures taking no arguments.
pub enum WithoutStopToken {}

impl<F> ThreadProcedure<WithStopToken> for F
where
    F: Fn(&StopToken) + Send + Sync + 'static,
{
    fn run(&self, stop: &StopToken) {
        self(stop)
    }
}

impl<F> ThreadProcedure<WithoutStopToken> for F
where
    F: Fn() + Send + Sync + 'static,
{
    fn run(&self, _stop: &StopToken) {
        self()
    }
}

pub(crate) type Procedure = Arc<dyn Fn(&StopToken) + Send + Sync + 'static>;

fn into_procedure<M>(procedure: impl ThreadProcedure<M>) -> Procedure {
    Arc::new(move |stop: &StopToken| procedure.run(stop))
}

/// A named OS thread with delayed start and cooperative stop.
///
/// The procedure runs until it returns; a panic inside it is caught and
/// logged so it cannot take the process down. Dropping a `Thread` stops and
/// joins it.
pub struct Thread {
    name: String,
    priority: Priority,
    procedure: Procedure,
    stop: StopToken,
    start_state: Arc<StartState>,
    running: Arc<AtomicBool>,
    launched: AtomicBool,
    handle: Mutex<Option<std::thread::JoinHandle<()>>>,
    id: Mutex<Option<ThreadId>>,
}

impl Thread {
    /// Creates an unstarted thread. `procedure` may take a `&StopToken` or
    /// nothing at all.
    pub fn new<M>(
        name: impl Into<String>,
        priority: Priority,
        procedure: impl ThreadProcedure<M>,
    ) -> Self {
        Self::from_procedure(name.into(), priority, into_procedure(procedure))
    }

    pub(crate) fn from_procedure(name: String, priority: Priority, procedure: Procedure) -> Self {
        Self {
            name,
            priority,
            procedure,
            stop: StopToken::default(),
            start_state: Arc::new(StartState::default()),
            running: Arc::new(AtomicBool::new(false)),
            launched: AtomicBool::new(false),
            handle: Mutex::new(None),
            id: Mutex::new(None),
        }
    }

    /// Spawns the native thread and begins the procedure.
    ///
    /// Returns a [`StartToken`] that completes as soon as the procedure is
    /// executing. Start is legal exactly once per `Thread`; a failed spawn
    /// leaves the thread unstarted so the call may be retried.
    pub fn start(&self) -> Result<StartToken, ThreadError> {
        if self.launched.swap(true, Ordering::AcqRel) {
            return Err(ThreadError::AlreadyStarted);
        }
        self.running.store(true, Ordering::Release);

        let name = self.name.clone();
        let priority = self.priority;
        let procedure = self.procedure.clone();
        let stop = self.stop.clone();
        let start_state = self.start_state.clone();
        let running = self.running.clone();

        let handle = std::thread::Builder::new()
            .name(self.name.clone())
            .spawn(move || {
                sys::set_current_thread_name(&name);
                sys::set_current_thread_priority(priority);
                start_state.mark_started();
                let result = std::panic::catch_unwind(AssertUnwindSafe(|| procedure(&stop)));
                if result.is_err() {
                    tracing::warn!(thread = %name, "thread procedure panicked");
                }
                running.store(false, Ordering::Release);
            })
            .map_err(|err| {
                // No thread was created; leave the object unstarted so the
                // caller can retry once the OS recovers.
                self.running.store(false, Ordering::Release);
                self.launched.store(false, Ordering::Release);
                ThreadError::Spawn(err)
            })?;

        *self.id.lock() = Some(handle.thread().id());
        *self.handle.lock() = Some(handle);
        Ok(StartToken {
            shared: self.start_state.clone(),
        })
    }

    /// Signals the procedure to stop. Non-blocking and idempotent.
    pub fn stop(&self) {
        if self.is_started() {
            self.stop.notify_stop();
        }
    }

    /// Waits until the OS thread has exited. No-op if never started.
    pub fn join(&self) {
        let handle = self.handle.lock().take();
        if let Some(handle) = handle {
            // The procedure's panic was already caught; a join error here
            // means the runtime itself unwound and there is nothing to do.
            let _ = handle.join();
        }
    }

    /// The OS thread id, available once started.
    pub fn id(&self) -> Option<ThreadId> {
        *self.id.lock()
    }

    /// True from `start()` until the procedure returns.
    pub fn is_started(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    pub fn is_stopping(&self) -> bool {
        self.stop.is_stopping()
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn priority(&self) -> Priority {
        self.priority
    }
}

impl PartialEq for Thread {
    fn eq(&self, other: &Self) -> bool {
        self.id() == other.id()
    }
}

impl Eq for Thread {}

impl Drop for Thread {
    fn drop(&mut self) {
        self.stop();
        self.join();
    }
}

impl std::fmt::Debug for Thread {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Thread")
            .field("name", &self.name)
            .field("id", &self.id())
            .field("is_started", &self.is_started())
            .finish()
    }
}

pub(crate) struct ThisThreadInner {
    id: ThreadId,
    procedure: Mutex<Option<Procedure>>,
    stop: StopToken,
    running: AtomicBool,
}

impl ThisThreadInner {
    pub(crate) fn stop(&self) {
        if self.is_started() {
            self.stop.notify_stop();
        }
    }

    pub(crate) fn is_started(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }
}

/// A [`Thread`]-like object that adopts the calling thread.
///
/// `start()` runs the installed procedure inline and therefore blocks until
/// the procedure returns. Unlike [`Thread`], it can be started again after
/// that: the stop token is re-armed on every start. Clones are handles to the
/// same adopted thread, which is how a task running elsewhere can stop a run
/// loop hosted on the main thread.
#[derive(Clone)]
pub struct ThisThread {
    inner: Arc<ThisThreadInner>,
}

impl std::fmt::Debug for ThisThread {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ThisThread")
            .field("id", &self.inner.id)
            .field("is_started", &self.is_started())
            .finish()
    }
}

impl Default for ThisThread {
    fn default() -> Self {
        Self::new()
    }
}

impl ThisThread {
    /// Adopts the calling thread.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(ThisThreadInner {
                id: std::thread::current().id(),
                procedure: Mutex::new(None),
                stop: StopToken::default(),
                running: AtomicBool::new(false),
            }),
        }
    }

    /// Installs the procedure to run on [`start`](Self::start).
    ///
    /// Fails with [`ThreadError::AlreadyStarted`] while the procedure is
    /// executing.
    pub fn set_procedure<M>(&self, procedure: impl ThreadProcedure<M>) -> Result<(), ThreadError> {
        if self.is_started() {
            return Err(ThreadError::AlreadyStarted);
        }
        *self.inner.procedure.lock() = Some(into_procedure(procedure));
        Ok(())
    }

    /// Runs the installed procedure on the calling thread, blocking until it
    /// returns. Does nothing if no procedure was installed.
    pub fn start(&self) -> Result<(), ThreadError> {
        if self.inner.running.swap(true, Ordering::AcqRel) {
            return Err(ThreadError::AlreadyStarted);
        }
        self.inner.stop.rearm();
        let procedure = self.inner.procedure.lock().clone();
        if let Some(procedure) = procedure {
            let result =
                std::panic::catch_unwind(AssertUnwindSafe(|| procedure(&self.inner.stop)));
            if result.is_err() {
                tracing::warn!("adopted thread procedure panicked");
            }
        }
        self.inner.running.store(false, Ordering::Release);
        Ok(())
    }

    /// Signals the running procedure to stop. Non-blocking and idempotent.
    pub fn stop(&self) {
        self.inner.stop();
    }

    /// The id of the adopted thread.
    pub fn id(&self) -> ThreadId {
        self.inner.id
    }

    pub fn is_started(&self) -> bool {
        self.inner.is_started()
    }

    pub fn is_stopping(&self) -> bool {
        self.inner.stop.is_stopping()
    }

    pub(crate) fn inner_handle(&self) -> Arc<ThisThreadInner> {
        self.inner.clone()
    }
}
