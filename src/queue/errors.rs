/// Errors surfaced by the task-queue send operations.
#[derive(thiserror::Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueError {
    /// The queue is shutting down and no longer accepts tasks.
    #[error("task queue is not accepting tasks, its thread has been signalled to stop")]
    NotAccepting,

    /// A blocking send was attempted while no servicing thread is running,
    /// which would deadlock the caller.
    #[error("cannot run a blocking task, the servicing thread is not running")]
    NotRunning,

    /// The task backing a future was cancelled or dropped before it could
    /// produce a value.
    #[error("task was cancelled before it could complete its promise")]
    BrokenPromise,
}
