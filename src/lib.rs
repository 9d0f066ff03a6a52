//! Managed threads, serial and pooled task queues, and thread-pinned
//! signal/slot dispatch.

pub mod thread;
pub use thread::{Priority, StartToken, StopToken, ThisThread, Thread, ThreadError};

pub mod pool;
pub use pool::ThreadPool;

pub mod queue;
pub use queue::{
    ParallelTaskQueue, QueueError, SerialTaskQueue, SubQueue, TaskHandle, TaskHandleWithFuture,
    TaskQueue,
};

pub mod signal;
pub use signal::{Connection, Signal};

#[cfg(test)]
pub(crate) mod test_utils;
