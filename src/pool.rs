//! A fixed-size bag of [`Thread`]s all running the same procedure.

use crate::thread::{Priority, Procedure, StopToken, Thread, ThreadError, ThreadProcedure};
use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::ThreadId;

/// A pool of identically configured worker threads.
///
/// Workers are named `{name}-{index}`. The pool can be started and stopped
/// repeatedly; `stop` only signals the workers, they are joined when the pool
/// is dropped or when the next `start` replaces them.
pub struct ThreadPool {
    name: String,
    priority: Priority,
    procedure: Procedure,
    workers: Mutex<Vec<Thread>>,
    started: AtomicBool,
}

impl ThreadPool {
    /// Creates a stopped pool of `size` workers. `procedure` may take a
    /// `&StopToken` or nothing at all.
    pub fn new<M>(
        name: impl Into<String>,
        size: usize,
        priority: Priority,
        procedure: impl ThreadProcedure<M>,
    ) -> Self {
        let name = name.into();
        let procedure: Procedure = {
            let procedure = Arc::new(procedure);
            Arc::new(move |stop: &StopToken| procedure.run(stop))
        };
        let workers = (0..size)
            .map(|i| make_worker(&name, i, priority, &procedure))
            .collect();
        Self {
            name,
            priority,
            procedure,
            workers: Mutex::new(workers),
            started: AtomicBool::new(false),
        }
    }

    /// Starts every worker, waiting until each procedure is actually
    /// executing so worker thread ids are known when this returns.
    pub fn start(&self) -> Result<(), ThreadError> {
        if self.started.swap(true, Ordering::AcqRel) {
            return Err(ThreadError::AlreadyStarted);
        }

        let mut workers = self.workers.lock();
        // Thread objects are one-shot; every start gets a fresh batch.
        let size = workers.len();
        *workers = (0..size)
            .map(|i| make_worker(&self.name, i, self.priority, &self.procedure))
            .collect();

        let tokens = workers
            .iter()
            .map(|worker| worker.start())
            .collect::<Result<Vec<_>, _>>()?;
        for token in &tokens {
            token.wait();
        }
        Ok(())
    }

    /// Signals every worker to stop. Non-blocking and idempotent.
    pub fn stop(&self) {
        if !self.started.swap(false, Ordering::AcqRel) {
            return;
        }
        for worker in self.workers.lock().iter() {
            worker.stop();
        }
    }

    /// Waits until every worker thread has exited.
    pub fn join(&self) {
        for worker in self.workers.lock().iter() {
            worker.join();
        }
    }

    /// Changes the worker count. Legal only while the pool is stopped.
    pub fn resize(&self, size: usize) -> Result<(), ThreadError> {
        if self.is_started() {
            return Err(ThreadError::AlreadyStarted);
        }
        let mut workers = self.workers.lock();
        if size < workers.len() {
            workers.truncate(size);
        } else {
            for i in workers.len()..size {
                workers.push(make_worker(&self.name, i, self.priority, &self.procedure));
            }
        }
        Ok(())
    }

    pub fn size(&self) -> usize {
        self.workers.lock().len()
    }

    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::Acquire)
    }

    /// True if `id` belongs to one of the pool's workers. O(N).
    pub fn is_thread_id_in_pool(&self, id: ThreadId) -> bool {
        self.workers.lock().iter().any(|w| w.id() == Some(id))
    }

    pub(crate) fn worker_ids(&self) -> Vec<ThreadId> {
        self.workers.lock().iter().filter_map(Thread::id).collect()
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

impl Drop for ThreadPool {
    fn drop(&mut self) {
        self.stop();
        // Dropping the workers joins them.
    }
}

impl std::fmt::Debug for ThreadPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ThreadPool")
            .field("name", &self.name)
            .field("size", &self.size())
            .field("is_started", &self.is_started())
            .finish()
    }
}

fn make_worker(name: &str, index: usize, priority: Priority, procedure: &Procedure) -> Thread {
    Thread::from_procedure(format!("{name}-{index}"), priority, procedure.clone())
}
