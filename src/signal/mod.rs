//! A multicast signal whose listeners each run on their own task queue.
//!
//! Connecting a callback pins it to a queue: every emission is packaged into
//! a task and sent there, so the callback always runs on that queue's
//! servicing thread. Emissions from the servicing thread itself short-circuit
//! and invoke the callback inline.

use crate::queue::sealed::QueueRef;
use crate::queue::task::Task;
use crate::queue::{QueueCore, TaskQueue};
use parking_lot::Mutex;
use smallvec::SmallVec;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

struct Slot<A> {
    id: u64,
    target: Weak<QueueCore>,
    callback: Arc<dyn Fn(A) + Send + Sync>,
}

struct SignalInner<A> {
    slots: Mutex<SmallVec<[Slot<A>; 4]>>,
    next_id: AtomicU64,
}

/// Type-erased view of a signal's slot list, so [`Connection`] does not need
/// the signal's argument type.
trait SlotRegistry: Send + Sync {
    fn remove(&self, id: u64) -> bool;
}

impl<A: Clone + Send + 'static> SlotRegistry for SignalInner<A> {
    fn remove(&self, id: u64) -> bool {
        let mut slots = self.slots.lock();
        let before = slots.len();
        slots.retain(|slot| slot.id != id);
        slots.len() != before
    }
}

/// A multicast emitter parameterised by its argument tuple.
///
/// Use `Signal<()>` for argument-less signals, a bare type for one argument
/// and a tuple for several. Arguments are captured by value per slot at emit
/// time, so listeners see a consistent snapshot.
pub struct Signal<A: Clone + Send + 'static> {
    inner: Arc<SignalInner<A>>,
}

impl<A: Clone + Send + 'static> Default for Signal<A> {
    fn default() -> Self {
        Self::new()
    }
}

impl<A: Clone + Send + 'static> Signal<A> {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(SignalInner {
                slots: Mutex::new(SmallVec::new()),
                next_id: AtomicU64::new(0),
            }),
        }
    }

    /// Connects `callback` to this signal, pinned to `queue`.
    ///
    /// The slot holds only a weak reference to the queue; if the queue goes
    /// away first, later emissions skip it. The returned [`Connection`]
    /// disconnects the slot when closed or dropped.
    pub fn connect<Q, F>(&self, queue: &Q, callback: F) -> Connection
    where
        Q: TaskQueue,
        F: Fn(A) + Send + Sync + 'static,
    {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        self.inner.slots.lock().push(Slot {
            id,
            target: Arc::downgrade(queue.core()),
            callback: Arc::new(callback),
        });

        let registry: Arc<dyn SlotRegistry> = self.inner.clone();
        Connection {
            registry: Some((Arc::downgrade(&registry), id)),
        }
    }

    /// Removes every slot. Outstanding [`Connection`]s become no-ops.
    pub fn disconnect_all(&self) {
        self.inner.slots.lock().clear();
    }

    /// Emits to every slot connected at this moment, in connection order.
    ///
    /// Slots on another thread's queue receive a task carrying a clone of
    /// `args`; slots whose queue is the caller's own servicing thread are
    /// invoked inline before this returns. A failing or vanished slot never
    /// prevents dispatch to the remaining ones.
    ///
    /// The slot list is locked for the whole fan-out, so an inline callback
    /// must not emit on the same signal again.
    pub fn emit(&self, args: A) {
        let slots = self.inner.slots.lock();
        for slot in slots.iter() {
            let Some(target) = slot.target.upgrade() else {
                tracing::warn!(slot = slot.id, "skipping slot, its host queue is gone");
                continue;
            };
            let callback = slot.callback.clone();
            let args = args.clone();
            if target.is_same_thread() {
                if std::panic::catch_unwind(AssertUnwindSafe(|| callback(args))).is_err() {
                    tracing::warn!(slot = slot.id, "slot callback panicked during inline dispatch");
                }
            } else if let Err(err) = target.enqueue(Task::plain(move || callback(args))) {
                tracing::warn!(slot = slot.id, %err, "dropping dispatch, host queue is shutting down");
            }
        }
    }
}

impl<A: Clone + Send + 'static> std::fmt::Debug for Signal<A> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Signal")
            .field("slots", &self.inner.slots.lock().len())
            .finish()
    }
}

/// Handle to one signal connection.
///
/// Move-only; closing (or dropping) it disconnects the slot. A connection
/// outliving its signal is harmless: it holds only a weak reference, so
/// `close` simply becomes a no-op.
pub struct Connection {
    registry: Option<(Weak<dyn SlotRegistry>, u64)>,
}

impl Connection {
    /// Disconnects the slot. Idempotent.
    pub fn close(&mut self) {
        if let Some((registry, id)) = self.registry.take() {
            if let Some(registry) = registry.upgrade() {
                registry.remove(id);
            }
        }
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.close();
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("is_closed", &self.registry.is_none())
            .finish()
    }
}
