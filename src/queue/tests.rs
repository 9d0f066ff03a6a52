use super::*;
use crate::test_utils::wait_for;
use anyhow::Result;
use static_assertions::assert_impl_all;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::AtomicUsize;

assert_impl_all!(SerialTaskQueue: Send, Sync);
assert_impl_all!(ParallelTaskQueue: Send, Sync);
assert_impl_all!(SubQueue: Send, Sync);

const LONG_WAIT: Duration = Duration::from_secs(5);

/// Blocks the servicing thread until the returned closure is invoked.
fn gate(queue: &impl TaskQueue) -> Result<impl FnOnce()> {
    let release = Arc::new(AtomicBool::new(false));
    let entered = Arc::new(AtomicBool::new(false));
    let release2 = release.clone();
    let entered2 = entered.clone();
    queue.send(move || {
        entered2.store(true, Ordering::SeqCst);
        while !release2.load(Ordering::SeqCst) {
            std::thread::sleep(Duration::from_millis(1));
        }
    })?;
    assert!(wait_for(|| entered.load(Ordering::SeqCst), LONG_WAIT));
    Ok(move || release.store(true, Ordering::SeqCst))
}

#[test]
fn test_send_sync_returns_value() -> Result<()> {
    let queue = SerialTaskQueue::new("queue")?;
    assert_eq!(queue.send_sync(|| 42)?, 42);
    Ok(())
}

#[test]
fn test_tasks_run_on_the_servicing_thread() -> Result<()> {
    let queue = SerialTaskQueue::new("queue")?;
    let first = queue.send_sync(|| std::thread::current().id())?;
    let second = queue.send_sync(|| std::thread::current().id())?;

    assert_ne!(first, std::thread::current().id());
    assert_eq!(first, second);
    Ok(())
}

#[test]
fn test_serial_queue_preserves_send_order() -> Result<()> {
    let queue = SerialTaskQueue::new("queue")?;
    let seen = Arc::new(Mutex::new(Vec::new()));

    for i in 0..100 {
        let seen = seen.clone();
        queue.send(move || seen.lock().push(i))?;
    }
    queue.send_wait(|| {})?;

    assert_eq!(*seen.lock(), (0..100).collect::<Vec<_>>());
    Ok(())
}

#[test]
fn test_delayed_task_never_runs_early() -> Result<()> {
    let queue = SerialTaskQueue::new("queue")?;
    let delay = Duration::from_millis(100);
    let executed_at = Arc::new(Mutex::new(None));

    let executed_at2 = executed_at.clone();
    let sent_at = Instant::now();
    let handle = queue.send_delayed(move || *executed_at2.lock() = Some(Instant::now()), delay)?;

    assert!(wait_for(|| handle.is_executed(), LONG_WAIT));
    let executed_at = executed_at.lock().expect("task recorded its run time");
    assert!(executed_at.duration_since(sent_at) >= delay);
    Ok(())
}

#[test]
fn test_delayed_task_cancelled_before_promotion_never_runs() -> Result<()> {
    let queue = SerialTaskQueue::new("queue")?;
    let hits = Arc::new(AtomicUsize::new(0));

    let hits2 = hits.clone();
    let handle = queue.send_delayed(
        move || {
            hits2.fetch_add(1, Ordering::SeqCst);
        },
        Duration::from_millis(150),
    )?;
    handle.cancel();

    std::thread::sleep(Duration::from_millis(400));
    queue.send_wait(|| {})?;
    assert_eq!(hits.load(Ordering::SeqCst), 0);
    assert!(!handle.is_executed());
    Ok(())
}

#[test]
fn test_delayed_tasks_run_in_deadline_order() -> Result<()> {
    let queue = SerialTaskQueue::new("queue")?;
    let seen = Arc::new(Mutex::new(Vec::new()));

    let seen_late = seen.clone();
    let late = queue.send_delayed(move || seen_late.lock().push(2), Duration::from_millis(120))?;
    let seen_early = seen.clone();
    queue.send_delayed(move || seen_early.lock().push(1), Duration::from_millis(40))?;

    assert!(wait_for(|| late.is_executed(), LONG_WAIT));
    assert_eq!(*seen.lock(), vec![1, 2]);
    Ok(())
}

#[test]
fn test_cancel_after_start_lets_the_task_finish() -> Result<()> {
    let queue = SerialTaskQueue::new("queue")?;
    let entered = Arc::new(AtomicBool::new(false));
    let release = Arc::new(AtomicBool::new(false));

    let entered2 = entered.clone();
    let release2 = release.clone();
    let handle = queue.send_delayed(
        move || {
            entered2.store(true, Ordering::SeqCst);
            while !release2.load(Ordering::SeqCst) {
                std::thread::sleep(Duration::from_millis(1));
            }
        },
        Duration::from_millis(1),
    )?;

    assert!(wait_for(|| entered.load(Ordering::SeqCst), LONG_WAIT));
    // The task already started; cancelling now is a no-op.
    handle.cancel();
    release.store(true, Ordering::SeqCst);

    assert!(wait_for(|| handle.is_executed(), LONG_WAIT));
    Ok(())
}

#[test]
fn test_blocking_send_from_the_servicing_thread_is_reentrant() -> Result<()> {
    let queue = Arc::new(SerialTaskQueue::new("queue")?);
    let inner_queue = queue.clone();

    let result = queue.send_sync(move || {
        let nested = inner_queue.send_sync(|| 7).expect("nested blocking send");
        nested + 1
    })?;
    assert_eq!(result, 8);
    Ok(())
}

#[test]
fn test_async_send_from_the_servicing_thread_runs_inline() -> Result<()> {
    let queue = Arc::new(SerialTaskQueue::new("queue")?);
    let inner_queue = queue.clone();

    let ran_inline = queue.send_sync(move || {
        let handle = inner_queue.send_async(|| 5).expect("nested async send");
        handle.is_executed() && handle.value() == Ok(5)
    })?;
    assert!(ran_inline);
    Ok(())
}

#[test]
fn test_shut_down_queue_rejects_tasks() -> Result<()> {
    let queue = SerialTaskQueue::new("queue")?;
    let sub = queue.create_sub_queue();
    drop(queue);

    assert_eq!(sub.send(|| {}), Err(QueueError::NotAccepting));
    assert_eq!(
        sub.send_delayed(|| {}, Duration::from_millis(1)).err(),
        Some(QueueError::NotAccepting)
    );
    assert!(!sub.accepts_tasks());
    Ok(())
}

#[test]
fn test_blocking_send_before_adopted_thread_starts_fails() -> Result<()> {
    let this = ThisThread::new();
    let queue = SerialTaskQueue::with_this_thread(&this)?;

    assert_eq!(queue.send_sync(|| 1), Err(QueueError::NotRunning));
    assert_eq!(queue.send_wait(|| {}), Err(QueueError::NotRunning));
    // Non-blocking sends are fine, they run once the thread starts.
    queue.send(|| {})?;
    Ok(())
}

#[test]
fn test_adopted_thread_runs_the_queue_until_stopped() -> Result<()> {
    let this = ThisThread::new();
    let queue = SerialTaskQueue::with_this_thread(&this)?;
    let hits = Arc::new(AtomicUsize::new(0));

    let hits2 = hits.clone();
    queue.send(move || {
        hits2.fetch_add(1, Ordering::SeqCst);
    })?;

    let delay = Duration::from_millis(200);
    let stopper = this.clone();
    queue.send_delayed(move || stopper.stop(), delay)?;

    let started_at = Instant::now();
    this.start()?;
    let elapsed = started_at.elapsed();

    assert!(elapsed >= delay);
    assert!(elapsed < Duration::from_secs(2));
    assert_eq!(hits.load(Ordering::SeqCst), 1);
    Ok(())
}

#[test]
fn test_parallel_queue_runs_tasks_concurrently() -> Result<()> {
    let queue = ParallelTaskQueue::new("workers", 4)?;
    assert_eq!(queue.concurrency(), 4);

    let started_at = Instant::now();
    let handles = (0..4)
        .map(|_| {
            queue.send_async(|| {
                std::thread::sleep(Duration::from_millis(100));
                std::thread::current().id()
            })
        })
        .collect::<Result<Vec<_>, _>>()?;

    let mut worker_ids = std::collections::HashSet::new();
    for handle in handles {
        worker_ids.insert(handle.value()?);
    }
    let elapsed = started_at.elapsed();

    assert_eq!(worker_ids.len(), 4);
    assert!(elapsed < Duration::from_millis(350));
    Ok(())
}

#[test]
fn test_parallel_queue_same_thread_detection() -> Result<()> {
    let queue = Arc::new(ParallelTaskQueue::new("workers", 2)?);
    assert!(!queue.is_same_thread());

    let inner_queue = queue.clone();
    let on_worker = queue.send_sync(move || inner_queue.is_same_thread())?;
    assert!(on_worker);
    Ok(())
}

#[test]
fn test_sub_queue_shares_the_servicing_thread() -> Result<()> {
    let queue = SerialTaskQueue::new("queue")?;
    let sub = queue.create_sub_queue();

    let parent_thread = queue.send_sync(|| std::thread::current().id())?;
    let child_thread = sub.send_sync(|| std::thread::current().id())?;
    assert_eq!(parent_thread, child_thread);

    // Nested sub-queues keep the same servicing thread.
    let nested = sub.create_sub_queue();
    assert_eq!(nested.send_sync(|| std::thread::current().id())?, parent_thread);
    Ok(())
}

#[test]
fn test_sub_queue_delayed_task_wakes_the_parent_loop() -> Result<()> {
    let queue = SerialTaskQueue::new("queue")?;
    let sub = queue.create_sub_queue();

    let fired = Arc::new(AtomicBool::new(false));
    let fired2 = fired.clone();
    sub.send_delayed(
        move || fired2.store(true, Ordering::SeqCst),
        Duration::from_millis(50),
    )?;

    assert!(wait_for(|| fired.load(Ordering::SeqCst), LONG_WAIT));
    Ok(())
}

#[test]
fn test_parent_tasks_drain_before_sub_queue_tasks() -> Result<()> {
    let queue = SerialTaskQueue::new("queue")?;
    let sub = queue.create_sub_queue();
    let release = gate(&queue)?;

    let seen = Arc::new(Mutex::new(Vec::new()));
    let seen_child = seen.clone();
    sub.send(move || seen_child.lock().push("child"))?;
    let seen_parent = seen.clone();
    queue.send(move || seen_parent.lock().push("parent"))?;

    release();
    // The parent barrier drains before the child FIFO is touched.
    queue.send_wait(|| {})?;
    sub.send_wait(|| {})?;

    assert_eq!(*seen.lock(), vec!["parent", "child"]);
    Ok(())
}

#[test]
fn test_dropping_a_sub_queue_discards_its_tasks() -> Result<()> {
    let queue = SerialTaskQueue::new("queue")?;
    let sub = queue.create_sub_queue();
    let release = gate(&queue)?;

    let hits = Arc::new(AtomicUsize::new(0));
    let hits2 = hits.clone();
    sub.send(move || {
        hits2.fetch_add(1, Ordering::SeqCst);
    })?;
    let orphan = sub.send_async(|| 9)?;

    drop(sub);
    release();
    queue.send_wait(|| {})?;

    assert_eq!(hits.load(Ordering::SeqCst), 0);
    assert_eq!(orphan.value(), Err(QueueError::BrokenPromise));
    Ok(())
}

#[test]
fn test_cancel_all_discards_pending_work() -> Result<()> {
    let queue = SerialTaskQueue::new("queue")?;
    let release = gate(&queue)?;

    let hits = Arc::new(AtomicUsize::new(0));
    for _ in 0..2 {
        let hits = hits.clone();
        queue.send(move || {
            hits.fetch_add(1, Ordering::SeqCst);
        })?;
    }
    let delayed_hits = hits.clone();
    queue.send_delayed(
        move || {
            delayed_hits.fetch_add(1, Ordering::SeqCst);
        },
        Duration::from_millis(20),
    )?;
    let orphan = queue.send_async(|| 1)?;

    queue.cancel_all();
    release();
    queue.send_wait(|| {})?;

    assert_eq!(hits.load(Ordering::SeqCst), 0);
    assert_eq!(orphan.value(), Err(QueueError::BrokenPromise));
    Ok(())
}

#[test]
fn test_ready_tasks_still_run_when_the_queue_drops() -> Result<()> {
    let queue = SerialTaskQueue::new("queue")?;
    let hits = Arc::new(AtomicUsize::new(0));

    for _ in 0..5 {
        let hits = hits.clone();
        queue.send(move || {
            hits.fetch_add(1, Ordering::SeqCst);
        })?;
    }
    drop(queue);

    assert_eq!(hits.load(Ordering::SeqCst), 5);
    Ok(())
}

#[test]
fn test_pending_delayed_tasks_are_cancelled_when_the_queue_drops() -> Result<()> {
    let queue = SerialTaskQueue::new("queue")?;
    let hits = Arc::new(AtomicUsize::new(0));

    let hits2 = hits.clone();
    let handle = queue.send_delayed(
        move || {
            hits2.fetch_add(1, Ordering::SeqCst);
        },
        Duration::from_secs(10),
    )?;
    drop(queue);

    assert_eq!(hits.load(Ordering::SeqCst), 0);
    assert!(!handle.is_executed());
    Ok(())
}

#[test]
fn test_a_panicking_task_does_not_kill_the_queue() -> Result<()> {
    let queue = SerialTaskQueue::new("queue")?;
    queue.send(|| panic!("nobody hears this"))?;
    assert_eq!(queue.send_sync(|| 1)?, 1);
    Ok(())
}

#[test]
fn test_async_task_panic_resurfaces_at_value() -> Result<()> {
    let queue = SerialTaskQueue::new("queue")?;
    let handle = queue.send_async(|| -> i32 { panic!("boom") })?;
    assert!(wait_for(|| handle.is_executed(), LONG_WAIT));

    let caught = std::panic::catch_unwind(AssertUnwindSafe(move || handle.value()));
    assert!(caught.is_err());
    Ok(())
}
