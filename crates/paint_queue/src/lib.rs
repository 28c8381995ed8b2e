//! A totally ordered operation queue drained by one background worker.
//!
//! Operations are enqueued from the GL thread and dequeued in FIFO order by
//! the worker. Cancellation removes matching operations before the worker
//! picks them up; the relative order of survivors is preserved. An operation
//! the worker already holds is never pre-empted.

use std::collections::VecDeque;
use std::fmt;
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};

/// Returned by [`OperationQueue::schedule`] on a closed queue, carrying the
/// rejected operation back so the caller can unwind its bookkeeping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueClosed<T>(pub T);

impl<T> fmt::Display for QueueClosed<T> {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(formatter, "operation queue closed")
    }
}

impl<T: fmt::Debug> std::error::Error for QueueClosed<T> {}

struct QueueState<T> {
    operations: VecDeque<T>,
    closed: bool,
}

pub struct OperationQueue<T> {
    state: Mutex<QueueState<T>>,
    cond: Condvar,
}

impl<T> Default for OperationQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> OperationQueue<T> {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(QueueState {
                operations: VecDeque::new(),
                closed: false,
            }),
            cond: Condvar::new(),
        }
    }

    pub fn schedule(&self, operation: T) -> Result<(), QueueClosed<T>> {
        let mut state = self.state.lock().expect("operation queue lock poisoned");
        if state.closed {
            return Err(QueueClosed(operation));
        }
        state.operations.push_back(operation);
        self.cond.notify_one();
        Ok(())
    }

    /// Blocks until an operation is available. Returns `None` once the queue
    /// has been closed and drained.
    pub fn next(&self) -> Option<T> {
        let mut state = self.state.lock().expect("operation queue lock poisoned");
        loop {
            if let Some(operation) = state.operations.pop_front() {
                return Some(operation);
            }
            if state.closed {
                return None;
            }
            state = self
                .cond
                .wait(state)
                .expect("operation queue lock poisoned");
        }
    }

    pub fn try_next(&self) -> Option<T> {
        self.state
            .lock()
            .expect("operation queue lock poisoned")
            .operations
            .pop_front()
    }

    /// Removes every queued operation matching the predicate and returns
    /// them in queue order. Survivors keep their relative order.
    pub fn cancel_matching(&self, mut predicate: impl FnMut(&T) -> bool) -> Vec<T> {
        let mut state = self.state.lock().expect("operation queue lock poisoned");
        let mut removed = Vec::new();
        let mut survivors = VecDeque::with_capacity(state.operations.len());
        for operation in state.operations.drain(..) {
            if predicate(&operation) {
                removed.push(operation);
            } else {
                survivors.push_back(operation);
            }
        }
        state.operations = survivors;
        removed
    }

    /// Empties the queue without closing it, returning the dropped
    /// operations so the caller can unwind their bookkeeping.
    pub fn discard_all(&self) -> Vec<T> {
        let mut state = self.state.lock().expect("operation queue lock poisoned");
        state.operations.drain(..).collect()
    }

    /// Closes the queue: further scheduling fails and the worker exits once
    /// the remaining operations are drained.
    pub fn close(&self) {
        let mut state = self.state.lock().expect("operation queue lock poisoned");
        state.closed = true;
        self.cond.notify_all();
    }

    pub fn len(&self) -> usize {
        self.state
            .lock()
            .expect("operation queue lock poisoned")
            .operations
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// One-shot latch the worker raises once it is ready to accept work.
#[derive(Default)]
pub struct ReadyLatch {
    ready: Mutex<bool>,
    cond: Condvar,
}

impl ReadyLatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_ready(&self) {
        let mut ready = self.ready.lock().expect("ready latch lock poisoned");
        *ready = true;
        self.cond.notify_all();
    }

    pub fn wait_ready(&self) {
        let mut ready = self.ready.lock().expect("ready latch lock poisoned");
        while !*ready {
            ready = self.cond.wait(ready).expect("ready latch lock poisoned");
        }
    }

    pub fn is_ready(&self) -> bool {
        *self.ready.lock().expect("ready latch lock poisoned")
    }
}

pub struct WorkerHandle<T> {
    queue: Arc<OperationQueue<T>>,
    join: Option<JoinHandle<()>>,
}

impl<T> WorkerHandle<T> {
    /// Closes the queue and joins the worker after it drains the remainder.
    pub fn shutdown(mut self) {
        self.queue.close();
        if let Some(join) = self.join.take() {
            if join.join().is_err() {
                log::error!("paint worker panicked during shutdown");
            }
        }
    }
}

impl<T> Drop for WorkerHandle<T> {
    fn drop(&mut self) {
        self.queue.close();
        if let Some(join) = self.join.take() {
            if join.join().is_err() {
                log::error!("paint worker panicked");
            }
        }
    }
}

/// Spawns the background worker draining `queue` with `run`. The latch is
/// raised before the first dequeue so initialization can wait for it.
pub fn spawn_worker<T: Send + 'static>(
    name: &str,
    queue: Arc<OperationQueue<T>>,
    latch: Arc<ReadyLatch>,
    mut run: impl FnMut(T) + Send + 'static,
) -> WorkerHandle<T> {
    let worker_queue = Arc::clone(&queue);
    let join = thread::Builder::new()
        .name(name.to_owned())
        .spawn(move || {
            log::debug!("paint worker up");
            latch.set_ready();
            while let Some(operation) = worker_queue.next() {
                run(operation);
            }
            log::debug!("paint worker drained, exiting");
        })
        .expect("failed to spawn paint worker thread");
    WorkerHandle {
        queue,
        join: Some(join),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::mpsc;

    #[test]
    fn operations_drain_in_fifo_order() {
        let queue = OperationQueue::new();
        for value in 0..4 {
            queue.schedule(value).expect("schedule");
        }
        let drained: Vec<i32> = std::iter::from_fn(|| queue.try_next()).collect();
        assert_eq!(drained, vec![0, 1, 2, 3]);
    }

    #[test]
    fn cancel_matching_preserves_survivor_order() {
        let queue = OperationQueue::new();
        for value in 0..8 {
            queue.schedule(value).expect("schedule");
        }
        let removed = queue.cancel_matching(|value| value % 2 == 0);
        assert_eq!(removed, vec![0, 2, 4, 6]);
        let survivors: Vec<i32> = std::iter::from_fn(|| queue.try_next()).collect();
        assert_eq!(survivors, vec![1, 3, 5, 7]);
    }

    #[test]
    fn discard_all_returns_dropped_operations_and_keeps_queue_open() {
        let queue = OperationQueue::new();
        queue.schedule(1).expect("schedule");
        queue.schedule(2).expect("schedule");
        assert_eq!(queue.discard_all(), vec![1, 2]);
        assert!(queue.is_empty());
        queue.schedule(3).expect("queue stays open after discard");
    }

    #[test]
    fn schedule_after_close_is_rejected() {
        let queue = OperationQueue::new();
        queue.close();
        assert_eq!(queue.schedule(1), Err(QueueClosed(1)));
    }

    #[test]
    fn next_returns_none_only_after_close_and_drain() {
        let queue = OperationQueue::new();
        queue.schedule(9).expect("schedule");
        queue.close();
        assert_eq!(queue.next(), Some(9));
        assert_eq!(queue.next(), None);
    }

    #[test]
    fn worker_processes_scheduled_operations() {
        let queue = Arc::new(OperationQueue::new());
        let latch = Arc::new(ReadyLatch::new());
        let (sender, receiver) = mpsc::channel();
        let handle = spawn_worker("test-worker", Arc::clone(&queue), Arc::clone(&latch), {
            move |value: u32| sender.send(value).expect("report processed op")
        });
        latch.wait_ready();

        queue.schedule(5).expect("schedule");
        queue.schedule(6).expect("schedule");
        assert_eq!(receiver.recv().expect("first op"), 5);
        assert_eq!(receiver.recv().expect("second op"), 6);
        handle.shutdown();
    }

    #[test]
    fn worker_drains_remaining_operations_on_shutdown() {
        let queue = Arc::new(OperationQueue::new());
        let latch = Arc::new(ReadyLatch::new());
        let processed = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&processed);
        let handle = spawn_worker("test-worker", Arc::clone(&queue), latch, move |_: u32| {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        for value in 0..16 {
            queue.schedule(value).expect("schedule");
        }
        handle.shutdown();
        assert_eq!(processed.load(Ordering::SeqCst), 16);
    }

    #[test]
    fn latch_wait_returns_once_ready() {
        let latch = Arc::new(ReadyLatch::new());
        let waiter_latch = Arc::clone(&latch);
        let waiter = thread::spawn(move || waiter_latch.wait_ready());
        latch.set_ready();
        waiter.join().expect("waiter thread");
        assert!(latch.is_ready());
    }
}
