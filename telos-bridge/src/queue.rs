//! Bounded two-class task queue
//!
//! MPMC queue with strict `interactive` over `batch` priority, FIFO within a
//! class, and starvation avoidance: every K-th dispatch takes a batch task
//! regardless. Submission applies backpressure by blocking until a slot
//! frees or the supplied deadline expires.

use crate::task::Priority;
use crate::BATCH_STARVATION_INTERVAL;
use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::time::{Duration, Instant};

/// Why a submission was rejected; carries the item back to the caller
#[derive(Debug)]
pub enum SubmitError<T> {
    /// Queue stayed full past the deadline
    Full(T),
    /// Queue is closed to new work
    Closed(T),
}

/// Outcome of a worker pop
#[derive(Debug)]
pub enum Pop<T> {
    /// A task was dispatched
    Item(T),
    /// No task arrived within the timeout
    TimedOut,
    /// Queue is closed and drained; the worker should exit
    Closed,
}

struct QueueState<T> {
    interactive: VecDeque<T>,
    batch: VecDeque<T>,
    closed: bool,
    dispatches: u64,
}

impl<T> QueueState<T> {
    fn len(&self) -> usize {
        self.interactive.len() + self.batch.len()
    }

    fn take_next(&mut self) -> Option<T> {
        let force_batch = !self.batch.is_empty()
            && self.dispatches % BATCH_STARVATION_INTERVAL == BATCH_STARVATION_INTERVAL - 1;
        let item = if force_batch {
            self.batch.pop_front()
        } else {
            self.interactive
                .pop_front()
                .or_else(|| self.batch.pop_front())
        };
        if item.is_some() {
            self.dispatches += 1;
        }
        item
    }
}

/// Bounded MPMC queue with two priority classes
pub struct BoundedQueue<T> {
    capacity: usize,
    state: Mutex<QueueState<T>>,
    not_full: Condvar,
    not_empty: Condvar,
}

impl<T> BoundedQueue<T> {
    /// Create a queue holding at most `capacity` tasks across both classes
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            state: Mutex::new(QueueState {
                interactive: VecDeque::new(),
                batch: VecDeque::new(),
                closed: false,
                dispatches: 0,
            }),
            not_full: Condvar::new(),
            not_empty: Condvar::new(),
        }
    }

    /// Enqueue, blocking while full until `deadline`
    pub fn submit(
        &self,
        item: T,
        priority: Priority,
        deadline: Instant,
    ) -> Result<(), SubmitError<T>> {
        let mut state = self.state.lock();
        loop {
            if state.closed {
                return Err(SubmitError::Closed(item));
            }
            if state.len() < self.capacity {
                break;
            }
            if self.not_full.wait_until(&mut state, deadline).timed_out() {
                return Err(SubmitError::Full(item));
            }
        }
        match priority {
            Priority::Interactive => state.interactive.push_back(item),
            Priority::Batch => state.batch.push_back(item),
        }
        drop(state);
        self.not_empty.notify_one();
        Ok(())
    }

    /// Dequeue the next task by class priority, waiting up to `timeout`
    pub fn pop(&self, timeout: Duration) -> Pop<T> {
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock();
        loop {
            if let Some(item) = state.take_next() {
                drop(state);
                self.not_full.notify_one();
                return Pop::Item(item);
            }
            if state.closed {
                return Pop::Closed;
            }
            if self.not_empty.wait_until(&mut state, deadline).timed_out() {
                return Pop::TimedOut;
            }
        }
    }

    /// Close the queue to new submissions and wake all waiters
    pub fn close(&self) {
        let mut state = self.state.lock();
        state.closed = true;
        drop(state);
        self.not_full.notify_all();
        self.not_empty.notify_all();
    }

    /// Remove and return everything still queued (used at shutdown)
    pub fn drain(&self) -> Vec<T> {
        let mut state = self.state.lock();
        let mut drained = Vec::with_capacity(state.len());
        drained.extend(state.interactive.drain(..));
        drained.extend(state.batch.drain(..));
        drop(state);
        self.not_full.notify_all();
        drained
    }

    /// Tasks currently queued across both classes
    pub fn len(&self) -> usize {
        self.state.lock().len()
    }

    /// Whether the queue is empty
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether the queue has been closed
    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn soon() -> Instant {
        Instant::now() + Duration::from_millis(50)
    }

    #[test]
    fn fifo_within_class() {
        let q = BoundedQueue::new(8);
        q.submit(1, Priority::Interactive, soon()).unwrap();
        q.submit(2, Priority::Interactive, soon()).unwrap();
        assert!(matches!(q.pop(Duration::ZERO), Pop::Item(1)));
        assert!(matches!(q.pop(Duration::ZERO), Pop::Item(2)));
    }

    #[test]
    fn interactive_preempts_batch() {
        let q = BoundedQueue::new(8);
        q.submit(10, Priority::Batch, soon()).unwrap();
        q.submit(1, Priority::Interactive, soon()).unwrap();
        assert!(matches!(q.pop(Duration::ZERO), Pop::Item(1)));
        assert!(matches!(q.pop(Duration::ZERO), Pop::Item(10)));
    }

    #[test]
    fn batch_is_not_starved() {
        let q = BoundedQueue::new(64);
        q.submit(-1, Priority::Batch, soon()).unwrap();
        for i in 0..BATCH_STARVATION_INTERVAL as i32 {
            q.submit(i, Priority::Interactive, soon()).unwrap();
        }
        let mut popped = Vec::new();
        for _ in 0..=BATCH_STARVATION_INTERVAL as i32 {
            match q.pop(Duration::ZERO) {
                Pop::Item(v) => popped.push(v),
                other => panic!("unexpected {other:?}"),
            }
        }
        let batch_pos = popped.iter().position(|v| *v == -1).unwrap();
        assert!(
            batch_pos < BATCH_STARVATION_INTERVAL as usize,
            "batch task starved: {popped:?}"
        );
    }

    #[test]
    fn full_queue_times_out() {
        let q = BoundedQueue::new(1);
        q.submit(1, Priority::Interactive, soon()).unwrap();
        match q.submit(2, Priority::Interactive, soon()) {
            Err(SubmitError::Full(2)) => {}
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn blocked_submit_proceeds_when_slot_frees() {
        let q = Arc::new(BoundedQueue::new(1));
        q.submit(1, Priority::Interactive, soon()).unwrap();

        let q2 = Arc::clone(&q);
        let handle = std::thread::spawn(move || {
            q2.submit(2, Priority::Interactive, Instant::now() + Duration::from_secs(2))
        });

        std::thread::sleep(Duration::from_millis(20));
        assert!(matches!(q.pop(Duration::ZERO), Pop::Item(1)));
        assert!(handle.join().unwrap().is_ok());
        assert!(matches!(q.pop(Duration::from_millis(100)), Pop::Item(2)));
    }

    #[test]
    fn close_rejects_and_drains() {
        let q = BoundedQueue::new(4);
        q.submit(1, Priority::Interactive, soon()).unwrap();
        q.close();
        assert!(matches!(
            q.submit(2, Priority::Interactive, soon()),
            Err(SubmitError::Closed(2))
        ));
        assert_eq!(q.drain(), vec![1]);
        assert!(matches!(q.pop(Duration::ZERO), Pop::Closed));
    }
}
