//! Blocking FIFO between producer threads and the poll thread.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

/// A thread-safe queue. Any thread may push; the poll thread is the only consumer.
#[derive(Debug)]
pub struct Mailbox<T> {
    queue: Mutex<VecDeque<T>>,
    ready: Condvar,
}

impl<T> Default for Mailbox<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Mailbox<T> {
    pub fn new() -> Self {
        Self {
            queue: Mutex::new(VecDeque::new()),
            ready: Condvar::new(),
        }
    }

    /// Append `item` and wake a waiting consumer.
    pub fn push(&self, item: T) {
        self.queue.lock().push_back(item);
        self.ready.notify_one();
    }

    /// Remove and return the oldest item, if any.
    pub fn try_pop(&self) -> Option<T> {
        self.queue.lock().pop_front()
    }

    /// Remove and return the oldest item, waiting up to `timeout` for one to arrive.
    pub fn pop_timeout(&self, timeout: Duration) -> Option<T> {
        let deadline = Instant::now() + timeout;
        let mut queue = self.queue.lock();
        while queue.is_empty() {
            if self.ready.wait_until(&mut queue, deadline).timed_out() {
                break;
            }
        }
        queue.pop_front()
    }

    /// Wait up to `timeout` for the queue to become non-empty.
    /// Returns true if there is something to take.
    pub fn wait(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut queue = self.queue.lock();
        while queue.is_empty() {
            if self.ready.wait_until(&mut queue, deadline).timed_out() {
                return !queue.is_empty();
            }
        }
        true
    }

    /// Throw away everything queued. Returns how many items were dropped.
    pub fn purge(&self) -> usize {
        let mut queue = self.queue.lock();
        let count = queue.len();
        queue.clear();
        count
    }

    pub fn len(&self) -> usize {
        self.queue.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.lock().is_empty()
    }
}

impl<T: Clone> Mailbox<T> {
    /// A copy of the oldest item, leaving it queued.
    pub fn peek(&self) -> Option<T> {
        self.queue.lock().front().cloned()
    }
}
