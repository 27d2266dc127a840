//! Lock-free MPMC work queue.

use crossbeam_queue::SegQueue;

/// Unbounded multi-producer multi-consumer queue.
///
/// Push and pop never block; ordering is FIFO per producer.
#[derive(Debug)]
pub struct WorkQueue<T> {
    inner: SegQueue<T>,
}

/// Queue of opaque 64-bit tokens
pub type TokenQueue = WorkQueue<u64>;

impl<T> WorkQueue<T> {
    /// Create an empty queue
    #[must_use]
    pub const fn new() -> Self {
        Self {
            inner: SegQueue::new(),
        }
    }

    /// Push an item
    pub fn push(&self, item: T) {
        self.inner.push(item);
    }

    /// Pop the oldest item
    pub fn pop(&self) -> Option<T> {
        self.inner.pop()
    }

    /// Number of queued items; a hint under concurrent use
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.len()
    }

    /// Whether the queue is empty; a hint under concurrent use
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    /// Pop everything currently queued
    pub fn drain(&self) -> Vec<T> {
        let mut out = Vec::with_capacity(self.inner.len());
        while let Some(item) = self.inner.pop() {
            out.push(item);
        }
        out
    }
}

impl<T> Default for WorkQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}
