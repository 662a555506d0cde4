// =============================================================================
// Priority Work Queue — bounded, priority-first, FIFO within a class
// =============================================================================
//
// Items are keyed by `(priority, Reverse(seq))` in a max-heap:
//   - higher priority always pops first,
//   - within one priority the lowest sequence number (earliest push) pops
//     first.
//
// Sequence numbers come from one process-wide counter so that ordering stays
// strictly increasing even across queues. There is no aging: a steady flood of
// CRITICAL work starves LOW work indefinitely.
//
// The queue never blocks: once `capacity` is reached, `push` drops the item
// and bumps the drop counter.
// =============================================================================

use std::cmp::{Ordering, Reverse};
use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};

use crate::types::Priority;

static NEXT_SEQUENCE: AtomicU64 = AtomicU64::new(1);

/// Next value of the process-wide monotonic sequence counter.
pub fn next_sequence() -> u64 {
    NEXT_SEQUENCE.fetch_add(1, AtomicOrdering::Relaxed)
}

struct QueuedItem<T> {
    priority: Priority,
    seq: u64,
    item: T,
}

impl<T> QueuedItem<T> {
    fn key(&self) -> (Priority, Reverse<u64>) {
        (self.priority, Reverse(self.seq))
    }
}

impl<T> PartialEq for QueuedItem<T> {
    fn eq(&self, other: &Self) -> bool {
        self.key() == other.key()
    }
}

impl<T> Eq for QueuedItem<T> {}

impl<T> PartialOrd for QueuedItem<T> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl<T> Ord for QueuedItem<T> {
    fn cmp(&self, other: &Self) -> Ordering {
        self.key().cmp(&other.key())
    }
}

/// Bounded priority queue. Not synchronised on its own; each component keeps
/// it inside its state mutex.
pub struct PriorityWorkQueue<T> {
    heap: BinaryHeap<QueuedItem<T>>,
    capacity: usize,
    dropped: u64,
}

impl<T> PriorityWorkQueue<T> {
    pub fn new(capacity: usize) -> Self {
        Self {
            heap: BinaryHeap::new(),
            capacity,
            dropped: 0,
        }
    }

    /// Enqueue `item`. Returns `false` (and counts a drop) when full.
    pub fn push(&mut self, priority: Priority, item: T) -> bool {
        if self.heap.len() >= self.capacity {
            self.dropped += 1;
            return false;
        }
        self.heap.push(QueuedItem {
            priority,
            seq: next_sequence(),
            item,
        });
        true
    }

    /// Remove the highest-priority, earliest-submitted item.
    pub fn pop(&mut self) -> Option<T> {
        self.heap.pop().map(|q| q.item)
    }

    pub fn len(&self) -> usize {
        self.heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of items rejected because the queue was full.
    pub fn dropped(&self) -> u64 {
        self.dropped
    }
}
