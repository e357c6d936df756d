//! BinaryHeap-based one-shot timers shared by the event loop adapters
//!
//! - Insert: O(log n)
//! - Cancel: O(1) (lazy, the heap entry is skipped when it surfaces)
//! - Take expired: O(k log n) where k = number of expired timers
//!
//! Not thread-safe by itself; each adapter keeps it behind its own lock.

use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap};
use std::time::Instant;

use super::Callback;

/// Handle returned by `EventLoop::post_after`, used to cancel the timer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimerHandle(u64);

/// Min-heap ordering by deadline, ties broken by insertion order
struct HeapEntry {
    deadline: Instant,
    seq: u64,
}

impl PartialEq for HeapEntry {
    fn eq(&self, other: &Self) -> bool {
        self.deadline == other.deadline && self.seq == other.seq
    }
}

impl Eq for HeapEntry {}

impl PartialOrd for HeapEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for HeapEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        // Reversed: BinaryHeap is a max-heap
        match other.deadline.cmp(&self.deadline) {
            Ordering::Equal => other.seq.cmp(&self.seq),
            ord => ord,
        }
    }
}

pub(crate) struct TimerQueue {
    heap: BinaryHeap<HeapEntry>,
    /// Callbacks of timers that are neither fired nor cancelled
    pending: HashMap<u64, Callback>,
    next_seq: u64,
}

impl TimerQueue {
    pub(crate) fn new() -> Self {
        Self {
            heap: BinaryHeap::new(),
            pending: HashMap::new(),
            next_seq: 0,
        }
    }

    pub(crate) fn insert(&mut self, deadline: Instant, callback: Callback) -> TimerHandle {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.heap.push(HeapEntry { deadline, seq });
        self.pending.insert(seq, callback);
        TimerHandle(seq)
    }

    /// Returns true if the timer was still pending
    pub(crate) fn cancel(&mut self, handle: TimerHandle) -> bool {
        let removed = self.pending.remove(&handle.0).is_some();
        if self.pending.is_empty() {
            self.heap.clear();
        }
        removed
    }

    /// Remove and return the callbacks of every timer due at `now`, earliest first
    pub(crate) fn take_expired(&mut self, now: Instant) -> Vec<Callback> {
        let mut expired = Vec::new();
        while let Some(top) = self.heap.peek() {
            if top.deadline > now {
                break;
            }
            let seq = top.seq;
            self.heap.pop();
            if let Some(cb) = self.pending.remove(&seq) {
                expired.push(cb);
            }
        }
        expired
    }

    /// Deadline of the earliest live timer
    pub(crate) fn next_deadline(&mut self) -> Option<Instant> {
        // Discard cancelled entries sitting at the top
        while let Some(top) = self.heap.peek() {
            if self.pending.contains_key(&top.seq) {
                return Some(top.deadline);
            }
            self.heap.pop();
        }
        None
    }

    pub(crate) fn len(&self) -> usize {
        self.pending.len()
    }
}
