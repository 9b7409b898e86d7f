//! Deadline heap for one locality
//!
//! Live entries sit in a map keyed by handle; the heap only orders
//! `(deadline, handle)` keys. Cancelling removes the map entry and leaves
//! a stale key behind, which is dropped when it surfaces at the top.
//!
//! Insert and poll are O(log n) per entry, cancel is O(1).

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::time::Instant;

use parking_lot::Mutex;

use super::{TimerBackend, TimerEntry, TimerHandle};

type Key = Reverse<(Instant, u64)>;

#[derive(Default)]
struct Deadlines {
    order: BinaryHeap<Key>,
    live: HashMap<TimerHandle, TimerEntry>,
    stats: TimerStats,
}

impl Deadlines {
    /// Drop keys of cancelled timers from the top of the heap
    fn skip_stale(&mut self) {
        while let Some(Reverse((_, raw))) = self.order.peek() {
            if self.live.contains_key(&TimerHandle(*raw)) {
                return;
            }
            self.order.pop();
        }
    }
}

/// Heap-ordered timer storage, one per locality
#[derive(Default)]
pub struct HeapTimerBackend {
    inner: Mutex<Deadlines>,
}

impl HeapTimerBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(Deadlines {
                order: BinaryHeap::with_capacity(capacity),
                live: HashMap::with_capacity(capacity),
                stats: TimerStats::default(),
            }),
        }
    }

    pub fn stats(&self) -> TimerStats {
        let inner = self.inner.lock();
        TimerStats {
            armed: inner.live.len(),
            ..inner.stats
        }
    }
}

impl TimerBackend for HeapTimerBackend {
    fn insert(&self, entry: TimerEntry) -> TimerHandle {
        let handle = entry.handle;
        let mut inner = self.inner.lock();
        inner.order.push(Reverse((entry.deadline, handle.raw())));
        inner.live.insert(handle, entry);
        inner.stats.inserted += 1;
        handle
    }

    fn cancel(&self, handle: TimerHandle) -> bool {
        let mut inner = self.inner.lock();
        if inner.live.remove(&handle).is_none() {
            return false;
        }
        inner.stats.cancelled += 1;
        inner.skip_stale();
        true
    }

    fn poll_expired(&self, now: Instant) -> Vec<TimerEntry> {
        let mut inner = self.inner.lock();
        let mut due = Vec::new();
        while let Some(&Reverse((deadline, raw))) = inner.order.peek() {
            if deadline > now {
                break;
            }
            inner.order.pop();
            if let Some(entry) = inner.live.remove(&TimerHandle(raw)) {
                due.push(entry);
            }
        }
        inner.stats.fired += due.len() as u64;
        due
    }

    fn next_deadline(&self) -> Option<Instant> {
        let mut inner = self.inner.lock();
        inner.skip_stale();
        inner.order.peek().map(|Reverse((deadline, _))| *deadline)
    }

    fn len(&self) -> usize {
        self.inner.lock().live.len()
    }

    fn name(&self) -> &'static str {
        "heap"
    }
}

/// Timer counters of one locality
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TimerStats {
    /// Timers waiting for their deadline
    pub armed: usize,
    pub inserted: u64,
    pub fired: u64,
    pub cancelled: u64,
}
