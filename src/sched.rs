use std::cmp::{Ordering, Reverse};
use std::collections::{BinaryHeap, HashSet};
use std::rc::Rc;

use crate::clock::Clock;
use crate::evloop::EventLoop;

/// Cancelled entries stay in the heap as tombstones until this many
/// accumulate, then the heap is rebuilt over live entries only.
const TOMBSTONE_LIMIT: usize = 32;

pub(crate) type TimerCallback = Box<dyn FnOnce(&EventLoop)>;

/// Priority queue of absolute monotonic deadlines with cancellation by id.
///
/// Ids are dense, strictly positive and never reused. Cancellation marks the
/// id dead in a side set; dead heap entries are discarded lazily when they
/// surface at the root or in bulk once [`TOMBSTONE_LIMIT`] is exceeded.
pub(crate) struct Scheduler {
    clock: Rc<dyn Clock>,
    heap: BinaryHeap<Reverse<TimerEntry>>,
    live: HashSet<u64>,
    tombstones: usize,
    next_id: u64,
}

struct TimerEntry {
    deadline: i64,
    id: u64,
    cb: TimerCallback,
}

// Heap order is (deadline, id); the callback takes no part in it.
impl PartialEq for TimerEntry {
    fn eq(&self, other: &Self) -> bool { self.deadline == other.deadline && self.id == other.id }
}
impl Eq for TimerEntry {}
impl PartialOrd for TimerEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> { Some(self.cmp(other)) }
}
impl Ord for TimerEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        self.deadline.cmp(&other.deadline).then(self.id.cmp(&other.id))
    }
}

impl Scheduler {
    pub fn new(clock: Rc<dyn Clock>) -> Self {
        Scheduler {
            clock,
            heap: BinaryHeap::new(),
            live: empty!(),
            tombstones: 0,
            next_id: 1,
        }
    }

    pub fn len(&self) -> usize { self.live.len() }

    /// Enqueue a callback at an absolute monotonic deadline.
    pub fn at_ns(&mut self, deadline: i64, cb: TimerCallback) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        self.live.insert(id);
        self.heap.push(Reverse(TimerEntry { deadline, id, cb }));
        id
    }

    /// Enqueue a callback `delta_ns` from the cached now; negative deltas
    /// clamp to zero.
    pub fn after_ns(&mut self, delta_ns: i64, cb: TimerCallback) -> u64 {
        let deadline = self.clock.deadline_in_ns(delta_ns);
        self.at_ns(deadline, cb)
    }

    /// Tombstone the entry; returns whether the id was still live.
    pub fn cancel(&mut self, id: u64) -> bool {
        if !self.live.remove(&id) {
            return false;
        }
        self.tombstones += 1;
        if self.tombstones > TOMBSTONE_LIMIT {
            self.compact();
        }
        true
    }

    /// Deadline of the nearest live entry, discarding dead roots on the way.
    pub fn next_deadline_ns(&mut self) -> Option<i64> {
        while let Some(Reverse(root)) = self.heap.peek() {
            if self.live.contains(&root.id) {
                return Some(root.deadline);
            }
            self.heap.pop();
            self.tombstones = self.tombstones.saturating_sub(1);
        }
        None
    }

    /// Pop every live entry whose deadline is at or before the cached now,
    /// in non-decreasing deadline order. Entries scheduled by the returned
    /// callbacks land in the heap and belong to a later batch.
    pub fn pop_expired(&mut self) -> Vec<(u64, TimerCallback)> {
        let now = self.clock.now_ns();
        let mut batch = Vec::new();
        while let Some(Reverse(root)) = self.heap.peek() {
            if !self.live.contains(&root.id) {
                self.heap.pop();
                self.tombstones = self.tombstones.saturating_sub(1);
                continue;
            }
            if root.deadline > now {
                break;
            }
            let Reverse(entry) = self.heap.pop().expect("peeked root");
            self.live.remove(&entry.id);
            batch.push((entry.id, entry.cb));
        }
        batch
    }

    fn compact(&mut self) {
        let live = &self.live;
        let entries = std::mem::take(&mut self.heap).into_vec();
        self.heap = entries
            .into_iter()
            .filter(|Reverse(e)| live.contains(&e.id))
            .collect();
        self.tombstones = 0;
    }

    #[cfg(test)]
    fn heap_len(&self) -> usize { self.heap.len() }
}
