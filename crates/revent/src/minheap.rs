//! Timer store: indexed min-heap plus common-timeout buckets
//!
//! An array-backed binary min-heap of event ids keyed on (deadline,
//! schedule sequence). Each record stores its own position in
//! `timeout_pos`, so erasing an arbitrary element is O(log n): the hole
//! is refilled with the former tail, sifting whichever direction its key
//! requires.
//!
//! Common-timeout buckets overlay the heap: events sharing one relative
//! timeout queue FIFO in their bucket (FIFO order is deadline order),
//! and only the bucket's internal head event sits in the heap, carrying
//! the earliest deadline of the list.

use std::collections::VecDeque;
use std::time::Duration;

use slab::Slab;

use crate::event::{EventId, EventRecord, TimeoutPos};

pub(crate) struct MinHeap {
    v: Vec<EventId>,
}

impl MinHeap {
    pub fn new() -> Self {
        MinHeap { v: Vec::new() }
    }

    pub fn len(&self) -> usize {
        self.v.len()
    }

    pub fn is_empty(&self) -> bool {
        self.v.is_empty()
    }

    pub fn peek(&self) -> Option<EventId> {
        self.v.first().copied()
    }

    fn greater(ev: &Slab<EventRecord>, a: EventId, b: EventId) -> bool {
        let ra = &ev[a];
        let rb = &ev[b];
        (ra.deadline, ra.seq) > (rb.deadline, rb.seq)
    }

    fn set(&mut self, ev: &mut Slab<EventRecord>, idx: usize, id: EventId) {
        self.v[idx] = id;
        ev[id].timeout_pos = TimeoutPos::Heap(idx);
    }

    fn reserve_one(&mut self) {
        if self.v.len() == self.v.capacity() {
            let want = if self.v.capacity() == 0 {
                8
            } else {
                self.v.capacity() * 2
            };
            self.v.reserve_exact(want - self.v.len());
        }
    }

    pub fn push(&mut self, ev: &mut Slab<EventRecord>, id: EventId) {
        debug_assert!(matches!(ev[id].timeout_pos, TimeoutPos::None));
        self.reserve_one();
        let hole = self.v.len();
        self.v.push(id);
        self.shift_up(ev, hole, id);
    }

    pub fn pop(&mut self, ev: &mut Slab<EventRecord>) -> Option<EventId> {
        if self.v.is_empty() {
            return None;
        }
        let top = self.v[0];
        let last = self.v.pop().unwrap();
        if !self.v.is_empty() {
            self.shift_down(ev, 0, last);
        }
        ev[top].timeout_pos = TimeoutPos::None;
        Some(top)
    }

    /// Remove an element wherever it sits. Returns false if the event is
    /// not heap-resident.
    pub fn erase(&mut self, ev: &mut Slab<EventRecord>, id: EventId) -> bool {
        let idx = match ev[id].timeout_pos {
            TimeoutPos::Heap(i) => i,
            _ => return false,
        };
        let last = self.v.pop().unwrap();
        if last != id {
            if idx > 0 && Self::greater(ev, self.v[(idx - 1) / 2], last) {
                self.shift_up_unconditional(ev, idx, last);
            } else {
                self.shift_down(ev, idx, last);
            }
        }
        ev[id].timeout_pos = TimeoutPos::None;
        true
    }

    /// Re-place an element after its deadline changed; inserts it if it
    /// is not heap-resident yet.
    pub fn adjust(&mut self, ev: &mut Slab<EventRecord>, id: EventId) {
        match ev[id].timeout_pos {
            TimeoutPos::Heap(idx) => {
                if idx > 0 && Self::greater(ev, self.v[(idx - 1) / 2], id) {
                    self.shift_up_unconditional(ev, idx, id);
                } else {
                    self.shift_down(ev, idx, id);
                }
            }
            TimeoutPos::None => self.push(ev, id),
            TimeoutPos::Common(_) => {
                debug_assert!(false, "adjust on a bucket-resident event");
            }
        }
    }

    fn shift_up(&mut self, ev: &mut Slab<EventRecord>, mut hole: usize, id: EventId) {
        while hole > 0 {
            let parent = (hole - 1) / 2;
            if !Self::greater(ev, self.v[parent], id) {
                break;
            }
            let p = self.v[parent];
            self.set(ev, hole, p);
            hole = parent;
        }
        self.set(ev, hole, id);
    }

    /// Like `shift_up`, but the first hop is known to be needed.
    fn shift_up_unconditional(&mut self, ev: &mut Slab<EventRecord>, mut hole: usize, id: EventId) {
        loop {
            let parent = (hole - 1) / 2;
            let p = self.v[parent];
            self.set(ev, hole, p);
            hole = parent;
            if hole == 0 || !Self::greater(ev, self.v[(hole - 1) / 2], id) {
                break;
            }
        }
        self.set(ev, hole, id);
    }

    fn shift_down(&mut self, ev: &mut Slab<EventRecord>, mut hole: usize, id: EventId) {
        let n = self.v.len();
        loop {
            // right child; drops to the left one when the right does not
            // exist or is larger
            let mut child = 2 * (hole + 1);
            if child > n {
                break;
            }
            if child == n || Self::greater(ev, self.v[child], self.v[child - 1]) {
                child -= 1;
            }
            if !Self::greater(ev, id, self.v[child]) {
                break;
            }
            let c = self.v[child];
            self.set(ev, hole, c);
            hole = child;
        }
        self.set(ev, hole, id);
    }

    #[cfg(test)]
    fn assert_consistent(&self, ev: &Slab<EventRecord>) {
        for (i, &id) in self.v.iter().enumerate() {
            assert_eq!(ev[id].timeout_pos, TimeoutPos::Heap(i));
            if i > 0 {
                let parent = self.v[(i - 1) / 2];
                assert!(
                    !Self::greater(ev, parent, id),
                    "heap property violated at index {}",
                    i
                );
            }
        }
    }
}

/// Events sharing one relative timeout. Only `head` (an internal event)
/// is heap-resident; the queue is FIFO and therefore deadline-ordered.
pub(crate) struct CommonTimeoutList {
    pub duration: Duration,
    pub queue: VecDeque<EventId>,
    pub head: EventId,
}
