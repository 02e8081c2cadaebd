//! The timer wheel: a min-heap of absolute wake-ups with lazy invalidation
//! so a canceled timer doesn't need to be removed from the heap immediately.

use std::cell::Cell;
use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::rc::Rc;
use std::task::Waker;

use crate::time::MillisTime;

/// Opaque handle returned by [`TimerWheel::schedule`], used to
/// [`TimerWheel::invalidate`] a still-pending timer (e.g. a sleep whose
/// coroutine was canceled, or the loser of a timeout-vs-completion race).
#[derive(Clone)]
pub struct TimerId {
    valid: Rc<Cell<bool>>,
}

impl TimerId {
    pub fn invalidate(&self) {
        self.valid.set(false);
    }
}

struct Entry {
    deadline: MillisTime,
    seq: u64,
    valid: Rc<Cell<bool>>,
    waker: Waker,
}

impl PartialEq for Entry {
    fn eq(&self, other: &Self) -> bool {
        self.deadline == other.deadline && self.seq == other.seq
    }
}
impl Eq for Entry {}

impl Ord for Entry {
    fn cmp(&self, other: &Self) -> Ordering {
        // BinaryHeap is a max-heap; reverse so the earliest deadline sorts
        // to the top. Ties broken by insertion order (lower seq first).
        other
            .deadline
            .cmp(&self.deadline)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}
impl PartialOrd for Entry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Min-heap of time events, keyed by absolute monotonic milliseconds.
#[derive(Default)]
pub struct TimerWheel {
    heap: BinaryHeap<Entry>,
    next_seq: u64,
}

impl TimerWheel {
    pub fn new() -> Self {
        TimerWheel {
            heap: BinaryHeap::new(),
            next_seq: 0,
        }
    }

    /// schedule(t, waker) -> id
    pub fn schedule(&mut self, deadline: MillisTime, waker: Waker) -> TimerId {
        let valid = Rc::new(Cell::new(true));
        let seq = self.next_seq;
        self.next_seq += 1;
        self.heap.push(Entry {
            deadline,
            seq,
            valid: valid.clone(),
            waker,
        });
        TimerId { valid }
    }

    /// peek_deadline(): next valid wake-up time, or `None` for infinity.
    /// Lazily discards invalidated entries sitting at the top of the heap.
    pub fn peek_deadline(&mut self) -> Option<MillisTime> {
        while let Some(top) = self.heap.peek() {
            if top.valid.get() {
                return Some(top.deadline);
            }
            self.heap.pop();
        }
        None
    }

    /// fire_due(now): pop and wake every valid entry whose deadline has
    /// passed; invalid ones are discarded without resuming anyone.
    pub fn fire_due(&mut self, now: MillisTime) {
        loop {
            match self.heap.peek() {
                Some(top) if top.deadline <= now => {
                    let entry = self.heap.pop().expect("peeked Some");
                    if entry.valid.get() {
                        entry.waker.wake();
                    }
                }
                _ => break,
            }
        }
    }

    pub fn len(&self) -> usize {
        self.heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }
}
