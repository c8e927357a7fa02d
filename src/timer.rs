//! Timer queues and their integration contract.
//!
//! The reactor does not own timer ordering; it consumes a small query
//! contract: the minimum time until the next deadline (capped), draining
//! of expired timers after a wait cycle, and draining of everything at
//! shutdown. [`TimerQueue`] is that contract and [`TimerQueueSet`] the
//! membership list the reactor walks under its global lock.
//!
//! [`DeadlineQueue`] is the supplied implementation: a min-heap of
//! `(deadline, insertion sequence, op)` entries over `Instant`, so
//! wall-clock adjustments never distort wait computations and timers
//! sharing a deadline expire in insertion order.

use crate::error::OpError;
use crate::op::{Op, ReadyBatch};
use parking_lot::Mutex;
use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Query contract between the reactor and one timer queue.
pub trait TimerQueue: Send {
    /// Time until the earliest deadline, capped at `cap`. Returns `cap`
    /// when the queue is empty.
    fn wait_duration(&self, cap: Duration) -> Duration;

    /// Moves every timer whose deadline has passed into `batch`.
    fn get_ready_timers(&mut self, batch: &mut ReadyBatch);

    /// Moves every outstanding timer into `batch`, marked aborted.
    /// Used at reactor shutdown.
    fn get_all_timers(&mut self, batch: &mut ReadyBatch);
}

/// Shared handle to a timer queue registered with the reactor.
pub type SharedTimerQueue = Arc<Mutex<dyn TimerQueue>>;

/// Membership list of timer queues, guarded by the reactor's global lock.
#[derive(Default)]
pub(crate) struct TimerQueueSet {
    queues: Vec<SharedTimerQueue>,
}

impl TimerQueueSet {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn insert(&mut self, queue: SharedTimerQueue) {
        if !self.queues.iter().any(|q| Arc::ptr_eq(q, &queue)) {
            self.queues.push(queue);
        }
    }

    pub(crate) fn erase(&mut self, queue: &SharedTimerQueue) {
        self.queues.retain(|q| !Arc::ptr_eq(q, queue));
    }

    pub(crate) fn wait_duration(&self, cap: Duration) -> Duration {
        self.queues
            .iter()
            .map(|q| q.lock().wait_duration(cap))
            .min()
            .unwrap_or(cap)
    }

    pub(crate) fn get_ready_timers(&self, batch: &mut ReadyBatch) {
        for queue in &self.queues {
            queue.lock().get_ready_timers(batch);
        }
    }

    pub(crate) fn get_all_timers(&self, batch: &mut ReadyBatch) {
        for queue in &self.queues {
            queue.lock().get_all_timers(batch);
        }
    }
}

struct TimerEntry {
    deadline: Instant,
    seq: u64,
    op: Box<dyn Op>,
}

impl PartialEq for TimerEntry {
    fn eq(&self, other: &Self) -> bool {
        self.deadline == other.deadline && self.seq == other.seq
    }
}

impl Eq for TimerEntry {}

impl PartialOrd for TimerEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for TimerEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        // Reverse ordering for min-heap behavior in BinaryHeap.
        other
            .deadline
            .cmp(&self.deadline)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

/// Min-heap timer queue ordered by monotonic deadline.
///
/// Schedule a timer, then call
/// [`Reactor::interrupt`](crate::Reactor::interrupt) so a blocked wait
/// cycle recomputes its timeout against the new deadline.
#[derive(Default)]
pub struct DeadlineQueue {
    heap: BinaryHeap<TimerEntry>,
    next_seq: u64,
}

impl DeadlineQueue {
    /// Creates an empty queue.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of outstanding timers.
    #[must_use]
    pub fn len(&self) -> usize {
        self.heap.len()
    }

    /// Returns true if no timers are outstanding.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }

    /// Schedules `op` to become ready at `deadline`.
    pub fn schedule(&mut self, deadline: Instant, op: Box<dyn Op>) {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.heap.push(TimerEntry { deadline, seq, op });
    }

    /// The earliest outstanding deadline, if any.
    #[must_use]
    pub fn next_deadline(&self) -> Option<Instant> {
        self.heap.peek().map(|entry| entry.deadline)
    }
}

impl TimerQueue for DeadlineQueue {
    fn wait_duration(&self, cap: Duration) -> Duration {
        match self.heap.peek() {
            Some(entry) => entry
                .deadline
                .saturating_duration_since(Instant::now())
                .min(cap),
            None => cap,
        }
    }

    fn get_ready_timers(&mut self, batch: &mut ReadyBatch) {
        let now = Instant::now();
        while let Some(entry) = self.heap.peek() {
            if entry.deadline > now {
                break;
            }
            if let Some(entry) = self.heap.pop() {
                batch.push(entry.op);
            }
        }
    }

    fn get_all_timers(&mut self, batch: &mut ReadyBatch) {
        // Drain in deadline order so shutdown completions stay
        // deterministic.
        while let Some(entry) = self.heap.pop() {
            let mut op = entry.op;
            op.set_error(OpError::Aborted);
            batch.push(op);
        }
    }
}
