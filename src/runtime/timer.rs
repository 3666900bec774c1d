use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::time::{Duration, Instant};

/// Identifier handed out by [`TimerWheel::add`]; used to cancel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimerId(u64);

pub(crate) type TimerCallback = Box<dyn FnOnce()>;

#[derive(PartialEq, Eq)]
struct TimerKey {
    deadline: Instant,
    /// Arrival order; breaks ties between timers sharing a deadline.
    seq: u64,
    id: TimerId,
}

impl Ord for TimerKey {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        (self.deadline, self.seq).cmp(&(other.deadline, other.seq))
    }
}

impl PartialOrd for TimerKey {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

/// Ordered set of deadlines.
///
/// Cancellation is lazy: the heap entry of a cancelled timer stays until it
/// surfaces, but its callback is gone, so a cancelled timer never fires.
pub(crate) struct TimerWheel {
    heap: BinaryHeap<Reverse<TimerKey>>,
    callbacks: HashMap<TimerId, TimerCallback>,
    next_id: u64,
    next_seq: u64,
}

impl TimerWheel {
    pub fn new() -> Self {
        Self {
            heap: BinaryHeap::new(),
            callbacks: HashMap::new(),
            next_id: 0,
            next_seq: 0,
        }
    }

    pub fn add(&mut self, delay: Duration, callback: TimerCallback) -> TimerId {
        let id = TimerId(self.next_id);
        self.next_id += 1;
        let seq = self.next_seq;
        self.next_seq += 1;
        self.heap.push(Reverse(TimerKey {
            deadline: Instant::now() + delay,
            seq,
            id,
        }));
        self.callbacks.insert(id, callback);
        id
    }

    /// Returns true if the timer was still pending.
    pub fn cancel(&mut self, id: TimerId) -> bool {
        self.callbacks.remove(&id).is_some()
    }

    /// Time until the nearest live deadline: zero when past due, `None` when
    /// the set is empty.
    pub fn next_delay(&mut self, now: Instant) -> Option<Duration> {
        self.drop_cancelled();
        let Reverse(key) = self.heap.peek()?;
        Some(key.deadline.saturating_duration_since(now))
    }

    /// Detach every callback whose deadline has passed, in deadline-then-
    /// arrival order. The caller runs them outside the wheel borrow so that
    /// callbacks may schedule new timers.
    pub fn take_due(&mut self, now: Instant) -> Vec<TimerCallback> {
        let mut due = Vec::new();
        while let Some(Reverse(key)) = self.heap.peek() {
            if key.deadline > now {
                break;
            }
            let id = key.id;
            self.heap.pop();
            if let Some(cb) = self.callbacks.remove(&id) {
                due.push(cb);
            }
        }
        due
    }

    pub fn is_empty(&self) -> bool {
        self.callbacks.is_empty()
    }

    fn drop_cancelled(&mut self) {
        while let Some(Reverse(key)) = self.heap.peek() {
            if self.callbacks.contains_key(&key.id) {
                break;
            }
            self.heap.pop();
        }
    }
}
