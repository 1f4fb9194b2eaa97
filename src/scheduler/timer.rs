//! Timeout deadlines for dispatched tasks.
//!
//! Deadlines are never removed eagerly. When one expires the scheduler checks
//! whether the task it names is still running; if not, the deadline is stale
//! and simply discarded.

use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::time::Instant;

use super::tag::Tag;
use super::task::TaskId;

/// Min-heap of armed deadlines.
#[derive(Debug, Default)]
pub struct TimerQueue {
    heap: BinaryHeap<Reverse<(Instant, TaskId, Tag)>>,
}

impl TimerQueue {
    /// Create an empty timer queue.
    #[inline]
    pub fn new() -> Self {
        Self::default()
    }

    /// Arm a deadline for a dispatched task.
    #[inline]
    pub fn arm(
        &mut self,
        deadline: Instant,
        id: TaskId,
        tag: Tag,
    ) {
        self.heap.push(Reverse((deadline, id, tag)));
    }

    /// The earliest armed deadline.
    #[inline]
    pub fn next_deadline(&self) -> Option<Instant> {
        self.heap.peek().map(|Reverse((deadline, _, _))| *deadline)
    }

    /// Pop one deadline that has expired at `now`.
    pub fn pop_expired(
        &mut self,
        now: Instant,
    ) -> Option<(TaskId, Tag)> {
        match self.heap.peek() {
            Some(Reverse((deadline, _, _))) if *deadline <= now => self
                .heap
                .pop()
                .map(|Reverse((_, id, tag))| (id, tag)),
            _ => None,
        }
    }

    /// Number of armed deadlines, stale ones included.
    #[inline]
    pub fn len(&self) -> usize {
        self.heap.len()
    }

    /// Whether no deadline is armed.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }
}
