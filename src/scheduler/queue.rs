//! Pending queue for the scheduler
//!
//! Tasks that cannot dispatch yet, whether blocked on a dependency or on
//! capacity, wait here in one sequence ordered by priority. Lower priority
//! values sit closer to the front. Among equal priorities entries keep
//! arrival order, except that a `lifo` entry goes ahead of all of them.

use std::collections::VecDeque;

/// Ordering hints of a queued entry.
pub trait Queued {
    /// Priority; lower values dequeue first.
    fn priority(&self) -> i32;

    /// Whether the entry goes ahead of existing equal-priority entries.
    fn is_lifo(&self) -> bool;
}

/// Priority-ordered queue of entries awaiting dispatch.
#[derive(Debug)]
pub struct PendingQueue<T> {
    entries: VecDeque<T>,
}

impl<T: Queued> PendingQueue<T> {
    /// Create a new empty queue.
    #[inline]
    pub fn new() -> Self {
        Self {
            entries: VecDeque::new(),
        }
    }

    /// Insert an entry at its ordered position. Returns that position.
    pub fn insert(
        &mut self,
        entry: T,
    ) -> usize {
        let priority = entry.priority();
        let lifo = entry.is_lifo();
        let position = self
            .entries
            .iter()
            .position(|queued| {
                priority < queued.priority() || (lifo && priority == queued.priority())
            })
            .unwrap_or(self.entries.len());
        self.entries.insert(position, entry);
        position
    }

    /// Index of the first entry, in queue order, matching `ready`.
    #[inline]
    pub fn position(
        &self,
        ready: impl FnMut(&T) -> bool,
    ) -> Option<usize> {
        self.entries.iter().position(ready)
    }

    /// Remove the entry at `index`.
    #[inline]
    pub fn remove(
        &mut self,
        index: usize,
    ) -> Option<T> {
        self.entries.remove(index)
    }

    /// Remove every entry matching `predicate`, preserving their order.
    pub fn drain_matching(
        &mut self,
        mut predicate: impl FnMut(&T) -> bool,
    ) -> Vec<T> {
        let mut removed = Vec::new();
        let mut kept = VecDeque::with_capacity(self.entries.len());
        for entry in self.entries.drain(..) {
            if predicate(&entry) {
                removed.push(entry);
            } else {
                kept.push_back(entry);
            }
        }
        self.entries = kept;
        removed
    }

    /// Pop the front entry.
    #[inline]
    pub fn pop_front(&mut self) -> Option<T> {
        self.entries.pop_front()
    }

    /// Peek at the front entry.
    #[inline]
    pub fn front(&self) -> Option<&T> {
        self.entries.front()
    }

    /// Iterate in queue order.
    #[inline]
    pub fn iter(&self) -> impl Iterator<Item = &T> {
        self.entries.iter()
    }

    /// Get the number of entries.
    #[inline]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Check if the queue is empty.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl<T: Queued> Default for PendingQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}
