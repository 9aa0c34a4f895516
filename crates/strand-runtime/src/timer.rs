//! Timer heap keyed by absolute deadline
//!
//! Min-heap over (deadline, fiber, wait sequence). Cancellation is lazy:
//! nothing is removed when a wait concludes early. Instead every entry
//! carries the fiber's wait sequence number from the moment it was
//! created, and the scheduler discards entries whose sequence no longer
//! matches the fiber's current one.
//!
//! # Complexity
//!
//! - Insert: O(log n)
//! - Cancel: O(1) (sequence bump elsewhere)
//! - Pop expired: O(log n) each
//! - Next deadline: O(1)

use std::collections::BinaryHeap;
use strand_core::FiberId;

/// One pending deadline
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimerEntry {
    /// Absolute deadline in monotonic ms
    pub deadline: i64,
    pub fiber: FiberId,
    /// Wait sequence of the fiber when this entry was created
    pub seq: u64,
}

/// Wrapper for heap ordering (min-heap by deadline)
struct HeapEntry(TimerEntry);

impl PartialEq for HeapEntry {
    fn eq(&self, other: &Self) -> bool {
        self.0.deadline == other.0.deadline && self.0.fiber == other.0.fiber
    }
}

impl Eq for HeapEntry {}

impl PartialOrd for HeapEntry {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for HeapEntry {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        // Reverse ordering for min-heap (earliest deadline first).
        // Tie-break by fiber id for deterministic ordering.
        match other.0.deadline.cmp(&self.0.deadline) {
            std::cmp::Ordering::Equal => other.0.fiber.raw().cmp(&self.0.fiber.raw()),
            ord => ord,
        }
    }
}

/// Min-heap of pending deadlines
pub struct TimerHeap {
    heap: BinaryHeap<HeapEntry>,
}

impl TimerHeap {
    pub fn new() -> Self {
        Self {
            heap: BinaryHeap::with_capacity(64),
        }
    }

    pub fn insert(&mut self, deadline: i64, fiber: FiberId, seq: u64) {
        self.heap.push(HeapEntry(TimerEntry {
            deadline,
            fiber,
            seq,
        }));
    }

    /// Earliest pending deadline, if any
    ///
    /// May report a deadline belonging to a stale entry; the poll loop
    /// tolerates the resulting early wakeup.
    #[inline]
    pub fn next_deadline(&self) -> Option<i64> {
        self.heap.peek().map(|e| e.0.deadline)
    }

    /// Pop the earliest entry whose deadline has passed
    pub fn pop_expired(&mut self, now: i64) -> Option<TimerEntry> {
        match self.heap.peek() {
            Some(e) if e.0.deadline <= now => self.heap.pop().map(|e| e.0),
            _ => None,
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.heap.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }
}

impl Default for TimerHeap {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ordering() {
        let mut heap = TimerHeap::new();
        heap.insert(30, FiberId::from_parts(3, 0), 1);
        heap.insert(10, FiberId::from_parts(1, 0), 1);
        heap.insert(20, FiberId::from_parts(2, 0), 1);

        assert_eq!(heap.next_deadline(), Some(10));

        let mut fired = Vec::new();
        while let Some(e) = heap.pop_expired(50) {
            fired.push(e.fiber.raw());
        }
        assert_eq!(fired, vec![1, 2, 3]);
    }

    #[test]
    fn test_not_yet_expired() {
        let mut heap = TimerHeap::new();
        heap.insert(100, FiberId::from_parts(1, 0), 1);
        assert!(heap.pop_expired(99).is_none());
        assert_eq!(heap.len(), 1);
        assert!(heap.pop_expired(100).is_some());
        assert!(heap.is_empty());
    }

    #[test]
    fn test_tie_break_deterministic() {
        let mut heap = TimerHeap::new();
        heap.insert(10, FiberId::from_parts(9, 0), 1);
        heap.insert(10, FiberId::from_parts(4, 0), 1);
        assert_eq!(heap.pop_expired(10).unwrap().fiber.raw(), 4);
        assert_eq!(heap.pop_expired(10).unwrap().fiber.raw(), 9);
    }

    #[test]
    fn test_stale_entries_carry_seq() {
        let mut heap = TimerHeap::new();
        heap.insert(5, FiberId::from_parts(1, 0), 7);
        let e = heap.pop_expired(10).unwrap();
        assert_eq!(e.seq, 7);
    }
}
