//! Per-class reorder queue for sequenced flows.

use std::collections::VecDeque;
use std::time::Instant;

use mockets_core::seq;
use mockets_core::Packet;

/// A queued packet, or a placeholder for one the sender cancelled.
pub(crate) struct Pending {
    pub tsn: u32,
    pub packet: Option<Packet<'static>>,
    pub arrived: Instant,
}

/// Outcome of [`SequencedQueue::insert`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Insert {
    Queued,
    /// Already delivered or already queued.
    Duplicate,
    /// `window` or more TSNs past the next expected one.
    OutOfWindow,
}

/// Packets of one sequenced class waiting for their turn, ordered by TSN.
///
/// Everything queued is at or after `next` and less than `window` past it,
/// so ordering by forward distance from `next` is ordering by TSN, across
/// wrap-around too.
pub(crate) struct SequencedQueue {
    next: u32,
    window: u32,
    entries: VecDeque<Pending>,
}

impl SequencedQueue {
    pub fn new(next: u32, window: u32) -> Self {
        Self {
            next,
            window: window.max(1),
            entries: VecDeque::new(),
        }
    }

    /// Whether `tsn` is inside the window starting at the next expected TSN.
    pub fn in_window(&self, tsn: u32) -> bool {
        seq::delta(tsn, self.next) < self.window
    }

    pub fn next_expected(&self) -> u32 {
        self.next
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Queue `packet` (None for a cancellation placeholder) under `tsn`.
    pub fn insert(&mut self, tsn: u32, packet: Option<Packet<'static>>, now: Instant) -> Insert {
        if seq::lt(tsn, self.next) {
            return Insert::Duplicate;
        }
        if !self.in_window(tsn) {
            return Insert::OutOfWindow;
        }
        let offset = seq::delta(tsn, self.next);
        match self
            .entries
            .binary_search_by_key(&offset, |e| seq::delta(e.tsn, self.next))
        {
            Ok(_) => Insert::Duplicate,
            Err(idx) => {
                self.entries.insert(
                    idx,
                    Pending {
                        tsn,
                        packet,
                        arrived: now,
                    },
                );
                Insert::Queued
            }
        }
    }

    pub fn head(&self) -> Option<&Pending> {
        self.entries.front()
    }

    /// Remove the head and move `next` past it, skipping any gap before it.
    pub fn pop(&mut self) -> Option<Pending> {
        let head = self.entries.pop_front()?;
        self.next = head.tsn.wrapping_add(1);
        Some(head)
    }

    /// Queued TSNs beyond the next expected one.
    pub fn queued_tsns(&self) -> impl Iterator<Item = u32> + '_ {
        self.entries.iter().map(|e| e.tsn)
    }

    /// Drop everything, returning how many real packets were discarded.
    pub fn clear(&mut self) -> usize {
        let n = self.entries.iter().filter(|e| e.packet.is_some()).count();
        self.entries.clear();
        n
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tsns(q: &SequencedQueue) -> Vec<u32> {
        q.queued_tsns().collect()
    }

    #[test]
    fn keeps_tsn_order_and_rejects_duplicates() {
        let now = Instant::now();
        let mut q = SequencedQueue::new(5, 64);
        assert_eq!(q.insert(7, None, now), Insert::Queued);
        assert_eq!(q.insert(5, None, now), Insert::Queued);
        assert_eq!(q.insert(6, None, now), Insert::Queued);
        assert_eq!(q.insert(6, None, now), Insert::Duplicate);
        assert_eq!(q.insert(4, None, now), Insert::Duplicate);
        assert_eq!(tsns(&q), vec![5, 6, 7]);
    }

    #[test]
    fn pop_advances_next_past_gaps() {
        let now = Instant::now();
        let mut q = SequencedQueue::new(1, 64);
        q.insert(4, None, now);
        assert_eq!(q.pop().unwrap().tsn, 4);
        assert_eq!(q.next_expected(), 5);
        assert_eq!(q.insert(3, None, now), Insert::Duplicate);
    }

    #[test]
    fn orders_across_wraparound() {
        let now = Instant::now();
        let mut q = SequencedQueue::new(u32::MAX - 1, 64);
        q.insert(1, None, now);
        q.insert(u32::MAX, None, now);
        q.insert(u32::MAX - 1, None, now);
        q.insert(0, None, now);
        assert_eq!(tsns(&q), vec![u32::MAX - 1, u32::MAX, 0, 1]);
    }

    #[test]
    fn far_future_tsns_are_refused() {
        let now = Instant::now();
        let mut q = SequencedQueue::new(100, 8);
        assert_eq!(q.insert(107, None, now), Insert::Queued);
        assert_eq!(q.insert(108, None, now), Insert::OutOfWindow);
        // just short of half the space ahead is still "after next"
        assert_eq!(q.insert(100u32.wrapping_add(i32::MAX as u32), None, now), Insert::OutOfWindow);
        assert_eq!(q.len(), 1);

        // the window slides with delivery
        q.insert(100, None, now);
        q.pop();
        assert_eq!(q.insert(108, None, now), Insert::Queued);
        assert_eq!(tsns(&q), vec![107, 108]);
    }
}
