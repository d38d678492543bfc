//! Record of which TSNs of one flow have been received.
//!
//! Kept as a cumulative TSN (everything at or before it has arrived) plus
//! disjoint inclusive ranges beyond it, merged as gaps fill.

use mockets_core::packet::TsnBlock;
use mockets_core::seq;

#[derive(Debug, Clone)]
pub struct ReceivedTsnTracker {
    cumulative: u32,
    /// Sorted in sequence order, all strictly after `cumulative + 1`.
    ranges: Vec<(u32, u32)>,
}

impl ReceivedTsnTracker {
    /// Tracker whose first expected TSN is `next`.
    pub fn new(next: u32) -> Self {
        Self {
            cumulative: next.wrapping_sub(1),
            ranges: Vec::new(),
        }
    }

    pub fn cumulative_tsn(&self) -> u32 {
        self.cumulative
    }

    pub fn ranges(&self) -> &[(u32, u32)] {
        &self.ranges
    }

    pub fn already_received(&self, tsn: u32) -> bool {
        seq::le(tsn, self.cumulative)
            || self
                .ranges
                .iter()
                .any(|&(start, end)| seq::ge(tsn, start) && seq::le(tsn, end))
    }

    /// Record `tsn`. Returns false when it had already been recorded.
    pub fn add(&mut self, tsn: u32) -> bool {
        if self.already_received(tsn) {
            return false;
        }
        if tsn == self.cumulative.wrapping_add(1) {
            self.cumulative = tsn;
            if let Some(&(start, end)) = self.ranges.first() {
                if start == self.cumulative.wrapping_add(1) {
                    self.cumulative = end;
                    self.ranges.remove(0);
                }
            }
            return true;
        }

        let idx = self
            .ranges
            .iter()
            .position(|&(start, _)| seq::lt(tsn, start))
            .unwrap_or(self.ranges.len());
        let joins_prev = idx > 0 && self.ranges[idx - 1].1.wrapping_add(1) == tsn;
        let joins_next = idx < self.ranges.len() && tsn.wrapping_add(1) == self.ranges[idx].0;
        match (joins_prev, joins_next) {
            (true, true) => {
                self.ranges[idx - 1].1 = self.ranges[idx].1;
                self.ranges.remove(idx);
            }
            (true, false) => self.ranges[idx - 1].1 = tsn,
            (false, true) => self.ranges[idx].0 = tsn,
            (false, false) => self.ranges.insert(idx, (tsn, tsn)),
        }
        true
    }

    /// Ranges received beyond the cumulative TSN, as a SAck block.
    pub fn to_sack_block(&self, flow: u8) -> Option<TsnBlock> {
        if self.ranges.is_empty() {
            return None;
        }
        Some(TsnBlock::ranges(flow, self.ranges.clone()))
    }
}
