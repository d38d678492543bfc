//! Fragment reassembly for unsequenced flows.
//!
//! Fragments of one message carry consecutive message ids, the first flagged
//! First and the last flagged Last. They may arrive in any order; a message
//! is complete once every id between its First and Last fragment is present.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use mockets_core::packet::FragmentPosition;
use mockets_core::Packet;

pub(crate) enum Reassembly {
    Duplicate,
    Pending,
    Complete(Vec<Packet<'static>>),
}

struct Fragment {
    packet: Packet<'static>,
    arrived: Instant,
}

pub(crate) struct UnsequencedFragments {
    fragments: HashMap<u32, Fragment>,
    /// Unreliable flows drop fragments that wait longer than this.
    expiry: Option<Duration>,
}

impl UnsequencedFragments {
    pub fn new(expiry: Option<Duration>) -> Self {
        Self {
            fragments: HashMap::new(),
            expiry,
        }
    }

    pub fn len(&self) -> usize {
        self.fragments.len()
    }

    pub fn insert(&mut self, packet: Packet<'static>, now: Instant) -> Reassembly {
        let id = packet.sequence_num();
        if self.fragments.contains_key(&id) {
            return Reassembly::Duplicate;
        }
        self.fragments.insert(
            id,
            Fragment {
                packet,
                arrived: now,
            },
        );
        match self.complete_run(id) {
            Some((first, count)) => {
                let packets = (0..count)
                    .filter_map(|i| self.fragments.remove(&first.wrapping_add(i)))
                    .map(|f| f.packet)
                    .collect();
                Reassembly::Complete(packets)
            }
            None => Reassembly::Pending,
        }
    }

    fn position(&self, id: u32) -> Option<FragmentPosition> {
        self.fragments.get(&id).and_then(|f| f.packet.fragment_position())
    }

    /// First id and length of the complete message containing `id`, if any.
    fn complete_run(&self, id: u32) -> Option<(u32, u32)> {
        let mut first = id;
        loop {
            match self.position(first)? {
                FragmentPosition::First => break,
                FragmentPosition::Last if first != id => return None,
                _ => first = first.wrapping_sub(1),
            }
            if first == id {
                return None;
            }
        }
        let mut last = id;
        loop {
            match self.position(last)? {
                FragmentPosition::Last => break,
                FragmentPosition::First if last != first => return None,
                _ => last = last.wrapping_add(1),
            }
            if last == first {
                return None;
            }
        }
        Some((first, last.wrapping_sub(first).wrapping_add(1)))
    }

    /// Drop fragments older than the expiry. Returns how many went.
    pub fn expire(&mut self, now: Instant) -> usize {
        let Some(expiry) = self.expiry else {
            return 0;
        };
        let before = self.fragments.len();
        self.fragments
            .retain(|_, f| now.saturating_duration_since(f.arrived) <= expiry);
        before - self.fragments.len()
    }

    pub fn clear(&mut self) -> usize {
        let n = self.fragments.len();
        self.fragments.clear();
        n
    }
}
