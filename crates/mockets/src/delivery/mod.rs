//! Delivery and reorder engine for one connection.
//!
//! The receive side of a connection hands every decoded packet to
//! [`DeliveryEngine::packet_arrived`]. The engine sorts packets into their
//! delivery class, holds sequenced packets until their turn (and until their
//! declared cross-class prerequisites are met), reassembles fragmented
//! messages, and queues finished messages for the application, which reads
//! them through [`DeliveryEngine::receive`] and friends.
//!
//! Unreliable-sequenced gaps are skipped once the head of the queue has
//! waited long enough; [`DeliveryEngine::poll`] applies those timeouts when
//! no packet arrives to trigger them.

mod sequenced;
mod tsn;
mod unsequenced;

pub use tsn::ReceivedTsnTracker;

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use mockets_core::config::DeliveryConfig;
use mockets_core::packet::{FragmentPosition, SAck, SequencedTsns, TsnBlock};
use mockets_core::queue::{BlockingQueue, Extract, QueuedItem, Wait};
use mockets_core::wire::{
    tsn_block, DEFAULT_REORDER_WINDOW, DEFAULT_UNRELIABLE_SEQUENCED_DELIVERY_TIMEOUT_MS,
};
use mockets_core::{seq, Chunk, DeliveryClass, InitialTsns, Packet};

use sequenced::{Insert, SequencedQueue};
use unsequenced::{Reassembly, UnsequencedFragments};

/// Gaps wait at most this many multiples of the delivery timeout.
const MAX_TIMEOUT_MULTIPLIER: u32 = 5;

// ── Settings ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy)]
pub struct DeliverySettings {
    pub unreliable_sequenced_timeout: Duration,
    pub unsequenced_fragment_expiry: Duration,
    /// TSNs past the next expected one a sequenced flow will hold.
    pub reorder_window: u32,
}

impl Default for DeliverySettings {
    fn default() -> Self {
        let timeout = Duration::from_millis(DEFAULT_UNRELIABLE_SEQUENCED_DELIVERY_TIMEOUT_MS);
        Self {
            unreliable_sequenced_timeout: timeout,
            unsequenced_fragment_expiry: timeout,
            reorder_window: DEFAULT_REORDER_WINDOW,
        }
    }
}

impl From<&DeliveryConfig> for DeliverySettings {
    fn from(c: &DeliveryConfig) -> Self {
        Self {
            unreliable_sequenced_timeout: c.unreliable_sequenced_timeout(),
            unsequenced_fragment_expiry: c.unsequenced_fragment_expiry(),
            reorder_window: c.effective_reorder_window(),
        }
    }
}

// ── Delivered messages ────────────────────────────────────────────────────────

/// One message ready for the application.
#[derive(Debug, Clone)]
pub enum DataBuffer {
    Single(Packet<'static>),
    Fragments {
        fragments: Vec<Packet<'static>>,
        message_size: usize,
    },
}

impl DataBuffer {
    fn packets(&self) -> &[Packet<'static>] {
        match self {
            DataBuffer::Single(p) => std::slice::from_ref(p),
            DataBuffer::Fragments { fragments, .. } => fragments,
        }
    }

    fn pieces(&self) -> impl Iterator<Item = &[u8]> + '_ {
        self.packets()
            .iter()
            .filter_map(|p| p.find_data())
            .map(|d| d.data)
    }

    pub fn message_size(&self) -> usize {
        match self {
            DataBuffer::Single(p) => p.find_data().map_or(0, |d| d.data.len()),
            DataBuffer::Fragments { message_size, .. } => *message_size,
        }
    }

    /// Application tag of the message (0 when untagged).
    pub fn tag(&self) -> u16 {
        self.packets()
            .first()
            .and_then(|p| p.find_data())
            .map_or(0, |d| d.tag)
    }

    pub fn delivery_class(&self) -> Option<DeliveryClass> {
        self.packets().first().map(Packet::delivery_class)
    }

    /// Copy the message into `buf`, truncating what does not fit.
    pub fn copy_into(&self, buf: &mut [u8]) -> usize {
        self.copy_into_vectored(&mut [buf])
    }

    /// Copy the message across `bufs` in order, truncating what does not fit.
    pub fn copy_into_vectored(&self, bufs: &mut [&mut [u8]]) -> usize {
        let mut targets = bufs.iter_mut().filter(|b| !b.is_empty());
        let Some(mut current) = targets.next() else {
            return 0;
        };
        let mut offset = 0;
        let mut total = 0;
        for mut piece in self.pieces() {
            while !piece.is_empty() {
                if offset == current.len() {
                    match targets.next() {
                        Some(next) => {
                            current = next;
                            offset = 0;
                        }
                        None => return total,
                    }
                }
                let n = piece.len().min(current.len() - offset);
                current[offset..offset + n].copy_from_slice(&piece[..n]);
                offset += n;
                total += n;
                piece = &piece[n..];
            }
        }
        total
    }

    pub fn to_vec(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.message_size());
        for piece in self.pieces() {
            out.extend_from_slice(piece);
        }
        out
    }
}

impl QueuedItem for DataBuffer {
    fn item_size(&self) -> usize {
        self.message_size()
    }
}

/// State-change chunks delivered in control order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlEvent {
    Shutdown,
    ShutdownAck,
    ShutdownComplete,
}

// ── Statistics ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MessageCounts {
    pub reliable_sequenced: u32,
    pub reliable_unsequenced: u32,
    pub unreliable_sequenced: u32,
    pub unreliable_unsequenced: u32,
}

impl MessageCounts {
    fn record(&mut self, class: DeliveryClass) {
        match class {
            DeliveryClass::Control | DeliveryClass::ReliableSequenced => {
                self.reliable_sequenced += 1
            }
            DeliveryClass::ReliableUnsequenced => self.reliable_unsequenced += 1,
            DeliveryClass::UnreliableSequenced => self.unreliable_sequenced += 1,
            DeliveryClass::UnreliableUnsequenced => self.unreliable_unsequenced += 1,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeliveryStats {
    pub received_bytes: u64,
    pub messages: MessageCounts,
    /// Tagged messages only.
    pub per_tag: HashMap<u16, MessageCounts>,
    pub duplicate_discards: u32,
    pub reassembly_skipped_discards: u32,
    pub unsatisfied_prerequisite_discards: u32,
    /// Sequenced packets or cancellations too far past the next expected TSN.
    pub out_of_window_discards: u32,
}

// ── Engine ────────────────────────────────────────────────────────────────────

/// Where finished work goes: the application queue, stats and events.
struct Output {
    stats: DeliveryStats,
    events: Vec<ControlEvent>,
}

impl Output {
    fn record_message(&mut self, class: DeliveryClass, tag: u16, size: usize) {
        self.stats.received_bytes += size as u64;
        self.stats.messages.record(class);
        if tag != 0 {
            self.stats.per_tag.entry(tag).or_default().record(class);
        }
    }

    fn deliver(&mut self, buffer: DataBuffer, ready: &BlockingQueue<DataBuffer>) {
        let class = buffer.delivery_class().unwrap_or(DeliveryClass::UnreliableUnsequenced);
        self.record_message(class, buffer.tag(), buffer.message_size());
        if ready.insert(buffer).is_err() {
            tracing::trace!("message arrived after close; dropped");
        }
    }

    /// Run the chunks of a whole packet: data goes to the application,
    /// state changes become events.
    fn process_packet(&mut self, packet: Packet<'static>, ready: &BlockingQueue<DataBuffer>) {
        let mut has_data = false;
        for chunk in packet.chunks() {
            match chunk {
                Ok(Chunk::Data(_)) => {
                    has_data = true;
                    break;
                }
                Ok(Chunk::Shutdown) => self.events.push(ControlEvent::Shutdown),
                Ok(Chunk::ShutdownAck) => self.events.push(ControlEvent::ShutdownAck),
                Ok(Chunk::ShutdownComplete) => self.events.push(ControlEvent::ShutdownComplete),
                Ok(other) => {
                    tracing::trace!(chunk_type = ?other.chunk_type(), "chunk ignored by delivery")
                }
                Err(e) => {
                    tracing::warn!(tsn = packet.sequence_num(), error = %e, "malformed chunk; rest of packet ignored");
                    break;
                }
            }
        }
        if has_data {
            self.deliver(DataBuffer::Single(packet), ready);
        }
    }

    fn deliver_fragments(&mut self, fragments: Vec<Packet<'static>>, ready: &BlockingQueue<DataBuffer>) {
        let message_size = fragments
            .iter()
            .filter_map(|p| p.find_data())
            .map(|d| d.data.len())
            .sum();
        tracing::trace!(
            first_tsn = fragments.first().map(Packet::sequence_num),
            count = fragments.len(),
            message_size,
            "reassembled message"
        );
        self.deliver(
            DataBuffer::Fragments {
                fragments,
                message_size,
            },
            ready,
        );
    }

    fn discard_fragments(&mut self, slot: &mut Option<Vec<Packet<'static>>>, reason: &'static str) {
        if let Some(old) = slot.take() {
            tracing::debug!(count = old.len(), reason, "discarded partial message");
            self.stats.reassembly_skipped_discards += old.len() as u32;
        }
    }

    /// Feed one in-order packet of a sequenced flow through reassembly.
    fn reassemble(
        &mut self,
        slot: &mut Option<Vec<Packet<'static>>>,
        packet: Packet<'static>,
        ready: &BlockingQueue<DataBuffer>,
    ) {
        let tsn = packet.sequence_num();
        match packet.fragment_position() {
            None => {
                self.discard_fragments(slot, "whole message interrupted fragments");
                self.process_packet(packet, ready);
            }
            Some(FragmentPosition::First) => {
                self.discard_fragments(slot, "new first fragment");
                *slot = Some(vec![packet]);
            }
            Some(FragmentPosition::Intermediate) => match slot {
                Some(list) => list.push(packet),
                None => self.orphan_fragment(tsn),
            },
            Some(FragmentPosition::Last) => match slot.take() {
                Some(mut list) => {
                    list.push(packet);
                    self.deliver_fragments(list, ready);
                }
                None => self.orphan_fragment(tsn),
            },
        }
    }

    fn orphan_fragment(&mut self, tsn: u32) {
        tracing::warn!(tsn, "fragment without a first fragment; dropped");
        self.stats.reassembly_skipped_discards += 1;
    }
}

struct EngineState {
    settings: DeliverySettings,
    control: SequencedQueue,
    reliable_sequenced: SequencedQueue,
    unreliable_sequenced: SequencedQueue,
    reliable_sequenced_fragments: Option<Vec<Packet<'static>>>,
    unreliable_sequenced_fragments: Option<Vec<Packet<'static>>>,
    reliable_unsequenced: UnsequencedFragments,
    unreliable_unsequenced: UnsequencedFragments,
    reliable_unsequenced_received: ReceivedTsnTracker,
    out: Output,
    closed: bool,
}

fn prerequisites_met(packet: &Packet<'_>, next: &SequencedTsns) -> bool {
    packet
        .delivery_prerequisites()
        .map_or(true, |p| p.satisfied_by(next))
}

impl EngineState {
    fn next_tsns(&self) -> SequencedTsns {
        SequencedTsns {
            control: self.control.next_expected(),
            reliable_sequenced: self.reliable_sequenced.next_expected(),
            unreliable_sequenced: self.unreliable_sequenced.next_expected(),
        }
    }

    fn queue_sequenced(&mut self, packet: Packet<'static>, now: Instant) {
        let tsn = packet.sequence_num();
        let class = packet.delivery_class();
        let queue = match class {
            DeliveryClass::Control => &mut self.control,
            DeliveryClass::ReliableSequenced => &mut self.reliable_sequenced,
            _ => &mut self.unreliable_sequenced,
        };
        match queue.insert(tsn, Some(packet), now) {
            Insert::Queued => {}
            Insert::Duplicate => {
                if class.is_reliable() {
                    self.out.stats.duplicate_discards += 1;
                }
                tracing::trace!(tsn, ?class, "old or duplicate packet dropped");
            }
            Insert::OutOfWindow => {
                self.out.stats.out_of_window_discards += 1;
                tracing::debug!(
                    tsn,
                    ?class,
                    next = queue.next_expected(),
                    "packet beyond the reorder window dropped"
                );
            }
        }
    }

    /// Apply cancelled TSN blocks. A block naming more TSNs than the reorder
    /// window holds is dropped whole; otherwise TSNs outside the window are
    /// skipped one by one.
    fn cancel(&mut self, blocks: &[TsnBlock], now: Instant) {
        let window = self.settings.reorder_window;
        for block in blocks {
            let count = block.count();
            if count > u64::from(window) {
                tracing::debug!(flow = block.flow, count, window, "oversized cancelled block dropped");
                self.out.stats.out_of_window_discards += 1;
                continue;
            }
            let flow = block.flow & tsn_block::FLOW_MASK;
            for tsn in block.tsns() {
                let outcome = match flow {
                    tsn_block::CANCELLED_RELIABLE_SEQUENCED => {
                        self.reliable_sequenced.insert(tsn, None, now)
                    }
                    tsn_block::CANCELLED_UNRELIABLE_SEQUENCED => {
                        self.unreliable_sequenced.insert(tsn, None, now)
                    }
                    tsn_block::CANCELLED_RELIABLE_UNSEQUENCED => {
                        let received = &mut self.reliable_unsequenced_received;
                        if seq::delta(tsn, received.cumulative_tsn()) > window {
                            Insert::OutOfWindow
                        } else {
                            received.add(tsn);
                            Insert::Queued
                        }
                    }
                    _ => {
                        tracing::debug!(flow, "cancelled block for unknown flow");
                        break;
                    }
                };
                if outcome == Insert::OutOfWindow {
                    tracing::trace!(tsn, flow, "cancellation beyond the reorder window ignored");
                }
            }
        }
    }

    fn process_reliable_unsequenced(
        &mut self,
        packet: Packet<'static>,
        now: Instant,
        ready: &BlockingQueue<DataBuffer>,
    ) {
        let id = packet.sequence_num();
        if self.reliable_unsequenced_received.already_received(id) {
            tracing::trace!(id, "duplicate reliable unsequenced packet");
            self.out.stats.duplicate_discards += 1;
            return;
        }
        if !packet.is_fragment() {
            self.reliable_unsequenced_received.add(id);
            self.out.process_packet(packet, ready);
            return;
        }
        match self.reliable_unsequenced.insert(packet, now) {
            Reassembly::Duplicate => self.out.stats.duplicate_discards += 1,
            Reassembly::Pending => {
                self.reliable_unsequenced_received.add(id);
            }
            Reassembly::Complete(fragments) => {
                self.reliable_unsequenced_received.add(id);
                self.out.deliver_fragments(fragments, ready);
            }
        }
    }

    fn process_unreliable_unsequenced(
        &mut self,
        packet: Packet<'static>,
        now: Instant,
        ready: &BlockingQueue<DataBuffer>,
    ) {
        if !packet.is_fragment() {
            self.out.process_packet(packet, ready);
            return;
        }
        match self.unreliable_unsequenced.insert(packet, now) {
            Reassembly::Duplicate => self.out.stats.duplicate_discards += 1,
            Reassembly::Pending => {}
            Reassembly::Complete(fragments) => self.out.deliver_fragments(fragments, ready),
        }
    }

    fn try_control(&mut self, ready: &BlockingQueue<DataBuffer>) -> bool {
        let next = self.next_tsns();
        let Some(head) = self.control.head() else {
            return false;
        };
        if head.tsn != next.control {
            return false;
        }
        if let Some(p) = &head.packet {
            if !prerequisites_met(p, &next) {
                return false;
            }
        }
        if let Some(head) = self.control.pop() {
            if let Some(packet) = head.packet {
                self.out.process_packet(packet, ready);
            }
        }
        true
    }

    fn try_reliable_sequenced(&mut self, ready: &BlockingQueue<DataBuffer>) -> bool {
        let next = self.next_tsns();
        let Some(head) = self.reliable_sequenced.head() else {
            return false;
        };
        if head.tsn != next.reliable_sequenced {
            return false;
        }
        if let Some(p) = &head.packet {
            if !prerequisites_met(p, &next) {
                return false;
            }
        }
        let Some(head) = self.reliable_sequenced.pop() else {
            return false;
        };
        match head.packet {
            None => {
                tracing::trace!(tsn = head.tsn, "skipping cancelled packet");
                self.out
                    .discard_fragments(&mut self.reliable_sequenced_fragments, "fragment cancelled");
            }
            Some(packet) => {
                self.out
                    .reassemble(&mut self.reliable_sequenced_fragments, packet, ready);
            }
        }
        true
    }

    fn try_unreliable_sequenced(&mut self, now: Instant, ready: &BlockingQueue<DataBuffer>) -> bool {
        let next = self.next_tsns();
        let timeout = self.settings.unreliable_sequenced_timeout;
        let Some(head) = self.unreliable_sequenced.head() else {
            return false;
        };
        let waited = now.saturating_duration_since(head.arrived);
        let expected = head.tsn == next.unreliable_sequenced;
        let missing = seq::delta(head.tsn, next.unreliable_sequenced);
        let skipping = !expected
            && waited > timeout * missing.saturating_add(1).min(MAX_TIMEOUT_MULTIPLIER);
        if !expected && !skipping {
            return false;
        }
        let blocked = head
            .packet
            .as_ref()
            .is_some_and(|p| !prerequisites_met(p, &next));
        if blocked && waited <= timeout {
            return false;
        }

        let Some(head) = self.unreliable_sequenced.pop() else {
            return false;
        };
        if skipping {
            tracing::debug!(
                tsn = head.tsn,
                missing,
                "unreliable sequenced delivery timed out; skipping gap"
            );
            self.out
                .discard_fragments(&mut self.unreliable_sequenced_fragments, "packets skipped");
        }
        let Some(packet) = head.packet else {
            self.out
                .discard_fragments(&mut self.unreliable_sequenced_fragments, "fragment cancelled");
            return true;
        };
        if blocked {
            tracing::debug!(tsn = head.tsn, "prerequisites never met; dropped");
            self.out.stats.unsatisfied_prerequisite_discards += 1;
            self.out
                .discard_fragments(&mut self.unreliable_sequenced_fragments, "packet dropped");
            return true;
        }
        if skipping
            && matches!(
                packet.fragment_position(),
                Some(FragmentPosition::Intermediate | FragmentPosition::Last)
            )
        {
            self.out.orphan_fragment(head.tsn);
            return true;
        }
        self.out
            .reassemble(&mut self.unreliable_sequenced_fragments, packet, ready);
        true
    }

    fn drain(&mut self, now: Instant, ready: &BlockingQueue<DataBuffer>) {
        loop {
            let mut progressed = self.try_control(ready);
            progressed |= self.try_reliable_sequenced(ready);
            progressed |= self.try_unreliable_sequenced(now, ready);
            if !progressed {
                break;
            }
        }
    }
}

/// Receive-side engine of one connection.
pub struct DeliveryEngine {
    state: Mutex<EngineState>,
    ready: BlockingQueue<DataBuffer>,
}

impl DeliveryEngine {
    /// Engine expecting the peer's first packets to carry `peer` TSNs.
    pub fn new(peer: &InitialTsns, settings: DeliverySettings) -> Self {
        Self {
            state: Mutex::new(EngineState {
                settings,
                control: SequencedQueue::new(peer.control, settings.reorder_window),
                reliable_sequenced: SequencedQueue::new(
                    peer.reliable_sequenced,
                    settings.reorder_window,
                ),
                unreliable_sequenced: SequencedQueue::new(
                    peer.unreliable_sequenced,
                    settings.reorder_window,
                ),
                reliable_sequenced_fragments: None,
                unreliable_sequenced_fragments: None,
                reliable_unsequenced: UnsequencedFragments::new(None),
                unreliable_unsequenced: UnsequencedFragments::new(Some(
                    settings.unsequenced_fragment_expiry,
                )),
                reliable_unsequenced_received: ReceivedTsnTracker::new(
                    peer.reliable_unsequenced_id,
                ),
                out: Output {
                    stats: DeliveryStats::default(),
                    events: Vec::new(),
                },
                closed: false,
            }),
            ready: BlockingQueue::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, EngineState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Take one received packet. Piggybacked Cancelled chunks are applied
    /// first; the rest of the packet is queued under its delivery class.
    pub fn packet_arrived(&self, packet: &Packet<'_>, now: Instant) {
        let mut st = self.lock();
        if st.closed {
            return;
        }
        for chunk in packet.chunks() {
            match chunk {
                Ok(Chunk::Cancelled(blocks)) => st.cancel(&blocks, now),
                Ok(_) => {}
                Err(e) => {
                    tracing::warn!(tsn = packet.sequence_num(), error = %e, "malformed chunk");
                    break;
                }
            }
        }

        let packet = packet.prepare_for_processing();
        if packet.chunks().next().is_some() {
            match packet.delivery_class() {
                DeliveryClass::Control
                | DeliveryClass::ReliableSequenced
                | DeliveryClass::UnreliableSequenced => st.queue_sequenced(packet, now),
                DeliveryClass::ReliableUnsequenced => {
                    st.process_reliable_unsequenced(packet, now, &self.ready)
                }
                DeliveryClass::UnreliableUnsequenced => {
                    st.process_unreliable_unsequenced(packet, now, &self.ready)
                }
            }
        }
        st.drain(now, &self.ready);
    }

    /// Apply delivery timeouts and expire stale unsequenced fragments.
    pub fn poll(&self, now: Instant) {
        let mut st = self.lock();
        if st.closed {
            return;
        }
        st.drain(now, &self.ready);
        let expired = st.unreliable_unsequenced.expire(now);
        if expired > 0 {
            tracing::debug!(count = expired, "expired unreliable unsequenced fragments");
            st.out.stats.reassembly_skipped_discards += expired as u32;
        }
    }

    /// Size of the next message, per the queue's wait semantics.
    pub fn next_message_size(&self, wait: Wait) -> Extract<usize> {
        self.ready.peek_with(wait, DataBuffer::message_size)
    }

    /// Copy the next message into `buf`; bytes beyond `buf.len()` are lost.
    pub fn receive(&self, buf: &mut [u8], wait: Wait) -> Extract<usize> {
        self.ready.extract(wait).map(|b| b.copy_into(buf))
    }

    /// Scatter the next message across `bufs`.
    pub fn receive_vectored(&self, bufs: &mut [&mut [u8]], wait: Wait) -> Extract<usize> {
        self.ready.extract(wait).map(|b| b.copy_into_vectored(bufs))
    }

    /// The next message itself.
    pub fn receive_buffer(&self, wait: Wait) -> Extract<DataBuffer> {
        self.ready.extract(wait)
    }

    pub fn cumulative_size_of_available_messages(&self) -> usize {
        self.ready.cumulative_size()
    }

    pub fn next_expected(&self) -> SequencedTsns {
        self.lock().next_tsns()
    }

    pub fn stats(&self) -> DeliveryStats {
        self.lock().out.stats.clone()
    }

    pub fn take_control_events(&self) -> Vec<ControlEvent> {
        std::mem::take(&mut self.lock().out.events)
    }

    /// Acknowledgement of everything received so far.
    pub fn sack(&self) -> SAck {
        let st = self.lock();
        let mut blocks = Vec::new();
        for (flow, queue) in [
            (tsn_block::SACK_CONTROL, &st.control),
            (tsn_block::SACK_RELIABLE_SEQUENCED, &st.reliable_sequenced),
        ] {
            let queued: Vec<u32> = queue.queued_tsns().collect();
            if !queued.is_empty() {
                blocks.push(TsnBlock::singles(flow, queued));
            }
        }
        blocks.extend(
            st.reliable_unsequenced_received
                .to_sack_block(tsn_block::SACK_RELIABLE_UNSEQUENCED),
        );
        SAck {
            control_cumulative_ack: st.control.next_expected().wrapping_sub(1),
            reliable_sequenced_cumulative_ack: st.reliable_sequenced.next_expected().wrapping_sub(1),
            reliable_unsequenced_cumulative_ack: st.reliable_unsequenced_received.cumulative_tsn(),
            bandwidth: None,
            blocks,
        }
    }

    /// Stop delivering. Partial messages are freed and counted; messages
    /// already queued stay readable, after which reads report closed.
    pub fn close(&self) {
        let mut st = self.lock();
        if !st.closed {
            st.closed = true;
            let EngineState {
                reliable_sequenced_fragments,
                unreliable_sequenced_fragments,
                out,
                ..
            } = &mut *st;
            out.discard_fragments(reliable_sequenced_fragments, "connection closed");
            out.discard_fragments(unreliable_sequenced_fragments, "connection closed");
            let pending = st.reliable_unsequenced.clear() + st.unreliable_unsequenced.clear();
            st.out.stats.reassembly_skipped_discards += pending as u32;
            let queued = st.control.clear() + st.reliable_sequenced.clear() + st.unreliable_sequenced.clear();
            tracing::debug!(queued, pending, "delivery engine closed");
        }
        drop(st);
        self.ready.close();
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MTU: usize = 1450;

    fn peer_tsns() -> InitialTsns {
        InitialTsns {
            control: 100,
            reliable_sequenced: 200,
            unreliable_sequenced: 300,
            reliable_unsequenced_id: 400,
            unreliable_unsequenced_id: 500,
        }
    }

    fn engine() -> DeliveryEngine {
        DeliveryEngine::new(
            &peer_tsns(),
            DeliverySettings {
                unreliable_sequenced_timeout: Duration::from_millis(100),
                unsequenced_fragment_expiry: Duration::from_millis(100),
                reorder_window: 64,
            },
        )
    }

    struct Shape<'a> {
        class: DeliveryClass,
        tsn: u32,
        data: &'a [u8],
        fragment: Option<FragmentPosition>,
        prerequisites: Option<SequencedTsns>,
    }

    fn shape(class: DeliveryClass, tsn: u32, data: &[u8]) -> Shape<'_> {
        Shape {
            class,
            tsn,
            data,
            fragment: None,
            prerequisites: None,
        }
    }

    fn build(s: Shape<'_>) -> Packet<'static> {
        let mut p = Packet::new(MTU).unwrap();
        p.set_delivery_class(s.class).unwrap();
        p.set_sequence_num(s.tsn).unwrap();
        p.set_fragment(s.fragment).unwrap();
        if let Some(tsns) = s.prerequisites {
            p.allocate_delivery_prerequisites().unwrap();
            p.set_delivery_prerequisites(&tsns).unwrap();
        }
        p.add_data_chunk(0, s.data).unwrap();
        Packet::parse_owned(p.as_bytes().to_vec()).unwrap()
    }

    fn data(class: DeliveryClass, tsn: u32, payload: &[u8]) -> Packet<'static> {
        build(shape(class, tsn, payload))
    }

    fn fragment(class: DeliveryClass, tsn: u32, payload: &[u8], pos: FragmentPosition) -> Packet<'static> {
        build(Shape {
            fragment: Some(pos),
            ..shape(class, tsn, payload)
        })
    }

    fn cancelled(blocks: Vec<TsnBlock>) -> Packet<'static> {
        let mut p = Packet::new(MTU).unwrap();
        p.set_delivery_class(DeliveryClass::UnreliableUnsequenced).unwrap();
        p.add_chunk(&Chunk::Cancelled(blocks)).unwrap();
        Packet::parse_owned(p.as_bytes().to_vec()).unwrap()
    }

    fn drain_messages(e: &DeliveryEngine) -> Vec<Vec<u8>> {
        let mut out = Vec::new();
        while let Extract::Item(b) = e.receive_buffer(Wait::NoWait) {
            out.push(b.to_vec());
        }
        out
    }

    #[test]
    fn reliable_sequenced_is_released_in_order() {
        use DeliveryClass::ReliableSequenced as RS;
        let e = engine();
        let now = Instant::now();
        e.packet_arrived(&data(RS, 202, b"c"), now);
        e.packet_arrived(&data(RS, 201, b"b"), now);
        assert_eq!(e.next_message_size(Wait::NoWait), Extract::TimedOut);
        e.packet_arrived(&data(RS, 200, b"a"), now);
        assert_eq!(drain_messages(&e), vec![b"a".to_vec(), b"b".to_vec(), b"c".to_vec()]);
        assert_eq!(e.next_expected().reliable_sequenced, 203);
    }

    #[test]
    fn duplicates_are_counted_not_delivered() {
        use DeliveryClass::ReliableSequenced as RS;
        let e = engine();
        let now = Instant::now();
        e.packet_arrived(&data(RS, 200, b"a"), now);
        e.packet_arrived(&data(RS, 200, b"a"), now);
        e.packet_arrived(&data(DeliveryClass::ReliableUnsequenced, 400, b"u"), now);
        e.packet_arrived(&data(DeliveryClass::ReliableUnsequenced, 400, b"u"), now);
        assert_eq!(drain_messages(&e).len(), 2);
        assert_eq!(e.stats().duplicate_discards, 2);
    }

    #[test]
    fn prerequisites_hold_back_delivery() {
        let e = engine();
        let now = Instant::now();
        // reliable sequenced packet that needs control TSN 100 delivered first
        let gated = build(Shape {
            prerequisites: Some(SequencedTsns {
                control: 101,
                reliable_sequenced: 0,
                unreliable_sequenced: 300,
            }),
            ..shape(DeliveryClass::ReliableSequenced, 200, b"after control")
        });
        e.packet_arrived(&gated, now);
        assert_eq!(e.next_message_size(Wait::NoWait), Extract::TimedOut);

        e.packet_arrived(&data(DeliveryClass::Control, 100, b"control"), now);
        assert_eq!(
            drain_messages(&e),
            vec![b"control".to_vec(), b"after control".to_vec()]
        );
    }

    #[test]
    fn single_missing_packet_waits_twice_the_timeout() {
        use DeliveryClass::UnreliableSequenced as US;
        let e = engine();
        let start = Instant::now();
        e.packet_arrived(&data(US, 301, b"next"), start);
        e.poll(start + Duration::from_millis(150));
        assert!(drain_messages(&e).is_empty());
        e.poll(start + Duration::from_millis(210));
        assert_eq!(drain_messages(&e), vec![b"next".to_vec()]);
    }

    #[test]
    fn long_gaps_wait_at_most_five_timeouts() {
        use DeliveryClass::UnreliableSequenced as US;
        let e = engine();
        let start = Instant::now();
        e.packet_arrived(&data(US, 340, b"far"), start);
        e.poll(start + Duration::from_millis(450));
        assert!(drain_messages(&e).is_empty());
        e.poll(start + Duration::from_millis(510));
        assert_eq!(drain_messages(&e), vec![b"far".to_vec()]);
    }

    #[test]
    fn unreliable_gap_is_skipped_after_timeout() {
        use DeliveryClass::UnreliableSequenced as US;
        let e = engine();
        let start = Instant::now();
        e.packet_arrived(&data(US, 302, b"late"), start);
        e.poll(start + Duration::from_millis(250));
        assert!(drain_messages(&e).is_empty(), "two missing packets wait 3x the timeout");

        e.poll(start + Duration::from_millis(350));
        assert_eq!(drain_messages(&e), vec![b"late".to_vec()]);
        assert_eq!(e.next_expected().unreliable_sequenced, 303);

        // an older packet arriving now is stale
        e.packet_arrived(&data(US, 300, b"stale"), start + Duration::from_millis(360));
        assert!(drain_messages(&e).is_empty());
    }

    #[test]
    fn sequenced_fragments_reassemble() {
        use DeliveryClass::ReliableSequenced as RS;
        use FragmentPosition::*;
        let e = engine();
        let now = Instant::now();
        e.packet_arrived(&fragment(RS, 202, b"ghi", Last), now);
        e.packet_arrived(&fragment(RS, 200, b"abc", First), now);
        e.packet_arrived(&fragment(RS, 201, b"def", Intermediate), now);

        assert_eq!(e.next_message_size(Wait::NoWait), Extract::Item(9));
        assert_eq!(e.cumulative_size_of_available_messages(), 9);
        let mut first = [0u8; 4];
        let mut second = [0u8; 16];
        let n = e.receive_vectored(&mut [&mut first, &mut second], Wait::NoWait);
        assert_eq!(n, Extract::Item(9));
        assert_eq!(&first, b"abcd");
        assert_eq!(&second[..5], b"efghi");
    }

    #[test]
    fn receive_truncates_to_buffer() {
        let e = engine();
        e.packet_arrived(&data(DeliveryClass::UnreliableUnsequenced, 1, b"0123456789"), Instant::now());
        let mut buf = [0u8; 4];
        assert_eq!(e.receive(&mut buf, Wait::NoWait), Extract::Item(4));
        assert_eq!(&buf, b"0123");
        assert_eq!(e.next_message_size(Wait::NoWait), Extract::TimedOut);
    }

    #[test]
    fn cancelled_placeholder_breaks_partial_message() {
        use DeliveryClass::ReliableSequenced as RS;
        let e = engine();
        let now = Instant::now();
        e.packet_arrived(&fragment(RS, 200, b"part", FragmentPosition::First), now);

        e.packet_arrived(
            &cancelled(vec![TsnBlock::singles(tsn_block::CANCELLED_RELIABLE_SEQUENCED, vec![201])]),
            now,
        );

        e.packet_arrived(&data(RS, 202, b"whole"), now);
        assert_eq!(drain_messages(&e), vec![b"whole".to_vec()]);
        assert_eq!(e.stats().reassembly_skipped_discards, 1);
    }

    #[test]
    fn unsequenced_fragments_reassemble_in_any_order() {
        use DeliveryClass::ReliableUnsequenced as RU;
        use FragmentPosition::*;
        let e = engine();
        let now = Instant::now();
        e.packet_arrived(&fragment(RU, 401, b"-world", Last), now);
        e.packet_arrived(&fragment(RU, 400, b"hello", First), now);
        assert_eq!(drain_messages(&e), vec![b"hello-world".to_vec()]);
        // a retransmitted fragment is recognised
        e.packet_arrived(&fragment(RU, 400, b"hello", First), now);
        assert_eq!(e.stats().duplicate_discards, 1);
    }

    #[test]
    fn stale_unreliable_fragments_expire_on_poll() {
        let e = engine();
        let start = Instant::now();
        e.packet_arrived(
            &fragment(DeliveryClass::UnreliableUnsequenced, 1, b"x", FragmentPosition::First),
            start,
        );
        e.poll(start + Duration::from_millis(200));
        assert_eq!(e.stats().reassembly_skipped_discards, 1);
    }

    #[test]
    fn control_chunks_become_events() {
        let e = engine();
        let mut p = Packet::new(MTU).unwrap();
        p.set_delivery_class(DeliveryClass::Control).unwrap();
        p.set_sequence_num(100).unwrap();
        p.add_chunk(&Chunk::Shutdown).unwrap();
        e.packet_arrived(&Packet::parse_owned(p.as_bytes().to_vec()).unwrap(), Instant::now());
        assert_eq!(e.take_control_events(), vec![ControlEvent::Shutdown]);
        assert!(e.take_control_events().is_empty());
    }

    #[test]
    fn sack_reports_gaps() {
        use DeliveryClass::ReliableSequenced as RS;
        let e = engine();
        let now = Instant::now();
        e.packet_arrived(&data(RS, 200, b"a"), now);
        e.packet_arrived(&data(RS, 203, b"d"), now);
        let sack = e.sack();
        assert_eq!(sack.reliable_sequenced_cumulative_ack, 200);
        assert_eq!(sack.control_cumulative_ack, 99);
        assert_eq!(sack.reliable_unsequenced_cumulative_ack, 399);
        assert_eq!(sack.blocks.len(), 1);
        assert_eq!(sack.blocks[0].tsns().collect::<Vec<_>>(), vec![203]);
    }

    #[test]
    fn close_frees_partials_and_reports_closed() {
        let e = engine();
        let now = Instant::now();
        e.packet_arrived(&data(DeliveryClass::UnreliableUnsequenced, 1, b"kept"), now);
        e.packet_arrived(
            &fragment(DeliveryClass::ReliableSequenced, 200, b"half", FragmentPosition::First),
            now,
        );
        e.close();
        assert_eq!(e.stats().reassembly_skipped_discards, 1);
        assert_eq!(e.next_message_size(Wait::Forever), Extract::Item(4));
        assert_eq!(drain_messages(&e), vec![b"kept".to_vec()]);
        assert_eq!(e.next_message_size(Wait::Forever).as_code(), 0);
    }

    #[test]
    fn stats_count_by_class_and_tag() {
        let e = engine();
        let mut p = Packet::new(MTU).unwrap();
        p.set_delivery_class(DeliveryClass::ReliableUnsequenced).unwrap();
        p.set_sequence_num(400).unwrap();
        p.add_data_chunk(9, b"tagged").unwrap();
        e.packet_arrived(&Packet::parse_owned(p.as_bytes().to_vec()).unwrap(), Instant::now());

        let stats = e.stats();
        assert_eq!(stats.received_bytes, 6);
        assert_eq!(stats.messages.reliable_unsequenced, 1);
        assert_eq!(stats.per_tag[&9].reliable_unsequenced, 1);
        let msg = e.receive_buffer(Wait::NoWait).item().unwrap();
        assert_eq!(msg.tag(), 9);
    }

    #[test]
    fn packets_beyond_the_reorder_window_are_dropped() {
        use DeliveryClass::ReliableSequenced as RS;
        let e = engine();
        let now = Instant::now();
        e.packet_arrived(&data(RS, 263, b"last slot"), now);
        e.packet_arrived(&data(RS, 264, b"too far"), now);
        e.packet_arrived(&data(RS, 200u32.wrapping_add(i32::MAX as u32), b"way too far"), now);
        assert_eq!(e.stats().out_of_window_discards, 2);
        assert_eq!(e.sack().blocks[0].tsns().collect::<Vec<_>>(), vec![263]);

        e.packet_arrived(&data(RS, 200, b"first"), now);
        assert_eq!(drain_messages(&e), vec![b"first".to_vec()]);
        assert_eq!(e.next_expected().reliable_sequenced, 201);
    }

    #[test]
    fn huge_cancelled_ranges_are_not_expanded() {
        use DeliveryClass::ReliableSequenced as RS;
        let e = engine();
        let now = Instant::now();
        let huge = TsnBlock::ranges(
            tsn_block::CANCELLED_RELIABLE_SEQUENCED,
            vec![(200, 200u32.wrapping_add(i32::MAX as u32))],
        );
        e.packet_arrived(&cancelled(vec![huge]), now);
        assert_eq!(e.stats().out_of_window_discards, 1);

        // a range straddling the window edge only fills what fits
        let edge = TsnBlock::ranges(tsn_block::CANCELLED_RELIABLE_SEQUENCED, vec![(250, 270)]);
        e.packet_arrived(&cancelled(vec![edge]), now);
        assert_eq!(e.sack().blocks[0].tsns().count(), 14);

        e.packet_arrived(&data(RS, 200, b"still flowing"), now);
        assert_eq!(drain_messages(&e), vec![b"still flowing".to_vec()]);
    }

    #[test]
    fn reversed_cancelled_range_is_ignored() {
        use DeliveryClass::ReliableSequenced as RS;
        let e = engine();
        let now = Instant::now();
        let reversed = TsnBlock::ranges(tsn_block::CANCELLED_RELIABLE_SEQUENCED, vec![(205, 201)]);
        e.packet_arrived(&cancelled(vec![reversed]), now);
        assert!(e.sack().blocks.is_empty());

        e.packet_arrived(&data(RS, 200, b"a"), now);
        e.packet_arrived(&data(RS, 201, b"b"), now);
        assert_eq!(drain_messages(&e), vec![b"a".to_vec(), b"b".to_vec()]);
    }
}
