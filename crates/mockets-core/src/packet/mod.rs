//! Packet codec.
//!
//! A [`Packet`] is either built for sending (write mode, owned buffer bounded
//! by an MTU) or parsed from a received datagram (read mode, usually borrowing
//! the receive buffer). Chunks are appended in write mode and walked with an
//! internal cursor in read mode.
//!
//! Layout: header (14 bytes), optional delivery-prerequisite block (8 bytes),
//! then zero or more chunks. Primary chunks come first; once a piggyback
//! chunk (SAck, Cancelled, Timestamp, ...) is present no primary chunk may
//! follow. A packet carries at most one Data chunk.

mod chunk;

pub use chunk::{BandwidthEstimate, Chunk, DataChunk, SAck, TsnBlock, TsnEntries};

use std::borrow::Cow;
use std::fmt;

use zerocopy::{AsBytes, FromBytes, FromZeroes};

use crate::wire::{
    flags, ChunkHeader, ChunkType, PacketHeader, PrerequisiteBlock, WireError,
    CHUNK_HEADER_SIZE, MAXIMUM_MTU, PACKET_HEADER_SIZE, PREREQUISITE_BLOCK_SIZE,
};

// ── Errors ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PacketError {
    #[error("packet is read-only")]
    ReadOnly,

    #[error("cannot add {0:?} after a piggyback chunk")]
    PiggybackOrder(ChunkType),

    #[error("packet already carries a data chunk")]
    DuplicateData,

    #[error("insufficient space: chunk needs {needed} bytes, {available} available")]
    InsufficientSpace { needed: usize, available: usize },

    #[error("chunk of {0} bytes does not fit the 16-bit size field")]
    ChunkTooLarge(usize),

    #[error("MTU {0} outside {min}..={max}", min = PACKET_HEADER_SIZE + CHUNK_HEADER_SIZE, max = MAXIMUM_MTU)]
    InvalidMtu(usize),

    #[error("packet of {0} bytes is shorter than its header")]
    TooShort(usize),

    #[error("chunk at offset {offset} is truncated or declares a bad size")]
    BadChunkSize { offset: usize },

    #[error("{chunk_type:?} chunk of {size} bytes is shorter than its layout")]
    ChunkTooShort { chunk_type: ChunkType, size: usize },

    #[error("malformed {0:?} chunk")]
    Malformed(ChunkType),

    #[error("no chunk at the cursor")]
    NoChunk,

    #[error("expected {expected:?} chunk, found {found:?}")]
    UnexpectedChunk {
        expected: ChunkType,
        found: ChunkType,
    },

    #[error("delivery prerequisites must be allocated before any chunk")]
    PrerequisitesAfterChunks,

    #[error("delivery prerequisites not allocated")]
    PrerequisitesMissing,

    #[error("{0:?} packets carry no delivery prerequisites")]
    NoPrerequisites(DeliveryClass),

    #[error(transparent)]
    Wire(#[from] WireError),
}

// ── Delivery Classes ─────────────────────────────────────────────────────────

/// Delivery class of a packet, derived from its header flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeliveryClass {
    Control,
    ReliableSequenced,
    UnreliableSequenced,
    ReliableUnsequenced,
    UnreliableUnsequenced,
}

impl DeliveryClass {
    pub fn from_flags(f: u16) -> Self {
        let reliable = f & flags::RELIABLE != 0;
        let sequenced = f & flags::SEQUENCED != 0;
        if f & flags::CONTROL != 0 {
            DeliveryClass::Control
        } else {
            match (reliable, sequenced) {
                (true, true) => DeliveryClass::ReliableSequenced,
                (false, true) => DeliveryClass::UnreliableSequenced,
                (true, false) => DeliveryClass::ReliableUnsequenced,
                (false, false) => DeliveryClass::UnreliableUnsequenced,
            }
        }
    }

    fn flags(self) -> u16 {
        match self {
            DeliveryClass::Control => flags::CONTROL | flags::RELIABLE | flags::SEQUENCED,
            DeliveryClass::ReliableSequenced => flags::RELIABLE | flags::SEQUENCED,
            DeliveryClass::UnreliableSequenced => flags::SEQUENCED,
            DeliveryClass::ReliableUnsequenced => flags::RELIABLE,
            DeliveryClass::UnreliableUnsequenced => 0,
        }
    }

    pub fn is_reliable(self) -> bool {
        !matches!(
            self,
            DeliveryClass::UnreliableSequenced | DeliveryClass::UnreliableUnsequenced
        )
    }

    pub fn is_sequenced(self) -> bool {
        matches!(
            self,
            DeliveryClass::Control
                | DeliveryClass::ReliableSequenced
                | DeliveryClass::UnreliableSequenced
        )
    }

    /// The two foreign classes whose TSNs a packet of this class declares as
    /// prerequisites, in wire order. Unsequenced classes carry none.
    pub fn prerequisite_classes(self) -> Option<[DeliveryClass; 2]> {
        use DeliveryClass::*;
        match self {
            Control => Some([ReliableSequenced, UnreliableSequenced]),
            ReliableSequenced => Some([Control, UnreliableSequenced]),
            UnreliableSequenced => Some([Control, ReliableSequenced]),
            ReliableUnsequenced | UnreliableUnsequenced => None,
        }
    }
}

/// Next TSN per sequenced class, as known to the sender when stamping a
/// packet or to the receiver when checking one.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SequencedTsns {
    pub control: u32,
    pub reliable_sequenced: u32,
    pub unreliable_sequenced: u32,
}

impl SequencedTsns {
    pub fn get(&self, class: DeliveryClass) -> Option<u32> {
        match class {
            DeliveryClass::Control => Some(self.control),
            DeliveryClass::ReliableSequenced => Some(self.reliable_sequenced),
            DeliveryClass::UnreliableSequenced => Some(self.unreliable_sequenced),
            _ => None,
        }
    }
}

/// Decoded prerequisite block: (class, TSN) pairs that must have been
/// delivered before the packet may be.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeliveryPrerequisites(pub [(DeliveryClass, u32); 2]);

impl DeliveryPrerequisites {
    pub fn get(&self, class: DeliveryClass) -> Option<u32> {
        self.0.iter().find(|(c, _)| *c == class).map(|(_, tsn)| *tsn)
    }

    /// True when every declared TSN is at or before the receiver's next
    /// expected TSN for that class.
    pub fn satisfied_by(&self, next: &SequencedTsns) -> bool {
        self.0.iter().all(|&(class, tsn)| match next.get(class) {
            Some(n) => crate::seq::le(tsn, n),
            None => true,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FragmentPosition {
    First,
    Intermediate,
    Last,
}

impl FragmentPosition {
    fn flag(self) -> u16 {
        match self {
            FragmentPosition::First => flags::FIRST_FRAGMENT,
            FragmentPosition::Intermediate => flags::INTERMEDIATE_FRAGMENT,
            FragmentPosition::Last => flags::LAST_FRAGMENT,
        }
    }
}

// ── Packet ───────────────────────────────────────────────────────────────────

#[derive(Clone)]
pub struct Packet<'a> {
    buf: Cow<'a, [u8]>,
    writable: bool,
    mtu: usize,
    /// Offset of the first chunk (after header and prerequisite block).
    chunks_start: usize,
    has_data: bool,
    /// Offset of the first piggyback chunk, if any.
    piggyback_start: Option<usize>,
    cursor: usize,
}

impl Packet<'static> {
    /// Empty packet in write mode: protocol version and message flags set,
    /// no chunks.
    pub fn new(mtu: usize) -> Result<Self, PacketError> {
        if !(PACKET_HEADER_SIZE + CHUNK_HEADER_SIZE..=MAXIMUM_MTU).contains(&mtu) {
            return Err(PacketError::InvalidMtu(mtu));
        }
        let mut header = PacketHeader::new_zeroed();
        header
            .flags
            .set(flags::PROTOCOL_VERSION | flags::MESSAGE_PACKET);
        let mut buf = Vec::with_capacity(mtu);
        buf.extend_from_slice(header.as_bytes());
        Ok(Self {
            buf: Cow::Owned(buf),
            writable: true,
            mtu,
            chunks_start: PACKET_HEADER_SIZE,
            has_data: false,
            piggyback_start: None,
            cursor: PACKET_HEADER_SIZE,
        })
    }

    /// Same as [`Packet::parse`] but takes ownership of the bytes.
    pub fn parse_owned(bytes: Vec<u8>) -> Result<Self, PacketError> {
        Packet::parse_cow(Cow::Owned(bytes))
    }
}

impl<'a> Packet<'a> {
    /// Wrap a received datagram in read mode.
    pub fn parse(bytes: &'a [u8]) -> Result<Self, PacketError> {
        Self::parse_cow(Cow::Borrowed(bytes))
    }

    fn parse_cow(buf: Cow<'a, [u8]>) -> Result<Self, PacketError> {
        let header = PacketHeader::read_from_prefix(&buf[..]).ok_or(PacketError::TooShort(buf.len()))?;
        let f = header.flags.get();
        if f & flags::PROTOCOL_VERSION == 0 {
            return Err(WireError::UnknownVersion(f).into());
        }
        let chunks_start = if f & flags::DELIVERY_PREREQUISITES != 0 {
            PACKET_HEADER_SIZE + PREREQUISITE_BLOCK_SIZE
        } else {
            PACKET_HEADER_SIZE
        };
        if buf.len() < chunks_start {
            return Err(PacketError::TooShort(buf.len()));
        }
        let mtu = buf.len();
        Ok(Self {
            buf,
            writable: false,
            mtu,
            chunks_start,
            has_data: false,
            piggyback_start: None,
            cursor: chunks_start,
        })
    }

    /// Detach from the receive buffer. Mode is preserved.
    pub fn into_owned(self) -> Packet<'static> {
        Packet {
            buf: Cow::Owned(self.buf.into_owned()),
            writable: self.writable,
            mtu: self.mtu,
            chunks_start: self.chunks_start,
            has_data: self.has_data,
            piggyback_start: self.piggyback_start,
            cursor: self.cursor,
        }
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.buf
    }

    pub fn packet_size(&self) -> usize {
        self.buf.len()
    }

    pub fn is_writable(&self) -> bool {
        self.writable
    }

    pub fn mtu(&self) -> usize {
        self.mtu
    }

    /// Bytes still available for chunks in write mode.
    pub fn remaining_space(&self) -> usize {
        self.mtu.saturating_sub(self.buf.len())
    }

    // ── Header ───────────────────────────────────────────────────────────────

    fn header(&self) -> PacketHeader {
        PacketHeader::read_from_prefix(&self.buf[..]).unwrap_or_else(PacketHeader::new_zeroed)
    }

    fn header_mut(&mut self) -> Result<&mut PacketHeader, PacketError> {
        if !self.writable {
            return Err(PacketError::ReadOnly);
        }
        let len = self.buf.len();
        PacketHeader::mut_from_prefix(self.buf.to_mut().as_mut_slice())
            .ok_or(PacketError::TooShort(len))
    }

    pub fn flags(&self) -> u16 {
        self.header().flags.get()
    }

    pub fn window_size(&self) -> u32 {
        self.header().window_size.get()
    }

    pub fn validation(&self) -> u32 {
        self.header().validation.get()
    }

    pub fn sequence_num(&self) -> u32 {
        self.header().sequence_num.get()
    }

    pub fn set_window_size(&mut self, v: u32) -> Result<(), PacketError> {
        self.header_mut()?.window_size.set(v);
        Ok(())
    }

    pub fn set_validation(&mut self, v: u32) -> Result<(), PacketError> {
        self.header_mut()?.validation.set(v);
        Ok(())
    }

    pub fn set_sequence_num(&mut self, v: u32) -> Result<(), PacketError> {
        self.header_mut()?.sequence_num.set(v);
        Ok(())
    }

    fn update_flags(&mut self, clear: u16, set: u16) -> Result<(), PacketError> {
        let header = self.header_mut()?;
        let f = header.flags.get();
        header.flags.set((f & !clear) | set);
        Ok(())
    }

    pub fn delivery_class(&self) -> DeliveryClass {
        DeliveryClass::from_flags(self.flags())
    }

    pub fn set_delivery_class(&mut self, class: DeliveryClass) -> Result<(), PacketError> {
        self.update_flags(
            flags::CONTROL | flags::RELIABLE | flags::SEQUENCED,
            class.flags(),
        )
    }

    pub fn is_control(&self) -> bool {
        self.flags() & flags::CONTROL != 0
    }

    pub fn is_reliable(&self) -> bool {
        self.flags() & flags::RELIABLE != 0
    }

    pub fn is_sequenced(&self) -> bool {
        self.flags() & flags::SEQUENCED != 0
    }

    pub fn is_retransmitted(&self) -> bool {
        self.flags() & flags::RETRANSMITTED != 0
    }

    pub fn set_retransmitted(&mut self) -> Result<(), PacketError> {
        self.update_flags(0, flags::RETRANSMITTED)
    }

    pub fn fragment_position(&self) -> Option<FragmentPosition> {
        let f = self.flags();
        if f & flags::FIRST_FRAGMENT != 0 {
            Some(FragmentPosition::First)
        } else if f & flags::INTERMEDIATE_FRAGMENT != 0 {
            Some(FragmentPosition::Intermediate)
        } else if f & flags::LAST_FRAGMENT != 0 {
            Some(FragmentPosition::Last)
        } else {
            None
        }
    }

    pub fn is_fragment(&self) -> bool {
        self.fragment_position().is_some()
    }

    pub fn set_fragment(&mut self, pos: Option<FragmentPosition>) -> Result<(), PacketError> {
        self.update_flags(flags::FRAGMENT_MASK, pos.map_or(0, FragmentPosition::flag))
    }

    // ── Delivery Prerequisites ───────────────────────────────────────────────

    pub fn has_delivery_prerequisites(&self) -> bool {
        self.flags() & flags::DELIVERY_PREREQUISITES != 0
    }

    /// Reserve the prerequisite block. Must precede every chunk.
    pub fn allocate_delivery_prerequisites(&mut self) -> Result<(), PacketError> {
        if !self.writable {
            return Err(PacketError::ReadOnly);
        }
        if self.has_delivery_prerequisites() {
            return Ok(());
        }
        if self.buf.len() != PACKET_HEADER_SIZE {
            return Err(PacketError::PrerequisitesAfterChunks);
        }
        self.update_flags(0, flags::DELIVERY_PREREQUISITES)?;
        self.buf
            .to_mut()
            .extend_from_slice(PrerequisiteBlock::new_zeroed().as_bytes());
        self.chunks_start = PACKET_HEADER_SIZE + PREREQUISITE_BLOCK_SIZE;
        self.cursor = self.chunks_start;
        Ok(())
    }

    /// Stamp the prerequisite block from the sender's per-class counters,
    /// choosing the two foreign classes by this packet's own class.
    pub fn set_delivery_prerequisites(&mut self, tsns: &SequencedTsns) -> Result<(), PacketError> {
        if !self.writable {
            return Err(PacketError::ReadOnly);
        }
        if !self.has_delivery_prerequisites() {
            return Err(PacketError::PrerequisitesMissing);
        }
        let class = self.delivery_class();
        let [first, second] = class
            .prerequisite_classes()
            .ok_or(PacketError::NoPrerequisites(class))?;
        let block = PrerequisiteBlock::mut_from_prefix(
            &mut self.buf.to_mut()[PACKET_HEADER_SIZE..],
        )
        .ok_or(PacketError::PrerequisitesMissing)?;
        block.first.set(tsns.get(first).unwrap_or(0));
        block.second.set(tsns.get(second).unwrap_or(0));
        Ok(())
    }

    /// Prerequisites declared by the packet, if it carries a block and its
    /// class has prerequisites.
    pub fn delivery_prerequisites(&self) -> Option<DeliveryPrerequisites> {
        if !self.has_delivery_prerequisites() {
            return None;
        }
        let [first, second] = self.delivery_class().prerequisite_classes()?;
        let block = PrerequisiteBlock::read_from_prefix(self.buf.get(PACKET_HEADER_SIZE..)?)?;
        Some(DeliveryPrerequisites([
            (first, block.first.get()),
            (second, block.second.get()),
        ]))
    }

    // ── Writing Chunks ───────────────────────────────────────────────────────

    /// Append a chunk. On error the packet is left unchanged.
    pub fn add_chunk(&mut self, chunk: &Chunk<'_>) -> Result<(), PacketError> {
        if !self.writable {
            return Err(PacketError::ReadOnly);
        }
        let chunk_type = chunk.chunk_type();
        if !chunk_type.is_piggyback() {
            if self.piggyback_start.is_some() {
                return Err(PacketError::PiggybackOrder(chunk_type));
            }
            if chunk_type == ChunkType::Data && self.has_data {
                return Err(PacketError::DuplicateData);
            }
        }

        let start = self.buf.len();
        let available = self.mtu.saturating_sub(start);
        let buf = self.buf.to_mut();
        buf.extend_from_slice(ChunkHeader::new_zeroed().as_bytes());
        let result = chunk.encode_body(buf).and_then(|()| {
            let size = buf.len() - start;
            if size > available {
                return Err(PacketError::InsufficientSpace {
                    needed: size,
                    available,
                });
            }
            let size16 = u16::try_from(size).map_err(|_| PacketError::ChunkTooLarge(size))?;
            let mut header = ChunkHeader::new_zeroed();
            header.chunk_type.set(chunk_type.into());
            header.chunk_size.set(size16);
            buf[start..start + CHUNK_HEADER_SIZE].copy_from_slice(header.as_bytes());
            Ok(())
        });
        if let Err(e) = result {
            buf.truncate(start);
            return Err(e);
        }

        if chunk_type.is_piggyback() && self.piggyback_start.is_none() {
            self.piggyback_start = Some(start);
        }
        if chunk_type == ChunkType::Data {
            self.has_data = true;
        }
        Ok(())
    }

    pub fn add_data_chunk(&mut self, tag: u16, data: &[u8]) -> Result<(), PacketError> {
        self.add_chunk(&Chunk::Data(DataChunk { tag, data }))
    }

    /// Drop every piggyback chunk so the packet can be retransmitted with
    /// fresh ones.
    pub fn remove_piggyback_chunks(&mut self) -> Result<(), PacketError> {
        if !self.writable {
            return Err(PacketError::ReadOnly);
        }
        if let Some(start) = self.piggyback_start.take() {
            self.buf.to_mut().truncate(start);
        }
        Ok(())
    }

    // ── Reading Chunks ───────────────────────────────────────────────────────

    /// (raw type, size) of the well-formed chunk header at `offset`.
    fn raw_chunk_at(&self, offset: usize) -> Option<(u16, usize)> {
        let header = ChunkHeader::read_from_prefix(self.buf.get(offset..)?)?;
        let size = header.chunk_size.get() as usize;
        if size < CHUNK_HEADER_SIZE || offset + size > self.buf.len() {
            return None;
        }
        Some((header.chunk_type.get(), size))
    }

    pub fn reset_chunk_iterator(&mut self) {
        self.cursor = self.chunks_start;
    }

    /// Move to the following chunk. Returns false once the cursor is past the
    /// last complete chunk.
    pub fn advance_to_next_chunk(&mut self) -> bool {
        match self.raw_chunk_at(self.cursor) {
            Some((_, size)) => {
                self.cursor += size;
                self.raw_chunk_at(self.cursor).is_some()
            }
            None => false,
        }
    }

    /// Type of the chunk under the cursor. None at the end of the packet, on
    /// a malformed header or an unknown type.
    pub fn chunk_type(&self) -> Option<ChunkType> {
        let (raw, _) = self.raw_chunk_at(self.cursor)?;
        ChunkType::try_from(raw).ok()
    }

    /// Decode the chunk under the cursor.
    pub fn current_chunk(&self) -> Result<Chunk<'_>, PacketError> {
        self.chunk_at(self.cursor).map(|(chunk, _)| chunk)
    }

    /// Data chunk under the cursor.
    pub fn data_chunk(&self) -> Result<DataChunk<'_>, PacketError> {
        match self.current_chunk()? {
            Chunk::Data(d) => Ok(d),
            other => Err(PacketError::UnexpectedChunk {
                expected: ChunkType::Data,
                found: other.chunk_type(),
            }),
        }
    }

    fn chunk_at(&self, offset: usize) -> Result<(Chunk<'_>, usize), PacketError> {
        if offset >= self.buf.len() {
            return Err(PacketError::NoChunk);
        }
        let (raw, size) = self
            .raw_chunk_at(offset)
            .ok_or(PacketError::BadChunkSize { offset })?;
        let chunk_type = ChunkType::try_from(raw)?;
        if size < chunk_type.min_size() {
            return Err(PacketError::ChunkTooShort { chunk_type, size });
        }
        let body = &self.buf[offset + CHUNK_HEADER_SIZE..offset + size];
        Ok((Chunk::decode(chunk_type, body)?, size))
    }

    /// Iterate all chunks from the start, independent of the cursor. Stops
    /// after the first error.
    pub fn chunks(&self) -> Chunks<'_, 'a> {
        Chunks {
            packet: self,
            offset: self.chunks_start,
            done: false,
        }
    }

    /// The single Data chunk of the packet, wherever it sits.
    pub fn find_data(&self) -> Option<DataChunk<'_>> {
        self.chunks().find_map(|c| match c {
            Ok(Chunk::Data(d)) => Some(d),
            _ => None,
        })
    }

    /// Read-only owned copy with piggyback chunks (and any malformed tail)
    /// removed, ready to be queued for delivery.
    pub fn prepare_for_processing(&self) -> Packet<'static> {
        let mut end = self.chunks_start;
        while let Some((raw, size)) = self.raw_chunk_at(end) {
            if ChunkType::try_from(raw).is_ok_and(ChunkType::is_piggyback) {
                break;
            }
            end += size;
        }
        let mut bytes = self.buf[..end].to_vec();
        if let Some(h) = PacketHeader::mut_from_prefix(bytes.as_mut_slice()) {
            // retransmission marker is meaningless past this point
            let f = h.flags.get();
            h.flags.set(f & !flags::RETRANSMITTED);
        }
        let mtu = bytes.len();
        Packet {
            buf: Cow::Owned(bytes),
            writable: false,
            mtu,
            chunks_start: self.chunks_start,
            has_data: false,
            piggyback_start: None,
            cursor: self.chunks_start,
        }
    }
}

pub struct Chunks<'p, 'a> {
    packet: &'p Packet<'a>,
    offset: usize,
    done: bool,
}

impl<'p, 'a> Iterator for Chunks<'p, 'a> {
    type Item = Result<Chunk<'p>, PacketError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done || self.offset >= self.packet.buf.len() {
            return None;
        }
        match self.packet.chunk_at(self.offset) {
            Ok((chunk, size)) => {
                self.offset += size;
                Some(Ok(chunk))
            }
            Err(e) => {
                self.done = true;
                Some(Err(e))
            }
        }
    }
}

impl fmt::Debug for Packet<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Packet")
            .field("size", &self.buf.len())
            .field("writable", &self.writable)
            .field("flags", &format_args!("0x{:04x}", self.flags()))
            .field("sequence_num", &self.sequence_num())
            .finish()
    }
}

/// Human-readable dump: header fields, prerequisites and one line per chunk.
impl fmt::Display for Packet<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "packet size={} flags=0x{:04x} class={:?} window={} validation=0x{:08x} seq={}",
            self.buf.len(),
            self.flags(),
            self.delivery_class(),
            self.window_size(),
            self.validation(),
            self.sequence_num()
        )?;
        if let Some(pos) = self.fragment_position() {
            writeln!(f, "  fragment {pos:?}")?;
        }
        if let Some(DeliveryPrerequisites(entries)) = self.delivery_prerequisites() {
            for (class, tsn) in entries {
                writeln!(f, "  prerequisite {class:?} <= {tsn}")?;
            }
        }
        for chunk in self.chunks() {
            match chunk {
                Ok(Chunk::Data(d)) => {
                    writeln!(f, "  Data tag={} len={}", d.tag, d.data.len())?
                }
                Ok(c) => writeln!(f, "  {c:?}")?,
                Err(e) => writeln!(f, "  <{e}>")?,
            }
        }
        Ok(())
    }
}

// ── Tests ────────────────────────────────────────────────────────────────────
