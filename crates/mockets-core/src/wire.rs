//! Mockets wire format — fixed-layout blocks that make up packets and chunks.
//!
//! These types ARE the protocol. Every field and every size is part of the
//! wire contract and must stay bit-exact for interoperability.
//!
//! All multi-byte integers are big-endian (network order). The structs are
//! #[repr(C)] over zerocopy's byte-order-aware integers, which are unaligned,
//! so the layout has no padding and can be overlaid directly on a datagram
//! buffer. There is no unsafe code in this module.

use static_assertions::assert_eq_size;
use zerocopy::byteorder::{BigEndian, I64, U16, U32};
use zerocopy::{AsBytes, FromBytes, FromZeroes, Unaligned};

pub type U16Be = U16<BigEndian>;
pub type U32Be = U32<BigEndian>;
pub type I64Be = I64<BigEndian>;

// ── Packet Header ────────────────────────────────────────────────────────────

/// Leading block of every packet.
///
/// Wire size: 14 bytes.
#[derive(Debug, Clone, AsBytes, FromBytes, FromZeroes, Unaligned)]
#[repr(C)]
pub struct PacketHeader {
    /// Bit flags, see [`flags`].
    pub flags: U16Be,
    /// Receive window advertised by the sender.
    pub window_size: U32Be,
    /// Validation tag bound to the connection.
    pub validation: U32Be,
    /// TSN within the packet's delivery class.
    pub sequence_num: U32Be,
}

assert_eq_size!(PacketHeader, [u8; 14]);

/// Optional block following the header when [`flags::DELIVERY_PREREQUISITES`]
/// is set. Holds the two foreign-class TSNs relevant to the packet's class.
///
/// Wire size: 8 bytes.
#[derive(Debug, Clone, AsBytes, FromBytes, FromZeroes, Unaligned)]
#[repr(C)]
pub struct PrerequisiteBlock {
    pub first: U32Be,
    pub second: U32Be,
}

assert_eq_size!(PrerequisiteBlock, [u8; 8]);

/// Packet header flag bits.
pub mod flags {
    pub const RELIABLE: u16 = 0x0001;
    pub const SEQUENCED: u16 = 0x0002;
    pub const MESSAGE_PACKET: u16 = 0x0004;
    pub const CONTROL: u16 = 0x0008;
    pub const DELIVERY_PREREQUISITES: u16 = 0x0010;
    pub const FIRST_FRAGMENT: u16 = 0x0020;
    pub const INTERMEDIATE_FRAGMENT: u16 = 0x0040;
    pub const LAST_FRAGMENT: u16 = 0x0080;
    pub const RETRANSMITTED: u16 = 0x0100;
    pub const PROTOCOL_VERSION: u16 = 0x1000;

    pub const FRAGMENT_MASK: u16 = FIRST_FRAGMENT | INTERMEDIATE_FRAGMENT | LAST_FRAGMENT;
}

// ── Chunk Blocks ─────────────────────────────────────────────────────────────

/// Every chunk starts with this header. `chunk_size` includes the header.
///
/// Wire size: 4 bytes.
#[derive(Debug, Clone, AsBytes, FromBytes, FromZeroes, Unaligned)]
#[repr(C)]
pub struct ChunkHeader {
    pub chunk_type: U16Be,
    pub chunk_size: U16Be,
}

assert_eq_size!(ChunkHeader, [u8; 4]);

/// Data chunk header: the generic header plus an application tag.
///
/// Wire size: 6 bytes.
#[derive(Debug, Clone, AsBytes, FromBytes, FromZeroes, Unaligned)]
#[repr(C)]
pub struct DataChunkHeader {
    pub chunk_type: U16Be,
    pub chunk_size: U16Be,
    pub tag: U16Be,
}

assert_eq_size!(DataChunkHeader, [u8; 6]);

/// Connection-establishment fields shared by Init, InitAck, SimpleConnect
/// and SimpleConnectAck.
///
/// Wire size: 24 bytes.
#[derive(Debug, Clone, AsBytes, FromBytes, FromZeroes, Unaligned)]
#[repr(C)]
pub struct ConnectFields {
    pub validation: U32Be,
    pub control_tsn: U32Be,
    pub reliable_sequenced_tsn: U32Be,
    pub unreliable_sequenced_tsn: U32Be,
    pub reliable_unsequenced_id: U32Be,
    pub unreliable_unsequenced_id: U32Be,
}

assert_eq_size!(ConnectFields, [u8; 24]);

/// Serialized StateCookie. Side A is the connecting client, side Z the server.
///
/// Wire size: 68 bytes (2 × i64 + 12 × u32 + 2 × u16).
#[derive(Debug, Clone, AsBytes, FromBytes, FromZeroes, Unaligned)]
#[repr(C)]
pub struct StateCookieBlock {
    /// Milliseconds since the UNIX epoch.
    pub generation_time: I64Be,
    /// Milliseconds.
    pub lifespan: I64Be,
    pub validation_a: U32Be,
    pub validation_z: U32Be,
    pub control_tsn_a: U32Be,
    pub control_tsn_z: U32Be,
    pub reliable_sequenced_tsn_a: U32Be,
    pub reliable_sequenced_tsn_z: U32Be,
    pub unreliable_sequenced_tsn_a: U32Be,
    pub unreliable_sequenced_tsn_z: U32Be,
    pub reliable_unsequenced_id_a: U32Be,
    pub reliable_unsequenced_id_z: U32Be,
    pub unreliable_unsequenced_id_a: U32Be,
    pub unreliable_unsequenced_id_z: U32Be,
    pub port_a: U16Be,
    pub port_z: U16Be,
}

assert_eq_size!(StateCookieBlock, [u8; 68]);

/// Cumulative acknowledgements at the start of SAck chunks.
///
/// Wire size: 12 bytes.
#[derive(Debug, Clone, AsBytes, FromBytes, FromZeroes, Unaligned)]
#[repr(C)]
pub struct SAckFields {
    pub control_cumulative_ack: U32Be,
    pub reliable_sequenced_cumulative_ack: U32Be,
    pub reliable_unsequenced_cumulative_ack: U32Be,
}

assert_eq_size!(SAckFields, [u8; 12]);

/// Receiver-side bandwidth estimation fields of SAckRecBandEst.
///
/// Wire size: 12 bytes.
#[derive(Debug, Clone, AsBytes, FromBytes, FromZeroes, Unaligned)]
#[repr(C)]
pub struct BandwidthFields {
    pub bytes_received: U32Be,
    pub timestamp: I64Be,
}

assert_eq_size!(BandwidthFields, [u8; 12]);

/// Header of one TSN block inside SAck and Cancelled chunks.
/// `block_size` includes these 3 bytes.
///
/// Wire size: 3 bytes.
#[derive(Debug, Clone, AsBytes, FromBytes, FromZeroes, Unaligned)]
#[repr(C)]
pub struct TsnBlockHeader {
    pub block_flags: u8,
    pub block_size: U16Be,
}

assert_eq_size!(TsnBlockHeader, [u8; 3]);

/// TSN block flag bits. The low nibble selects the flow (meaning depends on
/// the enclosing chunk), the high nibble the block encoding.
pub mod tsn_block {
    pub const SACK_CONTROL: u8 = 0x01;
    pub const SACK_RELIABLE_SEQUENCED: u8 = 0x02;
    pub const SACK_RELIABLE_UNSEQUENCED: u8 = 0x04;

    pub const CANCELLED_RELIABLE_SEQUENCED: u8 = 0x01;
    pub const CANCELLED_RELIABLE_UNSEQUENCED: u8 = 0x02;
    pub const CANCELLED_UNRELIABLE_SEQUENCED: u8 = 0x04;

    pub const RANGE: u8 = 0x10;
    pub const SINGLE: u8 = 0x20;

    pub const FLOW_MASK: u8 = 0x0F;
}

// ── Chunk Types ──────────────────────────────────────────────────────────────

pub const CHUNK_CLASS_METADATA: u16 = 0x1000;
pub const CHUNK_CLASS_DATA: u16 = 0x2000;
pub const CHUNK_CLASS_STATECHANGE: u16 = 0x4000;

/// Closed set of chunk types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum ChunkType {
    SAck = CHUNK_CLASS_METADATA | 0x0001,
    Heartbeat = CHUNK_CLASS_METADATA | 0x0002,
    Cancelled = CHUNK_CLASS_METADATA | 0x0003,
    Timestamp = CHUNK_CLASS_METADATA | 0x0004,
    TimestampAck = CHUNK_CLASS_METADATA | 0x0005,
    SAckRecBandEst = CHUNK_CLASS_METADATA | 0x0006,
    Data = CHUNK_CLASS_DATA | 0x0001,
    Init = CHUNK_CLASS_STATECHANGE | 0x0001,
    InitAck = CHUNK_CLASS_STATECHANGE | 0x0002,
    CookieEcho = CHUNK_CLASS_STATECHANGE | 0x0003,
    CookieAck = CHUNK_CLASS_STATECHANGE | 0x0004,
    Shutdown = CHUNK_CLASS_STATECHANGE | 0x0005,
    ShutdownAck = CHUNK_CLASS_STATECHANGE | 0x0006,
    ShutdownComplete = CHUNK_CLASS_STATECHANGE | 0x0007,
    Abort = CHUNK_CLASS_STATECHANGE | 0x0008,
    Suspend = CHUNK_CLASS_STATECHANGE | 0x0009,
    SuspendAck = CHUNK_CLASS_STATECHANGE | 0x000A,
    Resume = CHUNK_CLASS_STATECHANGE | 0x000B,
    ResumeAck = CHUNK_CLASS_STATECHANGE | 0x000C,
    ReEstablish = CHUNK_CLASS_STATECHANGE | 0x000D,
    ReEstablishAck = CHUNK_CLASS_STATECHANGE | 0x000E,
    SimpleSuspend = CHUNK_CLASS_STATECHANGE | 0x000F,
    SimpleSuspendAck = CHUNK_CLASS_STATECHANGE | 0x0010,
    SimpleConnect = CHUNK_CLASS_STATECHANGE | 0x0011,
    SimpleConnectAck = CHUNK_CLASS_STATECHANGE | 0x0012,
}

impl ChunkType {
    /// Piggyback chunks may follow a primary chunk; once one is present no
    /// further primary chunk may be added to the packet.
    pub fn is_piggyback(self) -> bool {
        matches!(
            self,
            ChunkType::SAck
                | ChunkType::SAckRecBandEst
                | ChunkType::Cancelled
                | ChunkType::Timestamp
                | ChunkType::TimestampAck
        )
    }

    /// Smallest valid `chunk_size` for this type.
    pub fn min_size(self) -> usize {
        const HDR: usize = CHUNK_HEADER_SIZE;
        const CONNECT: usize = std::mem::size_of::<ConnectFields>();
        const COOKIE: usize = std::mem::size_of::<StateCookieBlock>();
        match self {
            ChunkType::Init | ChunkType::SimpleConnect => HDR + CONNECT,
            ChunkType::InitAck => HDR + CONNECT + COOKIE,
            ChunkType::SimpleConnectAck => HDR + CONNECT + 2 + COOKIE,
            ChunkType::CookieEcho => HDR + COOKIE,
            ChunkType::CookieAck => HDR + 2,
            ChunkType::Data => DATA_CHUNK_HEADER_SIZE,
            ChunkType::Heartbeat | ChunkType::Timestamp | ChunkType::TimestampAck => HDR + 8,
            ChunkType::SAck => HDR + std::mem::size_of::<SAckFields>(),
            ChunkType::SAckRecBandEst => {
                HDR + std::mem::size_of::<SAckFields>() + std::mem::size_of::<BandwidthFields>()
            }
            _ => HDR,
        }
    }
}

impl TryFrom<u16> for ChunkType {
    type Error = WireError;

    fn try_from(value: u16) -> Result<Self, Self::Error> {
        use ChunkType::*;
        const ALL: [ChunkType; 25] = [
            SAck,
            Heartbeat,
            Cancelled,
            Timestamp,
            TimestampAck,
            SAckRecBandEst,
            Data,
            Init,
            InitAck,
            CookieEcho,
            CookieAck,
            Shutdown,
            ShutdownAck,
            ShutdownComplete,
            Abort,
            Suspend,
            SuspendAck,
            Resume,
            ResumeAck,
            ReEstablish,
            ReEstablishAck,
            SimpleSuspend,
            SimpleSuspendAck,
            SimpleConnect,
            SimpleConnectAck,
        ];
        ALL.into_iter()
            .find(|t| *t as u16 == value)
            .ok_or(WireError::UnknownChunkType(value))
    }
}

impl From<ChunkType> for u16 {
    fn from(t: ChunkType) -> u16 {
        t as u16
    }
}

// ── Constants ────────────────────────────────────────────────────────────────

pub const PACKET_HEADER_SIZE: usize = std::mem::size_of::<PacketHeader>();
pub const PREREQUISITE_BLOCK_SIZE: usize = std::mem::size_of::<PrerequisiteBlock>();
pub const CHUNK_HEADER_SIZE: usize = std::mem::size_of::<ChunkHeader>();
pub const DATA_CHUNK_HEADER_SIZE: usize = std::mem::size_of::<DataChunkHeader>();
pub const STATE_COOKIE_SIZE: usize = std::mem::size_of::<StateCookieBlock>();
pub const TSN_BLOCK_HEADER_SIZE: usize = std::mem::size_of::<TsnBlockHeader>();

/// Default packet MTU for a connection.
pub const DEFAULT_MTU: usize = 1450;

/// Largest packet any endpoint will build or accept.
pub const MAXIMUM_MTU: usize = 2048;

/// Largest ciphertext unit carried by the secure transport.
pub const DEFAULT_SECURE_MTU: usize = 1400;

/// Buffer size used while a secure handshake is in progress.
pub const HANDSHAKE_BUFFER_SIZE: usize = 3000;

/// Receive window advertised in handshake replies.
pub const DEFAULT_MAXIMUM_WINDOW_SIZE: u32 = 262_144;

/// Lifespan of a StateCookie and of the matching CookieRec, milliseconds.
pub const DEFAULT_COOKIE_LIFESPAN_MS: i64 = 60_000;

/// Base timeout before unreliable-sequenced gaps are skipped, milliseconds.
pub const DEFAULT_UNRELIABLE_SEQUENCED_DELIVERY_TIMEOUT_MS: u64 = 3_000;

/// How far past the next expected TSN a sequenced flow accepts packets.
pub const DEFAULT_REORDER_WINDOW: u32 = 4096;

// ── Errors ───────────────────────────────────────────────────────────────────

/// Errors that can arise when interpreting wire-format data.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WireError {
    #[error("unknown chunk type: 0x{0:04x}")]
    UnknownChunkType(u16),

    #[error("missing protocol version flag in 0x{0:04x}")]
    UnknownVersion(u16),
}

// ── Tests ────────────────────────────────────────────────────────────────────
