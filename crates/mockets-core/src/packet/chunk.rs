//! Chunk values and their per-type payload layouts.
//!
//! A [`Chunk`] borrows variable-length payloads (data, keys, tokens) from the
//! packet it was decoded from. Fixed-size fields are decoded into plain values.

use zerocopy::{AsBytes, FromBytes, FromZeroes};

use super::PacketError;
use crate::cookie::{EndpointParams, InitialTsns, StateCookie};
use crate::seq;
use crate::wire::{
    tsn_block, BandwidthFields, ChunkType, ConnectFields, SAckFields, StateCookieBlock,
    TsnBlockHeader, STATE_COOKIE_SIZE, TSN_BLOCK_HEADER_SIZE,
};

// ── Values ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DataChunk<'a> {
    pub tag: u16,
    pub data: &'a [u8],
}

/// Entries of one TSN block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TsnEntries {
    /// Inclusive (start, end) ranges.
    Ranges(Vec<(u32, u32)>),
    Singles(Vec<u32>),
}

/// A block of TSNs for one flow inside a SAck or Cancelled chunk.
/// `flow` is one of the flow bits in [`tsn_block`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TsnBlock {
    pub flow: u8,
    pub entries: TsnEntries,
}

impl TsnBlock {
    pub fn ranges(flow: u8, ranges: Vec<(u32, u32)>) -> Self {
        Self {
            flow,
            entries: TsnEntries::Ranges(ranges),
        }
    }

    pub fn singles(flow: u8, tsns: Vec<u32>) -> Self {
        Self {
            flow,
            entries: TsnEntries::Singles(tsns),
        }
    }

    /// Every TSN the block names, ranges expanded lazily.
    pub fn tsns(&self) -> impl Iterator<Item = u32> + '_ {
        let (singles, ranges): (&[u32], &[(u32, u32)]) = match &self.entries {
            TsnEntries::Singles(v) => (v, &[]),
            TsnEntries::Ranges(v) => (&[], v),
        };
        singles.iter().copied().chain(ranges.iter().flat_map(|&(start, end)| {
            (0..=seq::delta(end, start)).map(move |i| start.wrapping_add(i))
        }))
    }

    /// Number of TSNs the block names, without expanding it.
    pub fn count(&self) -> u64 {
        match &self.entries {
            TsnEntries::Singles(v) => v.len() as u64,
            TsnEntries::Ranges(v) => v
                .iter()
                .map(|&(start, end)| u64::from(seq::delta(end, start)) + 1)
                .sum(),
        }
    }

    fn encoded_len(&self) -> usize {
        TSN_BLOCK_HEADER_SIZE
            + match &self.entries {
                TsnEntries::Ranges(v) => v.len() * 8,
                TsnEntries::Singles(v) => v.len() * 4,
            }
    }

    fn encode(&self, out: &mut Vec<u8>) -> Result<(), PacketError> {
        let len = self.encoded_len();
        let block_size = u16::try_from(len).map_err(|_| PacketError::ChunkTooLarge(len))?;
        let kind = match self.entries {
            TsnEntries::Ranges(_) => tsn_block::RANGE,
            TsnEntries::Singles(_) => tsn_block::SINGLE,
        };
        let mut header = TsnBlockHeader::new_zeroed();
        header.block_flags = (self.flow & tsn_block::FLOW_MASK) | kind;
        header.block_size.set(block_size);
        out.extend_from_slice(header.as_bytes());
        match &self.entries {
            TsnEntries::Ranges(v) => {
                for (start, end) in v {
                    out.extend_from_slice(&start.to_be_bytes());
                    out.extend_from_slice(&end.to_be_bytes());
                }
            }
            TsnEntries::Singles(v) => {
                for tsn in v {
                    out.extend_from_slice(&tsn.to_be_bytes());
                }
            }
        }
        Ok(())
    }

    fn parse_all(chunk_type: ChunkType, mut bytes: &[u8]) -> Result<Vec<Self>, PacketError> {
        let mut blocks = Vec::new();
        while !bytes.is_empty() {
            let header =
                TsnBlockHeader::read_from_prefix(bytes).ok_or(PacketError::Malformed(chunk_type))?;
            let size = header.block_size.get() as usize;
            if size < TSN_BLOCK_HEADER_SIZE || size > bytes.len() {
                return Err(PacketError::Malformed(chunk_type));
            }
            let body = &bytes[TSN_BLOCK_HEADER_SIZE..size];
            let flow = header.block_flags & tsn_block::FLOW_MASK;
            let entries = if header.block_flags & tsn_block::RANGE != 0 {
                if body.len() % 8 != 0 {
                    return Err(PacketError::Malformed(chunk_type));
                }
                let ranges: Vec<(u32, u32)> = body
                    .chunks_exact(8)
                    .map(|c| (be_u32(&c[..4]), be_u32(&c[4..])))
                    .collect();
                if ranges.iter().any(|&(start, end)| seq::gt(start, end)) {
                    return Err(PacketError::Malformed(chunk_type));
                }
                TsnEntries::Ranges(ranges)
            } else if header.block_flags & tsn_block::SINGLE != 0 {
                if body.len() % 4 != 0 {
                    return Err(PacketError::Malformed(chunk_type));
                }
                TsnEntries::Singles(body.chunks_exact(4).map(be_u32).collect())
            } else {
                return Err(PacketError::Malformed(chunk_type));
            };
            blocks.push(TsnBlock { flow, entries });
            bytes = &bytes[size..];
        }
        Ok(blocks)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BandwidthEstimate {
    pub bytes_received: u32,
    pub timestamp: i64,
}

/// Selective acknowledgement. Encoded as SAckRecBandEst when `bandwidth`
/// is present, as SAck otherwise.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SAck {
    pub control_cumulative_ack: u32,
    pub reliable_sequenced_cumulative_ack: u32,
    pub reliable_unsequenced_cumulative_ack: u32,
    pub bandwidth: Option<BandwidthEstimate>,
    pub blocks: Vec<TsnBlock>,
}

/// A decoded chunk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Chunk<'a> {
    Init(EndpointParams),
    InitAck {
        params: EndpointParams,
        cookie: StateCookie,
    },
    CookieEcho {
        cookie: StateCookie,
        /// Client's X25519 public key, when it wants a resume token.
        public_key: Option<&'a [u8]>,
    },
    CookieAck {
        port: u16,
        resume_token: Option<&'a [u8]>,
    },
    Shutdown,
    ShutdownAck,
    ShutdownComplete,
    Abort,
    SAck(SAck),
    Heartbeat(i64),
    Cancelled(Vec<TsnBlock>),
    Timestamp(i64),
    TimestampAck(i64),
    Data(DataChunk<'a>),
    Suspend(&'a [u8]),
    SuspendAck(&'a [u8]),
    Resume(&'a [u8]),
    ResumeAck,
    ReEstablish(&'a [u8]),
    ReEstablishAck,
    SimpleSuspend,
    SimpleSuspendAck,
    SimpleConnect(EndpointParams),
    SimpleConnectAck {
        params: EndpointParams,
        port: u16,
        cookie: StateCookie,
    },
}

impl<'a> Chunk<'a> {
    pub fn chunk_type(&self) -> ChunkType {
        match self {
            Chunk::Init(_) => ChunkType::Init,
            Chunk::InitAck { .. } => ChunkType::InitAck,
            Chunk::CookieEcho { .. } => ChunkType::CookieEcho,
            Chunk::CookieAck { .. } => ChunkType::CookieAck,
            Chunk::Shutdown => ChunkType::Shutdown,
            Chunk::ShutdownAck => ChunkType::ShutdownAck,
            Chunk::ShutdownComplete => ChunkType::ShutdownComplete,
            Chunk::Abort => ChunkType::Abort,
            Chunk::SAck(s) if s.bandwidth.is_some() => ChunkType::SAckRecBandEst,
            Chunk::SAck(_) => ChunkType::SAck,
            Chunk::Heartbeat(_) => ChunkType::Heartbeat,
            Chunk::Cancelled(_) => ChunkType::Cancelled,
            Chunk::Timestamp(_) => ChunkType::Timestamp,
            Chunk::TimestampAck(_) => ChunkType::TimestampAck,
            Chunk::Data(_) => ChunkType::Data,
            Chunk::Suspend(_) => ChunkType::Suspend,
            Chunk::SuspendAck(_) => ChunkType::SuspendAck,
            Chunk::Resume(_) => ChunkType::Resume,
            Chunk::ResumeAck => ChunkType::ResumeAck,
            Chunk::ReEstablish(_) => ChunkType::ReEstablish,
            Chunk::ReEstablishAck => ChunkType::ReEstablishAck,
            Chunk::SimpleSuspend => ChunkType::SimpleSuspend,
            Chunk::SimpleSuspendAck => ChunkType::SimpleSuspendAck,
            Chunk::SimpleConnect(_) => ChunkType::SimpleConnect,
            Chunk::SimpleConnectAck { .. } => ChunkType::SimpleConnectAck,
        }
    }

    /// Append everything after the 4-byte chunk header.
    pub(crate) fn encode_body(&self, out: &mut Vec<u8>) -> Result<(), PacketError> {
        match self {
            Chunk::Init(p) | Chunk::SimpleConnect(p) => {
                out.extend_from_slice(connect_fields(p).as_bytes());
            }
            Chunk::InitAck { params, cookie } => {
                out.extend_from_slice(connect_fields(params).as_bytes());
                out.extend_from_slice(cookie.to_block().as_bytes());
            }
            Chunk::SimpleConnectAck {
                params,
                port,
                cookie,
            } => {
                out.extend_from_slice(connect_fields(params).as_bytes());
                out.extend_from_slice(&port.to_be_bytes());
                out.extend_from_slice(cookie.to_block().as_bytes());
            }
            Chunk::CookieEcho { cookie, public_key } => {
                out.extend_from_slice(cookie.to_block().as_bytes());
                if let Some(key) = public_key {
                    put_len_prefixed(out, key)?;
                }
            }
            Chunk::CookieAck { port, resume_token } => {
                out.extend_from_slice(&port.to_be_bytes());
                if let Some(token) = resume_token {
                    put_len_prefixed(out, token)?;
                }
            }
            Chunk::Heartbeat(ts) | Chunk::Timestamp(ts) | Chunk::TimestampAck(ts) => {
                out.extend_from_slice(&ts.to_be_bytes());
            }
            Chunk::SAck(sack) => {
                let mut fields = SAckFields::new_zeroed();
                fields.control_cumulative_ack.set(sack.control_cumulative_ack);
                fields
                    .reliable_sequenced_cumulative_ack
                    .set(sack.reliable_sequenced_cumulative_ack);
                fields
                    .reliable_unsequenced_cumulative_ack
                    .set(sack.reliable_unsequenced_cumulative_ack);
                out.extend_from_slice(fields.as_bytes());
                if let Some(bw) = sack.bandwidth {
                    let mut b = BandwidthFields::new_zeroed();
                    b.bytes_received.set(bw.bytes_received);
                    b.timestamp.set(bw.timestamp);
                    out.extend_from_slice(b.as_bytes());
                }
                for block in &sack.blocks {
                    block.encode(out)?;
                }
            }
            Chunk::Cancelled(blocks) => {
                for block in blocks {
                    block.encode(out)?;
                }
            }
            Chunk::Data(d) => {
                out.extend_from_slice(&d.tag.to_be_bytes());
                out.extend_from_slice(d.data);
            }
            Chunk::Suspend(b)
            | Chunk::SuspendAck(b)
            | Chunk::Resume(b)
            | Chunk::ReEstablish(b) => out.extend_from_slice(b),
            Chunk::Shutdown
            | Chunk::ShutdownAck
            | Chunk::ShutdownComplete
            | Chunk::Abort
            | Chunk::ResumeAck
            | Chunk::ReEstablishAck
            | Chunk::SimpleSuspend
            | Chunk::SimpleSuspendAck => {}
        }
        Ok(())
    }

    /// Decode a chunk body. The caller has already checked that the body is at
    /// least `chunk_type.min_size()` minus the header.
    pub(crate) fn decode(chunk_type: ChunkType, body: &'a [u8]) -> Result<Self, PacketError> {
        let short = || PacketError::ChunkTooShort {
            chunk_type,
            size: body.len() + crate::wire::CHUNK_HEADER_SIZE,
        };
        let connect = |b: &[u8]| {
            ConnectFields::read_from_prefix(b)
                .map(|f| endpoint_params(&f))
                .ok_or_else(short)
        };
        let cookie_at = |b: &[u8]| {
            StateCookieBlock::read_from_prefix(b)
                .map(|c| StateCookie::from_block(&c))
                .ok_or_else(short)
        };
        const CONNECT: usize = std::mem::size_of::<ConnectFields>();
        const SACK: usize = std::mem::size_of::<SAckFields>();
        const BANDWIDTH: usize = std::mem::size_of::<BandwidthFields>();

        let chunk = match chunk_type {
            ChunkType::Init => Chunk::Init(connect(body)?),
            ChunkType::SimpleConnect => Chunk::SimpleConnect(connect(body)?),
            ChunkType::InitAck => Chunk::InitAck {
                params: connect(body)?,
                cookie: cookie_at(body.get(CONNECT..).ok_or_else(short)?)?,
            },
            ChunkType::SimpleConnectAck => {
                let rest = body.get(CONNECT..).ok_or_else(short)?;
                Chunk::SimpleConnectAck {
                    params: connect(body)?,
                    port: be_u16(rest.get(..2).ok_or_else(short)?),
                    cookie: cookie_at(rest.get(2..).ok_or_else(short)?)?,
                }
            }
            ChunkType::CookieEcho => Chunk::CookieEcho {
                cookie: cookie_at(body)?,
                public_key: get_len_prefixed(chunk_type, &body[STATE_COOKIE_SIZE..])?,
            },
            ChunkType::CookieAck => Chunk::CookieAck {
                port: be_u16(body.get(..2).ok_or_else(short)?),
                resume_token: get_len_prefixed(chunk_type, &body[2..])?,
            },
            ChunkType::Heartbeat => Chunk::Heartbeat(be_i64(body.get(..8).ok_or_else(short)?)),
            ChunkType::Timestamp => Chunk::Timestamp(be_i64(body.get(..8).ok_or_else(short)?)),
            ChunkType::TimestampAck => {
                Chunk::TimestampAck(be_i64(body.get(..8).ok_or_else(short)?))
            }
            ChunkType::SAck | ChunkType::SAckRecBandEst => {
                let fields = SAckFields::read_from_prefix(body).ok_or_else(short)?;
                let (bandwidth, blocks_at) = if chunk_type == ChunkType::SAckRecBandEst {
                    let b = BandwidthFields::read_from_prefix(&body[SACK..]).ok_or_else(short)?;
                    let estimate = BandwidthEstimate {
                        bytes_received: b.bytes_received.get(),
                        timestamp: b.timestamp.get(),
                    };
                    (Some(estimate), SACK + BANDWIDTH)
                } else {
                    (None, SACK)
                };
                Chunk::SAck(SAck {
                    control_cumulative_ack: fields.control_cumulative_ack.get(),
                    reliable_sequenced_cumulative_ack: fields
                        .reliable_sequenced_cumulative_ack
                        .get(),
                    reliable_unsequenced_cumulative_ack: fields
                        .reliable_unsequenced_cumulative_ack
                        .get(),
                    bandwidth,
                    blocks: TsnBlock::parse_all(chunk_type, &body[blocks_at..])?,
                })
            }
            ChunkType::Cancelled => Chunk::Cancelled(TsnBlock::parse_all(chunk_type, body)?),
            ChunkType::Data => Chunk::Data(DataChunk {
                tag: be_u16(body.get(..2).ok_or_else(short)?),
                data: &body[2..],
            }),
            ChunkType::Suspend => Chunk::Suspend(body),
            ChunkType::SuspendAck => Chunk::SuspendAck(body),
            ChunkType::Resume => Chunk::Resume(body),
            ChunkType::ReEstablish => Chunk::ReEstablish(body),
            ChunkType::Shutdown => Chunk::Shutdown,
            ChunkType::ShutdownAck => Chunk::ShutdownAck,
            ChunkType::ShutdownComplete => Chunk::ShutdownComplete,
            ChunkType::Abort => Chunk::Abort,
            ChunkType::ResumeAck => Chunk::ResumeAck,
            ChunkType::ReEstablishAck => Chunk::ReEstablishAck,
            ChunkType::SimpleSuspend => Chunk::SimpleSuspend,
            ChunkType::SimpleSuspendAck => Chunk::SimpleSuspendAck,
        };
        Ok(chunk)
    }
}

// ── Helpers ──────────────────────────────────────────────────────────────────

fn connect_fields(p: &EndpointParams) -> ConnectFields {
    let mut f = ConnectFields::new_zeroed();
    f.validation.set(p.validation);
    f.control_tsn.set(p.tsns.control);
    f.reliable_sequenced_tsn.set(p.tsns.reliable_sequenced);
    f.unreliable_sequenced_tsn.set(p.tsns.unreliable_sequenced);
    f.reliable_unsequenced_id.set(p.tsns.reliable_unsequenced_id);
    f.unreliable_unsequenced_id.set(p.tsns.unreliable_unsequenced_id);
    f
}

fn endpoint_params(f: &ConnectFields) -> EndpointParams {
    EndpointParams {
        validation: f.validation.get(),
        tsns: InitialTsns {
            control: f.control_tsn.get(),
            reliable_sequenced: f.reliable_sequenced_tsn.get(),
            unreliable_sequenced: f.unreliable_sequenced_tsn.get(),
            reliable_unsequenced_id: f.reliable_unsequenced_id.get(),
            unreliable_unsequenced_id: f.unreliable_unsequenced_id.get(),
        },
    }
}

fn put_len_prefixed(out: &mut Vec<u8>, bytes: &[u8]) -> Result<(), PacketError> {
    let len = u32::try_from(bytes.len()).map_err(|_| PacketError::ChunkTooLarge(bytes.len()))?;
    out.extend_from_slice(&len.to_be_bytes());
    out.extend_from_slice(bytes);
    Ok(())
}

/// Optional trailing `len u32 | bytes`. Empty input means absent.
fn get_len_prefixed(chunk_type: ChunkType, rest: &[u8]) -> Result<Option<&[u8]>, PacketError> {
    if rest.is_empty() {
        return Ok(None);
    }
    let len_bytes = rest.get(..4).ok_or(PacketError::Malformed(chunk_type))?;
    let len = be_u32(len_bytes) as usize;
    rest.get(4..)
        .and_then(|r| r.get(..len))
        .map(Some)
        .ok_or(PacketError::Malformed(chunk_type))
}

fn be_u16(b: &[u8]) -> u16 {
    let mut a = [0u8; 2];
    a.copy_from_slice(&b[..2]);
    u16::from_be_bytes(a)
}

fn be_u32(b: &[u8]) -> u32 {
    let mut a = [0u8; 4];
    a.copy_from_slice(&b[..4]);
    u32::from_be_bytes(a)
}

fn be_i64(b: &[u8]) -> i64 {
    let mut a = [0u8; 8];
    a.copy_from_slice(&b[..8]);
    i64::from_be_bytes(a)
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use super::*;

    fn params(fill: u32) -> EndpointParams {
        EndpointParams {
            validation: fill,
            tsns: InitialTsns {
                control: fill,
                reliable_sequenced: fill,
                unreliable_sequenced: fill,
                reliable_unsequenced_id: fill,
                unreliable_unsequenced_id: fill,
            },
        }
    }

    fn cookie(low: bool) -> StateCookie {
        if low {
            StateCookie::new(i64::MIN, 0, params(0), params(0), 0, 0)
        } else {
            StateCookie::new(0, i64::MAX, params(u32::MAX), params(u32::MAX), u16::MAX, u16::MAX)
        }
    }

    fn encode(chunk: &Chunk<'_>) -> Vec<u8> {
        let mut body = Vec::new();
        chunk.encode_body(&mut body).unwrap();
        body
    }

    /// One chunk of every type, with fields pinned to their lowest or highest
    /// representable values.
    fn every_chunk<'a>(low: bool, bytes: &'a [u8]) -> Vec<Chunk<'a>> {
        let (n32, n64, n16) = if low { (0, i64::MIN, 0) } else { (u32::MAX, i64::MAX, u16::MAX) };
        let optional = if low { None } else { Some(bytes) };
        vec![
            Chunk::Init(params(n32)),
            Chunk::InitAck {
                params: params(n32),
                cookie: cookie(low),
            },
            Chunk::CookieEcho {
                cookie: cookie(low),
                public_key: optional,
            },
            Chunk::CookieAck {
                port: n16,
                resume_token: optional,
            },
            Chunk::Shutdown,
            Chunk::ShutdownAck,
            Chunk::ShutdownComplete,
            Chunk::Abort,
            Chunk::SAck(SAck {
                control_cumulative_ack: n32,
                reliable_sequenced_cumulative_ack: n32,
                reliable_unsequenced_cumulative_ack: n32,
                bandwidth: None,
                blocks: vec![TsnBlock::singles(tsn_block::SACK_CONTROL, vec![n32])],
            }),
            Chunk::SAck(SAck {
                control_cumulative_ack: n32,
                reliable_sequenced_cumulative_ack: n32,
                reliable_unsequenced_cumulative_ack: n32,
                bandwidth: Some(BandwidthEstimate {
                    bytes_received: n32,
                    timestamp: n64,
                }),
                blocks: vec![TsnBlock::ranges(tsn_block::SACK_RELIABLE_SEQUENCED, vec![(n32, n32)])],
            }),
            Chunk::Heartbeat(n64),
            Chunk::Cancelled(vec![
                TsnBlock::ranges(tsn_block::CANCELLED_RELIABLE_SEQUENCED, vec![(n32, n32)]),
                TsnBlock::singles(tsn_block::CANCELLED_UNRELIABLE_SEQUENCED, vec![n32]),
            ]),
            Chunk::Timestamp(n64),
            Chunk::TimestampAck(n64),
            Chunk::Data(DataChunk {
                tag: n16,
                data: if low { &bytes[..0] } else { bytes },
            }),
            Chunk::Suspend(bytes),
            Chunk::SuspendAck(bytes),
            Chunk::Resume(bytes),
            Chunk::ResumeAck,
            Chunk::ReEstablish(bytes),
            Chunk::ReEstablishAck,
            Chunk::SimpleSuspend,
            Chunk::SimpleSuspendAck,
            Chunk::SimpleConnect(params(n32)),
            Chunk::SimpleConnectAck {
                params: params(n32),
                port: n16,
                cookie: cookie(low),
            },
        ]
    }

    #[test]
    fn every_chunk_type_survives_encoding_at_the_edges() {
        let bytes = [0xC3u8; 32];
        for low in [true, false] {
            let chunks = every_chunk(low, &bytes);
            let types: HashSet<ChunkType> = chunks.iter().map(Chunk::chunk_type).collect();
            assert_eq!(types.len(), 25);

            for chunk in &chunks {
                let chunk_type = chunk.chunk_type();
                let body = encode(chunk);
                assert!(
                    body.len() + crate::wire::CHUNK_HEADER_SIZE >= chunk_type.min_size(),
                    "{chunk_type:?} encodes below its minimum size"
                );
                let decoded = Chunk::decode(chunk_type, &body).unwrap();
                assert_eq!(&decoded, chunk, "{chunk_type:?} low={low}");
            }
        }
    }

    #[test]
    fn truncated_fixed_fields_are_too_short() {
        let bytes = [0u8; 0];
        for chunk in every_chunk(true, &bytes) {
            let chunk_type = chunk.chunk_type();
            let fixed = match &chunk {
                Chunk::SAck(s) => Chunk::SAck(SAck {
                    blocks: Vec::new(),
                    ..s.clone()
                }),
                Chunk::Cancelled(_) => continue,
                other => other.clone(),
            };
            let body = encode(&fixed);
            if body.is_empty() {
                continue;
            }
            let err = Chunk::decode(chunk_type, &body[..body.len() - 1]).unwrap_err();
            assert!(
                matches!(err, PacketError::ChunkTooShort { chunk_type: t, size }
                    if t == chunk_type && size == body.len() - 1 + crate::wire::CHUNK_HEADER_SIZE),
                "{chunk_type:?}: {err}"
            );
        }
    }

    #[test]
    fn truncated_variable_parts_are_malformed() {
        let key = [7u8; 32];
        let echo = encode(&Chunk::CookieEcho {
            cookie: cookie(false),
            public_key: Some(&key),
        });
        let ack = encode(&Chunk::CookieAck {
            port: 9,
            resume_token: Some(&key),
        });
        let cancelled = encode(&Chunk::Cancelled(vec![TsnBlock::ranges(
            tsn_block::CANCELLED_RELIABLE_SEQUENCED,
            vec![(1, 4), (9, 12)],
        )]));
        let sack = encode(&Chunk::SAck(SAck {
            blocks: vec![TsnBlock::singles(tsn_block::SACK_CONTROL, vec![3, 5])],
            ..SAck::default()
        }));

        for (chunk_type, body) in [
            (ChunkType::CookieEcho, &echo),
            (ChunkType::CookieAck, &ack),
            (ChunkType::Cancelled, &cancelled),
            (ChunkType::SAck, &sack),
        ] {
            for cut in [1, 4] {
                let err = Chunk::decode(chunk_type, &body[..body.len() - cut]).unwrap_err();
                assert!(
                    matches!(err, PacketError::Malformed(t) if t == chunk_type),
                    "{chunk_type:?} cut by {cut}: {err}"
                );
            }
        }
    }

    #[test]
    fn reversed_range_is_rejected() {
        let mut body = Vec::new();
        let block = TsnBlock::ranges(tsn_block::CANCELLED_RELIABLE_SEQUENCED, vec![(10, 2)]);
        block.encode(&mut body).unwrap();
        assert!(matches!(
            Chunk::decode(ChunkType::Cancelled, &body),
            Err(PacketError::Malformed(ChunkType::Cancelled))
        ));
    }

    #[test]
    fn wrapping_range_expands_lazily() {
        let block = TsnBlock::ranges(tsn_block::SACK_CONTROL, vec![(u32::MAX - 1, 1)]);
        assert_eq!(block.count(), 4);
        assert_eq!(block.tsns().collect::<Vec<_>>(), vec![u32::MAX - 1, u32::MAX, 0, 1]);

        let wide = TsnBlock::ranges(tsn_block::SACK_CONTROL, vec![(0, i32::MAX as u32)]);
        assert_eq!(wide.count(), 1 << 31);
        assert_eq!(wide.tsns().take(3).collect::<Vec<_>>(), vec![0, 1, 2]);
    }
}
