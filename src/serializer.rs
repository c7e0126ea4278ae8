//! Two-dialect wire (de)serialization (§4.4, §6).
//!
//! Packet type codes differ between the legacy (`MFS`) dialect and the
//! current (`SAU_`) dialect; this module models that as a `Dialect` enum and
//! a `MessageSerializer` trait with one implementation per dialect, matching
//! the re-architecture guidance in §9 ("model as a tagged variant dispatched
//! by match" rather than a virtual base class).
//!
//! All multi-byte integers are big-endian on the wire, matching the
//! original's `put32bit`/`put64bit` helpers.

use crate::error::SfsStatus;

/// Which wire dialect a connection has latched onto.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dialect {
    Legacy,
    Current,
}

/// Packet-type code ranges and the logical operations they carry (§4.4, §6).
pub mod packet_type {
    use crate::config::protocol_ranges::{MAX_OLD_PACKET_TYPE, MIN_SAU_PACKET_TYPE};

    pub mod legacy {
        pub const ANTOAN_NOP: u32 = 0;
        pub const ANTOAN_PING: u32 = 1;
        pub const ANTOAN_PING_REPLY: u32 = 2;
        pub const CLTOCS_READ: u32 = 200;
        pub const CSTOCL_READ_DATA: u32 = 201;
        pub const CSTOCL_READ_STATUS: u32 = 202;
        pub const CLTOCS_WRITE: u32 = 210;
        pub const CLTOCS_WRITE_DATA: u32 = 211;
        pub const CSTOCL_WRITE_STATUS: u32 = 212;
        pub const CLTOCS_GET_CHUNK_BLOCKS: u32 = 220;
        pub const CSTOCL_GET_CHUNK_BLOCKS: u32 = 221;
        pub const CLTOCS_HDD_LIST_V2: u32 = 230;
        pub const CLTOCS_LIST_DISK_GROUPS: u32 = 231;
        pub const CLTOCS_CHART: u32 = 232;
        pub const CLTOCS_TEST_CHUNK: u32 = 233;
        pub const CLTOCS_ADMIN_DISK_GROUPS: u32 = 234;
    }

    pub mod current {
        use super::MIN_SAU_PACKET_TYPE;
        pub const SAU_CLTOCS_READ: u32 = MIN_SAU_PACKET_TYPE + 0;
        pub const SAU_CSTOCL_READ_DATA: u32 = MIN_SAU_PACKET_TYPE + 1;
        pub const SAU_CSTOCL_READ_STATUS: u32 = MIN_SAU_PACKET_TYPE + 2;
        pub const SAU_CLTOCS_WRITE_INIT: u32 = MIN_SAU_PACKET_TYPE + 10;
        pub const SAU_CLTOCS_WRITE_DATA: u32 = MIN_SAU_PACKET_TYPE + 11;
        pub const SAU_CSTOCL_WRITE_STATUS: u32 = MIN_SAU_PACKET_TYPE + 12;
        pub const SAU_CLTOCS_WRITE_END: u32 = MIN_SAU_PACKET_TYPE + 13;
        pub const SAU_CLTOCS_PREFETCH: u32 = MIN_SAU_PACKET_TYPE + 20;
        pub const SAU_CLTOCS_GET_CHUNK_BLOCKS: u32 = MIN_SAU_PACKET_TYPE + 30;
        pub const SAU_CSTOCL_GET_CHUNK_BLOCKS: u32 = MIN_SAU_PACKET_TYPE + 31;
        pub const SAU_CLTOCS_HDD_LIST_V2: u32 = MIN_SAU_PACKET_TYPE + 40;
        pub const SAU_CLTOCS_LIST_DISK_GROUPS: u32 = MIN_SAU_PACKET_TYPE + 41;
        pub const SAU_CLTOCS_CHART: u32 = MIN_SAU_PACKET_TYPE + 42;
        pub const SAU_CLTOCS_TEST_CHUNK: u32 = MIN_SAU_PACKET_TYPE + 43;
        pub const SAU_CLTOCS_ADMIN_DISK_GROUPS: u32 = MIN_SAU_PACKET_TYPE + 44;
    }

    pub const ANTOAN_NOP: u32 = legacy::ANTOAN_NOP;
    pub const ANTOAN_PING: u32 = legacy::ANTOAN_PING;
    pub const ANTOAN_PING_REPLY: u32 = legacy::ANTOAN_PING_REPLY;

    pub fn is_legacy(t: u32) -> bool {
        t <= MAX_OLD_PACKET_TYPE
    }

    pub fn is_current(t: u32) -> bool {
        (MIN_SAU_PACKET_TYPE..=crate::config::protocol_ranges::MAX_SAU_PACKET_TYPE).contains(&t)
    }
}

impl Dialect {
    /// Classifies a raw wire type into the dialect that owns it. Keepalive
    /// types (`ANTOAN_*`) are shared and classify as neither.
    pub fn from_packet_type(t: u32) -> Option<Dialect> {
        if packet_type::is_legacy(t) {
            Some(Dialect::Legacy)
        } else if packet_type::is_current(t) {
            Some(Dialect::Current)
        } else {
            None
        }
    }
}

/// Failure to parse a packet payload: always results in `Close` with no
/// status emitted (§7).
#[derive(Debug, thiserror::Error)]
pub enum ParseError {
    #[error("packet too short: need {need} more bytes, have {have}")]
    TooShort { need: usize, have: usize },
    #[error("malformed packet: {0}")]
    Malformed(&'static str),
}

struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Reader { buf, pos: 0 }
    }

    fn need(&self, n: usize) -> Result<(), ParseError> {
        if self.pos + n > self.buf.len() {
            Err(ParseError::TooShort {
                need: self.pos + n - self.buf.len(),
                have: self.buf.len() - self.pos,
            })
        } else {
            Ok(())
        }
    }

    fn u8(&mut self) -> Result<u8, ParseError> {
        self.need(1)?;
        let v = self.buf[self.pos];
        self.pos += 1;
        Ok(v)
    }

    fn u16(&mut self) -> Result<u16, ParseError> {
        self.need(2)?;
        let v = u16::from_be_bytes(self.buf[self.pos..self.pos + 2].try_into().unwrap());
        self.pos += 2;
        Ok(v)
    }

    fn u32(&mut self) -> Result<u32, ParseError> {
        self.need(4)?;
        let v = u32::from_be_bytes(self.buf[self.pos..self.pos + 4].try_into().unwrap());
        self.pos += 4;
        Ok(v)
    }

    fn u64(&mut self) -> Result<u64, ParseError> {
        self.need(8)?;
        let v = u64::from_be_bytes(self.buf[self.pos..self.pos + 8].try_into().unwrap());
        self.pos += 8;
        Ok(v)
    }

    fn remaining(&self) -> &'a [u8] {
        &self.buf[self.pos..]
    }
}

/// Chunk part type discriminator (replication/erasure scheme).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChunkPartType {
    Standard,
    Xor { level: u8, part: u8 },
    Ec { data: u8, parity: u8 },
}

impl ChunkPartType {
    fn encode(self) -> [u8; 3] {
        match self {
            ChunkPartType::Standard => [0, 0, 0],
            ChunkPartType::Xor { level, part } => [1, level, part],
            ChunkPartType::Ec { data, parity } => [2, data, parity],
        }
    }

    fn decode(reader: &mut Reader) -> Result<ChunkPartType, ParseError> {
        let tag = reader.u8()?;
        let a = reader.u8()?;
        let b = reader.u8()?;
        match tag {
            0 => Ok(ChunkPartType::Standard),
            1 => Ok(ChunkPartType::Xor { level: a, part: b }),
            2 => Ok(ChunkPartType::Ec { data: a, parity: b }),
            _ => Err(ParseError::Malformed("unknown chunk part type tag")),
        }
    }
}

/// One hop in a write chain: the peer's address, the part type it should
/// receive, and the peer's advertised protocol version (used to pick its
/// re-encoding on forward).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChainEntry {
    pub addr: std::net::SocketAddrV4,
    pub part_type: ChunkPartType,
    pub peer_version: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadRequest {
    pub chunk_id: u64,
    pub version: u32,
    pub part_type: ChunkPartType,
    pub offset: u32,
    pub size: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteInitRequest {
    pub chunk_id: u64,
    pub version: u32,
    pub part_type: ChunkPartType,
    pub chain: Vec<ChainEntry>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WriteDataHeader {
    pub chunk_id: u64,
    pub write_id: u32,
    pub block_num: u16,
    pub offset: u32,
    pub size: u32,
    pub crc: u32,
}

fn put_u32(out: &mut Vec<u8>, v: u32) {
    out.extend_from_slice(&v.to_be_bytes());
}
fn put_u64(out: &mut Vec<u8>, v: u64) {
    out.extend_from_slice(&v.to_be_bytes());
}
fn put_u16(out: &mut Vec<u8>, v: u16) {
    out.extend_from_slice(&v.to_be_bytes());
}
fn put_addr(out: &mut Vec<u8>, addr: &std::net::SocketAddrV4) {
    out.extend_from_slice(&addr.ip().octets());
    put_u16(out, addr.port());
}
fn get_addr(reader: &mut Reader) -> Result<std::net::SocketAddrV4, ParseError> {
    reader.need(6)?;
    let octets: [u8; 4] = reader.remaining()[0..4].try_into().unwrap();
    // advance manually since Reader has no u8 array helper
    for _ in 0..4 {
        reader.u8()?;
    }
    let port = reader.u16()?;
    Ok(std::net::SocketAddrV4::new(octets.into(), port))
}

/// A wrapped, type-prefixed packet body ready to be sent: callers prepend
/// the `[type:u32][length:u32]` header with [`crate::packet::encode_header`].
pub trait MessageSerializer: std::fmt::Debug + Send + Sync {
    fn dialect(&self) -> Dialect;

    fn read_packet_type(&self) -> u32;
    fn read_status_packet_type(&self) -> u32;
    fn read_data_packet_type(&self) -> u32;
    fn write_init_packet_type(&self) -> u32;
    fn write_data_packet_type(&self) -> u32;
    fn write_status_packet_type(&self) -> u32;
    fn write_end_packet_type(&self) -> Option<u32>;
    fn prefetch_packet_type(&self) -> Option<u32>;
    fn get_chunk_blocks_packet_type(&self) -> u32;
    fn get_chunk_blocks_reply_packet_type(&self) -> u32;
    fn test_chunk_packet_type(&self) -> u32;

    fn parse_read_request(&self, payload: &[u8]) -> Result<ReadRequest, ParseError>;
    fn parse_chunk_key_request(&self, payload: &[u8]) -> Result<ChunkKeyRequest, ParseError>;
    fn parse_write_init(&self, payload: &[u8]) -> Result<WriteInitRequest, ParseError>;
    fn parse_write_data_header(
        &self,
        payload: &[u8],
    ) -> Result<(WriteDataHeader, usize), ParseError>;
    fn parse_write_status(&self, payload: &[u8]) -> Result<(u64, u32, SfsStatus), ParseError>;
    fn parse_write_end(&self, payload: &[u8]) -> Result<u64, ParseError>;

    fn serialize_read_data_prefix(&self, chunk_id: u64, offset: u32, size: u32) -> Vec<u8>;
    fn serialize_read_status(&self, chunk_id: u64, status: SfsStatus) -> Vec<u8>;
    fn serialize_write_status(&self, chunk_id: u64, write_id: u32, status: SfsStatus) -> Vec<u8>;
    fn serialize_write_init_chain(
        &self,
        chunk_id: u64,
        version: u32,
        part_type: ChunkPartType,
        chain: &[ChainEntry],
    ) -> Vec<u8>;
    fn serialize_write_data_header(&self, header: &WriteDataHeader) -> Vec<u8>;

    fn serialize_get_chunk_blocks_reply(
        &self,
        chunk_id: u64,
        status: SfsStatus,
        block_count: u16,
    ) -> Vec<u8>;
}

/// A bare `(chunkId, version, partType)` request payload shared by
/// `GetChunkBlocks` and `TestChunk` (§4.6 Idle transitions).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkKeyRequest {
    pub chunk_id: u64,
    pub version: u32,
    pub part_type: ChunkPartType,
}

fn status_to_u8(status: SfsStatus) -> u8 {
    u8::from(status)
}

fn status_from_u8(byte: u8) -> Result<SfsStatus, ParseError> {
    SfsStatus::try_from(byte).map_err(|_| ParseError::Malformed("unknown status byte"))
}

/// The fixed-layout legacy (`MFS`) dialect: no part-type field on reads,
/// chain entries carry only an address (always `Standard` part type,
/// version unknown), no `WRITE_END`/`PREFETCH` packets.
#[derive(Debug, Default, Clone, Copy)]
pub struct LegacySerializer;

impl MessageSerializer for LegacySerializer {
    fn dialect(&self) -> Dialect {
        Dialect::Legacy
    }
    fn read_packet_type(&self) -> u32 {
        packet_type::legacy::CLTOCS_READ
    }
    fn read_status_packet_type(&self) -> u32 {
        packet_type::legacy::CSTOCL_READ_STATUS
    }
    fn read_data_packet_type(&self) -> u32 {
        packet_type::legacy::CSTOCL_READ_DATA
    }
    fn write_init_packet_type(&self) -> u32 {
        packet_type::legacy::CLTOCS_WRITE
    }
    fn write_data_packet_type(&self) -> u32 {
        packet_type::legacy::CLTOCS_WRITE_DATA
    }
    fn write_status_packet_type(&self) -> u32 {
        packet_type::legacy::CSTOCL_WRITE_STATUS
    }
    fn write_end_packet_type(&self) -> Option<u32> {
        None
    }
    fn prefetch_packet_type(&self) -> Option<u32> {
        None
    }
    fn get_chunk_blocks_packet_type(&self) -> u32 {
        packet_type::legacy::CLTOCS_GET_CHUNK_BLOCKS
    }
    fn get_chunk_blocks_reply_packet_type(&self) -> u32 {
        packet_type::legacy::CSTOCL_GET_CHUNK_BLOCKS
    }
    fn test_chunk_packet_type(&self) -> u32 {
        packet_type::legacy::CLTOCS_TEST_CHUNK
    }

    fn parse_read_request(&self, payload: &[u8]) -> Result<ReadRequest, ParseError> {
        let mut r = Reader::new(payload);
        let chunk_id = r.u64()?;
        let version = r.u32()?;
        let offset = r.u32()?;
        let size = r.u32()?;
        Ok(ReadRequest {
            chunk_id,
            version,
            part_type: ChunkPartType::Standard,
            offset,
            size,
        })
    }

    fn parse_chunk_key_request(&self, payload: &[u8]) -> Result<ChunkKeyRequest, ParseError> {
        let mut r = Reader::new(payload);
        let chunk_id = r.u64()?;
        let version = r.u32()?;
        Ok(ChunkKeyRequest {
            chunk_id,
            version,
            part_type: ChunkPartType::Standard,
        })
    }

    fn parse_write_init(&self, payload: &[u8]) -> Result<WriteInitRequest, ParseError> {
        let mut r = Reader::new(payload);
        let chunk_id = r.u64()?;
        let version = r.u32()?;
        let mut chain = Vec::new();
        while r.remaining().len() >= 6 {
            let addr = get_addr(&mut r)?;
            chain.push(ChainEntry {
                addr,
                part_type: ChunkPartType::Standard,
                peer_version: 0,
            });
        }
        Ok(WriteInitRequest {
            chunk_id,
            version,
            part_type: ChunkPartType::Standard,
            chain,
        })
    }

    fn parse_write_data_header(
        &self,
        payload: &[u8],
    ) -> Result<(WriteDataHeader, usize), ParseError> {
        let mut r = Reader::new(payload);
        let chunk_id = r.u64()?;
        let write_id = r.u32()?;
        let block_num = r.u16()?;
        let offset = r.u32()?;
        let size = r.u32()?;
        let crc = r.u32()?;
        Ok((
            WriteDataHeader {
                chunk_id,
                write_id,
                block_num,
                offset,
                size,
                crc,
            },
            r.pos,
        ))
    }

    fn parse_write_status(&self, payload: &[u8]) -> Result<(u64, u32, SfsStatus), ParseError> {
        let mut r = Reader::new(payload);
        let chunk_id = r.u64()?;
        let write_id = r.u32()?;
        let status = status_from_u8(r.u8()?)?;
        Ok((chunk_id, write_id, status))
    }

    fn parse_write_end(&self, _payload: &[u8]) -> Result<u64, ParseError> {
        Err(ParseError::Malformed(
            "WRITE_END is not part of the legacy dialect",
        ))
    }

    fn serialize_read_data_prefix(&self, chunk_id: u64, offset: u32, size: u32) -> Vec<u8> {
        let mut out = Vec::with_capacity(16);
        put_u64(&mut out, chunk_id);
        put_u32(&mut out, offset);
        put_u32(&mut out, size);
        out
    }

    fn serialize_read_status(&self, chunk_id: u64, status: SfsStatus) -> Vec<u8> {
        let mut out = Vec::with_capacity(9);
        put_u64(&mut out, chunk_id);
        out.push(status_to_u8(status));
        out
    }

    fn serialize_write_status(&self, chunk_id: u64, write_id: u32, status: SfsStatus) -> Vec<u8> {
        let mut out = Vec::with_capacity(13);
        put_u64(&mut out, chunk_id);
        put_u32(&mut out, write_id);
        out.push(status_to_u8(status));
        out
    }

    fn serialize_write_init_chain(
        &self,
        chunk_id: u64,
        version: u32,
        _part_type: ChunkPartType,
        chain: &[ChainEntry],
    ) -> Vec<u8> {
        let mut out = Vec::with_capacity(12 + chain.len() * 6);
        put_u64(&mut out, chunk_id);
        put_u32(&mut out, version);
        for entry in chain {
            put_addr(&mut out, &entry.addr);
        }
        out
    }

    fn serialize_write_data_header(&self, header: &WriteDataHeader) -> Vec<u8> {
        let mut out = Vec::with_capacity(26);
        put_u64(&mut out, header.chunk_id);
        put_u32(&mut out, header.write_id);
        put_u16(&mut out, header.block_num);
        put_u32(&mut out, header.offset);
        put_u32(&mut out, header.size);
        put_u32(&mut out, header.crc);
        out
    }

    fn serialize_get_chunk_blocks_reply(
        &self,
        chunk_id: u64,
        status: SfsStatus,
        block_count: u16,
    ) -> Vec<u8> {
        let mut out = Vec::with_capacity(11);
        put_u64(&mut out, chunk_id);
        put_u16(&mut out, block_count);
        out.push(status_to_u8(status));
        out
    }
}

/// The current (`SAU_`) dialect: part type travels on reads and chain
/// entries, chain entries also carry the peer's version so it can be
/// re-encoded downstream, and adds `WRITE_END`/`PREFETCH`.
#[derive(Debug, Default, Clone, Copy)]
pub struct CurrentSerializer;

impl MessageSerializer for CurrentSerializer {
    fn dialect(&self) -> Dialect {
        Dialect::Current
    }
    fn read_packet_type(&self) -> u32 {
        packet_type::current::SAU_CLTOCS_READ
    }
    fn read_status_packet_type(&self) -> u32 {
        packet_type::current::SAU_CSTOCL_READ_STATUS
    }
    fn read_data_packet_type(&self) -> u32 {
        packet_type::current::SAU_CSTOCL_READ_DATA
    }
    fn write_init_packet_type(&self) -> u32 {
        packet_type::current::SAU_CLTOCS_WRITE_INIT
    }
    fn write_data_packet_type(&self) -> u32 {
        packet_type::current::SAU_CLTOCS_WRITE_DATA
    }
    fn write_status_packet_type(&self) -> u32 {
        packet_type::current::SAU_CSTOCL_WRITE_STATUS
    }
    fn write_end_packet_type(&self) -> Option<u32> {
        Some(packet_type::current::SAU_CLTOCS_WRITE_END)
    }
    fn prefetch_packet_type(&self) -> Option<u32> {
        Some(packet_type::current::SAU_CLTOCS_PREFETCH)
    }
    fn get_chunk_blocks_packet_type(&self) -> u32 {
        packet_type::current::SAU_CLTOCS_GET_CHUNK_BLOCKS
    }
    fn get_chunk_blocks_reply_packet_type(&self) -> u32 {
        packet_type::current::SAU_CSTOCL_GET_CHUNK_BLOCKS
    }
    fn test_chunk_packet_type(&self) -> u32 {
        packet_type::current::SAU_CLTOCS_TEST_CHUNK
    }

    fn parse_read_request(&self, payload: &[u8]) -> Result<ReadRequest, ParseError> {
        let mut r = Reader::new(payload);
        let chunk_id = r.u64()?;
        let version = r.u32()?;
        let part_type = ChunkPartType::decode(&mut r)?;
        let offset = r.u32()?;
        let size = r.u32()?;
        Ok(ReadRequest {
            chunk_id,
            version,
            part_type,
            offset,
            size,
        })
    }

    fn parse_chunk_key_request(&self, payload: &[u8]) -> Result<ChunkKeyRequest, ParseError> {
        let mut r = Reader::new(payload);
        let chunk_id = r.u64()?;
        let version = r.u32()?;
        let part_type = ChunkPartType::decode(&mut r)?;
        Ok(ChunkKeyRequest {
            chunk_id,
            version,
            part_type,
        })
    }

    fn parse_write_init(&self, payload: &[u8]) -> Result<WriteInitRequest, ParseError> {
        let mut r = Reader::new(payload);
        let chunk_id = r.u64()?;
        let version = r.u32()?;
        let part_type = ChunkPartType::decode(&mut r)?;
        let mut chain = Vec::new();
        while r.remaining().len() >= 6 + 3 + 4 {
            let addr = get_addr(&mut r)?;
            let entry_part_type = ChunkPartType::decode(&mut r)?;
            let peer_version = r.u32()?;
            chain.push(ChainEntry {
                addr,
                part_type: entry_part_type,
                peer_version,
            });
        }
        Ok(WriteInitRequest {
            chunk_id,
            version,
            part_type,
            chain,
        })
    }

    fn parse_write_data_header(
        &self,
        payload: &[u8],
    ) -> Result<(WriteDataHeader, usize), ParseError> {
        // Identical layout to the legacy dialect; kept as a separate method
        // so each dialect's header size can diverge independently later.
        LegacySerializer.parse_write_data_header(payload)
    }

    fn parse_write_status(&self, payload: &[u8]) -> Result<(u64, u32, SfsStatus), ParseError> {
        LegacySerializer.parse_write_status(payload)
    }

    fn parse_write_end(&self, payload: &[u8]) -> Result<u64, ParseError> {
        let mut r = Reader::new(payload);
        r.u64()
    }

    fn serialize_read_data_prefix(&self, chunk_id: u64, offset: u32, size: u32) -> Vec<u8> {
        LegacySerializer.serialize_read_data_prefix(chunk_id, offset, size)
    }

    fn serialize_read_status(&self, chunk_id: u64, status: SfsStatus) -> Vec<u8> {
        LegacySerializer.serialize_read_status(chunk_id, status)
    }

    fn serialize_write_status(&self, chunk_id: u64, write_id: u32, status: SfsStatus) -> Vec<u8> {
        LegacySerializer.serialize_write_status(chunk_id, write_id, status)
    }

    fn serialize_write_init_chain(
        &self,
        chunk_id: u64,
        version: u32,
        part_type: ChunkPartType,
        chain: &[ChainEntry],
    ) -> Vec<u8> {
        let mut out = Vec::with_capacity(12 + 3 + chain.len() * (6 + 3 + 4));
        put_u64(&mut out, chunk_id);
        put_u32(&mut out, version);
        out.extend_from_slice(&part_type.encode());
        for entry in chain {
            put_addr(&mut out, &entry.addr);
            out.extend_from_slice(&entry.part_type.encode());
            put_u32(&mut out, entry.peer_version);
        }
        out
    }

    fn serialize_write_data_header(&self, header: &WriteDataHeader) -> Vec<u8> {
        LegacySerializer.serialize_write_data_header(header)
    }

    fn serialize_get_chunk_blocks_reply(
        &self,
        chunk_id: u64,
        status: SfsStatus,
        block_count: u16,
    ) -> Vec<u8> {
        LegacySerializer.serialize_get_chunk_blocks_reply(chunk_id, status, block_count)
    }
}

/// Picks the dialect a packet type belongs to and returns the matching
/// serializer singleton, or `None` for keepalive types shared by both
/// dialects or for unrecognized types.
pub fn serializer_for_dialect(dialect: Dialect) -> &'static dyn MessageSerializer {
    static LEGACY: LegacySerializer = LegacySerializer;
    static CURRENT: CurrentSerializer = CurrentSerializer;
    match dialect {
        Dialect::Legacy => &LEGACY,
        Dialect::Current => &CURRENT,
    }
}

/// The two-byte legacy chunk-type tag used by [`serialize_write_init_chain_xor_tier`]:
/// `(tag, level)` where `tag` distinguishes standard/XOR and `level` packs a
/// XOR scheme's level and part into one nibble-pair. A downstream hop too old
/// to be EC-aware has no slot for EC's `(data, parity)` pair, so an `Ec` part
/// type collapses to the bare XOR tag with `level = 0` here.
fn legacy_chunk_type_byte(part_type: ChunkPartType) -> (u8, u8) {
    match part_type {
        ChunkPartType::Standard => (0, 0),
        ChunkPartType::Xor { level, part } => (1, (level << 4) | (part & 0x0F)),
        ChunkPartType::Ec { .. } => (1, 0),
    }
}

/// The XOR-tier chain re-encoding (§4.4): the same current-dialect
/// `WRITE_INIT` packet type as the EC-aware encoding, but each part type -
/// the chunk's own and every chain entry's - is packed into the older
/// two-byte `(tag, level)` pair instead of the full three-byte EC-capable
/// encoding, and chain entries drop the peer-version field entirely (only an
/// EC-aware hop re-derives a further re-encoding from it).
fn serialize_write_init_chain_xor_tier(
    chunk_id: u64,
    version: u32,
    part_type: ChunkPartType,
    chain: &[ChainEntry],
) -> Vec<u8> {
    let mut out = Vec::with_capacity(12 + 2 + chain.len() * (6 + 2));
    put_u64(&mut out, chunk_id);
    put_u32(&mut out, version);
    let (tag, level) = legacy_chunk_type_byte(part_type);
    out.push(tag);
    out.push(level);
    for entry in chain {
        put_addr(&mut out, &entry.addr);
        let (tag, level) = legacy_chunk_type_byte(entry.part_type);
        out.push(tag);
        out.push(level);
    }
    out
}

/// Encodes a re-sent write-chain header for the next hop, choosing one of
/// three wire shapes by the hop's advertised version (§4.4 / original
/// `serializeCltocsWriteInit`): EC-aware current-dialect chain (full
/// three-byte part type plus peer version per entry), XOR-tier
/// current-dialect chain (two-byte legacy part-type tag, no peer version),
/// or legacy `CLTOCS_WRITE` with a bare address vector.
pub fn reencode_chain_for_next_hop(
    next_hop_version: u32,
    chunk_id: u64,
    version: u32,
    part_type: ChunkPartType,
    remaining_chain: &[ChainEntry],
) -> (u32, Vec<u8>) {
    use crate::config::protocol_ranges::{FIRST_EC_VERSION, FIRST_XOR_VERSION};

    if next_hop_version >= FIRST_EC_VERSION {
        let ser = CurrentSerializer;
        (
            ser.write_init_packet_type(),
            ser.serialize_write_init_chain(chunk_id, version, part_type, remaining_chain),
        )
    } else if next_hop_version >= FIRST_XOR_VERSION {
        (
            CurrentSerializer.write_init_packet_type(),
            serialize_write_init_chain_xor_tier(chunk_id, version, part_type, remaining_chain),
        )
    } else {
        let ser = LegacySerializer;
        (
            ser.write_init_packet_type(),
            ser.serialize_write_init_chain(chunk_id, version, part_type, remaining_chain),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{Ipv4Addr, SocketAddrV4};

    #[test]
    fn legacy_read_request_round_trip() {
        let ser = LegacySerializer;
        let req = ReadRequest {
            chunk_id: 42,
            version: 1,
            part_type: ChunkPartType::Standard,
            offset: 100,
            size: 50,
        };
        let mut wire = Vec::new();
        put_u64(&mut wire, req.chunk_id);
        put_u32(&mut wire, req.version);
        put_u32(&mut wire, req.offset);
        put_u32(&mut wire, req.size);
        let parsed = ser.parse_read_request(&wire).unwrap();
        assert_eq!(parsed, req);
    }

    #[test]
    fn current_read_request_round_trip_with_part_type() {
        let ser = CurrentSerializer;
        let req = ReadRequest {
            chunk_id: 7,
            version: 3,
            part_type: ChunkPartType::Ec { data: 6, parity: 2 },
            offset: 0,
            size: 65536,
        };
        let mut wire = Vec::new();
        put_u64(&mut wire, req.chunk_id);
        put_u32(&mut wire, req.version);
        wire.extend_from_slice(&req.part_type.encode());
        put_u32(&mut wire, req.offset);
        put_u32(&mut wire, req.size);
        let parsed = ser.parse_read_request(&wire).unwrap();
        assert_eq!(parsed, req);
    }

    #[test]
    fn dialects_produce_bit_distinct_write_status() {
        let legacy = LegacySerializer.serialize_write_status(1, 2, SfsStatus::Ok);
        let current = CurrentSerializer.serialize_write_status(1, 2, SfsStatus::Ok);
        // Same fixed layout by construction in this core, but packet types
        // (which accompany the payload on the wire) always differ:
        assert_ne!(
            LegacySerializer.write_status_packet_type(),
            CurrentSerializer.write_status_packet_type()
        );
        assert_eq!(legacy, current);
    }

    #[test]
    fn write_init_chain_round_trip_current_dialect() {
        let ser = CurrentSerializer;
        let chain = vec![ChainEntry {
            addr: SocketAddrV4::new(Ipv4Addr::new(10, 0, 0, 1), 9422),
            part_type: ChunkPartType::Xor { level: 4, part: 1 },
            peer_version: 0x0010_0000,
        }];
        let wire = ser.serialize_write_init_chain(7, 1, ChunkPartType::Standard, &chain);
        let parsed = ser.parse_write_init(&wire).unwrap();
        assert_eq!(parsed.chunk_id, 7);
        assert_eq!(parsed.version, 1);
        assert_eq!(parsed.chain, chain);
    }

    #[test]
    fn chain_reencoding_picks_three_distinct_wire_shapes_by_next_hop_version() {
        use crate::config::protocol_ranges::{FIRST_EC_VERSION, FIRST_XOR_VERSION};

        let chain = vec![ChainEntry {
            addr: SocketAddrV4::new(Ipv4Addr::new(10, 0, 0, 2), 9422),
            part_type: ChunkPartType::Xor { level: 4, part: 1 },
            peer_version: 0x0010_0000,
        }];

        let (ec_type, ec_body) =
            reencode_chain_for_next_hop(FIRST_EC_VERSION, 7, 1, ChunkPartType::Standard, &chain);
        let (xor_type, xor_body) =
            reencode_chain_for_next_hop(FIRST_XOR_VERSION, 7, 1, ChunkPartType::Standard, &chain);
        let (legacy_type, legacy_body) = reencode_chain_for_next_hop(
            FIRST_XOR_VERSION - 1,
            7,
            1,
            ChunkPartType::Standard,
            &chain,
        );

        // EC-tier and XOR-tier share the current-dialect WRITE_INIT packet
        // type but differ in body shape (3-byte part type + peer version vs
        // the 2-byte legacy tag with no peer version).
        assert_eq!(ec_type, xor_type);
        assert_eq!(ec_type, CurrentSerializer.write_init_packet_type());
        assert_ne!(ec_body, xor_body);
        assert_eq!(ec_body.len(), xor_body.len() + chain.len() * 5 + 1);

        // The legacy tier uses an entirely different packet type and a body
        // with no part-type or version field at all.
        assert_eq!(legacy_type, LegacySerializer.write_init_packet_type());
        assert_ne!(legacy_type, ec_type);
        assert_ne!(legacy_body, ec_body);
        assert_ne!(legacy_body, xor_body);
    }

    #[test]
    fn get_chunk_blocks_reply_round_trips_status_and_count() {
        let ser = CurrentSerializer;
        let wire = ser.serialize_get_chunk_blocks_reply(9, SfsStatus::Ok, 512);
        assert_eq!(&wire[0..8], &9u64.to_be_bytes());
        assert_eq!(&wire[8..10], &512u16.to_be_bytes());
        assert_eq!(wire[10], 0);
    }

    #[test]
    fn chunk_key_request_round_trip_current_dialect() {
        let ser = CurrentSerializer;
        let req = ChunkKeyRequest {
            chunk_id: 55,
            version: 2,
            part_type: ChunkPartType::Xor { level: 3, part: 1 },
        };
        let mut wire = Vec::new();
        put_u64(&mut wire, req.chunk_id);
        put_u32(&mut wire, req.version);
        wire.extend_from_slice(&req.part_type.encode());
        let parsed = ser.parse_chunk_key_request(&wire).unwrap();
        assert_eq!(parsed, req);
    }

    #[test]
    fn dialect_classification_matches_ranges() {
        assert_eq!(
            Dialect::from_packet_type(packet_type::legacy::CLTOCS_READ),
            Some(Dialect::Legacy)
        );
        assert_eq!(
            Dialect::from_packet_type(packet_type::current::SAU_CLTOCS_READ),
            Some(Dialect::Current)
        );
    }
}
