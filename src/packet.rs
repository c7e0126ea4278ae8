//! Wire framing (`[type:u32][length:u32][payload]`) and the aligned input
//! buffer used for `WriteData`/`WriteEnd` payloads (§4.2, §6).

use crate::buffer::aligned::{aligned_vec, ALIGNMENT};
use crate::constants::{MAX_PACKET_SIZE, SFSBLOCKSIZE, WRITE_DATA_PREFIX_SIZE};

/// `[type:u32][length:u32]` framing header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketHeader {
    pub ptype: u32,
    pub length: u32,
}

impl PacketHeader {
    pub const SIZE: usize = 8;

    pub fn parse(bytes: &[u8; Self::SIZE]) -> PacketHeader {
        PacketHeader {
            ptype: u32::from_be_bytes(bytes[0..4].try_into().unwrap()),
            length: u32::from_be_bytes(bytes[4..8].try_into().unwrap()),
        }
    }

    pub fn encode(&self) -> [u8; Self::SIZE] {
        let mut out = [0u8; Self::SIZE];
        out[0..4].copy_from_slice(&self.ptype.to_be_bytes());
        out[4..8].copy_from_slice(&self.length.to_be_bytes());
        out
    }

    /// True if `length` is within the wire-level size budget.
    pub fn length_is_valid(&self) -> bool {
        (self.length as usize) <= MAX_PACKET_SIZE
    }
}

/// Wraps `ptype`/`payload` in a full `[type][length][payload]` frame.
pub fn encode_packet(ptype: u32, payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(PacketHeader::SIZE + payload.len());
    out.extend_from_slice(
        &PacketHeader {
            ptype,
            length: payload.len() as u32,
        }
        .encode(),
    );
    out.extend_from_slice(payload);
    out
}

/// Which half of a packet a connection's read cursor is currently in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadMode {
    Header,
    Data,
}

/// A page-aligned scratch buffer sized so that a `WriteData` payload copied
/// into it at offset [`Self::payload_start`] starts on a 4 KiB boundary -
/// ready for `O_DIRECT` writes without a further copy (§4.2).
///
/// This is purely a performance path: `ConnectionEntry` parses a `WriteData`
/// packet identically whether its bytes live here or in a plain `Vec<u8>`,
/// per the Open Question resolution in §9 of the design notes.
pub struct AlignedPacket {
    storage: Vec<u8>,
    payload_start: usize,
}

impl AlignedPacket {
    /// `prefix_size` is the dialect's `WriteData` header size; the payload
    /// is positioned so it starts aligned right after it, mirroring
    /// `kIOAlignedOffset = blockSize - prefixSize` in the original.
    pub fn new(prefix_size: usize) -> Self {
        let storage = aligned_vec(ALIGNMENT + SFSBLOCKSIZE, ALIGNMENT);
        AlignedPacket {
            storage,
            payload_start: ALIGNMENT - prefix_size,
        }
    }

    pub fn with_default_prefix() -> Self {
        Self::new(WRITE_DATA_PREFIX_SIZE)
    }

    /// Offset within [`Self::storage`] at which the packet prefix begins
    /// (so the variable-size payload that follows lands block-aligned).
    pub fn prefix_start(&self) -> usize {
        self.payload_start
    }

    /// A mutable view of the whole packet body (prefix + payload),
    /// `total_len` bytes starting at [`Self::prefix_start`].
    pub fn as_mut_slice(&mut self, total_len: usize) -> &mut [u8] {
        &mut self.storage[self.payload_start..self.payload_start + total_len]
    }

    pub fn as_slice(&self, total_len: usize) -> &[u8] {
        &self.storage[self.payload_start..self.payload_start + total_len]
    }
}

impl std::fmt::Debug for AlignedPacket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AlignedPacket")
            .field("payload_start", &self.payload_start)
            .field("storage_len", &self.storage.len())
            .finish()
    }
}

/// Backing storage for a packet body being read off the wire: either a
/// plain growable buffer, or the page-aligned [`AlignedPacket`] used for
/// `WriteData`/`WriteEnd` when `useAlignedMemory` is set.
#[derive(Debug)]
pub enum PacketBody {
    Plain(Vec<u8>),
    Aligned(AlignedPacket),
}

impl PacketBody {
    pub fn plain_with_capacity(len: usize) -> Self {
        PacketBody::Plain(vec![0u8; len])
    }

    pub fn aligned(len: usize) -> Self {
        let mut packet = AlignedPacket::with_default_prefix();
        // Zero exactly the region that will be read into; the rest of the
        // (reused) aligned storage is scratch space.
        packet.as_mut_slice(len).iter_mut().for_each(|b| *b = 0);
        PacketBody::Aligned(packet)
    }

    pub fn as_mut_slice(&mut self, len: usize) -> &mut [u8] {
        match self {
            PacketBody::Plain(v) => {
                if v.len() < len {
                    v.resize(len, 0);
                }
                &mut v[..len]
            }
            PacketBody::Aligned(p) => p.as_mut_slice(len),
        }
    }

    pub fn as_slice(&self, len: usize) -> &[u8] {
        match self {
            PacketBody::Plain(v) => &v[..len],
            PacketBody::Aligned(p) => p.as_slice(len),
        }
    }
}

/// The restartable state of a packet currently being read off a socket:
/// header first, then a variable-size body once the header declares its
/// length. Used for both the client-facing `inputPacket` and the
/// downstream-facing `forwardInputPacket`.
#[derive(Debug)]
pub struct InputPacket {
    pub mode: ReadMode,
    header_buf: [u8; PacketHeader::SIZE],
    header_filled: usize,
    pub header: Option<PacketHeader>,
    pub body: PacketBody,
    body_filled: usize,
}

impl Default for InputPacket {
    fn default() -> Self {
        InputPacket {
            mode: ReadMode::Header,
            header_buf: [0u8; PacketHeader::SIZE],
            header_filled: 0,
            header: None,
            body: PacketBody::Plain(Vec::new()),
            body_filled: 0,
        }
    }
}

/// Outcome of feeding freshly-read bytes into an [`InputPacket`].
#[derive(Debug, PartialEq, Eq)]
pub enum FeedResult {
    /// Still waiting on more bytes for the current section.
    NeedMore,
    /// The header just completed; caller should inspect `header` and decide
    /// how to size/allocate the body (plain vs. aligned) before further
    /// reads land in `body`.
    HeaderComplete,
    /// The full packet (header + body) is now available.
    PacketComplete,
}

impl InputPacket {
    pub fn new() -> Self {
        Self::default()
    }

    /// Resets the packet to await a fresh header, e.g. after dispatch.
    pub fn reset(&mut self) {
        self.mode = ReadMode::Header;
        self.header_filled = 0;
        self.header = None;
        self.body = PacketBody::Plain(Vec::new());
        self.body_filled = 0;
    }

    /// Switches to reading the body with the given backing storage, once
    /// the header has been inspected (`FeedResult::HeaderComplete`).
    pub fn begin_body(&mut self, body: PacketBody) {
        self.mode = ReadMode::Data;
        self.body = body;
        self.body_filled = 0;
    }

    /// How many more bytes are needed to complete the current section.
    pub fn bytes_needed(&self) -> usize {
        match self.mode {
            ReadMode::Header => PacketHeader::SIZE - self.header_filled,
            ReadMode::Data => {
                let total = self.header.map(|h| h.length as usize).unwrap_or(0);
                total - self.body_filled
            }
        }
    }

    /// Copies as much of `src` as fits into the current section, returning
    /// the number of bytes consumed and the resulting state.
    pub fn feed(&mut self, src: &[u8]) -> (usize, FeedResult) {
        let need = self.bytes_needed();
        let take = need.min(src.len());

        match self.mode {
            ReadMode::Header => {
                self.header_buf[self.header_filled..self.header_filled + take]
                    .copy_from_slice(&src[..take]);
                self.header_filled += take;
                if self.header_filled == PacketHeader::SIZE {
                    self.header = Some(PacketHeader::parse(&self.header_buf));
                    let total = self.header.unwrap().length as usize;
                    if total == 0 {
                        self.body_filled = 0;
                        self.mode = ReadMode::Data;
                        return (take, FeedResult::PacketComplete);
                    }
                    return (take, FeedResult::HeaderComplete);
                }
                (take, FeedResult::NeedMore)
            }
            ReadMode::Data => {
                let filled = self.body_filled;
                self.body.as_mut_slice(filled + take)[filled..filled + take]
                    .copy_from_slice(&src[..take]);
                self.body_filled += take;
                let total = self.header.map(|h| h.length as usize).unwrap_or(0);
                if self.body_filled == total {
                    (take, FeedResult::PacketComplete)
                } else {
                    (take, FeedResult::NeedMore)
                }
            }
        }
    }

    pub fn payload(&self) -> &[u8] {
        let total = self.header.map(|h| h.length as usize).unwrap_or(0);
        self.body.as_slice(total)
    }
}
