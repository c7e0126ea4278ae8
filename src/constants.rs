//! Wire-level size constants shared across the core.

/// Size in bytes of one block of chunk data (`SFSBLOCKSIZE`/`MFSBLOCKSIZE`).
pub const SFSBLOCKSIZE: usize = 64 * 1024;

/// Number of blocks per chunk (`MFSBLOCKSINCHUNK`).
pub const SFSBLOCKSINCHUNK: usize = 1024;

/// Size in bytes of one chunk (`SFSCHUNKSIZE`): 64 MiB.
pub const SFSCHUNKSIZE: usize = SFSBLOCKSINCHUNK * SFSBLOCKSIZE;

/// Maximum size of any packet on the wire: a generous header/control-message
/// budget plus room for one full block of write/read data.
pub const MAX_PACKET_SIZE: usize = 100_000 + SFSBLOCKSIZE;

/// Size of the fixed prefix of a `WRITE_DATA` packet ahead of its payload,
/// in the current dialect: `chunkId(8) + writeId(4) + blockNum(2) +
/// offset(4) + size(4) + crc(4)`.
pub const WRITE_DATA_PREFIX_SIZE: usize = 8 + 4 + 2 + 4 + 4 + 4;
