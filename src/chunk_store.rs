//! The on-disk chunk-format layer this core treats as an external
//! collaborator (§1, §4.5): callers implement [`ChunkStore`] against their
//! own chunk-header/CRC-block/block-offset format; this crate only ever
//! calls through the trait from a [`crate::job_pool::BackgroundJobPool`]
//! worker thread.

use crate::buffer::OutputBuffer;
use crate::error::SfsStatus;
use crate::serializer::ChunkPartType;

/// Disk-backed operations a `BackgroundJobPool` worker thread drives.
///
/// Every method runs on a job-pool thread and may block; the pool is what
/// keeps this off the network-worker's poll loop. Implementations must
/// serialize `write` calls for the same `(chunk_id, part_type)` themselves
/// if they bypass the pool's own per-chunk lock (see `run_worker` in
/// `job_pool`), and must leave `buffer` untouched on error so the
/// connection's output pipeline sees a clean failure.
pub trait ChunkStore: Send + Sync {
    fn open(&self, chunk_id: u64, version: u32, part_type: ChunkPartType)
        -> Result<(), SfsStatus>;

    fn close(&self, chunk_id: u64, part_type: ChunkPartType) -> Result<(), SfsStatus>;

    /// Appends the block's CRC (4 bytes, big-endian) followed by up to
    /// `size` bytes of chunk data to `buffer`, which already holds the
    /// serialized read-data prefix (§4.7). `read_behind`/`read_ahead` are
    /// readahead hints, not correctness requirements.
    #[allow(clippy::too_many_arguments)]
    fn read(
        &self,
        chunk_id: u64,
        version: u32,
        part_type: ChunkPartType,
        offset: u32,
        size: u32,
        read_behind: u32,
        read_ahead: u32,
        open_if_needed: bool,
        buffer: &mut OutputBuffer,
    ) -> Result<(), SfsStatus>;

    #[allow(clippy::too_many_arguments)]
    fn write(
        &self,
        chunk_id: u64,
        version: u32,
        part_type: ChunkPartType,
        write_id: u32,
        block_num: u16,
        offset: u32,
        size: u32,
        crc: u32,
        data: &[u8],
    ) -> Result<(), SfsStatus>;

    fn prefetch(
        &self,
        chunk_id: u64,
        version: u32,
        part_type: ChunkPartType,
        offset: u32,
        size: u32,
    ) -> Result<(), SfsStatus>;

    fn get_blocks(
        &self,
        chunk_id: u64,
        version: u32,
        part_type: ChunkPartType,
    ) -> Result<u16, SfsStatus>;

    fn test_crc(
        &self,
        chunk_id: u64,
        version: u32,
        part_type: ChunkPartType,
    ) -> Result<(), SfsStatus>;
}

/// An in-memory `ChunkStore` double for this crate's own tests, and for
/// downstream embedders exercising the core without a real disk backend.
#[cfg(any(test, feature = "test-support"))]
pub mod test_support {
    use std::collections::HashMap;
    use std::sync::Mutex;

    use super::ChunkStore;
    use crate::buffer::OutputBuffer;
    use crate::constants::SFSBLOCKSIZE;
    use crate::error::SfsStatus;
    use crate::serializer::ChunkPartType;

    #[derive(Default, Clone)]
    struct ChunkData {
        version: u32,
        blocks: Vec<Vec<u8>>,
    }

    /// Chunk data lives entirely in a `HashMap`, in fixed 64 KiB blocks like
    /// the real on-disk format, but with no header/CRC-block framing.
    #[derive(Default)]
    pub struct InMemoryChunkStore {
        chunks: Mutex<HashMap<(u64, ChunkPartType), ChunkData>>,
    }

    impl InMemoryChunkStore {
        pub fn new() -> Self {
            Self::default()
        }

        /// Test helper: seeds `size` bytes of deterministic content for a
        /// chunk so `read` has something to return.
        pub fn seed(&self, chunk_id: u64, version: u32, part_type: ChunkPartType, data: &[u8]) {
            let mut chunks = self.chunks.lock().unwrap();
            let entry = chunks.entry((chunk_id, part_type)).or_default();
            entry.version = version;
            entry.blocks.clear();
            for chunk in data.chunks(SFSBLOCKSIZE) {
                let mut block = chunk.to_vec();
                block.resize(SFSBLOCKSIZE, 0);
                entry.blocks.push(block);
            }
        }
    }

    impl ChunkStore for InMemoryChunkStore {
        fn open(
            &self,
            chunk_id: u64,
            version: u32,
            part_type: ChunkPartType,
        ) -> Result<(), SfsStatus> {
            let mut chunks = self.chunks.lock().unwrap();
            let entry = chunks.entry((chunk_id, part_type)).or_default();
            entry.version = version;
            Ok(())
        }

        fn close(&self, _chunk_id: u64, _part_type: ChunkPartType) -> Result<(), SfsStatus> {
            Ok(())
        }

        fn read(
            &self,
            chunk_id: u64,
            _version: u32,
            part_type: ChunkPartType,
            offset: u32,
            size: u32,
            _read_behind: u32,
            _read_ahead: u32,
            open_if_needed: bool,
            buffer: &mut OutputBuffer,
        ) -> Result<(), SfsStatus> {
            let mut chunks = self.chunks.lock().unwrap();
            let entry = if open_if_needed {
                chunks.entry((chunk_id, part_type)).or_default()
            } else {
                chunks
                    .get_mut(&(chunk_id, part_type))
                    .ok_or(SfsStatus::NotDone)?
            };
            let mut data = vec![0u8; size as usize];
            let block_size = SFSBLOCKSIZE as u32;
            let mut filled = 0usize;
            let mut cursor = offset;
            while filled < data.len() {
                let block_idx = (cursor / block_size) as usize;
                let within = (cursor % block_size) as usize;
                let take = (data.len() - filled).min(SFSBLOCKSIZE - within);
                if let Some(block) = entry.blocks.get(block_idx) {
                    data[filled..filled + take].copy_from_slice(&block[within..within + take]);
                }
                filled += take;
                cursor += take as u32;
            }
            let crc = crc32fast::hash(&data);
            buffer.copy_into(&crc.to_be_bytes());
            buffer.copy_into(&data);
            Ok(())
        }

        fn write(
            &self,
            chunk_id: u64,
            _version: u32,
            part_type: ChunkPartType,
            _write_id: u32,
            _block_num: u16,
            offset: u32,
            size: u32,
            crc: u32,
            data: &[u8],
        ) -> Result<(), SfsStatus> {
            if data.len() != size as usize {
                return Err(SfsStatus::WrongSize);
            }
            if crc32fast::hash(data) != crc {
                return Err(SfsStatus::Io);
            }
            let mut chunks = self.chunks.lock().unwrap();
            let entry = chunks.entry((chunk_id, part_type)).or_default();
            let block_size = SFSBLOCKSIZE as u32;
            let mut filled = 0usize;
            let mut cursor = offset;
            while filled < data.len() {
                let block_idx = (cursor / block_size) as usize;
                let within = (cursor % block_size) as usize;
                let take = (data.len() - filled).min(SFSBLOCKSIZE - within);
                if entry.blocks.len() <= block_idx {
                    entry.blocks.resize(block_idx + 1, vec![0u8; SFSBLOCKSIZE]);
                }
                entry.blocks[block_idx][within..within + take]
                    .copy_from_slice(&data[filled..filled + take]);
                filled += take;
                cursor += take as u32;
            }
            Ok(())
        }

        fn prefetch(
            &self,
            _chunk_id: u64,
            _version: u32,
            _part_type: ChunkPartType,
            _offset: u32,
            _size: u32,
        ) -> Result<(), SfsStatus> {
            Ok(())
        }

        fn get_blocks(
            &self,
            chunk_id: u64,
            _version: u32,
            part_type: ChunkPartType,
        ) -> Result<u16, SfsStatus> {
            let chunks = self.chunks.lock().unwrap();
            Ok(chunks
                .get(&(chunk_id, part_type))
                .map(|c| c.blocks.len() as u16)
                .unwrap_or(0))
        }

        fn test_crc(
            &self,
            _chunk_id: u64,
            _version: u32,
            _part_type: ChunkPartType,
        ) -> Result<(), SfsStatus> {
            Ok(())
        }
    }
}
