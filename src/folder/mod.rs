//! Storage-directory bookkeeping: the chunk index, scan lifecycle, disk
//! usage counters, and rolling stats of one configured folder (§3).

pub mod chunk;
pub mod folder_chunks;
pub mod lock_file;
pub mod stats;

use std::path::PathBuf;

pub use chunk::{Chunk, ChunkKey, ChunkState};
pub use folder_chunks::FolderChunks;
pub use lock_file::LockFile;
pub use stats::FolderStats;

use crate::error::CoreError;

/// Lifecycle of a folder's background disk scan (§3).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanState {
    Needed,
    InProgress,
    Terminate,
    ThreadFinished,
    SendNeeded,
    Working,
}

/// Lifecycle of a folder's background chunk-migration thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MigrateState {
    Done,
    InProgress,
    Terminate,
    ThreadFinished,
}

/// A storage directory hosting chunks, optionally split into a meta path
/// and a data path for zoned devices (§3, §6).
pub struct Folder {
    pub meta_path: PathBuf,
    pub data_path: Option<PathBuf>,
    pub chunks: FolderChunks,
    pub scan_state: ScanState,
    pub migrate_state: MigrateState,
    pub damaged: bool,
    pub marked_for_removal: bool,
    pub read_only: bool,
    pub total_space: u64,
    pub available_space: u64,
    pub leave_free: u64,
    pub stats: FolderStats,
    /// Guards against two chunkserver processes using the same data
    /// directory at once. `None` until [`Self::lock`] succeeds; a folder
    /// with no lock must not be handed out by [`Self::is_selectable_for_new_chunk`]
    /// in a real deployment, though that check lives at the collaborator
    /// that owns the full folder list, not here.
    pub lock: Option<LockFile>,
}

impl Folder {
    pub fn new(meta_path: PathBuf, data_path: Option<PathBuf>) -> Self {
        Folder {
            meta_path,
            data_path,
            chunks: FolderChunks::new(),
            scan_state: ScanState::Needed,
            migrate_state: MigrateState::Done,
            damaged: false,
            marked_for_removal: false,
            read_only: false,
            total_space: 0,
            available_space: 0,
            leave_free: 0,
            stats: FolderStats::new(),
            lock: None,
        }
    }

    /// Takes the exclusive lock-file on this folder's data directory
    /// (falling back to the meta path for a zoned split), preventing a
    /// second chunkserver process from mounting the same directory.
    pub fn acquire_lock(&mut self) -> Result<(), CoreError> {
        let dir = self.data_path.as_deref().unwrap_or(&self.meta_path);
        self.lock = Some(LockFile::acquire(dir)?);
        Ok(())
    }

    /// True iff this folder can receive newly placed chunks (§3).
    pub fn is_selectable_for_new_chunk(&self) -> bool {
        !self.damaged
            && !self.marked_for_removal
            && !self.read_only
            && self.total_space > 0
            && self.available_space > 0
            && self.scan_state == ScanState::Working
    }

    /// Usable free space after reserving [`Self::leave_free`].
    pub fn usable_space(&self) -> u64 {
        self.available_space.saturating_sub(self.leave_free)
    }
}
