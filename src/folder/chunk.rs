//! A single chunk as tracked by its owning folder (§3).

use std::sync::{Arc, Condvar, Mutex};

use crate::serializer::ChunkPartType;

/// Index into a [`super::folder_chunks::FolderChunks`] vector, or
/// [`INVALID_INDEX`] for a chunk not currently resident in one.
pub type FolderIndex = usize;

/// Sentinel for "not assigned a slot in any `FolderChunks` vector yet".
pub const INVALID_INDEX: FolderIndex = usize::MAX;

/// Lifecycle state of a chunk (§3).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkState {
    Available,
    Locked,
    Deleted,
    ToBeDeleted,
}

/// A lazily-allocated wait point for threads blocked on a chunk leaving
/// `Locked` state. Created on first contention, dropped once the last
/// waiter leaves (§9: "condition variable 'waiters'").
#[derive(Default)]
struct LockWaiters {
    inner: Mutex<()>,
    condvar: Condvar,
}

/// Uniquely identifies a chunk: `(chunkId, version, partType)` (§3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ChunkKey {
    pub chunk_id: u64,
    pub version: u32,
    pub part_type: ChunkPartType,
}

/// A chunk resident in a folder's [`super::folder_chunks::FolderChunks`].
pub struct Chunk {
    pub key: ChunkKey,
    pub state: ChunkState,
    pub refcount: u32,
    pub block_count: u32,
    /// Slot inside the owning folder's chunk vector; `INVALID_INDEX` while
    /// not resident in one (§3, §4.3).
    pub index_in_folder: FolderIndex,
    waiters: Option<Arc<LockWaiters>>,
}

impl Chunk {
    pub fn new(key: ChunkKey) -> Self {
        Chunk {
            key,
            state: ChunkState::Available,
            refcount: 0,
            block_count: 0,
            index_in_folder: INVALID_INDEX,
            waiters: None,
        }
    }

    /// Blocks the calling thread until `self.state != Locked`, lazily
    /// allocating the waiter condvar on first contention.
    ///
    /// `check_state` is invoked under the caller's own chunk-registry lock
    /// each time the condvar wakes, so this primitive carries no opinion on
    /// how chunk state itself is synchronized.
    pub fn wait_while_locked<F>(&mut self, mut still_locked: F)
    where
        F: FnMut() -> bool,
    {
        if !still_locked() {
            return;
        }
        let waiters = self
            .waiters
            .get_or_insert_with(|| Arc::new(LockWaiters::default()))
            .clone();
        let guard = waiters.inner.lock().unwrap();
        let _unused = waiters.condvar.wait_while(guard, |_| still_locked());
        if Arc::strong_count(&waiters) == 1 {
            self.waiters = None;
        }
    }

    /// Wakes any threads parked in [`Self::wait_while_locked`].
    pub fn notify_unlocked(&self) {
        if let Some(waiters) = &self.waiters {
            waiters.condvar.notify_all();
        }
    }
}
