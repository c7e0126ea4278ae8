//! A bounded, thread-safe free list of reusable buffers.
//!
//! Mirrors `BuffersPool<T>` from the original: a FIFO queue capped at 128
//! entries. `get(capacity)` only reuses the buffer at the *front* of the
//! queue if its capacity matches exactly - a buffer of a different size
//! sitting behind it is left alone rather than searched for, trading a
//! possible extra allocation for O(1), lock-free-under-contention behavior.
//! This core reproduces that exact-match policy rather than "improving" it
//! into a best-fit search.

use std::collections::VecDeque;

use parking_lot::Mutex;

use crate::buffer::output::OutputBuffer;

/// Maximum number of buffers a pool will hold onto.
const MAX_POOL_SIZE: usize = 128;

/// A capacity-keyed, bounded free list of [`OutputBuffer`]s.
pub struct BufferPool {
    buffers: Mutex<VecDeque<OutputBuffer>>,
}

impl Default for BufferPool {
    fn default() -> Self {
        Self::new()
    }
}

impl BufferPool {
    pub fn new() -> Self {
        BufferPool {
            buffers: Mutex::new(VecDeque::with_capacity(MAX_POOL_SIZE)),
        }
    }

    /// Returns a buffer of the given `capacity`, reusing the pool's front
    /// entry if (and only if) it matches exactly; otherwise allocates fresh.
    pub fn get(&self, capacity: usize) -> OutputBuffer {
        let mut buffers = self.buffers.lock();
        match buffers.front() {
            Some(front) if front.capacity() == capacity => {
                let mut buf = buffers.pop_front().unwrap();
                buf.clear();
                buf
            }
            _ => OutputBuffer::new(capacity),
        }
    }

    /// Returns `buffer` to the pool, dropping it if the pool is already at
    /// capacity.
    pub fn put(&self, mut buffer: OutputBuffer) {
        let mut buffers = self.buffers.lock();
        if buffers.len() < MAX_POOL_SIZE {
            buffer.clear();
            buffers.push_back(buffer);
        }
    }

    /// Number of buffers currently held by the pool (test/diagnostic use).
    pub fn len(&self) -> usize {
        self.buffers.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
