//! `OutputBuffer`: a page-aligned, reusable buffer for read responses.
//!
//! Mirrors the original's `output_buffer.{h,cc}` almost exactly: a fixed
//! capacity rounded up to a block boundary, a leading padding region so user
//! data still ends block-aligned, and a `[first, end)` window of bytes not
//! yet flushed to the wire.

use std::os::unix::io::RawFd;

use crate::buffer::aligned::{aligned_size, aligned_vec, ALIGNMENT};

/// Outcome of a non-blocking `write(2)` drain attempt.
#[derive(Debug)]
pub enum WriteStatus {
    /// All unflushed bytes were written.
    Done,
    /// The socket signalled `EAGAIN`; some bytes may still be pending.
    Again,
    /// An unrecoverable I/O error occurred.
    Error(std::io::Error),
}

/// A page-aligned, reusable byte buffer carrying one outgoing packet (or
/// packet prefix) worth of data.
#[derive(Debug)]
pub struct OutputBuffer {
    capacity: usize,
    capacity_aligned: usize,
    padding: usize,
    buffer: Vec<u8>,
    unflushed_first: usize,
    unflushed_end: usize,
}

impl OutputBuffer {
    /// Allocates a new buffer able to hold `capacity` bytes of user data,
    /// rounded up internally to `ALIGNMENT`.
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "OutputBuffer capacity must be positive");
        let capacity_aligned = aligned_size(capacity);
        let padding = capacity_aligned - capacity;
        let buffer = aligned_vec(capacity_aligned, ALIGNMENT);
        OutputBuffer {
            capacity,
            capacity_aligned,
            padding,
            buffer,
            unflushed_first: padding,
            unflushed_end: padding,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn capacity_aligned(&self) -> usize {
        self.capacity_aligned
    }

    pub fn padding(&self) -> usize {
        self.padding
    }

    /// Bytes appended but not yet written out.
    pub fn bytes_in_buffer(&self) -> usize {
        self.unflushed_end - self.unflushed_first
    }

    /// The unflushed slice, for CRC checks or tests.
    pub fn data(&self) -> &[u8] {
        &self.buffer[self.unflushed_first..self.unflushed_end]
    }

    /// Appends `src` to the buffer. Asserts rather than returning an error
    /// on overflow, matching the original's `eassert`-guarded invariant:
    /// callers size the buffer correctly up front.
    pub fn copy_into(&mut self, src: &[u8]) {
        assert!(
            self.unflushed_end + src.len() <= self.capacity_aligned,
            "OutputBuffer overflow: {} + {} > {}",
            self.unflushed_end,
            src.len(),
            self.capacity_aligned
        );
        let end = self.unflushed_end;
        self.buffer[end..end + src.len()].copy_from_slice(src);
        self.unflushed_end += src.len();
    }

    /// Recomputes the CRC-32 over the last `n_bytes` written and compares it
    /// against `crc`.
    pub fn check_crc(&self, n_bytes: usize, crc: u32) -> bool {
        assert!(n_bytes <= self.unflushed_end - self.padding);
        let start = self.unflushed_end - n_bytes;
        crc32fast::hash(&self.buffer[start..self.unflushed_end]) == crc
    }

    /// Issues non-blocking writes of the unflushed window to `fd` until it
    /// either drains completely, the socket signals `EAGAIN`, or a real
    /// error occurs. Partial progress advances `unflushed_first`.
    pub fn write_out_to(&mut self, fd: RawFd) -> WriteStatus {
        use nix::errno::Errno;
        use nix::unistd::write;
        use std::os::fd::BorrowedFd;

        while self.bytes_in_buffer() > 0 {
            // SAFETY: `fd` is owned by the caller for the duration of this call.
            let borrowed = unsafe { BorrowedFd::borrow_raw(fd) };
            match write(borrowed, &self.buffer[self.unflushed_first..self.unflushed_end]) {
                Ok(0) => return WriteStatus::Again,
                Ok(n) => self.unflushed_first += n,
                Err(Errno::EAGAIN) => return WriteStatus::Again,
                Err(Errno::EINTR) => continue,
                Err(e) => return WriteStatus::Error(e.into()),
            }
        }
        WriteStatus::Done
    }

    /// Resets the unflushed window so the buffer can be reused. Called by
    /// the owning `BufferPool` before handing the buffer back out.
    pub fn clear(&mut self) {
        self.unflushed_first = self.padding;
        self.unflushed_end = self.padding;
    }
}
