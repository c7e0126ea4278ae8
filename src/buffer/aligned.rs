//! Page-aligned allocation helpers.
//!
//! The original core uses a custom `AlignedAllocator` so that buffers handed
//! to `O_DIRECT`-capable disk I/O start on a block boundary. The standard
//! library exposes the same capability through `std::alloc` directly, so
//! rather than a custom allocator type this crate exposes a single helper
//! that returns an aligned, zeroed `Vec<u8>`.

use std::alloc::{self, Layout};

/// Disk I/O block size chunkserver buffers are aligned to (`disk::kIoBlockSize`
/// in the original). 4 KiB matches every common page/sector size.
pub const ALIGNMENT: usize = 4096;

/// Allocates a zeroed, `align`-aligned `Vec<u8>` of length `len`.
///
/// `align` must be a power of two; `len` may be zero. Panics only on
/// allocator failure (the same contract `Vec::with_capacity` has).
pub fn aligned_vec(len: usize, align: usize) -> Vec<u8> {
    debug_assert!(align.is_power_of_two());
    if len == 0 {
        return Vec::new();
    }

    let layout = Layout::from_size_align(len, align).expect("invalid aligned layout");
    // SAFETY: `layout` has non-zero size; the returned pointer is either
    // null (handled below) or valid for `len` bytes with `align` alignment.
    let ptr = unsafe { alloc::alloc_zeroed(layout) };
    if ptr.is_null() {
        alloc::handle_alloc_error(layout);
    }

    // SAFETY: `ptr` was allocated with the global allocator using `layout`,
    // is non-null, zero-initialized for `len` bytes, and `len <= len`.
    unsafe { Vec::from_raw_parts(ptr, len, len) }
}

/// Rounds `capacity` up to the next multiple of `ALIGNMENT`.
pub fn aligned_size(capacity: usize) -> usize {
    let remainder = capacity % ALIGNMENT;
    if remainder == 0 {
        capacity
    } else {
        capacity + ALIGNMENT - remainder
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn aligned_vec_has_requested_length_and_is_zeroed() {
        let v = aligned_vec(100, ALIGNMENT);
        assert_eq!(v.len(), 100);
        assert!(v.iter().all(|&b| b == 0));
        assert_eq!((v.as_ptr() as usize) % ALIGNMENT, 0);
    }

    #[test]
    fn aligned_vec_zero_length() {
        let v = aligned_vec(0, ALIGNMENT);
        assert!(v.is_empty());
    }

    #[test]
    fn aligned_size_rounds_up() {
        assert_eq!(aligned_size(0), 0);
        assert_eq!(aligned_size(1), ALIGNMENT);
        assert_eq!(aligned_size(ALIGNMENT), ALIGNMENT);
        assert_eq!(aligned_size(ALIGNMENT + 1), 2 * ALIGNMENT);
    }
}
