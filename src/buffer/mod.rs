//! Page-aligned, reusable I/O buffers for read responses (§4.1).

pub mod aligned;
pub mod output;
pub mod pool;

pub use aligned::{aligned_size, aligned_vec, ALIGNMENT};
pub use output::{OutputBuffer, WriteStatus};
pub use pool::BufferPool;
