//! Tiny POSIX socket-option helpers shared by the acceptor and the worker,
//! matching the original's `tcpnonblock`/`tcpnodelay` free functions.

use std::os::fd::BorrowedFd;
use std::os::unix::io::RawFd;

use nix::sys::socket::{setsockopt, sockopt};

/// Sets `O_NONBLOCK`; best-effort, matching the original's ignore-the-error
/// style for this one-shot setup call.
pub fn set_nonblocking(fd: RawFd) {
    unsafe {
        let flags = libc::fcntl(fd, libc::F_GETFL, 0);
        if flags >= 0 {
            libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK);
        }
    }
}

/// Disables Nagle's algorithm on a freshly-accepted or freshly-connected
/// TCP socket.
pub fn set_nodelay(fd: RawFd) {
    let borrowed = unsafe { BorrowedFd::borrow_raw(fd) };
    let _ = setsockopt(&borrowed, sockopt::TcpNoDelay, &true);
}
