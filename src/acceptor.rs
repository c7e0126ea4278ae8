//! `ConnectionAcceptor`: owns the listening socket and round-robins
//! accepted connections across a fixed set of workers (§4.9).

use std::net::{SocketAddr, TcpListener};
use std::os::fd::IntoRawFd;

use log::{info, warn};

use crate::socket::{set_nodelay, set_nonblocking};
use crate::worker::WorkerHandle;

/// Listens on one address and hands every accepted socket to the next
/// worker in round-robin order.
pub struct ConnectionAcceptor {
    listener: TcpListener,
    workers: Vec<WorkerHandle>,
    next_worker: usize,
}

impl ConnectionAcceptor {
    /// Binds `addr` and wraps `workers` for round-robin hand-off. The
    /// listener itself stays blocking - `accept_loop` is meant to run on
    /// its own dedicated thread.
    pub fn bind(addr: SocketAddr, workers: Vec<WorkerHandle>) -> std::io::Result<Self> {
        let listener = TcpListener::bind(addr)?;
        info!("chunkserver listening on {addr}");
        Ok(ConnectionAcceptor {
            listener,
            workers,
            next_worker: 0,
        })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Accepts connections until the listener errors out (e.g. the socket
    /// is closed from another thread to request shutdown).
    pub fn accept_loop(&mut self) {
        loop {
            match self.listener.accept() {
                Ok((stream, peer)) => self.dispatch(stream, peer),
                Err(e) => {
                    warn!("accept failed, stopping acceptor: {e}");
                    return;
                }
            }
        }
    }

    fn dispatch(&mut self, stream: std::net::TcpStream, peer: SocketAddr) {
        if self.workers.is_empty() {
            return;
        }
        // `into_raw_fd` hands ownership of the fd to the worker; it takes
        // over closing it once the connection reaches `Closed` (§4.8).
        let fd = stream.into_raw_fd();
        set_nonblocking(fd);
        set_nodelay(fd);
        self.workers[self.next_worker].hand_off(fd);
        self.next_worker = (self.next_worker + 1) % self.workers.len();
        info!("accepted connection from {peer}, routed to worker {}", self.next_worker);
    }
}
