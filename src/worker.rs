//! `NetworkWorkerThread`: one `poll(2)` loop driving a shard of
//! [`ConnectionEntry`] state machines plus its own [`BackgroundJobPool`]
//! (§4.8, §5).

use std::collections::HashMap;
use std::net::SocketAddrV4;
use std::os::fd::BorrowedFd;
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use crossbeam_channel::{Receiver, Sender};
use log::{info, warn};
use nix::poll::{poll, PollFd, PollFlags, PollTimeout};
use nix::unistd::{close, pipe, read, write};

use crate::buffer::BufferPool;
use crate::chunk_store::ChunkStore;
use crate::connection::{
    connect_retry_backoff, ConnectionCompletion, ConnectionEntry, ConnectionState,
    CompletionSender,
};
use crate::error::CoreError;
use crate::job_pool::BackgroundJobPool;

/// How long a single `poll(2)` call blocks before the worker re-checks for
/// termination and sweeps timeouts (§4.8 step 2).
const POLL_TIMEOUT_MS: u8 = 50;

/// Handle used by a [`crate::acceptor::ConnectionAcceptor`] (or a test
/// harness) to hand a freshly-accepted socket to a running worker.
pub struct WorkerHandle {
    notify_write_fd: RawFd,
    inbox: Sender<RawFd>,
    terminate: Arc<AtomicBool>,
}

impl WorkerHandle {
    /// Queues `fd` for pickup and wakes the worker's `poll` (§4.9).
    pub fn hand_off(&self, fd: RawFd) {
        let _ = self.inbox.send(fd);
        let borrowed = unsafe { BorrowedFd::borrow_raw(self.notify_write_fd) };
        let _ = write(borrowed, &[1u8]);
    }

    /// Sets the shared `terminate` flag and wakes the worker's `poll` so it
    /// observes the flag without waiting out the rest of its timeout.
    pub fn request_termination(&self) {
        self.terminate.store(true, Ordering::Relaxed);
        let borrowed = unsafe { BorrowedFd::borrow_raw(self.notify_write_fd) };
        let _ = write(borrowed, &[1u8]);
    }
}

/// One `poll`-driven event loop owning a shard of connections and its own
/// job pool (§4.8).
pub struct NetworkWorkerThread {
    entries: HashMap<u64, ConnectionEntry>,
    next_connection_id: AtomicU64,
    job_pool: Arc<BackgroundJobPool>,
    buffer_pool: Arc<BufferPool>,
    completion_tx: CompletionSender,
    completion_rx: Receiver<(u64, ConnectionCompletion)>,
    inbox_rx: Receiver<RawFd>,
    inbox_tx: Sender<RawFd>,
    notify_read_fd: RawFd,
    notify_write_fd: RawFd,
    terminate: Arc<AtomicBool>,
}

impl NetworkWorkerThread {
    pub fn new(
        hdd_workers: usize,
        max_bg_jobs: usize,
        store: Arc<dyn ChunkStore>,
    ) -> Result<Self, CoreError> {
        let job_pool = Arc::new(BackgroundJobPool::new(hdd_workers, max_bg_jobs, store)?);
        let (notify_read_fd, notify_write_fd) = pipe()
            .map(|(r, w)| {
                use std::os::fd::IntoRawFd;
                (r.into_raw_fd(), w.into_raw_fd())
            })
            .map_err(|e| CoreError::WakeupChannel(e.into()))?;
        let (completion_tx, completion_rx) = crossbeam_channel::unbounded();
        let (inbox_tx, inbox_rx) = crossbeam_channel::unbounded();

        Ok(NetworkWorkerThread {
            entries: HashMap::new(),
            next_connection_id: AtomicU64::new(1),
            job_pool,
            buffer_pool: Arc::new(BufferPool::new()),
            completion_tx,
            completion_rx,
            inbox_rx,
            inbox_tx,
            notify_read_fd,
            notify_write_fd,
            terminate: Arc::new(AtomicBool::new(false)),
        })
    }

    /// A handle an acceptor can clone-by-reference and hand sockets to from
    /// another thread.
    pub fn handle(&self) -> WorkerHandle {
        WorkerHandle {
            notify_write_fd: self.notify_write_fd,
            inbox: self.inbox_tx.clone(),
            terminate: Arc::clone(&self.terminate),
        }
    }

    pub fn termination_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.terminate)
    }

    fn adopt(&mut self, fd: RawFd) {
        let id = self.next_connection_id.fetch_add(1, Ordering::Relaxed);
        crate::socket::set_nonblocking(fd);
        crate::socket::set_nodelay(fd);
        let entry = ConnectionEntry::new(
            id,
            fd,
            Arc::clone(&self.buffer_pool),
            Arc::clone(&self.job_pool),
            self.completion_tx.clone(),
        );
        self.entries.insert(id, entry);
    }

    /// The main loop body (§4.8). Runs until [`Self::termination_flag`] is
    /// set, then drains every entry per `terminate`'s cleanup rules.
    pub fn run(&mut self) {
        while !self.terminate.load(Ordering::Relaxed) {
            self.tick();
        }
        self.drain_on_terminate();
    }

    /// One iteration of steps 1-5 of §4.8; exposed separately so tests can
    /// drive the loop deterministically instead of calling `run`.
    pub fn tick(&mut self) {
        let mut pollfds = Vec::with_capacity(self.entries.len() * 2 + 2);
        let notify_borrowed = unsafe { BorrowedFd::borrow_raw(self.notify_read_fd) };
        pollfds.push(PollFd::new(notify_borrowed, PollFlags::POLLIN));
        let wakeup_borrowed = unsafe { BorrowedFd::borrow_raw(self.job_pool.wakeup_fd()) };
        pollfds.push(PollFd::new(wakeup_borrowed, PollFlags::POLLIN));

        let ids: Vec<u64> = self.entries.keys().copied().collect();
        for &id in &ids {
            let entry = &self.entries[&id];
            let client_flags = client_poll_flags(entry);
            let client_fd = unsafe { BorrowedFd::borrow_raw(entry.client_fd) };
            pollfds.push(PollFd::new(client_fd, client_flags));

            if let Some(fwd) = entry.forward_fd {
                let forward_flags = forward_poll_flags(entry);
                let fwd_borrowed = unsafe { BorrowedFd::borrow_raw(fwd) };
                pollfds.push(PollFd::new(fwd_borrowed, forward_flags));
            }
        }

        match poll(&mut pollfds, PollTimeout::from(POLL_TIMEOUT_MS)) {
            Ok(_) => {}
            Err(nix::errno::Errno::EINTR) => return,
            Err(e) => {
                warn!("poll error: {e}");
                return;
            }
        }

        if pollfds[0]
            .revents()
            .is_some_and(|r| r.contains(PollFlags::POLLIN))
        {
            drain_notify_pipe(self.notify_read_fd);
            while let Ok(fd) = self.inbox_rx.try_recv() {
                self.adopt(fd);
            }
        }

        if pollfds[1]
            .revents()
            .is_some_and(|r| r.contains(PollFlags::POLLIN))
        {
            self.job_pool.drain_completions();
        }
        self.drain_job_completions();

        let now = Instant::now();
        // Slot layout must match the build loop above exactly: walk `ids` in
        // the same order and only advance past a forward slot for entries
        // that already had a `forward_fd` when `pollfds` was built. Dialing
        // out newly-`Connecting` entries happens afterwards, for next tick.
        let mut pf_idx = 2;
        for &id in &ids {
            let client_revents = pollfds[pf_idx].revents();
            pf_idx += 1;
            let had_forward_slot = self.entries[&id].forward_fd.is_some();
            let forward_revents = if had_forward_slot {
                let r = pollfds[pf_idx].revents();
                pf_idx += 1;
                r
            } else {
                None
            };
            self.service_entry(id, client_revents, forward_revents, now);
        }

        self.drive_connects(now);
        self.reap_closed();
    }

    /// Kicks off (or retries) the forward-socket connect for every entry
    /// sitting in `Connecting` with no fd yet (§4.6, §4.9 write-chain hop).
    fn drive_connects(&mut self, now: Instant) {
        for entry in self.entries.values_mut() {
            if entry.state != ConnectionState::Connecting || entry.forward_fd.is_some() {
                continue;
            }
            let addr = match entry.forward_address {
                Some(addr) => addr,
                None => {
                    entry.state = ConnectionState::Close;
                    continue;
                }
            };
            let due = entry.connect_start.map_or(true, |start| {
                now.duration_since(start) >= connect_retry_backoff(entry.connect_retry_counter)
            });
            if !due {
                continue;
            }
            match begin_forward_connect(addr) {
                Ok(fd) => {
                    entry.forward_fd = Some(fd);
                    entry.connect_start = Some(now);
                }
                Err(e) => {
                    warn!("forward connect to {addr} failed: {e}");
                    entry.connect_start = Some(now);
                    entry.on_forward_connect_failed();
                }
            }
        }
    }

    fn drain_job_completions(&mut self) {
        while let Ok((id, completion)) = self.completion_rx.try_recv() {
            if let Some(entry) = self.entries.get_mut(&id) {
                match completion {
                    ConnectionCompletion::Read(outcome) => entry.on_read_completed(outcome),
                    ConnectionCompletion::Write(outcome) => entry.on_write_completed(outcome),
                    ConnectionCompletion::GetBlocks(outcome) => entry.on_get_blocks_completed(outcome),
                }
            }
        }
    }

    fn service_entry(
        &mut self,
        id: u64,
        client_revents: Option<PollFlags>,
        forward_revents: Option<PollFlags>,
        now: Instant,
    ) {
        let entry = match self.entries.get_mut(&id) {
            Some(e) => e,
            None => return,
        };

        if let Some(revents) = client_revents {
            if revents.contains(PollFlags::POLLIN) {
                read_client_into(entry);
            }
            if revents.intersects(PollFlags::POLLERR | PollFlags::POLLHUP) {
                entry.state = ConnectionState::Close;
            }
        }
        if entry.has_pending_output() {
            entry.flush_output();
        }

        if let Some(revents) = forward_revents {
            if entry.state == ConnectionState::Connecting
                && revents.intersects(PollFlags::POLLOUT | PollFlags::POLLERR | PollFlags::POLLHUP)
            {
                let fd = entry.forward_fd.expect("forward_fd set before polling for it");
                if socket_error(fd) == 0 {
                    entry.on_forward_connected();
                } else {
                    entry.forward_fd = None;
                    let _ = close(fd);
                    entry.connect_start = Some(now);
                    entry.on_forward_connect_failed();
                }
            } else if revents.intersects(PollFlags::POLLERR | PollFlags::POLLHUP) {
                entry.on_forward_error();
            }
            if revents.contains(PollFlags::POLLIN) && entry.state == ConnectionState::WriteForward {
                read_forward_into(entry);
            }
        }
        if entry.forward_has_pending_output() {
            entry.flush_forward();
        }

        entry.apply_idle_timeout(now);

        if matches!(entry.state, ConnectionState::Close) {
            entry.close_jobs();
        }
    }

    fn reap_closed(&mut self) {
        let closed: Vec<u64> = self
            .entries
            .iter()
            .filter(|(_, e)| e.state == ConnectionState::Closed)
            .map(|(id, _)| *id)
            .collect();
        for id in closed {
            // `ConnectionEntry::drop` closes both sockets and returns any
            // still-owned `OutputBuffer`s to the pool.
            self.entries.remove(&id);
        }
    }

    fn drain_on_terminate(&mut self) {
        info!("network worker terminating, closing {} connections", self.entries.len());
        for (_, mut entry) in self.entries.drain() {
            entry.close_jobs();
            // dropping `entry` here closes both sockets and returns buffers
        }
    }
}

impl Drop for NetworkWorkerThread {
    fn drop(&mut self) {
        let _ = close(self.notify_read_fd);
        let _ = close(self.notify_write_fd);
    }
}

fn client_poll_flags(entry: &ConnectionEntry) -> PollFlags {
    let mut flags = PollFlags::empty();
    match entry.state {
        ConnectionState::Idle
        | ConnectionState::Read
        | ConnectionState::GetBlock
        | ConnectionState::WriteLast
        | ConnectionState::WriteForward => flags |= PollFlags::POLLIN,
        _ => {}
    }
    if entry.has_pending_output() {
        flags |= PollFlags::POLLOUT;
    }
    flags
}

fn forward_poll_flags(entry: &ConnectionEntry) -> PollFlags {
    match entry.state {
        ConnectionState::Connecting | ConnectionState::WriteInit => PollFlags::POLLOUT,
        ConnectionState::WriteForward => PollFlags::POLLIN | PollFlags::POLLOUT,
        _ => PollFlags::empty(),
    }
}

fn read_client_into(entry: &mut ConnectionEntry) {
    use nix::errno::Errno;

    let fd = entry.client_fd;
    let mut scratch = [0u8; 64 * 1024];
    loop {
        let borrowed = unsafe { BorrowedFd::borrow_raw(fd) };
        match read(borrowed, &mut scratch) {
            Ok(0) => {
                entry.state = ConnectionState::Close;
                return;
            }
            Ok(n) => {
                entry.on_client_bytes(&scratch[..n]);
                if n < scratch.len() {
                    return;
                }
            }
            Err(Errno::EAGAIN) => return,
            Err(Errno::EINTR) => continue,
            Err(_) => {
                entry.state = ConnectionState::Close;
                return;
            }
        }
    }
}

fn read_forward_into(entry: &mut ConnectionEntry) {
    use nix::errno::Errno;

    let fd = match entry.forward_fd {
        Some(fd) => fd,
        None => return,
    };
    let mut scratch = [0u8; 4096];
    loop {
        let borrowed = unsafe { BorrowedFd::borrow_raw(fd) };
        match read(borrowed, &mut scratch) {
            Ok(0) => {
                entry.on_forward_error();
                return;
            }
            Ok(n) => {
                entry.on_forward_bytes(&scratch[..n]);
                if n < scratch.len() {
                    return;
                }
            }
            Err(Errno::EAGAIN) => return,
            Err(Errno::EINTR) => continue,
            Err(_) => {
                entry.on_forward_error();
                return;
            }
        }
    }
}

/// Reads `SO_ERROR` off a socket to distinguish a completed non-blocking
/// connect from a failed one once it signals writable.
fn socket_error(fd: RawFd) -> i32 {
    let mut err: libc::c_int = 0;
    let mut len = std::mem::size_of::<libc::c_int>() as libc::socklen_t;
    unsafe {
        libc::getsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_ERROR,
            &mut err as *mut _ as *mut libc::c_void,
            &mut len,
        );
    }
    err
}

/// Opens a non-blocking TCP socket and starts connecting to `addr`,
/// returning the fd whether or not the connect has completed yet
/// (`EINPROGRESS` is not an error here, §4.6 write-chain hop).
fn begin_forward_connect(addr: SocketAddrV4) -> std::io::Result<RawFd> {
    unsafe {
        let fd = libc::socket(libc::AF_INET, libc::SOCK_STREAM | libc::SOCK_NONBLOCK, 0);
        if fd < 0 {
            return Err(std::io::Error::last_os_error());
        }
        let mut sockaddr: libc::sockaddr_in = std::mem::zeroed();
        sockaddr.sin_family = libc::AF_INET as libc::sa_family_t;
        sockaddr.sin_port = addr.port().to_be();
        sockaddr.sin_addr = libc::in_addr {
            s_addr: u32::from_ne_bytes(addr.ip().octets()),
        };
        let ret = libc::connect(
            fd,
            &sockaddr as *const libc::sockaddr_in as *const libc::sockaddr,
            std::mem::size_of::<libc::sockaddr_in>() as libc::socklen_t,
        );
        if ret < 0 {
            let err = std::io::Error::last_os_error();
            if err.raw_os_error() != Some(libc::EINPROGRESS) {
                libc::close(fd);
                return Err(err);
            }
        }
        Ok(fd)
    }
}

fn drain_notify_pipe(fd: RawFd) {
    use nix::errno::Errno;
    let mut scratch = [0u8; 256];
    loop {
        let borrowed = unsafe { BorrowedFd::borrow_raw(fd) };
        match read(borrowed, &mut scratch) {
            Ok(0) => break,
            Ok(n) if n < scratch.len() => break,
            Ok(_) => continue,
            Err(Errno::EAGAIN) => break,
            Err(Errno::EINTR) => continue,
            Err(_) => break,
        }
    }
}
