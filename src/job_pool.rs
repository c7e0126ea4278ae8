//! Background job pool: worker threads executing disk I/O against a
//! [`ChunkStore`] and correlating completions back to the submitting
//! connection (§4.5).
//!
//! One pool instance belongs to each `NetworkWorkerThread`
//! (`HDD_WORKERS_PER_NETWORK_WORKER` threads per pool). Completions are
//! never invoked inline on a pool thread: they are queued, and the owning
//! `NetworkWorkerThread` drains the queue itself once its `poll` wakes on
//! [`BackgroundJobPool::wakeup_fd`] - so `ConnectionEntry` mutation never
//! races the poll loop, matching §5's "no internal locking needed" claim.

use std::collections::HashMap;
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

use crossbeam_channel::{Receiver, Sender, TrySendError};
use nix::unistd::{close, pipe, read, write};

use crate::buffer::OutputBuffer;
use crate::chunk_store::ChunkStore;
use crate::error::{CoreError, SfsStatus};
use crate::serializer::ChunkPartType;

/// Non-zero handle to a submitted job; `0` means "no job outstanding".
pub type JobId = u64;

/// What a completed job hands back to its callback, beyond the bare status.
pub enum JobOutcome {
    /// `close`, `write`, `prefetch`, `test_chunk`: nothing but the status.
    Status(SfsStatus),
    /// `read`: the prefix+CRC+data buffer the job wrote into, handed back
    /// so the connection can attach it to `outputPackets`.
    Read {
        status: SfsStatus,
        buffer: OutputBuffer,
    },
    /// `get_blocks`: the chunk's block count.
    Blocks { status: SfsStatus, block_count: u16 },
    /// `open`: whether the chunk was newly opened on this connection.
    Open { status: SfsStatus },
}

impl JobOutcome {
    pub fn status(&self) -> SfsStatus {
        match self {
            JobOutcome::Status(s) => *s,
            JobOutcome::Read { status, .. } => *status,
            JobOutcome::Blocks { status, .. } => *status,
            JobOutcome::Open { status } => *status,
        }
    }
}

pub type Callback = Box<dyn FnOnce(JobOutcome) + Send>;

enum JobRequest {
    Open {
        chunk_id: u64,
        version: u32,
        part_type: ChunkPartType,
    },
    Close {
        chunk_id: u64,
        part_type: ChunkPartType,
    },
    Read {
        chunk_id: u64,
        version: u32,
        part_type: ChunkPartType,
        offset: u32,
        size: u32,
        read_behind: u32,
        read_ahead: u32,
        buffer: OutputBuffer,
        open_if_needed: bool,
    },
    Write {
        chunk_id: u64,
        version: u32,
        part_type: ChunkPartType,
        write_id: u32,
        block_num: u16,
        offset: u32,
        size: u32,
        crc: u32,
        data: Vec<u8>,
    },
    Prefetch {
        chunk_id: u64,
        version: u32,
        part_type: ChunkPartType,
        offset: u32,
        size: u32,
    },
    GetBlocks {
        chunk_id: u64,
        version: u32,
        part_type: ChunkPartType,
    },
    TestChunk {
        chunk_id: u64,
        version: u32,
        part_type: ChunkPartType,
    },
}

struct QueuedJob {
    id: JobId,
    request: JobRequest,
}

type CallbackCell = Arc<Mutex<Option<Callback>>>;

/// A bounded thread pool that executes [`ChunkStore`] operations off the
/// network-worker thread and reports completions through a pollable fd.
pub struct BackgroundJobPool {
    sender: Sender<QueuedJob>,
    next_id: AtomicU64,
    callbacks: Mutex<HashMap<JobId, CallbackCell>>,
    completions: Receiver<(JobId, JobOutcome)>,
    wakeup_read_fd: RawFd,
    wakeup_write_fd: RawFd,
    workers: Mutex<Vec<JoinHandle<()>>>,
    queue_capacity: usize,
    chunk_locks: Arc<Mutex<HashMap<(u64, ChunkPartType), Arc<Mutex<()>>>>>,
}

impl BackgroundJobPool {
    /// Spawns `worker_count` threads executing jobs against `store`, with a
    /// submit queue bounded to `queue_capacity` (`MAX_BG_JOBS_PER_NETWORK_WORKER`).
    pub fn new(
        worker_count: usize,
        queue_capacity: usize,
        store: Arc<dyn ChunkStore>,
    ) -> Result<Self, CoreError> {
        let (job_tx, job_rx) = crossbeam_channel::bounded::<QueuedJob>(queue_capacity);
        let (completion_tx, completion_rx) = crossbeam_channel::unbounded();
        let (wakeup_read_fd, wakeup_write_fd) = pipe()
            .map(|(r, w)| {
                use std::os::fd::IntoRawFd;
                (r.into_raw_fd(), w.into_raw_fd())
            })
            .map_err(|e| CoreError::WakeupChannel(e.into()))?;

        let callbacks: Mutex<HashMap<JobId, CallbackCell>> = Mutex::new(HashMap::new());
        let chunk_locks: Arc<Mutex<HashMap<(u64, ChunkPartType), Arc<Mutex<()>>>>> =
            Arc::new(Mutex::new(HashMap::new()));

        let mut workers = Vec::with_capacity(worker_count);
        for worker_index in 0..worker_count {
            let job_rx = job_rx.clone();
            let completion_tx = completion_tx.clone();
            let store = Arc::clone(&store);
            let chunk_locks = Arc::clone(&chunk_locks);
            let handle = std::thread::Builder::new()
                .name(format!("sfs-hdd-worker-{worker_index}"))
                .spawn(move || run_worker(job_rx, completion_tx, wakeup_write_fd, store, chunk_locks))
                .map_err(|e| CoreError::ThreadSpawn {
                    pool: "BackgroundJobPool",
                    count: worker_count,
                    source: e,
                })?;
            workers.push(handle);
        }

        Ok(BackgroundJobPool {
            sender: job_tx,
            next_id: AtomicU64::new(1),
            callbacks,
            completions: completion_rx,
            wakeup_read_fd,
            wakeup_write_fd,
            workers: Mutex::new(workers),
            queue_capacity,
            chunk_locks,
        })
    }

    /// fd that becomes readable whenever at least one completion is
    /// pending; include this in the owning worker's pollset (§4.5, §4.8).
    pub fn wakeup_fd(&self) -> RawFd {
        self.wakeup_read_fd
    }

    fn next_job_id(&self) -> JobId {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    fn submit(&self, request: JobRequest, callback: Callback) -> JobId {
        let id = self.next_job_id();
        self.callbacks
            .lock()
            .unwrap()
            .insert(id, Arc::new(Mutex::new(Some(callback))));
        match self.sender.try_send(QueuedJob { id, request }) {
            Ok(()) => id,
            Err(TrySendError::Full(_)) | Err(TrySendError::Disconnected(_)) => {
                self.callbacks.lock().unwrap().remove(&id);
                0
            }
        }
    }

    pub fn open(
        &self,
        chunk_id: u64,
        version: u32,
        part_type: ChunkPartType,
        callback: Callback,
    ) -> JobId {
        self.submit(
            JobRequest::Open {
                chunk_id,
                version,
                part_type,
            },
            callback,
        )
    }

    pub fn close(&self, chunk_id: u64, part_type: ChunkPartType, callback: Callback) -> JobId {
        self.submit(JobRequest::Close { chunk_id, part_type }, callback)
    }

    #[allow(clippy::too_many_arguments)]
    pub fn read(
        &self,
        chunk_id: u64,
        version: u32,
        part_type: ChunkPartType,
        offset: u32,
        size: u32,
        read_behind: u32,
        read_ahead: u32,
        buffer: OutputBuffer,
        open_if_needed: bool,
        callback: Callback,
    ) -> JobId {
        self.submit(
            JobRequest::Read {
                chunk_id,
                version,
                part_type,
                offset,
                size,
                read_behind,
                read_ahead,
                buffer,
                open_if_needed,
            },
            callback,
        )
    }

    #[allow(clippy::too_many_arguments)]
    pub fn write(
        &self,
        chunk_id: u64,
        version: u32,
        part_type: ChunkPartType,
        write_id: u32,
        block_num: u16,
        offset: u32,
        size: u32,
        crc: u32,
        data: Vec<u8>,
        callback: Callback,
    ) -> JobId {
        self.submit(
            JobRequest::Write {
                chunk_id,
                version,
                part_type,
                write_id,
                block_num,
                offset,
                size,
                crc,
                data,
            },
            callback,
        )
    }

    pub fn prefetch(
        &self,
        chunk_id: u64,
        version: u32,
        part_type: ChunkPartType,
        offset: u32,
        size: u32,
        callback: Callback,
    ) -> JobId {
        self.submit(
            JobRequest::Prefetch {
                chunk_id,
                version,
                part_type,
                offset,
                size,
            },
            callback,
        )
    }

    pub fn get_blocks(
        &self,
        chunk_id: u64,
        version: u32,
        part_type: ChunkPartType,
        callback: Callback,
    ) -> JobId {
        self.submit(
            JobRequest::GetBlocks {
                chunk_id,
                version,
                part_type,
            },
            callback,
        )
    }

    pub fn test_chunk(
        &self,
        chunk_id: u64,
        version: u32,
        part_type: ChunkPartType,
        callback: Callback,
    ) -> JobId {
        self.submit(
            JobRequest::TestChunk {
                chunk_id,
                version,
                part_type,
            },
            callback,
        )
    }

    /// Prevents `id`'s original callback from firing; the job still runs to
    /// completion on its worker thread, it just reports to a no-op.
    pub fn disable_job(&self, id: JobId) {
        self.change_callback(id, Box::new(|_| {}));
    }

    /// Atomically swaps `id`'s callback for `new_callback`, with respect to
    /// the job possibly completing concurrently on a pool thread.
    pub fn change_callback(&self, id: JobId, new_callback: Callback) {
        if let Some(cell) = self.callbacks.lock().unwrap().get(&id) {
            *cell.lock().unwrap() = Some(new_callback);
        }
    }

    /// Drains every completion currently queued, invoking each one's
    /// (possibly swapped) callback. Called by the owning worker thread once
    /// per poll tick when [`Self::wakeup_fd`] is readable.
    pub fn drain_completions(&self) {
        drain_wakeup_pipe(self.wakeup_read_fd);
        while let Ok((id, outcome)) = self.completions.try_recv() {
            let cell = self.callbacks.lock().unwrap().remove(&id);
            if let Some(cell) = cell {
                if let Some(callback) = cell.lock().unwrap().take() {
                    callback(outcome);
                }
            }
        }
    }

    pub fn queue_capacity(&self) -> usize {
        self.queue_capacity
    }
}

impl Drop for BackgroundJobPool {
    fn drop(&mut self) {
        // Dropping `sender` (implicitly, when the pool itself is dropped)
        // closes the channel; workers exit their `recv` loop once drained.
        let workers = std::mem::take(&mut *self.workers.lock().unwrap());
        for worker in workers {
            let _ = worker.join();
        }
        let _ = close(self.wakeup_read_fd);
        let _ = close(self.wakeup_write_fd);
    }
}

fn drain_wakeup_pipe(fd: RawFd) {
    use std::os::fd::BorrowedFd;
    let mut scratch = [0u8; 256];
    loop {
        // SAFETY: `fd` is owned by the pool for the duration of this call.
        let borrowed = unsafe { BorrowedFd::borrow_raw(fd) };
        match read(borrowed, &mut scratch) {
            Ok(0) => break,
            Ok(n) if n < scratch.len() => break,
            Ok(_) => continue,
            Err(nix::errno::Errno::EAGAIN) => break,
            Err(nix::errno::Errno::EINTR) => continue,
            Err(_) => break,
        }
    }
}

fn notify_wakeup(fd: RawFd) {
    use std::os::fd::BorrowedFd;
    // SAFETY: `fd` is owned by the pool for the duration of this call.
    let borrowed = unsafe { BorrowedFd::borrow_raw(fd) };
    let _ = write(borrowed, &[1u8]);
}

fn run_worker(
    job_rx: Receiver<QueuedJob>,
    completion_tx: Sender<(JobId, JobOutcome)>,
    wakeup_write_fd: RawFd,
    store: Arc<dyn ChunkStore>,
    chunk_locks: Arc<Mutex<HashMap<(u64, ChunkPartType), Arc<Mutex<()>>>>>,
) {
    while let Ok(job) = job_rx.recv() {
        let key = request_chunk_key(&job.request);
        // Reads/writes for the same chunk serialize through a per-chunk
        // lock so their completions preserve submission order (§4.5).
        let chunk_lock = {
            let mut locks = chunk_locks.lock().unwrap();
            Arc::clone(locks.entry(key).or_insert_with(|| Arc::new(Mutex::new(()))))
        };
        let outcome = {
            let _guard = chunk_lock.lock().unwrap();
            execute(&*store, job.request)
        };
        let _ = completion_tx.send((job.id, outcome));
        notify_wakeup(wakeup_write_fd);
    }
}

fn request_chunk_key(request: &JobRequest) -> (u64, ChunkPartType) {
    match request {
        JobRequest::Open { chunk_id, part_type, .. }
        | JobRequest::Close { chunk_id, part_type, .. }
        | JobRequest::Read { chunk_id, part_type, .. }
        | JobRequest::Write { chunk_id, part_type, .. }
        | JobRequest::Prefetch { chunk_id, part_type, .. }
        | JobRequest::GetBlocks { chunk_id, part_type, .. }
        | JobRequest::TestChunk { chunk_id, part_type, .. } => (*chunk_id, *part_type),
    }
}

fn execute(store: &dyn ChunkStore, request: JobRequest) -> JobOutcome {
    match request {
        JobRequest::Open {
            chunk_id,
            version,
            part_type,
        } => JobOutcome::Open {
            status: to_status(store.open(chunk_id, version, part_type)),
        },
        JobRequest::Close { chunk_id, part_type } => {
            JobOutcome::Status(to_status(store.close(chunk_id, part_type)))
        }
        JobRequest::Read {
            chunk_id,
            version,
            part_type,
            offset,
            size,
            read_behind,
            read_ahead,
            mut buffer,
            open_if_needed,
        } => {
            let result = store.read(
                chunk_id,
                version,
                part_type,
                offset,
                size,
                read_behind,
                read_ahead,
                open_if_needed,
                &mut buffer,
            );
            JobOutcome::Read {
                status: to_status(result),
                buffer,
            }
        }
        JobRequest::Write {
            chunk_id,
            version,
            part_type,
            write_id,
            block_num,
            offset,
            size,
            crc,
            data,
        } => {
            let result = store.write(
                chunk_id, version, part_type, write_id, block_num, offset, size, crc, &data,
            );
            JobOutcome::Status(to_status(result))
        }
        JobRequest::Prefetch {
            chunk_id,
            version,
            part_type,
            offset,
            size,
        } => JobOutcome::Status(to_status(store.prefetch(chunk_id, version, part_type, offset, size))),
        JobRequest::GetBlocks {
            chunk_id,
            version,
            part_type,
        } => match store.get_blocks(chunk_id, version, part_type) {
            Ok(count) => JobOutcome::Blocks {
                status: SfsStatus::Ok,
                block_count: count,
            },
            Err(status) => JobOutcome::Blocks {
                status,
                block_count: 0,
            },
        },
        JobRequest::TestChunk {
            chunk_id,
            version,
            part_type,
        } => JobOutcome::Status(to_status(store.test_crc(chunk_id, version, part_type))),
    }
}

fn to_status(result: Result<(), SfsStatus>) -> SfsStatus {
    result.err().unwrap_or(SfsStatus::Ok)
}
