//! `ConnectionEntry`: the per-connection state machine that turns a TCP
//! session into durable block I/O, forwarding writes down a chain while
//! farming disk work out to the background job pool (§4.6-§4.8).

use std::collections::{HashSet, VecDeque};
use std::net::SocketAddrV4;
use std::os::unix::io::RawFd;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crossbeam_channel::Sender;
use log::{debug, warn};

use crate::buffer::{BufferPool, OutputBuffer};
use crate::error::SfsStatus;
use crate::job_pool::{BackgroundJobPool, JobId, JobOutcome};
use crate::packet::{FeedResult, InputPacket, PacketBody, PacketHeader};
use crate::serializer::{
    packet_type, reencode_chain_for_next_hop, serializer_for_dialect, ChainEntry, ChunkPartType,
    Dialect, MessageSerializer, ParseError,
};

/// What a background job reports back, tagged with which connection
/// submitted it so the owning `NetworkWorkerThread` can route it without
/// holding a reference into its `entries` map across the job's lifetime
/// (§4.5, §4.7).
pub enum ConnectionCompletion {
    Read(JobOutcome),
    Write(JobOutcome),
    GetBlocks(JobOutcome),
}

/// The channel a `ConnectionEntry` posts job completions to; the owning
/// `NetworkWorkerThread` holds the matching `Receiver` and drains it right
/// after calling `BackgroundJobPool::drain_completions` (whose callbacks,
/// running on the worker thread, are what push into this channel).
pub type CompletionSender = Sender<(u64, ConnectionCompletion)>;

/// Idle timeout applied to a connection not mid-operation (§4.6, §5).
pub const IDLE_TIMEOUT: Duration = Duration::from_secs(10);

/// Up to 10 forward-connect retries with the original's odd/even backoff
/// schedule (§5): `300_000 * 2^(n>>1)` us for odd `n`, `200_000 * 2^(n>>1)`
/// us for even `n`.
pub const MAX_CONNECT_RETRIES: u8 = 10;

pub fn connect_retry_backoff(retry: u8) -> Duration {
    let shifted = 1u64 << (retry as u64 >> 1);
    let usec = if retry % 2 == 1 {
        300_000 * shifted
    } else {
        200_000 * shifted
    };
    Duration::from_micros(usec)
}

/// Readahead/readbehind hints applied the first time a chunk is opened on a
/// connection (§4.7); mirrors the global `gHDDReadAhead` policy object.
#[derive(Debug, Clone, Copy)]
pub struct ReadAheadPolicy {
    pub blocks_to_be_read_ahead: u32,
    pub max_blocks_to_be_read_behind: u32,
}

impl Default for ReadAheadPolicy {
    fn default() -> Self {
        ReadAheadPolicy {
            blocks_to_be_read_ahead: 0,
            max_blocks_to_be_read_behind: 0,
        }
    }
}

/// §4.6 connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Idle,
    Read,
    GetBlock,
    WriteLast,
    Connecting,
    WriteInit,
    WriteForward,
    WriteFinish,
    Close,
    CloseWait,
    Closed,
}

/// One packet waiting in `outputPackets`: either an owned byte vector or a
/// pool-borrowed [`OutputBuffer`] (§3).
pub enum OutputPacket {
    Owned(Vec<u8>),
    Buffered(OutputBuffer),
}

impl OutputPacket {
    fn bytes_remaining(&self, sent: usize) -> &[u8] {
        match self {
            OutputPacket::Owned(v) => &v[sent..],
            OutputPacket::Buffered(buf) => &buf.data()[sent..],
        }
    }
}

/// A single client (or peer) TCP session driving the chunkserver protocol
/// state machine (§3, §4.6).
pub struct ConnectionEntry {
    pub connection_id: u64,
    pub state: ConnectionState,
    pub client_fd: RawFd,
    pub forward_fd: Option<RawFd>,

    input_packet: InputPacket,
    forward_input_packet: InputPacket,

    pub output_packets: VecDeque<OutputPacket>,
    output_sent: usize,
    forward_init_packet: Vec<u8>,
    forward_sent: usize,

    pub chunk_id: u64,
    pub chunk_version: u32,
    pub chunk_part_type: ChunkPartType,
    pub offset: u32,
    pub size: u32,
    pub is_chunk_open: bool,

    pub read_job_id: JobId,
    pub write_job_id: JobId,
    pub get_blocks_job_id: JobId,
    pub write_job_write_id: u32,
    pub partially_completed_writes: HashSet<u32>,

    pub dialect: Option<Dialect>,
    pub forward_address: Option<SocketAddrV4>,
    pub connect_start: Option<Instant>,
    pub connect_retry_counter: u8,

    pub last_activity: Instant,
    pub todo_read_counter: u8,
    read_packet: Option<OutputBuffer>,
    pending_remaining_chain: Vec<ChainEntry>,

    buffer_pool: Arc<BufferPool>,
    job_pool: Arc<BackgroundJobPool>,
    completions: CompletionSender,
    read_ahead: ReadAheadPolicy,
}

impl ConnectionEntry {
    pub fn new(
        connection_id: u64,
        client_fd: RawFd,
        buffer_pool: Arc<BufferPool>,
        job_pool: Arc<BackgroundJobPool>,
        completions: CompletionSender,
    ) -> Self {
        ConnectionEntry {
            connection_id,
            state: ConnectionState::Idle,
            client_fd,
            forward_fd: None,
            input_packet: InputPacket::new(),
            forward_input_packet: InputPacket::new(),
            output_packets: VecDeque::new(),
            output_sent: 0,
            forward_init_packet: Vec::new(),
            forward_sent: 0,
            chunk_id: 0,
            chunk_version: 0,
            chunk_part_type: ChunkPartType::Standard,
            offset: 0,
            size: 0,
            is_chunk_open: false,
            read_job_id: 0,
            write_job_id: 0,
            get_blocks_job_id: 0,
            write_job_write_id: 0,
            partially_completed_writes: HashSet::new(),
            dialect: None,
            forward_address: None,
            connect_start: None,
            connect_retry_counter: 0,
            last_activity: Instant::now(),
            todo_read_counter: 0,
            read_packet: None,
            pending_remaining_chain: Vec::new(),
            buffer_pool,
            job_pool,
            completions,
            read_ahead: ReadAheadPolicy::default(),
        }
    }

    fn serializer(&self) -> &'static dyn MessageSerializer {
        serializer_for_dialect(self.dialect.unwrap_or(Dialect::Current))
    }

    fn attach_owned(&mut self, ptype: u32, payload: Vec<u8>) {
        self.output_packets
            .push_back(OutputPacket::Owned(crate::packet::encode_packet(ptype, &payload)));
    }

    fn close_with_error(&mut self) {
        self.state = ConnectionState::Close;
    }

    /// Idle-timeout sweep hook, called once per worker poll tick (§4.6).
    pub fn apply_idle_timeout(&mut self, now: Instant) {
        if !matches!(
            self.state,
            ConnectionState::Close | ConnectionState::CloseWait | ConnectionState::Closed
        ) && now.duration_since(self.last_activity) > IDLE_TIMEOUT
        {
            debug!("connection idle for >{:?}, closing", IDLE_TIMEOUT);
            self.state = ConnectionState::Close;
        }
    }

    /// Feeds freshly-read client bytes into the input packet, dispatching
    /// complete packets as they land.
    pub fn on_client_bytes(&mut self, mut bytes: &[u8]) {
        self.last_activity = Instant::now();
        while !bytes.is_empty() {
            let (consumed, result) = self.input_packet.feed(bytes);
            bytes = &bytes[consumed..];
            match result {
                FeedResult::NeedMore => {}
                FeedResult::HeaderComplete => {
                    let header = self.input_packet.header.unwrap();
                    if !header.length_is_valid() {
                        warn!("oversize packet header, closing");
                        self.close_with_error();
                        return;
                    }
                    let len = header.length as usize;
                    let body = if is_write_data_packet_type(header.ptype)
                        && len
                            <= crate::constants::SFSBLOCKSIZE
                                + crate::constants::WRITE_DATA_PREFIX_SIZE
                    {
                        // Write-data payloads get the page-aligned scratch
                        // buffer so a ChunkStore backed by O_DIRECT can hand
                        // the payload straight to write(2) (§4.2). Purely a
                        // performance path: PacketBody::as_slice reads back
                        // identically either way.
                        PacketBody::aligned(len)
                    } else {
                        PacketBody::plain_with_capacity(len)
                    };
                    self.input_packet.begin_body(body);
                }
                FeedResult::PacketComplete => {
                    let ptype = self.input_packet.header.unwrap().ptype;
                    let payload = self.input_packet.payload().to_vec();
                    self.input_packet.reset();
                    self.dispatch(ptype, &payload);
                    if self.state == ConnectionState::Close {
                        return;
                    }
                }
            }
        }
    }

    /// Feeds bytes read from the forward socket, dispatching `WRITE_STATUS`
    /// acks from the downstream peer (§4.6).
    pub fn on_forward_bytes(&mut self, mut bytes: &[u8]) {
        while !bytes.is_empty() {
            let (consumed, result) = self.forward_input_packet.feed(bytes);
            bytes = &bytes[consumed..];
            match result {
                FeedResult::NeedMore => {}
                FeedResult::HeaderComplete => {
                    let header = self.forward_input_packet.header.unwrap();
                    if !header.length_is_valid() {
                        self.on_forward_error();
                        return;
                    }
                    let len = header.length as usize;
                    self.forward_input_packet
                        .begin_body(PacketBody::plain_with_capacity(len));
                }
                FeedResult::PacketComplete => {
                    let payload = self.forward_input_packet.payload().to_vec();
                    self.forward_input_packet.reset();
                    let ser = self.serializer();
                    match ser.parse_write_status(&payload) {
                        Ok((chunk_id, write_id, status)) => {
                            self.on_downstream_write_status(chunk_id, write_id, status)
                        }
                        Err(_) => self.on_forward_error(),
                    }
                    if self.state == ConnectionState::Close {
                        return;
                    }
                }
            }
        }
    }

    fn latch_dialect(&mut self, ptype: u32) -> bool {
        match Dialect::from_packet_type(ptype) {
            Some(d) => {
                match self.dialect {
                    None => self.dialect = Some(d),
                    Some(existing) if existing != d => {
                        warn!("protocol dialect mismatch on established connection");
                        self.close_with_error();
                        return false;
                    }
                    _ => {}
                }
                true
            }
            None => true, // keepalive types are dialect-agnostic
        }
    }

    fn dispatch(&mut self, ptype: u32, payload: &[u8]) {
        if ptype == packet_type::ANTOAN_PING {
            self.attach_owned(packet_type::ANTOAN_PING_REPLY, payload.to_vec());
            return;
        }
        if ptype == packet_type::ANTOAN_NOP || ptype == packet_type::ANTOAN_PING_REPLY {
            return;
        }

        match self.state {
            ConnectionState::Idle => self.dispatch_idle(ptype, payload),
            ConnectionState::WriteLast | ConnectionState::WriteForward => {
                self.dispatch_write_phase(ptype, payload)
            }
            _ => {
                warn!("unexpected packet type {ptype} in state {:?}", self.state);
                self.close_with_error();
            }
        }
    }

    fn dispatch_idle(&mut self, ptype: u32, payload: &[u8]) {
        if !self.latch_dialect(ptype) {
            return;
        }
        let dialect = self.dialect.unwrap_or(Dialect::Current);
        let ser = serializer_for_dialect(dialect);

        if ptype == ser.read_packet_type() {
            self.handle_read_init(payload);
        } else if ptype == ser.write_init_packet_type() {
            self.handle_write_init(payload);
        } else if Some(ptype) == ser.prefetch_packet_type() {
            self.handle_prefetch(payload);
        } else if ptype == ser.get_chunk_blocks_packet_type() {
            self.handle_get_chunk_blocks(payload);
        } else if ptype == ser.test_chunk_packet_type() {
            self.handle_test_chunk(payload);
        } else if is_admin_query_packet_type(ptype) {
            // HddListV2/ListDiskGroups/Chart/AdminDiskGroups: the admin CLI
            // and its response formats are an out-of-scope collaborator
            // (§1); this core only guarantees it won't tear down the
            // connection over a recognized admin packet type.
            debug!("admin query packet type {ptype} recognized, no-op in Idle");
        } else {
            warn!("unexpected packet type {ptype} in Idle");
            self.close_with_error();
        }
    }

    fn dispatch_write_phase(&mut self, ptype: u32, payload: &[u8]) {
        let ser = self.serializer();
        if ptype == ser.write_data_packet_type() {
            self.handle_write_data(ptype, payload);
        } else if Some(ptype) == ser.write_end_packet_type() {
            self.handle_write_end(payload);
        } else {
            warn!("unexpected packet type {ptype} in write phase");
            self.close_with_error();
        }
    }

    // ---- Idle: Read ----------------------------------------------------

    fn handle_read_init(&mut self, payload: &[u8]) {
        let ser = self.serializer();
        let request = match ser.parse_read_request(payload) {
            Ok(r) => r,
            Err(ParseError::TooShort { .. }) | Err(ParseError::Malformed(_)) => {
                self.close_with_error();
                return;
            }
        };

        self.chunk_id = request.chunk_id;
        self.chunk_version = request.version;
        self.chunk_part_type = request.part_type;
        self.offset = request.offset;
        self.size = request.size;
        self.is_chunk_open = false;

        if (request.offset as u64 + request.size as u64) > crate::constants::SFSCHUNKSIZE as u64 {
            let status_payload = ser.serialize_read_status(request.chunk_id, SfsStatus::WrongSize);
            self.attach_owned(ser.read_status_packet_type(), status_payload);
            return;
        }

        self.todo_read_counter = 0;
        self.state = ConnectionState::Read;
        self.read_continue();
    }

    /// The restartable read stepper (§4.7).
    fn read_continue(&mut self) {
        if let Some(buffer) = self.read_packet.take() {
            self.output_packets.push_back(OutputPacket::Buffered(buffer));
            self.todo_read_counter += 1;
        }

        if self.size == 0 {
            let ser = self.serializer();
            let status_payload = ser.serialize_read_status(self.chunk_id, SfsStatus::Ok);
            let ptype = ser.read_status_packet_type();
            self.attach_owned(ptype, status_payload);
            self.job_pool
                .close(self.chunk_id, self.chunk_part_type, Box::new(|_| {}));
            self.state = ConnectionState::Idle;
            return;
        }

        let block_size = crate::constants::SFSBLOCKSIZE as u32;
        let this_part_offset = self.offset % block_size;
        let this_part_size = self.size.min(block_size - this_part_offset);

        let ser = self.serializer();
        let prefix = ser.serialize_read_data_prefix(self.chunk_id, self.offset, this_part_size);
        let ptype = ser.read_data_packet_type();
        let header = PacketHeader {
            ptype,
            length: (prefix.len() + 4 + this_part_size as usize) as u32,
        };
        let mut buffer = self
            .buffer_pool
            .get(PacketHeader::SIZE + prefix.len() + 4 + this_part_size as usize);
        buffer.copy_into(&header.encode());
        buffer.copy_into(&prefix);
        self.read_packet = Some(buffer);

        let (read_ahead, read_behind) = if !self.is_chunk_open {
            (
                self.read_ahead.blocks_to_be_read_ahead,
                self.read_ahead.max_blocks_to_be_read_behind.min(1),
            )
        } else {
            (0, 0)
        };

        let buffer = self.read_packet.take().unwrap();
        let open_if_needed = !self.is_chunk_open;
        self.is_chunk_open = true;
        let tx = self.completions.clone();
        let id = self.connection_id;
        let job_id = self.job_pool.read(
            self.chunk_id,
            self.chunk_version,
            self.chunk_part_type,
            self.offset,
            this_part_size,
            read_behind,
            read_ahead,
            buffer,
            open_if_needed,
            Box::new(move |outcome| {
                let _ = tx.send((id, ConnectionCompletion::Read(outcome)));
            }),
        );
        if job_id == 0 {
            self.close_with_error();
            return;
        }
        self.read_job_id = job_id;
        self.offset += this_part_size;
        self.size -= this_part_size;
        self.todo_read_counter += 1;
    }

    /// Handles a completed read job's outcome, invoked by the worker after
    /// draining `BackgroundJobPool` completions (§4.5, §4.7).
    pub fn on_read_completed(&mut self, outcome: JobOutcome) {
        self.read_job_id = 0;
        match outcome {
            JobOutcome::Read { status, buffer } if status == SfsStatus::Ok => {
                self.read_packet = Some(buffer);
                self.todo_read_counter -= 1;
                if self.todo_read_counter == 0 {
                    self.read_continue();
                }
            }
            JobOutcome::Read { status, .. } => {
                let ser = self.serializer();
                let payload = ser.serialize_read_status(self.chunk_id, status);
                let ptype = ser.read_status_packet_type();
                self.attach_owned(ptype, payload);
                self.job_pool
                    .close(self.chunk_id, self.chunk_part_type, Box::new(|_| {}));
                self.state = ConnectionState::Idle;
            }
            _ => unreachable!("read job always resolves to JobOutcome::Read"),
        }
    }

    /// Called once a packet attached by `read_continue` has been fully
    /// flushed to the client socket (§4.7).
    pub fn on_send_finished(&mut self) {
        if self.state == ConnectionState::Read && self.todo_read_counter > 0 {
            self.todo_read_counter -= 1;
            if self.todo_read_counter == 0 {
                self.read_continue();
            }
        }
    }

    // ---- Idle: Prefetch -------------------------------------------------

    fn handle_prefetch(&mut self, payload: &[u8]) {
        let ser = self.serializer();
        if let Ok(request) = ser.parse_read_request(payload) {
            self.job_pool.prefetch(
                request.chunk_id,
                request.version,
                request.part_type,
                request.offset,
                request.size,
                Box::new(|_| {}),
            );
        }
    }

    // ---- Idle: GetChunkBlocks -------------------------------------------

    fn handle_get_chunk_blocks(&mut self, payload: &[u8]) {
        let ser = self.serializer();
        let request = match ser.parse_chunk_key_request(payload) {
            Ok(r) => r,
            Err(_) => {
                self.close_with_error();
                return;
            }
        };
        self.chunk_id = request.chunk_id;
        self.chunk_version = request.version;
        self.chunk_part_type = request.part_type;

        let tx = self.completions.clone();
        let id = self.connection_id;
        self.get_blocks_job_id = self.job_pool.get_blocks(
            request.chunk_id,
            request.version,
            request.part_type,
            Box::new(move |outcome| {
                let _ = tx.send((id, ConnectionCompletion::GetBlocks(outcome)));
            }),
        );
        if self.get_blocks_job_id == 0 {
            self.close_with_error();
            return;
        }
        self.state = ConnectionState::GetBlock;
    }

    /// `getBlocks` job completion (§4.6 `GetBlock` state).
    pub fn on_get_blocks_completed(&mut self, outcome: JobOutcome) {
        self.get_blocks_job_id = 0;
        let (status, block_count) = match outcome {
            JobOutcome::Blocks { status, block_count } => (status, block_count),
            _ => unreachable!("get_blocks job always resolves to JobOutcome::Blocks"),
        };
        let ser = self.serializer();
        let payload = ser.serialize_get_chunk_blocks_reply(self.chunk_id, status, block_count);
        let ptype = ser.get_chunk_blocks_reply_packet_type();
        self.attach_owned(ptype, payload);
        self.state = ConnectionState::Idle;
    }

    // ---- Idle: TestChunk --------------------------------------------------

    fn handle_test_chunk(&mut self, payload: &[u8]) {
        let ser = self.serializer();
        if let Ok(request) = ser.parse_chunk_key_request(payload) {
            self.job_pool.test_chunk(
                request.chunk_id,
                request.version,
                request.part_type,
                Box::new(|_| {}),
            );
        }
    }

    // ---- Idle: WriteInit --------------------------------------------------

    fn handle_write_init(&mut self, payload: &[u8]) {
        let ser = self.serializer();
        let request = match ser.parse_write_init(payload) {
            Ok(r) => r,
            Err(_) => {
                self.close_with_error();
                return;
            }
        };
        self.chunk_id = request.chunk_id;
        self.chunk_version = request.version;
        self.chunk_part_type = request.part_type;
        self.partially_completed_writes.clear();
        self.write_job_write_id = 0;

        if request.chain.is_empty() {
            self.state = ConnectionState::WriteLast;
        } else {
            let mut chain = request.chain;
            let head = chain.remove(0);
            self.forward_address = Some(head.addr);
            self.pending_remaining_chain = chain;
            let (ptype, body) = reencode_chain_for_next_hop(
                head.peer_version,
                self.chunk_id,
                self.chunk_version,
                self.chunk_part_type,
                &self.pending_remaining_chain,
            );
            self.forward_init_packet = crate::packet::encode_packet(ptype, &body);
            self.forward_sent = 0;
            self.connect_retry_counter = 0;
            self.state = ConnectionState::Connecting;
            self.connect_start = Some(Instant::now());
            // Actual non-blocking connect is driven by the owning
            // NetworkWorkerThread via `begin_connect`/`poll_connect`
            // (kept out of this module so tests can run chain logic
            // without real sockets).
        }

        let job_id = self.job_pool.open(
            self.chunk_id,
            self.chunk_version,
            self.chunk_part_type,
            Box::new(|_| {}),
        );
        if job_id == 0 {
            self.close_with_error();
        }
    }

    /// Called by the worker once the forward connect attempt resolves.
    pub fn on_forward_connected(&mut self) {
        self.state = ConnectionState::WriteInit;
    }

    pub fn on_forward_connect_failed(&mut self) {
        self.connect_retry_counter += 1;
        if self.connect_retry_counter >= MAX_CONNECT_RETRIES {
            let ser = self.serializer();
            let payload = ser.serialize_write_status(self.chunk_id, 0, SfsStatus::CantConnect);
            let ptype = ser.write_status_packet_type();
            self.attach_owned(ptype, payload);
            self.state = ConnectionState::WriteFinish;
        }
        // else: the worker schedules a retry after `connect_retry_backoff`.
    }

    pub fn on_forward_init_sent(&mut self) {
        if self.state == ConnectionState::WriteInit {
            self.state = ConnectionState::WriteForward;
        }
    }

    // ---- WriteLast / WriteForward ---------------------------------------

    fn handle_write_data(&mut self, ptype: u32, payload: &[u8]) {
        let ser_dialect = Dialect::from_packet_type(ptype);
        if ser_dialect != self.dialect {
            warn!("WRITE_DATA dialect mismatch with latched WRITE_INIT dialect");
            self.close_with_error();
            return;
        }
        let ser = self.serializer();
        let (header, prefix_len) = match ser.parse_write_data_header(payload) {
            Ok(v) => v,
            Err(_) => {
                self.close_with_error();
                return;
            }
        };
        let data = &payload[prefix_len..];

        let mut status = SfsStatus::Ok;
        if data.len() != header.size as usize {
            status = SfsStatus::WrongSize;
        } else if header.chunk_id != self.chunk_id {
            status = SfsStatus::WrongChunkId;
        }

        if status != SfsStatus::Ok {
            let payload = ser.serialize_write_status(header.chunk_id, header.write_id, status);
            let ptype = ser.write_status_packet_type();
            self.attach_owned(ptype, payload);
            self.state = ConnectionState::WriteFinish;
            return;
        }

        if self.state == ConnectionState::WriteForward {
            // Forward the raw packet bytes byte-for-byte to the downstream
            // peer before (or alongside) the local write (§4.6).
            let mut raw = PacketHeader {
                ptype,
                length: payload.len() as u32,
            }
            .encode()
            .to_vec();
            raw.extend_from_slice(payload);
            self.forward_init_packet = raw;
            self.forward_sent = 0;
        }

        self.write_job_write_id = header.write_id;
        let tx = self.completions.clone();
        let id = self.connection_id;
        let job_id = self.job_pool.write(
            header.chunk_id,
            self.chunk_version,
            self.chunk_part_type,
            header.write_id,
            header.block_num,
            header.offset,
            header.size,
            header.crc,
            data.to_vec(),
            Box::new(move |outcome| {
                let _ = tx.send((id, ConnectionCompletion::Write(outcome)));
            }),
        );
        if job_id == 0 {
            self.close_with_error();
            return;
        }
        self.write_job_id = job_id;
    }

    /// Local write-job completion (§4.6 "XOR on a set" protocol).
    pub fn on_write_completed(&mut self, outcome: JobOutcome) {
        self.write_job_id = 0;
        let status = outcome.status();
        let write_id = self.write_job_write_id;
        let ser = self.serializer();

        if status != SfsStatus::Ok {
            let payload = ser.serialize_write_status(self.chunk_id, write_id, status);
            let ptype = ser.write_status_packet_type();
            self.attach_owned(ptype, payload);
            self.state = ConnectionState::WriteFinish;
            return;
        }

        if self.state == ConnectionState::WriteLast {
            let payload = ser.serialize_write_status(self.chunk_id, write_id, SfsStatus::Ok);
            let ptype = ser.write_status_packet_type();
            self.attach_owned(ptype, payload);
        } else if self.partially_completed_writes.remove(&write_id) {
            let payload = ser.serialize_write_status(self.chunk_id, write_id, SfsStatus::Ok);
            let ptype = ser.write_status_packet_type();
            self.attach_owned(ptype, payload);
        } else {
            self.partially_completed_writes.insert(write_id);
        }
    }

    /// Downstream peer's `WriteStatus(writeId)` ack received on the forward
    /// socket, in a `WriteForward` connection (§4.6).
    pub fn on_downstream_write_status(&mut self, chunk_id: u64, write_id: u32, status: SfsStatus) {
        let ser = self.serializer();
        if chunk_id != self.chunk_id {
            let payload = ser.serialize_write_status(chunk_id, 0, SfsStatus::WrongChunkId);
            let ptype = ser.write_status_packet_type();
            self.attach_owned(ptype, payload);
            self.state = ConnectionState::WriteFinish;
            return;
        }
        if status != SfsStatus::Ok {
            let payload = ser.serialize_write_status(chunk_id, write_id, status);
            let ptype = ser.write_status_packet_type();
            self.attach_owned(ptype, payload);
            self.state = ConnectionState::WriteFinish;
            return;
        }
        if self.partially_completed_writes.remove(&write_id) {
            let payload = ser.serialize_write_status(chunk_id, write_id, SfsStatus::Ok);
            let ptype = ser.write_status_packet_type();
            self.attach_owned(ptype, payload);
        } else {
            self.partially_completed_writes.insert(write_id);
        }
    }

    /// Downstream socket closed mid-chain or errored (§7 `fwdError`).
    pub fn on_forward_error(&mut self) {
        let ser = self.serializer();
        let payload = ser.serialize_write_status(self.chunk_id, 0, SfsStatus::Disconnected);
        let ptype = ser.write_status_packet_type();
        self.attach_owned(ptype, payload);
        self.state = ConnectionState::WriteFinish;
    }

    fn handle_write_end(&mut self, payload: &[u8]) {
        let ser = self.serializer();
        let chunk_id = match ser.parse_write_end(payload) {
            Ok(id) => id,
            Err(_) => {
                self.close_with_error();
                return;
            }
        };
        let _ = chunk_id;

        let too_early = self.write_job_id != 0
            || !self.partially_completed_writes.is_empty()
            || !self.output_packets.is_empty();
        if too_early {
            self.state = ConnectionState::WriteFinish;
            return;
        }

        self.job_pool
            .close(self.chunk_id, self.chunk_part_type, Box::new(|_| {}));
        if let Some(fd) = self.forward_fd.take() {
            // This core never reuses a forward connection across write
            // chains, so it owns closing the fd here rather than leaving it
            // for `NetworkWorkerThread::reap_closed` (§4.6).
            unsafe {
                libc::close(fd);
            }
        }
        self.is_chunk_open = false;
        self.state = ConnectionState::Idle;
    }

    // ---- Close lifecycle --------------------------------------------------

    /// §4.6 `closeJobs`: disables outstanding jobs (swapping their
    /// callback for a delayed-close) or, if none are outstanding, closes
    /// the chunk directly and marks the entry `Closed`.
    pub fn close_jobs(&mut self) {
        let mut outstanding = false;
        if self.read_job_id != 0 {
            self.job_pool.change_callback(self.read_job_id, Box::new(|_| {}));
            outstanding = true;
        }
        if self.write_job_id != 0 {
            self.job_pool.change_callback(self.write_job_id, Box::new(|_| {}));
            outstanding = true;
        }
        if self.get_blocks_job_id != 0 {
            self.job_pool
                .change_callback(self.get_blocks_job_id, Box::new(|_| {}));
            outstanding = true;
        }
        if outstanding {
            self.state = ConnectionState::CloseWait;
        } else {
            if self.is_chunk_open {
                self.job_pool
                    .close(self.chunk_id, self.chunk_part_type, Box::new(|_| {}));
            }
            self.state = ConnectionState::Closed;
        }
    }

    pub fn has_pending_output(&self) -> bool {
        !self.output_packets.is_empty()
    }

    /// Drains `outputPackets` to the client socket, returning `true` once
    /// fully drained.
    pub fn flush_output(&mut self) -> bool {
        while let Some(front) = self.output_packets.front() {
            let remaining = front.bytes_remaining(self.output_sent);
            if remaining.is_empty() {
                if let Some(OutputPacket::Buffered(buf)) = self.output_packets.pop_front() {
                    self.buffer_pool.put(buf);
                }
                self.output_sent = 0;
                self.on_send_finished();
                continue;
            }
            match write_nonblocking(self.client_fd, remaining) {
                WriteOutcome::Wrote(n) => self.output_sent += n,
                WriteOutcome::Again => return false,
                WriteOutcome::Error(_) => {
                    self.state = ConnectionState::Close;
                    return true;
                }
            }
        }
        if matches!(self.state, ConnectionState::WriteFinish) {
            self.state = ConnectionState::Close;
        }
        true
    }

    /// True while `forwardInitPacket` (a `WRITE_INIT` re-encode or a
    /// forwarded `WRITE_DATA`) still has unsent bytes (§4.6).
    pub fn forward_has_pending_output(&self) -> bool {
        self.forward_fd.is_some() && self.forward_sent < self.forward_init_packet.len()
    }

    /// Drains the pending forward-socket bytes, returning `true` once fully
    /// drained (or if there is nothing to send).
    pub fn flush_forward(&mut self) -> bool {
        let fd = match self.forward_fd {
            Some(fd) => fd,
            None => return true,
        };
        while self.forward_sent < self.forward_init_packet.len() {
            match write_nonblocking(fd, &self.forward_init_packet[self.forward_sent..]) {
                WriteOutcome::Wrote(n) => self.forward_sent += n,
                WriteOutcome::Again => return false,
                WriteOutcome::Error(_) => {
                    self.on_forward_error();
                    return true;
                }
            }
        }
        if self.state == ConnectionState::WriteInit {
            self.on_forward_init_sent();
        }
        true
    }
}

impl Drop for ConnectionEntry {
    /// Closes both sockets and returns any buffers still owned by this
    /// entry to the shared pool, whether queued in `outputPackets` or
    /// sitting half-built in `readPacket` (§3: "the entry's destructor
    /// must close both sockets and return any borrowed OutputBuffer to
    /// its pool").
    fn drop(&mut self) {
        for packet in self.output_packets.drain(..) {
            if let OutputPacket::Buffered(buf) = packet {
                self.buffer_pool.put(buf);
            }
        }
        if let Some(buf) = self.read_packet.take() {
            self.buffer_pool.put(buf);
        }
        unsafe {
            libc::close(self.client_fd);
        }
        if let Some(fd) = self.forward_fd.take() {
            unsafe {
                libc::close(fd);
            }
        }
    }
}

/// Outcome of a single non-blocking `write(2)`, distinct from a full drain:
/// callers track their own sent-offset and keep calling while bytes remain.
enum WriteOutcome {
    Wrote(usize),
    Again,
    Error(std::io::Error),
}

/// True for `WRITE_DATA` in either dialect - used to pick the page-aligned
/// input body for write payloads (§4.2).
fn is_write_data_packet_type(ptype: u32) -> bool {
    use crate::serializer::packet_type::{current, legacy};
    ptype == legacy::CLTOCS_WRITE_DATA || ptype == current::SAU_CLTOCS_WRITE_DATA
}

/// Recognizes the admin/stat query packet types (`HddListV2`,
/// `ListDiskGroups`, `Chart`, `AdminDiskGroups`) in either dialect - their
/// actual payload formats belong to the out-of-scope admin CLI collaborator
/// (§1), this core only commits to not closing the connection over one.
fn is_admin_query_packet_type(ptype: u32) -> bool {
    use crate::serializer::packet_type::{current, legacy};
    matches!(
        ptype,
        t if t == legacy::CLTOCS_HDD_LIST_V2
            || t == legacy::CLTOCS_LIST_DISK_GROUPS
            || t == legacy::CLTOCS_CHART
            || t == legacy::CLTOCS_ADMIN_DISK_GROUPS
            || t == current::SAU_CLTOCS_HDD_LIST_V2
            || t == current::SAU_CLTOCS_LIST_DISK_GROUPS
            || t == current::SAU_CLTOCS_CHART
            || t == current::SAU_CLTOCS_ADMIN_DISK_GROUPS
    )
}

fn write_nonblocking(fd: RawFd, data: &[u8]) -> WriteOutcome {
    use nix::errno::Errno;
    use nix::unistd::write;
    use std::os::fd::BorrowedFd;

    loop {
        let borrowed = unsafe { BorrowedFd::borrow_raw(fd) };
        match write(borrowed, data) {
            Ok(0) => return WriteOutcome::Again,
            Ok(n) => return WriteOutcome::Wrote(n),
            Err(Errno::EAGAIN) => return WriteOutcome::Again,
            Err(Errno::EINTR) => continue,
            Err(e) => return WriteOutcome::Error(e.into()),
        }
    }
}
