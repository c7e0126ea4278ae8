//! Property coverage for the restartable multi-block read stepper's
//! in-flight bound: at any instant a `Read`-state connection has at most one
//! job outstanding and at most one buffered packet awaiting flush, and the
//! two completions (job done, flush done) may arrive in either order
//! without the counter tracking them ever underflowing or stalling.

use std::sync::Arc;

use proptest::prelude::*;

use sfs_chunkserver_core::buffer::{BufferPool, OutputBuffer};
use sfs_chunkserver_core::chunk_store::test_support::InMemoryChunkStore;
use sfs_chunkserver_core::chunk_store::ChunkStore;
use sfs_chunkserver_core::connection::{ConnectionEntry, ConnectionState};
use sfs_chunkserver_core::constants::SFSBLOCKSIZE;
use sfs_chunkserver_core::error::SfsStatus;
use sfs_chunkserver_core::job_pool::{BackgroundJobPool, JobOutcome};
use sfs_chunkserver_core::packet::encode_packet;
use sfs_chunkserver_core::serializer::packet_type::current::SAU_CLTOCS_READ;

const STANDARD_TAG: [u8; 3] = [0, 0, 0];

fn read_request_payload(chunk_id: u64, version: u32, offset: u32, size: u32) -> Vec<u8> {
    let mut out = Vec::new();
    out.extend_from_slice(&chunk_id.to_be_bytes());
    out.extend_from_slice(&version.to_be_bytes());
    out.extend_from_slice(&STANDARD_TAG);
    out.extend_from_slice(&offset.to_be_bytes());
    out.extend_from_slice(&size.to_be_bytes());
    out
}

/// A fresh `/dev/null` fd: state-machine tests never touch the socket, but
/// `ConnectionEntry`'s `Drop` impl closes its client fd unconditionally, so
/// the placeholder must be a real, disposable fd rather than a standard
/// stream's.
fn dummy_fd() -> std::os::fd::RawFd {
    use std::os::fd::IntoRawFd;
    std::fs::File::open("/dev/null").unwrap().into_raw_fd()
}

fn new_entry() -> ConnectionEntry {
    let store: Arc<dyn ChunkStore> = Arc::new(InMemoryChunkStore::new());
    let job_pool = Arc::new(BackgroundJobPool::new(0, 64, store).unwrap());
    let buffer_pool = Arc::new(BufferPool::new());
    let (tx, _rx) = crossbeam_channel::unbounded();
    ConnectionEntry::new(1, dummy_fd(), buffer_pool, job_pool, tx)
}

#[derive(Debug, Clone, Copy)]
enum Event {
    JobDone,
    FlushDone,
}

proptest! {
    /// For a read spanning `block_count` whole blocks, every round's job
    /// completion and flush completion may arrive in either order, but the
    /// stepper always ends up back in `Idle` after exactly `block_count`
    /// buffered packets have been queued and the final status is `Ok`.
    #[test]
    fn multi_block_read_drains_regardless_of_completion_order(
        block_count in 1usize..6,
        job_first in prop::collection::vec(any::<bool>(), 1..6),
    ) {
        let mut entry = new_entry();
        let block = SFSBLOCKSIZE as u32;
        let chunk_id = 123u64;

        let req = read_request_payload(chunk_id, 1, 0, block * block_count as u32);
        entry.on_client_bytes(&encode_packet(SAU_CLTOCS_READ, &req));

        prop_assert_eq!(entry.state, ConnectionState::Read);
        prop_assert!(entry.read_job_id != 0);

        let mut queued_packets = 0usize;
        for round in 0..block_count {
            prop_assert_eq!(entry.state, ConnectionState::Read);
            prop_assert!(entry.read_job_id != 0, "each round must have a job outstanding");

            let order = job_first.get(round % job_first.len()).copied().unwrap_or(true);
            let fresh = OutputBuffer::new(128);

            if order {
                entry.on_read_completed(JobOutcome::Read { status: SfsStatus::Ok, buffer: fresh });
                entry.on_send_finished();
            } else {
                entry.on_send_finished();
                entry.on_read_completed(JobOutcome::Read { status: SfsStatus::Ok, buffer: fresh });
            }
            queued_packets += 1;
        }

        prop_assert_eq!(entry.state, ConnectionState::Idle);
        prop_assert_eq!(entry.output_packets.len(), queued_packets);
    }
}
