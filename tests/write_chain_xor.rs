//! Property coverage for the write-chain "XOR on a set" completion protocol
//! in `ConnectionEntry`: a `WriteStatus(Ok)` is emitted for a given
//! `write_id` exactly once, and only once both the local write job and the
//! downstream peer's ack have been observed, regardless of which order they
//! arrive in or how many other `write_id`s are interleaved.

use std::sync::Arc;

use proptest::prelude::*;

use sfs_chunkserver_core::buffer::BufferPool;
use sfs_chunkserver_core::chunk_store::test_support::InMemoryChunkStore;
use sfs_chunkserver_core::chunk_store::ChunkStore;
use sfs_chunkserver_core::connection::{ConnectionEntry, ConnectionState, OutputPacket};
use sfs_chunkserver_core::error::SfsStatus;
use sfs_chunkserver_core::job_pool::{BackgroundJobPool, JobOutcome};

const CHUNK_ID: u64 = 7;

/// A fresh `/dev/null` fd: state-machine tests never touch the socket, but
/// `ConnectionEntry`'s `Drop` impl closes its client fd unconditionally, so
/// the placeholder must be a real, disposable fd rather than a standard
/// stream's.
fn dummy_fd() -> std::os::fd::RawFd {
    use std::os::fd::IntoRawFd;
    std::fs::File::open("/dev/null").unwrap().into_raw_fd()
}

fn new_forwarding_entry() -> ConnectionEntry {
    let store: Arc<dyn ChunkStore> = Arc::new(InMemoryChunkStore::new());
    let job_pool = Arc::new(BackgroundJobPool::new(0, 4, store).unwrap());
    let buffer_pool = Arc::new(BufferPool::new());
    let (tx, _rx) = crossbeam_channel::unbounded();
    let mut entry = ConnectionEntry::new(1, dummy_fd(), buffer_pool, job_pool, tx);
    entry.chunk_id = CHUNK_ID;
    entry.state = ConnectionState::WriteForward;
    entry
}

fn count_ok_write_statuses(entry: &mut ConnectionEntry) -> usize {
    let mut count = 0;
    while let Some(packet) = entry.output_packets.pop_front() {
        let OutputPacket::Owned(bytes) = packet else {
            panic!("write-status replies are always Owned packets");
        };
        // [type:u32][length:u32][chunk_id:u64][write_id:u32][status:u8]
        assert!(bytes.len() >= 8 + 8 + 4 + 1);
        let status = bytes[bytes.len() - 1];
        assert_eq!(status, u8::from(SfsStatus::Ok));
        count += 1;
    }
    count
}

#[derive(Debug, Clone, Copy)]
enum Event {
    Local,
    Downstream,
}

proptest! {
    /// For a single `write_id`, no matter how local/downstream completion
    /// order is interleaved, exactly one `WriteStatus(Ok)` comes out, and
    /// only after both sides have reported in.
    #[test]
    fn exactly_one_ok_status_once_both_sides_report(
        write_id in any::<u32>(),
        downstream_first in any::<bool>(),
    ) {
        let mut entry = new_forwarding_entry();
        entry.write_job_write_id = write_id;

        let events = if downstream_first {
            [Event::Downstream, Event::Local]
        } else {
            [Event::Local, Event::Downstream]
        };

        let mut emitted = 0;
        for (step, event) in events.iter().enumerate() {
            match event {
                Event::Local => {
                    entry.write_job_write_id = write_id;
                    entry.on_write_completed(JobOutcome::Status(SfsStatus::Ok));
                }
                Event::Downstream => {
                    entry.on_downstream_write_status(CHUNK_ID, write_id, SfsStatus::Ok);
                }
            }
            emitted += count_ok_write_statuses(&mut entry);
            if step == 0 {
                prop_assert_eq!(emitted, 0, "must not emit before both sides report");
                prop_assert!(entry.partially_completed_writes.contains(&write_id));
            }
        }

        prop_assert_eq!(emitted, 1, "must emit exactly one Ok status total");
        prop_assert!(!entry.partially_completed_writes.contains(&write_id));
    }

    /// Distinct `write_id`s never interfere with each other's membership
    /// bookkeeping, however their local/downstream events are interleaved.
    #[test]
    fn distinct_write_ids_are_independent(
        ids in prop::collection::hash_set(any::<u32>(), 2..6),
        seed in any::<u64>(),
    ) {
        let mut ids: Vec<u32> = ids.into_iter().collect();
        // deterministic pseudo-shuffle of the interleaving order, no RNG dependency
        ids.sort_by_key(|&id| (id as u64).wrapping_mul(seed.wrapping_add(1)));

        let mut entry = new_forwarding_entry();
        let mut expected_done = std::collections::HashSet::new();

        for &id in &ids {
            entry.write_job_write_id = id;
            entry.on_write_completed(JobOutcome::Status(SfsStatus::Ok));
            prop_assert_eq!(count_ok_write_statuses(&mut entry), 0);
            prop_assert!(entry.partially_completed_writes.contains(&id));
        }

        for &id in ids.iter().rev() {
            entry.on_downstream_write_status(CHUNK_ID, id, SfsStatus::Ok);
            prop_assert_eq!(count_ok_write_statuses(&mut entry), 1);
            expected_done.insert(id);
            for &other in &ids {
                prop_assert_eq!(
                    entry.partially_completed_writes.contains(&other),
                    !expected_done.contains(&other)
                );
            }
        }
    }

    /// A non-Ok local status short-circuits straight to `WriteFinish` without
    /// ever touching the partially-completed-writes set.
    #[test]
    fn local_error_short_circuits_without_touching_membership(
        write_id in any::<u32>(),
    ) {
        let mut entry = new_forwarding_entry();
        entry.write_job_write_id = write_id;
        entry.on_write_completed(JobOutcome::Status(SfsStatus::Io));

        prop_assert!(!entry.partially_completed_writes.contains(&write_id));
        prop_assert_eq!(entry.state, ConnectionState::WriteFinish);
        let mut saw_status = false;
        while let Some(OutputPacket::Owned(bytes)) = entry.output_packets.pop_front() {
            saw_status = true;
            assert_eq!(*bytes.last().unwrap(), u8::from(SfsStatus::Io));
        }
        prop_assert!(saw_status);
    }

    /// A downstream ack for the wrong chunk id is rejected with
    /// `WrongChunkId` and never folds into this connection's write-id set.
    #[test]
    fn downstream_chunk_id_mismatch_is_rejected(
        write_id in any::<u32>(),
        other_chunk_id in any::<u64>(),
    ) {
        prop_assume!(other_chunk_id != CHUNK_ID);
        let mut entry = new_forwarding_entry();
        entry.on_downstream_write_status(other_chunk_id, write_id, SfsStatus::Ok);

        prop_assert!(entry.partially_completed_writes.is_empty());
        prop_assert_eq!(entry.state, ConnectionState::WriteFinish);
        let mut saw_status = false;
        while let Some(OutputPacket::Owned(bytes)) = entry.output_packets.pop_front() {
            saw_status = true;
            assert_eq!(*bytes.last().unwrap(), u8::from(SfsStatus::WrongChunkId));
        }
        prop_assert!(saw_status);
    }
}
