//! Wire status taxonomy and internal error type.
//!
//! `SfsStatus` is the fixed vocabulary of statuses this core puts on the
//! wire in `ReadStatus`/`WriteStatus` packets (§7 of the protocol spec).
//! `CoreError` is for failures that never reach the wire directly -
//! configuration parsing, job-pool setup, socket plumbing - and is the
//! `Err` side of every fallible function in this crate that isn't itself
//! a packet handler.

use std::fmt;

use num_enum::{IntoPrimitive, TryFromPrimitive};
use thiserror::Error;

/// Status code carried by `ReadStatus`/`WriteStatus` packets.
///
/// `Ok` is always `0`; the remaining discriminants are an internal
/// convention of this core (no collaborator depends on their literal
/// values, only on `Ok == 0` and on the taxonomy named in the protocol
/// spec).
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, IntoPrimitive, TryFromPrimitive)]
pub enum SfsStatus {
    Ok = 0,
    WrongSize = 1,
    WrongOffset = 2,
    WrongChunkId = 3,
    CantConnect = 4,
    Disconnected = 5,
    NotDone = 6,
    Io = 7,
    Timeout = 8,
}

impl SfsStatus {
    /// True for the single success value.
    pub fn is_ok(self) -> bool {
        self == SfsStatus::Ok
    }
}

impl fmt::Display for SfsStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Internal failure that never crosses the wire as a status byte: setup,
/// configuration, or plumbing errors the caller of this library should
/// surface before the affected component ever starts serving connections.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error("invalid HDD config line {line:?}: {reason}")]
    InvalidHddLine { line: String, reason: &'static str },

    #[error("invalid size literal {literal:?}: {reason}")]
    InvalidSize { literal: String, reason: &'static str },

    #[error("failed to spawn {count} worker threads for {pool}: {source}")]
    ThreadSpawn {
        pool: &'static str,
        count: usize,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to create self-pipe / eventfd for {0}")]
    WakeupChannel(#[source] std::io::Error),

    #[error("background job queue is full (capacity {capacity})")]
    JobQueueFull { capacity: usize },

    #[error("failed to lock folder directory {path:?}: {source}")]
    LockFile {
        path: std::path::PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Io(#[from] std::io::Error),
}
