//! Exclusive lock-file guarding a folder's data directory against double
//! mounting by a second chunkserver process (§3).

use std::fs::{File, OpenOptions};
use std::os::fd::{AsFd, AsRawFd, RawFd};
use std::path::Path;

use nix::fcntl::{flock, FlockArg};
use nix::sys::stat::fstat;

use crate::error::CoreError;

/// Holds the open fd of a folder's `.lock` file for as long as the folder
/// is in use, plus the `(device, inode)` pair identifying the underlying
/// storage so two configured folders that resolve to the same device can
/// be told apart from two that merely share a path prefix.
pub struct LockFile {
    file: File,
    device: u64,
    inode: u64,
}

impl LockFile {
    /// Opens (creating if necessary) `<dir>/.lock` and takes a non-blocking
    /// exclusive `flock`. Fails if another process already holds it, which
    /// is exactly the double-mount case this guards against.
    pub fn acquire(dir: &Path) -> Result<Self, CoreError> {
        let path = dir.join(".lock");
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .open(&path)
            .map_err(|source| CoreError::LockFile {
                path: path.clone(),
                source,
            })?;

        flock(file.as_fd(), FlockArg::LockExclusiveNonblock).map_err(|errno| {
            CoreError::LockFile {
                path: path.clone(),
                source: std::io::Error::from(errno),
            }
        })?;

        let st = fstat(file.as_fd()).map_err(|errno| CoreError::LockFile {
            path,
            source: std::io::Error::from(errno),
        })?;

        Ok(LockFile {
            file,
            device: st.st_dev,
            inode: st.st_ino,
        })
    }

    pub fn fd(&self) -> RawFd {
        self.file.as_raw_fd()
    }

    /// True if `other` sits on the same backing device as this lock.
    pub fn is_in_the_same_device(&self, device: u64) -> bool {
        self.device == device
    }

    /// True if `other` is the very same file (same device and inode) —
    /// i.e. two configured folders that both resolve to one directory.
    pub fn is_the_same_file(&self, device: u64, inode: u64) -> bool {
        self.device == device && self.inode == inode
    }

    pub fn device(&self) -> u64 {
        self.device
    }

    pub fn inode(&self) -> u64 {
        self.inode
    }
}

// `flock` is released automatically when `file`'s fd is closed on drop.
