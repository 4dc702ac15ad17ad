//! Backing block devices.
//!
//! The ATA engine talks to storage through [`BlockDev`]: a capacity query
//! plus a non-blocking [`submit`](BlockDev::submit) that accepts a
//! [`SectorIo`] and later invokes its completion from the backend's own
//! context. The response frame travels inside the `SectorIo`; its
//! payload region is the I/O buffer, and nothing else may touch the
//! frame until the completion hands it back.

pub mod file;

use crate::frame::Frame;
use thiserror::Error;

pub use file::FileBackend;

/// Storage errors surfaced to completions.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("device has shut down")]
    Gone,
}

/// Result handed to a completion: bytes transferred on success.
pub type IoResult = Result<usize, StorageError>;

/// Transfer direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoDir {
    Read,
    Write,
}

/// Completion callback. Runs in the backend's context; it must confine
/// itself to the owning slot, the busy count, and the outbound queue.
pub type IoDone = Box<dyn FnOnce(Frame, IoResult) + Send>;

/// One sector-granular transfer over a frame's payload region.
pub struct SectorIo {
    pub dir: IoDir,
    pub lba: u64,
    /// Payload offset within the frame.
    pub off: usize,
    /// Transfer length in bytes (sectors * 512).
    pub len: usize,
    pub frame: Frame,
    pub done: IoDone,
}

/// A backing block device.
pub trait BlockDev: Send + Sync {
    /// Capacity in 512-byte sectors, fixed for the device's lifetime.
    fn sectors(&self) -> u64;

    /// Queue a transfer. Must not block; the completion fires later from
    /// the device's own context, exactly once, success or failure.
    fn submit(&self, io: SectorIo);
}
