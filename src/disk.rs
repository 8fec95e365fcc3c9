//! Disk I/O subsystem: a multi-threaded, write-back block cache.
//!
//! All piece traffic for every torrent flows through [`DiskIo`]. Writes
//! coalesce in the [block cache](self) until enough contiguous blocks have
//! been hashed (or they expire), then hit the [`StorageBackend`] as large
//! vectored writes; reads are served from cache when possible and populate
//! a 2Q read ladder when not.
//!
//! # Architecture
//!
//! - [`DiskIo`] - worker thread pool, job queues, flush algorithms
//! - [`Storage`] / [`StorageBackend`] - per-torrent file-set I/O (the
//!   backend is host-provided; [`FileStorage`] is a ready-made flat-file
//!   implementation)
//! - [`BufferPool`] - 16 KiB block buffer accounting with back-pressure
//! - [`FilePool`] - bounded LRU of open file handles shared across torrents
//!
//! # Ordering guarantees
//!
//! Jobs against the same piece complete in submission order. A fenced job
//! (move, delete, resume-data and friends) observes every prior write to
//! its storage as persisted. Completion handlers run on the host thread,
//! in FIFO order of completion, from [`DiskIo::drain_completed`].
//!
//! # Zero-copy reads
//!
//! Read results are `bytes::Bytes` slices of the cached block: handing one
//! to the network layer pins the underlying buffer, and dropping it
//! reclaims the reference. No explicit reclaim call is needed.

mod backend;
mod buffer;
mod cache;
mod error;
mod fence;
mod file_pool;
mod file_storage;
mod job;
mod pool;
mod settings;

/// Fixed block size: the unit of caching and of peer-wire transfers.
pub const BLOCK_SIZE: usize = 16 * 1024;

pub use backend::{Storage, StorageBackend};
pub use buffer::{BufferPool, DiskObserver};
pub use error::DiskError;
pub use file_pool::{FileHandle, FilePool};
pub use file_storage::{FileEntry, FileStorage};
pub use job::{JobAction, JobFlags, JobHandler, JobResult};
pub use pool::{DiskIo, DiskStats};
pub use settings::DiskSettings;

#[cfg(test)]
mod tests;
