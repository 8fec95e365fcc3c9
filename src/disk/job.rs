use std::path::PathBuf;
use std::sync::Arc;

use bytes::Bytes;

use super::backend::Storage;
use super::error::DiskError;
use crate::bencode::Value;

/// What a disk job does. The worker dispatch table is indexed by this.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobAction {
    Read,
    Write,
    Hash,
    MoveStorage,
    ReleaseFiles,
    DeleteFiles,
    CheckFastresume,
    SaveResumeData,
    RenameFile,
    StopTorrent,
    CachePiece,
    FinalizeFile,
    FlushPiece,
    FlushHashed,
    FlushStorage,
    TrimCache,
    FilePriority,
    LoadTorrent,
    ClearPiece,
    Tick,
}

impl JobAction {
    /// Actions that must observe all prior jobs on their storage as
    /// completed before running.
    pub fn is_fenced(self) -> bool {
        matches!(
            self,
            JobAction::MoveStorage
                | JobAction::ReleaseFiles
                | JobAction::DeleteFiles
                | JobAction::CheckFastresume
                | JobAction::SaveResumeData
                | JobAction::RenameFile
                | JobAction::StopTorrent
                | JobAction::FilePriority
                | JobAction::ClearPiece
        )
    }
}

/// Per-job flag bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct JobFlags(u8);

impl JobFlags {
    /// The job raised (or is) a storage fence.
    pub const FENCE: JobFlags = JobFlags(0x01);
    /// Read results must be copied out of the cache rather than shared.
    pub const FORCE_COPY: JobFlags = JobFlags(0x02);
    /// Read populates the volatile LRU, not the regular read ladder.
    pub const VOLATILE_READ: JobFlags = JobFlags(0x04);
    /// The read was served from cache.
    pub const CACHE_HIT: JobFlags = JobFlags(0x08);
    /// The job has been counted against its storage's outstanding total.
    pub const IN_PROGRESS: JobFlags = JobFlags(0x10);

    pub fn contains(self, other: JobFlags) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn insert(&mut self, other: JobFlags) {
        self.0 |= other.0;
    }

    pub fn remove(&mut self, other: JobFlags) {
        self.0 &= !other.0;
    }
}

/// Successful job payloads delivered to the completion handler.
#[derive(Debug)]
pub enum JobResult {
    /// Nothing beyond "it happened".
    Done,
    /// Bytes served by a read.
    Read(Bytes),
    /// SHA-1 of a fully hashed piece.
    Hash([u8; 20]),
    /// Resume data produced by the backend.
    ResumeData(Value),
    /// Decoded torrent file.
    Torrent(Value),
}

pub type JobHandler = Box<dyn FnOnce(Result<JobResult, DiskError>) + Send + 'static>;

/// A unit of disk work.
///
/// A job lives in exactly one place at a time: the generic or hash queue, a
/// storage's fence queue, a cached piece's local queue, or the completion
/// queue. Write jobs park on their piece until the block they carried has
/// been flushed.
pub struct Job {
    pub action: JobAction,
    pub storage: Option<Arc<Storage>>,
    pub piece: u32,
    pub offset: u32,
    pub length: u32,
    /// Write payload (block-sized or less).
    pub buffer: Option<Bytes>,
    /// Path argument for move_storage / load_torrent.
    pub path: Option<PathBuf>,
    /// New name for rename_file.
    pub name: Option<String>,
    /// File index for rename_file / finalize_file.
    pub file: usize,
    /// Priorities for set_file_priority.
    pub priorities: Option<Vec<u8>>,
    /// Resume data input for check_fastresume.
    pub resume: Option<Value>,
    pub flags: JobFlags,
    pub error: Option<DiskError>,
    /// Payload produced by the worker, delivered on completion.
    pub result: JobResult,
    handler: Option<JobHandler>,
}

impl Job {
    pub fn new(action: JobAction, storage: Option<Arc<Storage>>) -> Self {
        Self {
            action,
            storage,
            piece: 0,
            offset: 0,
            length: 0,
            buffer: None,
            path: None,
            name: None,
            file: 0,
            priorities: None,
            resume: None,
            flags: JobFlags::default(),
            error: None,
            result: JobResult::Done,
            handler: None,
        }
    }

    pub fn with_handler(mut self, handler: JobHandler) -> Self {
        self.handler = Some(handler);
        self
    }

    /// Block slot this write job occupies within its piece.
    pub fn block_index(&self) -> usize {
        (self.offset as usize) / super::BLOCK_SIZE
    }

    /// Invokes the completion handler with the recorded payload, or with
    /// the job's error if one is set.
    pub fn deliver(mut self) {
        if let Some(handler) = self.handler.take() {
            let result = std::mem::replace(&mut self.result, JobResult::Done);
            match self.error.take() {
                Some(e) => handler(Err(e)),
                None => handler(Ok(result)),
            }
        }
    }
}

impl std::fmt::Debug for Job {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Job")
            .field("action", &self.action)
            .field("piece", &self.piece)
            .field("offset", &self.offset)
            .field("length", &self.length)
            .field("error", &self.error)
            .finish()
    }
}
