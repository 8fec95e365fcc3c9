use thiserror::Error;

/// Errors surfaced per disk job.
///
/// `Clone` so a single backend failure can be attached to every job drained
/// from a piece queue.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DiskError {
    #[error("failed to open file: {0}")]
    FileOpen(String),

    #[error("read failed: {0}")]
    Read(String),

    #[error("write failed: {0}")]
    Write(String),

    #[error("failed to allocate cache piece")]
    AllocCachePiece,

    #[error("failed to rename file: {0}")]
    RenameFile(String),

    #[error("partial disk operation: {done} of {wanted} bytes")]
    Partial { done: usize, wanted: usize },

    #[error("invalid piece {piece} offset {offset}")]
    InvalidRequest { piece: u32, offset: u32 },

    #[error("operation aborted")]
    OperationAborted,

    #[error("block buffer pool exhausted")]
    OutOfMemory,
}

impl DiskError {
    pub(crate) fn read(e: std::io::Error) -> Self {
        DiskError::Read(e.to_string())
    }

    pub(crate) fn write(e: std::io::Error) -> Self {
        DiskError::Write(e.to_string())
    }

    pub(crate) fn open(e: std::io::Error) -> Self {
        DiskError::FileOpen(e.to_string())
    }
}
