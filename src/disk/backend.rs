use std::path::Path;
use std::sync::Arc;

use parking_lot::Mutex;

use super::error::DiskError;
use super::fence::{FenceRelease, JobFence};
use super::job::Job;
use crate::bencode::Value;

/// Per-torrent file-set I/O, implemented by the host.
///
/// The disk subsystem never touches files directly: all piece data flows
/// through `readv`/`writev`, and the destructive operations are invoked only
/// behind a storage fence, so an implementation may assume no piece I/O is
/// in flight when they run.
///
/// A vectored call addresses `(piece, offset)` and fills (or drains) the
/// buffers in order; the return value is the total byte count moved.
pub trait StorageBackend: Send + Sync {
    fn num_pieces(&self) -> u32;

    /// Size of the given piece. All pieces share one size except possibly
    /// the last.
    fn piece_size(&self, piece: u32) -> u32;

    fn readv(&self, piece: u32, offset: u32, iov: &mut [&mut [u8]]) -> Result<usize, DiskError>;

    fn writev(&self, piece: u32, offset: u32, iov: &[&[u8]]) -> Result<usize, DiskError>;

    fn move_storage(&self, _new_root: &Path) -> Result<(), DiskError> {
        Ok(())
    }

    fn release_files(&self) -> Result<(), DiskError> {
        Ok(())
    }

    fn delete_files(&self) -> Result<(), DiskError> {
        Ok(())
    }

    fn rename_file(&self, _file: usize, _new_name: &str) -> Result<(), DiskError> {
        Ok(())
    }

    fn set_file_priority(&self, _priorities: &[u8]) -> Result<(), DiskError> {
        Ok(())
    }

    fn write_resume_data(&self) -> Result<Value, DiskError> {
        Ok(Value::dict())
    }

    fn check_fastresume(&self, _resume: Option<&Value>) -> Result<(), DiskError> {
        Ok(())
    }

    fn finalize_file(&self, _file: usize) -> Result<(), DiskError> {
        Ok(())
    }

    /// Periodic maintenance. Returning `true` requests further ticks.
    fn tick(&self) -> Result<bool, DiskError> {
        Ok(false)
    }
}

/// A registered torrent storage: a backend plus the engine-side state that
/// rides along with it (stable id, fence).
pub struct Storage {
    id: u32,
    backend: Box<dyn StorageBackend>,
    fence: Mutex<JobFence>,
}

impl Storage {
    pub fn new(id: u32, backend: Box<dyn StorageBackend>) -> Arc<Self> {
        Arc::new(Self {
            id,
            backend,
            fence: Mutex::new(JobFence::default()),
        })
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn backend(&self) -> &dyn StorageBackend {
        self.backend.as_ref()
    }

    /// Queues the job behind the storage fence if one is up. Returns the
    /// job back when it may run now (after counting it as outstanding).
    pub(crate) fn check_fence(&self, job: Job) -> Option<Job> {
        self.fence.lock().check(job)
    }

    pub(crate) fn raise_fence(&self, job: Job) -> super::fence::FenceAction {
        self.fence.lock().raise(job)
    }

    /// Called when a counted job finishes. Returns jobs to resubmit and,
    /// possibly, a fence job that is now ready to run.
    pub(crate) fn fence_complete(&self, was_fence: bool) -> FenceRelease {
        self.fence.lock().complete(was_fence)
    }

    /// Counts a job that bypasses the fence (the flush issued on its
    /// behalf).
    pub(crate) fn admit_unfenced(&self, job: Job) -> Job {
        self.fence.lock().admit_unfenced(job)
    }

    pub(crate) fn outstanding_jobs(&self) -> u32 {
        self.fence.lock().outstanding()
    }

    /// Drains every job parked behind the fence, for shutdown/cancel paths.
    pub(crate) fn take_blocked(&self) -> Vec<Job> {
        self.fence.lock().take_blocked()
    }
}

impl std::fmt::Debug for Storage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Storage").field("id", &self.id).finish()
    }
}
