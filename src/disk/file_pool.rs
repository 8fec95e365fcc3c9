use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;

use dashmap::DashMap;
use parking_lot::Mutex;
use tracing::debug;

use super::error::DiskError;

/// Fraction of the discovered file-descriptor soft limit the pool may use.
const FD_LIMIT_FRACTION: f32 = 0.8;

/// An open file shared across in-flight operations.
///
/// Handles are held by `Arc`, so evicting one from the pool never closes it
/// under an in-flight `readv`/`writev`; the last holder drops the
/// descriptor.
pub struct FileHandle {
    file: Mutex<File>,
    last_used: Mutex<Instant>,
    writable: bool,
}

impl FileHandle {
    pub fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<usize, DiskError> {
        let mut file = self.file.lock();
        file.seek(SeekFrom::Start(offset)).map_err(DiskError::read)?;
        let mut total = 0;
        while total < buf.len() {
            match file.read(&mut buf[total..]) {
                Ok(0) => break,
                Ok(n) => total += n,
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(DiskError::read(e)),
            }
        }
        Ok(total)
    }

    pub fn write_at(&self, offset: u64, buf: &[u8]) -> Result<usize, DiskError> {
        let mut file = self.file.lock();
        file.seek(SeekFrom::Start(offset))
            .map_err(DiskError::write)?;
        file.write_all(buf).map_err(DiskError::write)?;
        Ok(buf.len())
    }

    pub fn sync(&self) -> Result<(), DiskError> {
        self.file.lock().sync_all().map_err(DiskError::write)
    }

    fn touch(&self) {
        *self.last_used.lock() = Instant::now();
    }
}

/// Bounded LRU of open file handles, shared across all torrents.
pub struct FilePool {
    handles: DashMap<(u32, usize), Arc<FileHandle>>,
    max_open: AtomicUsize,
}

impl FilePool {
    /// Creates a pool holding at most `max_open` handles, clamped to 80% of
    /// the process file-descriptor soft limit when that is discoverable.
    pub fn new(max_open: usize) -> Arc<Self> {
        let max_open = match fd_soft_limit() {
            Some(limit) => max_open.min((limit as f32 * FD_LIMIT_FRACTION) as usize),
            None => max_open,
        }
        .max(4);

        Arc::new(Self {
            handles: DashMap::new(),
            max_open: AtomicUsize::new(max_open),
        })
    }

    pub fn max_open(&self) -> usize {
        self.max_open.load(Ordering::Relaxed)
    }

    pub fn open_count(&self) -> usize {
        self.handles.len()
    }

    /// Returns a cached handle or opens the file. Opening for write creates
    /// parent directories and upgrades a cached read-only handle.
    pub fn open(
        &self,
        storage: u32,
        file_index: usize,
        path: &Path,
        writable: bool,
    ) -> Result<Arc<FileHandle>, DiskError> {
        let key = (storage, file_index);

        if let Some(handle) = self.handles.get(&key) {
            if handle.writable || !writable {
                handle.touch();
                return Ok(handle.clone());
            }
            drop(handle);
            self.handles.remove(&key);
        }

        let file = if writable {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent).map_err(DiskError::open)?;
            }
            OpenOptions::new()
                .create(true)
                .read(true)
                .write(true)
                .truncate(false)
                .open(path)
                .map_err(DiskError::open)?
        } else {
            File::open(path).map_err(DiskError::open)?
        };

        let handle = Arc::new(FileHandle {
            file: Mutex::new(file),
            last_used: Mutex::new(Instant::now()),
            writable,
        });

        self.handles.insert(key, handle.clone());
        self.evict_over_limit();
        Ok(handle)
    }

    /// Closes every cached handle belonging to a storage, syncing writable
    /// ones.
    pub fn release_storage(&self, storage: u32) {
        let keys: Vec<(u32, usize)> = self
            .handles
            .iter()
            .filter(|e| e.key().0 == storage)
            .map(|e| *e.key())
            .collect();
        for key in keys {
            if let Some((_, handle)) = self.handles.remove(&key) {
                if handle.writable {
                    let _ = handle.sync();
                }
            }
        }
    }

    /// Shrinks (or grows) the pool bound, evicting least-recently-used
    /// handles as needed.
    pub fn resize(&self, max_open: usize) {
        self.max_open.store(max_open.max(4), Ordering::Relaxed);
        self.evict_over_limit();
    }

    fn evict_over_limit(&self) {
        let max = self.max_open.load(Ordering::Relaxed);
        while self.handles.len() > max {
            let oldest = self
                .handles
                .iter()
                .min_by_key(|e| *e.value().last_used.lock())
                .map(|e| *e.key());
            let Some(key) = oldest else { break };
            if let Some((_, handle)) = self.handles.remove(&key) {
                debug!(storage = key.0, file = key.1, "evicting idle file handle");
                if handle.writable {
                    let _ = handle.sync();
                }
            }
        }
    }
}

/// Reads the "Max open files" soft limit from /proc on Linux.
fn fd_soft_limit() -> Option<u64> {
    let limits = std::fs::read_to_string("/proc/self/limits").ok()?;
    let line = limits.lines().find(|l| l.starts_with("Max open files"))?;
    line.split_whitespace().nth(3)?.parse().ok()
}
