use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

use parking_lot::RwLock;

use super::error::DiskError;
use super::file_pool::FilePool;
use super::StorageBackend;
use crate::bencode::Value;

/// One file of a torrent, positioned within the torrent's byte space.
#[derive(Debug, Clone)]
pub struct FileEntry {
    /// Path relative to the storage root.
    pub path: PathBuf,
    pub length: u64,
    /// Byte offset of this file within the torrent.
    pub offset: u64,
}

impl FileEntry {
    pub fn new(path: PathBuf, length: u64, offset: u64) -> Self {
        Self {
            path,
            length,
            offset,
        }
    }
}

/// A slice of a piece mapped onto one file.
#[derive(Debug, Clone, Copy)]
struct FileSpan {
    file_index: usize,
    file_offset: u64,
    length: u64,
}

fn validate_file_path(path: &Path) -> Result<(), DiskError> {
    for component in path.components() {
        match component {
            Component::ParentDir | Component::RootDir | Component::Prefix(_) => {
                return Err(DiskError::FileOpen(format!(
                    "path escapes storage root: {}",
                    path.display()
                )));
            }
            _ => {}
        }
    }
    Ok(())
}

/// File-backed [`StorageBackend`]: pieces are laid out contiguously across
/// a flat file set, and all handles come from a shared [`FilePool`].
pub struct FileStorage {
    storage_id: u32,
    root: RwLock<PathBuf>,
    files: RwLock<Vec<FileEntry>>,
    piece_length: u32,
    total_length: u64,
    priorities: RwLock<Vec<u8>>,
    pool: Arc<FilePool>,
}

impl FileStorage {
    pub fn new(
        storage_id: u32,
        root: PathBuf,
        files: Vec<FileEntry>,
        piece_length: u32,
        pool: Arc<FilePool>,
    ) -> Result<Self, DiskError> {
        for file in &files {
            validate_file_path(&file.path)?;
        }
        let total_length = files.iter().map(|f| f.length).sum();

        Ok(Self {
            storage_id,
            root: RwLock::new(root),
            files: RwLock::new(files),
            piece_length,
            total_length,
            priorities: RwLock::new(Vec::new()),
            pool,
        })
    }

    pub fn total_length(&self) -> u64 {
        self.total_length
    }

    fn absolute_offset(&self, piece: u32, offset: u32) -> u64 {
        piece as u64 * self.piece_length as u64 + offset as u64
    }

    /// Maps `[start, start+length)` of the torrent byte space onto file
    /// regions.
    fn spans(&self, start: u64, length: u64) -> Result<Vec<FileSpan>, DiskError> {
        if start + length > self.total_length {
            return Err(DiskError::InvalidRequest {
                piece: (start / self.piece_length as u64) as u32,
                offset: (start % self.piece_length as u64) as u32,
            });
        }

        let files = self.files.read();
        let mut spans = Vec::new();
        let mut remaining = length;
        let mut cursor = start;

        for (index, file) in files.iter().enumerate() {
            if remaining == 0 {
                break;
            }
            let file_end = file.offset + file.length;
            if cursor >= file.offset && cursor < file_end {
                let take = remaining.min(file_end - cursor);
                spans.push(FileSpan {
                    file_index: index,
                    file_offset: cursor - file.offset,
                    length: take,
                });
                cursor += take;
                remaining -= take;
            }
        }

        Ok(spans)
    }

    fn file_path(&self, index: usize) -> PathBuf {
        self.root.read().join(&self.files.read()[index].path)
    }
}

impl StorageBackend for FileStorage {
    fn num_pieces(&self) -> u32 {
        self.total_length.div_ceil(self.piece_length as u64) as u32
    }

    fn piece_size(&self, piece: u32) -> u32 {
        let start = piece as u64 * self.piece_length as u64;
        let left = self.total_length.saturating_sub(start);
        left.min(self.piece_length as u64) as u32
    }

    fn readv(&self, piece: u32, offset: u32, iov: &mut [&mut [u8]]) -> Result<usize, DiskError> {
        let total: usize = iov.iter().map(|b| b.len()).sum();
        let spans = self.spans(self.absolute_offset(piece, offset), total as u64)?;

        let mut read = 0usize;
        let mut span_iter = spans.into_iter();
        let mut span = match span_iter.next() {
            Some(s) => s,
            None => return Ok(0),
        };
        let mut span_pos = 0u64;

        for buf in iov.iter_mut() {
            let mut buf_pos = 0usize;
            while buf_pos < buf.len() {
                if span_pos == span.length {
                    span = match span_iter.next() {
                        Some(s) => s,
                        None => return Ok(read),
                    };
                    span_pos = 0;
                }
                let want = (buf.len() - buf_pos).min((span.length - span_pos) as usize);
                let handle = self.pool.open(
                    self.storage_id,
                    span.file_index,
                    &self.file_path(span.file_index),
                    false,
                )?;
                let n = handle.read_at(
                    span.file_offset + span_pos,
                    &mut buf[buf_pos..buf_pos + want],
                )?;
                read += n;
                buf_pos += n;
                span_pos += n as u64;
                if n < want {
                    // short read (sparse tail); zero-fill the rest
                    for b in buf[buf_pos..].iter_mut() {
                        *b = 0;
                    }
                    read += buf.len() - buf_pos;
                    span_pos += (buf.len() - buf_pos) as u64;
                    buf_pos = buf.len();
                }
            }
        }

        Ok(read)
    }

    fn writev(&self, piece: u32, offset: u32, iov: &[&[u8]]) -> Result<usize, DiskError> {
        let total: usize = iov.iter().map(|b| b.len()).sum();
        let spans = self.spans(self.absolute_offset(piece, offset), total as u64)?;

        let mut written = 0usize;
        let mut span_iter = spans.into_iter();
        let mut span = match span_iter.next() {
            Some(s) => s,
            None => return Ok(0),
        };
        let mut span_pos = 0u64;

        for buf in iov.iter() {
            let mut buf_pos = 0usize;
            while buf_pos < buf.len() {
                if span_pos == span.length {
                    span = span_iter.next().ok_or(DiskError::Partial {
                        done: written,
                        wanted: total,
                    })?;
                    span_pos = 0;
                }
                let want = (buf.len() - buf_pos).min((span.length - span_pos) as usize);
                let handle = self.pool.open(
                    self.storage_id,
                    span.file_index,
                    &self.file_path(span.file_index),
                    true,
                )?;
                let n =
                    handle.write_at(span.file_offset + span_pos, &buf[buf_pos..buf_pos + want])?;
                written += n;
                buf_pos += n;
                span_pos += n as u64;
            }
        }

        Ok(written)
    }

    fn move_storage(&self, new_root: &Path) -> Result<(), DiskError> {
        self.pool.release_storage(self.storage_id);
        std::fs::create_dir_all(new_root).map_err(DiskError::open)?;

        let old_root = self.root.read().clone();
        for (index, file) in self.files.read().iter().enumerate() {
            let from = old_root.join(&file.path);
            if !from.exists() {
                continue;
            }
            let to = new_root.join(&file.path);
            if let Some(parent) = to.parent() {
                std::fs::create_dir_all(parent).map_err(DiskError::open)?;
            }
            std::fs::rename(&from, &to).map_err(|e| {
                DiskError::Write(format!("move file {}: {}", index, e))
            })?;
        }

        *self.root.write() = new_root.to_path_buf();
        Ok(())
    }

    fn release_files(&self) -> Result<(), DiskError> {
        self.pool.release_storage(self.storage_id);
        Ok(())
    }

    fn delete_files(&self) -> Result<(), DiskError> {
        self.pool.release_storage(self.storage_id);
        for file in self.files.read().iter() {
            let path = self.root.read().join(&file.path);
            match std::fs::remove_file(&path) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(DiskError::Write(e.to_string())),
            }
        }
        Ok(())
    }

    fn rename_file(&self, file: usize, new_name: &str) -> Result<(), DiskError> {
        let new_path = PathBuf::from(new_name);
        validate_file_path(&new_path).map_err(|_| {
            DiskError::RenameFile(format!("invalid target name: {}", new_name))
        })?;

        let mut files = self.files.write();
        let entry = files
            .get_mut(file)
            .ok_or_else(|| DiskError::RenameFile(format!("no such file index: {}", file)))?;

        let root = self.root.read();
        let from = root.join(&entry.path);
        let to = root.join(&new_path);
        if from.exists() {
            self.pool.release_storage(self.storage_id);
            if let Some(parent) = to.parent() {
                std::fs::create_dir_all(parent).map_err(DiskError::open)?;
            }
            std::fs::rename(&from, &to).map_err(|e| DiskError::RenameFile(e.to_string()))?;
        }
        entry.path = new_path;
        Ok(())
    }

    fn set_file_priority(&self, priorities: &[u8]) -> Result<(), DiskError> {
        *self.priorities.write() = priorities.to_vec();
        Ok(())
    }

    fn write_resume_data(&self) -> Result<Value, DiskError> {
        let files = self.files.read();
        let sizes: Vec<Value> = files
            .iter()
            .map(|f| {
                let on_disk = std::fs::metadata(self.root.read().join(&f.path))
                    .map(|m| m.len())
                    .unwrap_or(0);
                Value::Integer(on_disk as i64)
            })
            .collect();

        let mut resume = Value::dict();
        resume.insert(b"file-sizes", Value::List(sizes));
        resume.insert(b"piece-length", Value::Integer(self.piece_length as i64));
        Ok(resume)
    }

    fn check_fastresume(&self, resume: Option<&Value>) -> Result<(), DiskError> {
        let Some(resume) = resume else { return Ok(()) };

        if let Some(expected) = resume.get_int(b"piece-length") {
            if expected != self.piece_length as i64 {
                return Err(DiskError::FileOpen("piece length mismatch".into()));
            }
        }

        if let Some(sizes) = resume.get(b"file-sizes").and_then(|v| v.as_list()) {
            let files = self.files.read();
            for (entry, size) in files.iter().zip(sizes) {
                let on_disk = std::fs::metadata(self.root.read().join(&entry.path))
                    .map(|m| m.len())
                    .unwrap_or(0);
                if size.as_integer() != Some(on_disk as i64) {
                    return Err(DiskError::FileOpen(format!(
                        "file size mismatch: {}",
                        entry.path.display()
                    )));
                }
            }
        }
        Ok(())
    }

    fn finalize_file(&self, file: usize) -> Result<(), DiskError> {
        let path = self.file_path(file);
        if path.exists() {
            let handle = self.pool.open(self.storage_id, file, &path, true)?;
            handle.sync()?;
        }
        Ok(())
    }
}
