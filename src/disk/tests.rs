use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use parking_lot::Mutex;
use sha1::{Digest, Sha1};

use super::*;

#[derive(Debug, Clone, PartialEq)]
enum Event {
    Write { piece: u32, offset: u32, iovs: usize },
    ReleaseFiles,
    DeleteFiles,
}

/// In-memory backend recording every writev span and the operation order.
struct MockBackend {
    piece_length: u32,
    total: u64,
    data: Mutex<Vec<u8>>,
    events: Mutex<Vec<Event>>,
    write_payloads: Mutex<Vec<Vec<u8>>>,
}

impl MockBackend {
    fn new(piece_length: u32, num_pieces: u32) -> Arc<Self> {
        let total = piece_length as u64 * num_pieces as u64;
        Arc::new(Self {
            piece_length,
            total,
            data: Mutex::new(vec![0u8; total as usize]),
            events: Mutex::new(Vec::new()),
            write_payloads: Mutex::new(Vec::new()),
        })
    }

    fn events(&self) -> Vec<Event> {
        self.events.lock().clone()
    }

    fn write_calls(&self) -> usize {
        self.write_payloads.lock().len()
    }

    fn payload(&self, call: usize) -> Vec<u8> {
        self.write_payloads.lock()[call].clone()
    }

    fn contents(&self, start: usize, len: usize) -> Vec<u8> {
        self.data.lock()[start..start + len].to_vec()
    }
}

impl StorageBackend for MockBackend {
    fn num_pieces(&self) -> u32 {
        self.total.div_ceil(self.piece_length as u64) as u32
    }

    fn piece_size(&self, piece: u32) -> u32 {
        let start = piece as u64 * self.piece_length as u64;
        (self.total - start).min(self.piece_length as u64) as u32
    }

    fn readv(&self, piece: u32, offset: u32, iov: &mut [&mut [u8]]) -> Result<usize, DiskError> {
        let mut pos = piece as usize * self.piece_length as usize + offset as usize;
        let data = self.data.lock();
        let mut read = 0;
        for buf in iov.iter_mut() {
            buf.copy_from_slice(&data[pos..pos + buf.len()]);
            pos += buf.len();
            read += buf.len();
        }
        Ok(read)
    }

    fn writev(&self, piece: u32, offset: u32, iov: &[&[u8]]) -> Result<usize, DiskError> {
        let mut pos = piece as usize * self.piece_length as usize + offset as usize;
        let mut payload = Vec::new();
        {
            let mut data = self.data.lock();
            for buf in iov {
                data[pos..pos + buf.len()].copy_from_slice(buf);
                payload.extend_from_slice(buf);
                pos += buf.len();
            }
        }
        self.events.lock().push(Event::Write {
            piece,
            offset,
            iovs: iov.len(),
        });
        let written = payload.len();
        self.write_payloads.lock().push(payload);
        Ok(written)
    }

    fn release_files(&self) -> Result<(), DiskError> {
        self.events.lock().push(Event::ReleaseFiles);
        Ok(())
    }

    fn delete_files(&self) -> Result<(), DiskError> {
        self.events.lock().push(Event::DeleteFiles);
        Ok(())
    }
}

// tests keep a handle on the backend, so the storage gets a shared clone
impl StorageBackend for Arc<MockBackend> {
    fn num_pieces(&self) -> u32 {
        self.as_ref().num_pieces()
    }

    fn piece_size(&self, piece: u32) -> u32 {
        self.as_ref().piece_size(piece)
    }

    fn readv(&self, piece: u32, offset: u32, iov: &mut [&mut [u8]]) -> Result<usize, DiskError> {
        self.as_ref().readv(piece, offset, iov)
    }

    fn writev(&self, piece: u32, offset: u32, iov: &[&[u8]]) -> Result<usize, DiskError> {
        self.as_ref().writev(piece, offset, iov)
    }

    fn release_files(&self) -> Result<(), DiskError> {
        self.as_ref().release_files()
    }

    fn delete_files(&self) -> Result<(), DiskError> {
        self.as_ref().delete_files()
    }
}

fn block(fill: u8) -> Bytes {
    Bytes::from(vec![fill; BLOCK_SIZE])
}

struct Completions {
    ok: AtomicUsize,
    aborted: AtomicUsize,
    failed: AtomicUsize,
}

impl Completions {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            ok: AtomicUsize::new(0),
            aborted: AtomicUsize::new(0),
            failed: AtomicUsize::new(0),
        })
    }

    fn handler(self: &Arc<Self>) -> JobHandler {
        let this = self.clone();
        Box::new(move |result| match result {
            Ok(_) => {
                this.ok.fetch_add(1, Ordering::SeqCst);
            }
            Err(DiskError::OperationAborted) => {
                this.aborted.fetch_add(1, Ordering::SeqCst);
            }
            Err(_) => {
                this.failed.fetch_add(1, Ordering::SeqCst);
            }
        })
    }

    fn total(&self) -> usize {
        self.ok.load(Ordering::SeqCst)
            + self.aborted.load(Ordering::SeqCst)
            + self.failed.load(Ordering::SeqCst)
    }
}

/// Drains completions until `done` holds or five seconds pass.
fn wait_until(io: &DiskIo, mut done: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        io.drain_completed();
        if done() {
            return;
        }
        assert!(Instant::now() < deadline, "timed out waiting for disk jobs");
        std::thread::sleep(Duration::from_millis(5));
    }
}

fn coalescing_settings() -> DiskSettings {
    DiskSettings {
        cache_size: 256,
        write_cache_line_size: 4,
        cache_expiry: Duration::from_secs(3600),
        ..DiskSettings::default()
    }
}

#[test]
fn test_coalesced_flush_single_writev() {
    // scenario: 4 sequential writes to piece 0 come out as one writev
    let io = DiskIo::new(coalescing_settings());
    let backend = MockBackend::new(4 * BLOCK_SIZE as u32, 2);
    let storage = io.new_storage(Box::new(backend.clone()));

    let done = Completions::new();
    for i in 0..4u8 {
        io.async_write(
            &storage,
            0,
            i as u32 * BLOCK_SIZE as u32,
            block(i),
            done.handler(),
        );
    }

    wait_until(&io, || done.ok.load(Ordering::SeqCst) == 4);

    assert_eq!(backend.write_calls(), 1);
    assert_eq!(
        backend.events(),
        vec![Event::Write {
            piece: 0,
            offset: 0,
            iovs: 4
        }]
    );
    let mut expected = Vec::new();
    for i in 0..4u8 {
        expected.extend_from_slice(&vec![i; BLOCK_SIZE]);
    }
    assert_eq!(backend.payload(0), expected);
}

#[test]
fn test_stripe_flush_spans_pieces() {
    // write_cache_line_size covers two whole pieces and partial writes are
    // off: filling pieces 0 and 1 produces one writev across both
    let settings = DiskSettings {
        cache_size: 256,
        write_cache_line_size: 4,
        allow_partial_writes: false,
        cache_expiry: Duration::from_secs(3600),
        ..DiskSettings::default()
    };
    let io = DiskIo::new(settings);
    let backend = MockBackend::new(2 * BLOCK_SIZE as u32, 4);
    let storage = io.new_storage(Box::new(backend.clone()));

    let done = Completions::new();
    for (piece, blk, fill) in [(0, 0, 1u8), (0, 1, 2), (1, 0, 3), (1, 1, 4)] {
        io.async_write(
            &storage,
            piece,
            blk * BLOCK_SIZE as u32,
            block(fill),
            done.handler(),
        );
    }

    wait_until(&io, || done.ok.load(Ordering::SeqCst) == 4);

    assert_eq!(backend.write_calls(), 1);
    assert_eq!(
        backend.events(),
        vec![Event::Write {
            piece: 0,
            offset: 0,
            iovs: 4
        }]
    );
    let mut expected = Vec::new();
    for fill in 1..=4u8 {
        expected.extend_from_slice(&vec![fill; BLOCK_SIZE]);
    }
    assert_eq!(backend.payload(0), expected);
}

#[test]
fn test_fence_after_writes_observes_them_persisted() {
    // release_files must run after every prior write reached the backend
    let io = DiskIo::new(coalescing_settings());
    let backend = MockBackend::new(4 * BLOCK_SIZE as u32, 4);
    let storage = io.new_storage(Box::new(backend.clone()));

    let writes = Completions::new();
    for piece in 0..2u32 {
        for blk in 0..4u32 {
            io.async_write(
                &storage,
                piece,
                blk * BLOCK_SIZE as u32,
                block((piece * 4 + blk) as u8),
                writes.handler(),
            );
        }
    }
    let released = Completions::new();
    io.async_release_files(&storage, released.handler());

    wait_until(&io, || released.ok.load(Ordering::SeqCst) == 1);
    assert_eq!(writes.ok.load(Ordering::SeqCst), 8);

    let events = backend.events();
    let release_at = events
        .iter()
        .position(|e| *e == Event::ReleaseFiles)
        .expect("release_files ran");
    let blocks_before: usize = events[..release_at]
        .iter()
        .map(|e| match e {
            Event::Write { iovs, .. } => *iovs,
            _ => 0,
        })
        .sum();
    assert_eq!(blocks_before, 8, "all writes persisted before the fence");
}

#[test]
fn test_read_your_writes_before_flush() {
    let io = DiskIo::new(coalescing_settings());
    let backend = MockBackend::new(4 * BLOCK_SIZE as u32, 2);
    let storage = io.new_storage(Box::new(backend.clone()));

    let writes = Completions::new();
    io.async_write(&storage, 1, 0, block(0xAB), writes.handler());

    // nothing flushed yet: the read must still see the bytes
    let read_back: Arc<Mutex<Option<Bytes>>> = Arc::new(Mutex::new(None));
    let slot = read_back.clone();
    io.async_read(
        &storage,
        1,
        0,
        BLOCK_SIZE as u32,
        JobFlags::default(),
        Box::new(move |result| {
            if let Ok(JobResult::Read(data)) = result {
                *slot.lock() = Some(data);
            }
        }),
    );

    wait_until(&io, || read_back.lock().is_some());
    let data = read_back.lock().take().unwrap();
    assert!(data.iter().all(|&b| b == 0xAB));
}

#[test]
fn test_hash_matches_assembled_piece_regardless_of_write_order() {
    let io = DiskIo::new(coalescing_settings());
    let backend = MockBackend::new(4 * BLOCK_SIZE as u32, 2);
    let storage = io.new_storage(Box::new(backend.clone()));

    let writes = Completions::new();
    for blk in [1u32, 0, 3, 2] {
        io.async_write(
            &storage,
            0,
            blk * BLOCK_SIZE as u32,
            block(blk as u8),
            writes.handler(),
        );
    }

    let digest: Arc<Mutex<Option<[u8; 20]>>> = Arc::new(Mutex::new(None));
    let slot = digest.clone();
    io.async_hash(
        &storage,
        0,
        JobFlags::default(),
        Box::new(move |result| {
            if let Ok(JobResult::Hash(h)) = result {
                *slot.lock() = Some(h);
            }
        }),
    );

    wait_until(&io, || digest.lock().is_some());

    let mut hasher = Sha1::new();
    for fill in 0..4u8 {
        hasher.update(vec![fill; BLOCK_SIZE]);
    }
    let expected: [u8; 20] = hasher.finalize().into();
    assert_eq!(digest.lock().take().unwrap(), expected);
}

#[test]
fn test_delete_files_aborts_parked_writes() {
    // the flush gate (whole stripe required) never opens for a partial
    // piece, so these writes stay parked until delete aborts them
    let settings = DiskSettings {
        cache_size: 256,
        write_cache_line_size: 8,
        allow_partial_writes: false,
        cache_expiry: Duration::from_secs(3600),
        ..DiskSettings::default()
    };
    let io = DiskIo::new(settings);
    let backend = MockBackend::new(4 * BLOCK_SIZE as u32, 4);
    let storage = io.new_storage(Box::new(backend.clone()));

    let writes = Completions::new();
    io.async_write(&storage, 0, 0, block(1), writes.handler());
    io.async_write(&storage, 0, BLOCK_SIZE as u32, block(2), writes.handler());

    let deleted = Completions::new();
    io.async_delete_files(&storage, deleted.handler());

    wait_until(&io, || {
        deleted.ok.load(Ordering::SeqCst) == 1 && writes.total() == 2
    });

    assert_eq!(writes.aborted.load(Ordering::SeqCst), 2);
    assert_eq!(backend.write_calls(), 0, "dirty blocks were dropped");
    assert!(backend.events().contains(&Event::DeleteFiles));
}

#[test]
fn test_clear_piece_drops_cached_state() {
    let io = DiskIo::new(coalescing_settings());
    let backend = MockBackend::new(4 * BLOCK_SIZE as u32, 2);
    let storage = io.new_storage(Box::new(backend.clone()));

    let writes = Completions::new();
    io.async_write(&storage, 0, 0, block(0x77), writes.handler());

    let cleared = Completions::new();
    io.async_clear_piece(&storage, 0, cleared.handler());

    wait_until(&io, || cleared.ok.load(Ordering::SeqCst) == 1);
    // the fence flushed the parked write before clearing the piece
    assert_eq!(writes.ok.load(Ordering::SeqCst), 1);
    assert_eq!(backend.contents(0, BLOCK_SIZE), vec![0x77u8; BLOCK_SIZE]);

    // and the cache no longer holds any of its blocks
    wait_until(&io, || io.stats().blocks_in_use == 0);
}

#[test]
fn test_uncached_write_path() {
    let settings = DiskSettings {
        use_write_cache: false,
        ..coalescing_settings()
    };
    let io = DiskIo::new(settings);
    let backend = MockBackend::new(4 * BLOCK_SIZE as u32, 2);
    let storage = io.new_storage(Box::new(backend.clone()));

    let writes = Completions::new();
    io.async_write(&storage, 0, 0, block(9), writes.handler());
    wait_until(&io, || writes.ok.load(Ordering::SeqCst) == 1);

    assert_eq!(backend.write_calls(), 1);
    assert_eq!(backend.contents(0, BLOCK_SIZE), vec![9u8; BLOCK_SIZE]);
}

#[test]
fn test_save_resume_data_flushes_first() {
    let io = DiskIo::new(coalescing_settings());
    let backend = MockBackend::new(4 * BLOCK_SIZE as u32, 2);
    let storage = io.new_storage(Box::new(backend.clone()));

    let writes = Completions::new();
    io.async_write(&storage, 0, 0, block(5), writes.handler());

    let resume: Arc<Mutex<Option<crate::bencode::Value>>> = Arc::new(Mutex::new(None));
    let slot = resume.clone();
    io.async_save_resume_data(
        &storage,
        Box::new(move |result| {
            if let Ok(JobResult::ResumeData(v)) = result {
                *slot.lock() = Some(v);
            }
        }),
    );

    wait_until(&io, || resume.lock().is_some());
    // the dirty block reached the backend before resume data was produced
    assert_eq!(backend.contents(0, BLOCK_SIZE), vec![5u8; BLOCK_SIZE]);
}

#[test]
fn test_read_miss_populates_cache() {
    let io = DiskIo::new(coalescing_settings());
    let backend = MockBackend::new(4 * BLOCK_SIZE as u32, 2);
    {
        let mut data = backend.data.lock();
        for (i, b) in data.iter_mut().enumerate().take(BLOCK_SIZE) {
            *b = (i % 251) as u8;
        }
    }
    let storage = io.new_storage(Box::new(backend.clone()));

    let first: Arc<Mutex<Option<Bytes>>> = Arc::new(Mutex::new(None));
    let slot = first.clone();
    io.async_read(
        &storage,
        0,
        0,
        BLOCK_SIZE as u32,
        JobFlags::default(),
        Box::new(move |result| {
            if let Ok(JobResult::Read(data)) = result {
                *slot.lock() = Some(data);
            }
        }),
    );
    wait_until(&io, || first.lock().is_some());

    // second read hits the cache synchronously
    let hit = Arc::new(AtomicUsize::new(0));
    let flag = hit.clone();
    io.async_read(
        &storage,
        0,
        0,
        BLOCK_SIZE as u32,
        JobFlags::default(),
        Box::new(move |result| {
            if result.is_ok() {
                flag.fetch_add(1, Ordering::SeqCst);
            }
        }),
    );
    assert_eq!(hit.load(Ordering::SeqCst), 1, "hit completes synchronously");

    let expected: Vec<u8> = (0..BLOCK_SIZE).map(|i| (i % 251) as u8).collect();
    assert_eq!(first.lock().take().unwrap().to_vec(), expected);
}

#[test]
fn test_stop_torrent_flushes_and_releases() {
    let io = DiskIo::new(coalescing_settings());
    let backend = MockBackend::new(4 * BLOCK_SIZE as u32, 2);
    let storage = io.new_storage(Box::new(backend.clone()));

    let writes = Completions::new();
    io.async_write(&storage, 0, 0, block(3), writes.handler());

    let stopped = Completions::new();
    io.async_stop_torrent(&storage, stopped.handler());
    wait_until(&io, || stopped.ok.load(Ordering::SeqCst) == 1);

    assert_eq!(backend.contents(0, BLOCK_SIZE), vec![3u8; BLOCK_SIZE]);
    assert!(backend.events().contains(&Event::ReleaseFiles));
}
