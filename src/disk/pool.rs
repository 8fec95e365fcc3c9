use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use parking_lot::{Condvar, Mutex, MutexGuard, RwLock};
use sha1::Digest;
use tokio::sync::Notify;
use tracing::{debug, trace, warn};

use super::backend::{Storage, StorageBackend};
use super::buffer::{BufferPool, DiskObserver};
use super::cache::{BlockCache, CacheState, HashCursor, PieceEntry, PieceKey, TryRead};
use super::error::DiskError;
use super::fence::FenceAction;
use super::job::{Job, JobAction, JobFlags, JobHandler, JobResult};
use super::settings::DiskSettings;
use super::BLOCK_SIZE;
use crate::alert::{Alert, AlertManager};
use crate::bencode;

const EXPIRY_INTERVAL: Duration = Duration::from_secs(5);
const STATS_INTERVAL: Duration = Duration::from_secs(1);
const IDLE_WAIT: Duration = Duration::from_millis(500);
/// Upper bound on pieces flushed by one expiry pass.
const MAX_EXPIRED_FLUSH: usize = 200;

/// Outcome of a job handler.
enum Outcome {
    /// The job finished (successfully or with `job.error` set).
    Done(Job),
    /// Transient contention; requeue at the tail and yield.
    Retry(Job),
    /// The job now lives on a cached piece; a later flush or hash pass
    /// completes it.
    Deferred,
}

struct Queues {
    generic: VecDeque<Job>,
    hash: VecDeque<Job>,
    target_threads: usize,
    shutdown: bool,
}

/// Aggregate counters, flipped into per-interval averages once a second by
/// thread 0.
#[derive(Default)]
struct Counters {
    blocks_read: AtomicU64,
    blocks_written: AtomicU64,
    reads: AtomicU64,
    writes: AtomicU64,
    hashes: AtomicU64,
    jobs: AtomicU64,
}

/// Point-in-time view of the disk subsystem.
#[derive(Debug, Clone, Default)]
pub struct DiskStats {
    pub blocks_read: u64,
    pub blocks_written: u64,
    pub reads: u64,
    pub writes: u64,
    pub hashes: u64,
    pub jobs: u64,
    pub blocks_in_use: usize,
    pub cached_pieces: usize,
    pub queued_jobs: usize,
    /// Jobs completed per second over the last stats interval.
    pub job_rate: u64,
}

struct Shared {
    cache: Mutex<BlockCache>,
    queues: Mutex<Queues>,
    job_cond: Condvar,
    hash_cond: Condvar,
    completed: Mutex<VecDeque<Job>>,
    completed_notify: Notify,
    pool: Arc<BufferPool>,
    settings: RwLock<DiskSettings>,
    num_writing: AtomicUsize,
    counters: Counters,
    last_job_flip: AtomicU64,
    job_rate: AtomicU64,
    alerts: Option<Arc<AlertManager>>,
}

/// The disk I/O subsystem: a write-back block cache served by a pool of
/// worker threads.
///
/// Hosts submit work through the `async_*` methods; each takes a completion
/// handler invoked from [`drain_completed`](Self::drain_completed) on the
/// host's thread, in FIFO order of completion.
pub struct DiskIo {
    shared: Arc<Shared>,
    threads: Mutex<Vec<std::thread::JoinHandle<()>>>,
    next_storage: AtomicUsize,
}

impl DiskIo {
    pub fn new(settings: DiskSettings) -> Self {
        Self::with_alerts(settings, None)
    }

    pub fn with_alerts(settings: DiskSettings, alerts: Option<Arc<AlertManager>>) -> Self {
        let pool = BufferPool::new(settings.cache_size);
        let num_threads = settings.num_threads.max(1);
        let shared = Arc::new(Shared {
            cache: Mutex::new(BlockCache::new(pool.clone())),
            queues: Mutex::new(Queues {
                generic: VecDeque::new(),
                hash: VecDeque::new(),
                target_threads: num_threads,
                shutdown: false,
            }),
            job_cond: Condvar::new(),
            hash_cond: Condvar::new(),
            completed: Mutex::new(VecDeque::new()),
            completed_notify: Notify::new(),
            pool,
            settings: RwLock::new(settings),
            num_writing: AtomicUsize::new(0),
            counters: Counters::default(),
            last_job_flip: AtomicU64::new(0),
            job_rate: AtomicU64::new(0),
            alerts,
        });

        let io = Self {
            shared,
            threads: Mutex::new(Vec::new()),
            next_storage: AtomicUsize::new(1),
        };
        io.spawn_threads(num_threads);
        io
    }

    fn spawn_threads(&self, up_to: usize) {
        let mut threads = self.threads.lock();
        while threads.len() < up_to {
            let id = threads.len();
            let shared = self.shared.clone();
            let handle = std::thread::Builder::new()
                .name(format!("disk-{}", id))
                .spawn(move || worker(shared, id))
                .expect("spawning disk thread");
            threads.push(handle);
        }
    }

    /// Grows or shrinks the worker pool. Every fourth thread services only
    /// the hash queue.
    pub fn set_num_threads(&self, n: usize) {
        let n = n.max(1);
        {
            let mut q = self.shared.queues.lock();
            q.target_threads = n;
        }
        self.shared.job_cond.notify_all();
        self.shared.hash_cond.notify_all();
        self.spawn_threads(n);
    }

    /// Registers a backend and returns the storage handle jobs refer to.
    pub fn new_storage(&self, backend: Box<dyn StorageBackend>) -> Arc<Storage> {
        let id = self.next_storage.fetch_add(1, Ordering::Relaxed) as u32;
        Storage::new(id, backend)
    }

    pub fn settings(&self) -> DiskSettings {
        self.shared.settings.read().clone()
    }

    pub fn set_settings(&self, settings: DiskSettings) {
        self.shared.pool.set_limit(settings.cache_size);
        *self.shared.settings.write() = settings;
    }

    pub fn buffer_pool(&self) -> &Arc<BufferPool> {
        &self.shared.pool
    }

    /// Registers an observer notified when buffer pressure eases.
    pub fn subscribe_to_disk(&self, observer: &Arc<dyn DiskObserver>) {
        self.shared.pool.subscribe(observer);
    }

    pub fn stats(&self) -> DiskStats {
        let c = &self.shared.counters;
        let queued_jobs = {
            let q = self.shared.queues.lock();
            q.generic.len() + q.hash.len()
        };
        DiskStats {
            blocks_read: c.blocks_read.load(Ordering::Relaxed),
            blocks_written: c.blocks_written.load(Ordering::Relaxed),
            reads: c.reads.load(Ordering::Relaxed),
            writes: c.writes.load(Ordering::Relaxed),
            hashes: c.hashes.load(Ordering::Relaxed),
            jobs: c.jobs.load(Ordering::Relaxed),
            blocks_in_use: self.shared.pool.in_use(),
            cached_pieces: self.shared.cache.lock().num_pieces(),
            queued_jobs,
            job_rate: self.shared.job_rate.load(Ordering::Relaxed),
        }
    }

    /// Runs completion handlers for every finished job. Call from the host
    /// thread; handlers fire in FIFO order of completion.
    pub fn drain_completed(&self) -> usize {
        let jobs: Vec<Job> = {
            let mut completed = self.shared.completed.lock();
            completed.drain(..).collect()
        };
        let n = jobs.len();
        for job in jobs {
            job.deliver();
        }
        n
    }

    /// Resolves when at least one completion is waiting to be drained.
    pub async fn wait_completed(&self) {
        if !self.shared.completed.lock().is_empty() {
            return;
        }
        self.shared.completed_notify.notified().await;
    }

    // ----- job submission -----

    /// Reads `length` bytes (at most one block) at `(piece, offset)`. Cache
    /// hits complete synchronously.
    pub fn async_read(
        &self,
        storage: &Arc<Storage>,
        piece: u32,
        offset: u32,
        length: u32,
        flags: JobFlags,
        handler: JobHandler,
    ) {
        debug_assert!(length as usize <= BLOCK_SIZE);
        let mut job = Job::new(JobAction::Read, Some(storage.clone())).with_handler(handler);
        job.piece = piece;
        job.offset = offset;
        job.length = length;
        job.flags = flags;

        let use_cache = {
            let s = self.shared.settings.read();
            s.use_read_cache && s.cache_size > 0
        };
        if use_cache {
            let mut cache = self.shared.cache.lock();
            if let TryRead::Hit(data) =
                cache.try_read(&(storage.id(), piece), offset, length, Instant::now())
            {
                drop(cache);
                trace!(piece, offset, "read served from cache");
                job.flags.insert(JobFlags::CACHE_HIT);
                job.result = JobResult::Read(data);
                job.deliver();
                return;
            }
        }

        add_job(&self.shared, job);
    }

    /// Writes one block-aligned payload of at most one block.
    pub fn async_write(
        &self,
        storage: &Arc<Storage>,
        piece: u32,
        offset: u32,
        buffer: Bytes,
        handler: JobHandler,
    ) {
        debug_assert!(buffer.len() <= BLOCK_SIZE);
        debug_assert_eq!(offset as usize % BLOCK_SIZE, 0);

        let mut job = Job::new(JobAction::Write, Some(storage.clone())).with_handler(handler);
        job.piece = piece;
        job.offset = offset;
        job.length = buffer.len() as u32;
        job.buffer = Some(buffer);

        let use_cache = {
            let s = self.shared.settings.read();
            s.use_write_cache && s.cache_size > 0
        };
        if !use_cache {
            add_job(&self.shared, job);
            return;
        }

        // fence admission happens before the cache insert so a parked
        // write is replayed through this same path later
        let Some(job) = storage.check_fence(job) else {
            return;
        };

        let mut spawn_flush = false;
        let mut rejected = None;
        {
            let mut cache = self.shared.cache.lock();
            match cache.add_dirty_block(job, Instant::now()) {
                Ok(key) => {
                    if let Some(pe) = cache.find_mut(&key) {
                        if !pe.outstanding_flush {
                            pe.outstanding_flush = true;
                            spawn_flush = true;
                        }
                    }
                }
                Err(job) => rejected = Some(job),
            }
        }

        if let Some(job) = rejected {
            // slot conflict or hashed piece: write through uncached
            push_queue(&self.shared, job);
            return;
        }

        if self.shared.pool.is_exceeded() {
            if let Some(alerts) = &self.shared.alerts {
                alerts.post(Alert::CachePressure {
                    in_use: self.shared.pool.in_use(),
                    limit: self.shared.pool.limit(),
                });
            }
        }

        if spawn_flush {
            let mut fj = Job::new(JobAction::FlushHashed, Some(storage.clone()));
            fj.piece = piece;
            add_job(&self.shared, fj);
        }
    }

    /// Requests the SHA-1 of a whole piece. Completes synchronously when
    /// the hash cursor already covers the piece.
    pub fn async_hash(
        &self,
        storage: &Arc<Storage>,
        piece: u32,
        flags: JobFlags,
        handler: JobHandler,
    ) {
        let mut job = Job::new(JobAction::Hash, Some(storage.clone())).with_handler(handler);
        job.piece = piece;
        job.flags = flags;

        let piece_size = storage.backend().piece_size(piece);
        {
            let mut cache = self.shared.cache.lock();
            let key = (storage.id(), piece);
            if let Some(pe) = cache.find_mut(&key) {
                if !pe.hashing && pe.hash.as_ref().is_some_and(|h| h.offset == piece_size) {
                    let digest = pe.hash.take().expect("cursor checked").finalize();
                    if pe.state != CacheState::VolatileReadLru {
                        pe.hashing_done = true;
                    }
                    drop(cache);
                    job.result = JobResult::Hash(digest);
                    job.deliver();
                    return;
                }
            }
        }

        add_job(&self.shared, job);
    }

    pub fn async_move_storage(&self, storage: &Arc<Storage>, path: PathBuf, handler: JobHandler) {
        let mut job =
            Job::new(JobAction::MoveStorage, Some(storage.clone())).with_handler(handler);
        job.path = Some(path);
        add_fence_job(&self.shared, job);
    }

    pub fn async_release_files(&self, storage: &Arc<Storage>, handler: JobHandler) {
        let job = Job::new(JobAction::ReleaseFiles, Some(storage.clone())).with_handler(handler);
        add_fence_job(&self.shared, job);
    }

    pub fn async_check_fastresume(
        &self,
        storage: &Arc<Storage>,
        resume: Option<bencode::Value>,
        handler: JobHandler,
    ) {
        let mut job =
            Job::new(JobAction::CheckFastresume, Some(storage.clone())).with_handler(handler);
        job.resume = resume;
        add_fence_job(&self.shared, job);
    }

    pub fn async_save_resume_data(&self, storage: &Arc<Storage>, handler: JobHandler) {
        let job =
            Job::new(JobAction::SaveResumeData, Some(storage.clone())).with_handler(handler);
        add_fence_job(&self.shared, job);
    }

    pub fn async_rename_file(
        &self,
        storage: &Arc<Storage>,
        file: usize,
        name: String,
        handler: JobHandler,
    ) {
        let mut job = Job::new(JobAction::RenameFile, Some(storage.clone())).with_handler(handler);
        job.file = file;
        job.name = Some(name);
        add_fence_job(&self.shared, job);
    }

    pub fn async_set_file_priority(
        &self,
        storage: &Arc<Storage>,
        priorities: Vec<u8>,
        handler: JobHandler,
    ) {
        let mut job =
            Job::new(JobAction::FilePriority, Some(storage.clone())).with_handler(handler);
        job.priorities = Some(priorities);
        add_fence_job(&self.shared, job);
    }

    pub fn async_stop_torrent(&self, storage: &Arc<Storage>, handler: JobHandler) {
        let job = Job::new(JobAction::StopTorrent, Some(storage.clone())).with_handler(handler);
        add_fence_job(&self.shared, job);
    }

    /// Clears a piece from the cache (hash state included), aborting jobs
    /// parked on it. Fenced: all prior jobs on the storage complete first.
    pub fn async_clear_piece(&self, storage: &Arc<Storage>, piece: u32, handler: JobHandler) {
        let mut job = Job::new(JobAction::ClearPiece, Some(storage.clone())).with_handler(handler);
        job.piece = piece;
        add_fence_job(&self.shared, job);
    }

    /// Aborts every queued or cached job for the storage with
    /// `OperationAborted`, then deletes the files behind a fence.
    pub fn async_delete_files(&self, storage: &Arc<Storage>, handler: JobHandler) {
        let mut aborted = Vec::new();
        {
            let mut cache = self.shared.cache.lock();
            flush_cache_mode(
                &self.shared,
                &mut cache,
                Some(storage.id()),
                FlushMode::Delete,
                &mut aborted,
            );
        }

        // pull this storage's jobs out of both queues
        {
            let mut q = self.shared.queues.lock();
            let q = &mut *q;
            for queue in [&mut q.generic, &mut q.hash] {
                let drained: Vec<Job> = queue
                    .drain(..)
                    .collect::<Vec<_>>()
                    .into_iter()
                    .filter_map(|j| {
                        if j.storage.as_ref().map(|s| s.id()) == Some(storage.id()) {
                            aborted.push(j);
                            None
                        } else {
                            Some(j)
                        }
                    })
                    .collect();
                queue.extend(drained);
            }
        }

        // jobs parked behind a fence never started; abort them too
        aborted.extend(storage.take_blocked());

        for mut job in aborted {
            job.error = Some(DiskError::OperationAborted);
            complete_job(&self.shared, job);
        }

        let job = Job::new(JobAction::DeleteFiles, Some(storage.clone())).with_handler(handler);
        add_fence_job(&self.shared, job);
    }

    /// Reads a whole piece into the cache without hashing it.
    pub fn async_cache_piece(&self, storage: &Arc<Storage>, piece: u32, handler: JobHandler) {
        let mut job = Job::new(JobAction::CachePiece, Some(storage.clone())).with_handler(handler);
        job.piece = piece;
        add_job(&self.shared, job);
    }

    /// Flushes a piece's dirty blocks if it satisfies the flush condition.
    pub fn async_flush_piece(&self, storage: &Arc<Storage>, piece: u32, handler: JobHandler) {
        let mut job = Job::new(JobAction::FlushPiece, Some(storage.clone())).with_handler(handler);
        job.piece = piece;
        add_job(&self.shared, job);
    }

    /// Loads and bencode-decodes a torrent file.
    pub fn async_load_torrent(&self, path: PathBuf, handler: JobHandler) {
        let mut job = Job::new(JobAction::LoadTorrent, None).with_handler(handler);
        job.path = Some(path);
        add_job(&self.shared, job);
    }

    /// Syncs one finished file to disk.
    pub fn async_finalize_file(&self, storage: &Arc<Storage>, file: usize, handler: JobHandler) {
        let mut job =
            Job::new(JobAction::FinalizeFile, Some(storage.clone())).with_handler(handler);
        job.file = file;
        add_job(&self.shared, job);
    }

    pub fn async_tick_torrent(&self, storage: &Arc<Storage>, handler: JobHandler) {
        let job = Job::new(JobAction::Tick, Some(storage.clone())).with_handler(handler);
        add_job(&self.shared, job);
    }

    /// Stops the workers, aborting all queued jobs. Completions (including
    /// the aborted ones) are still delivered through `drain_completed`.
    pub fn abort(&self) {
        let queued: Vec<Job> = {
            let mut q = self.shared.queues.lock();
            q.shutdown = true;
            let generic_drained: Vec<Job> = q.generic.drain(..).collect();
            let hash_drained: Vec<Job> = q.hash.drain(..).collect();
            generic_drained.into_iter().chain(hash_drained).collect()
        };
        self.shared.job_cond.notify_all();
        self.shared.hash_cond.notify_all();

        let mut threads = self.threads.lock();
        for handle in threads.drain(..) {
            let _ = handle.join();
        }

        for mut job in queued {
            job.error = Some(DiskError::OperationAborted);
            complete_job(&self.shared, job);
        }

        let drained = self.shared.cache.lock().clear();
        for mut job in drained {
            job.error = Some(DiskError::OperationAborted);
            complete_job(&self.shared, job);
        }
    }
}

impl Drop for DiskIo {
    fn drop(&mut self) {
        self.abort();
    }
}

// ----- submission plumbing -----

fn add_job(shared: &Arc<Shared>, mut job: Job) {
    if !job.flags.contains(JobFlags::IN_PROGRESS) {
        if let Some(storage) = job.storage.clone() {
            match storage.check_fence(job) {
                Some(admitted) => job = admitted,
                None => return, // parked behind the fence
            }
        }
    }
    push_queue(shared, job);
}

fn push_queue(shared: &Arc<Shared>, job: Job) {
    let mut q = shared.queues.lock();
    // hash jobs get their own queue once a dedicated hasher thread exists
    if job.action == JobAction::Hash && q.target_threads > 3 {
        q.hash.push_back(job);
        drop(q);
        shared.hash_cond.notify_one();
    } else {
        q.generic.push_back(job);
        drop(q);
        shared.job_cond.notify_one();
    }
}

fn push_queue_front(shared: &Arc<Shared>, job: Job) {
    let mut q = shared.queues.lock();
    q.generic.push_front(job);
    drop(q);
    shared.job_cond.notify_one();
}

fn add_fence_job(shared: &Arc<Shared>, job: Job) {
    let storage = job.storage.clone().expect("fence jobs carry a storage");
    debug_assert!(job.action.is_fenced());
    match storage.raise_fence(job) {
        FenceAction::PostFence(fence) => {
            trace!("fence raised on idle storage");
            push_queue_front(shared, fence);
        }
        FenceAction::PostFlush => {
            trace!("fence parked; flushing storage first");
            let fj = Job::new(JobAction::FlushStorage, Some(storage.clone()));
            let fj = storage.admit_unfenced(fj);
            push_queue_front(shared, fj);
        }
        FenceAction::Blocked => {}
    }
}

/// Routes a finished job through fence accounting and into the completion
/// queue. Must not be called with the cache mutex held.
fn complete_job(shared: &Arc<Shared>, job: Job) {
    let mut fence_ready = None;
    let mut resubmit = Vec::new();

    if job.flags.contains(JobFlags::IN_PROGRESS) {
        if let Some(storage) = &job.storage {
            let release = storage.fence_complete(job.flags.contains(JobFlags::FENCE));
            resubmit = release.resubmit;
            fence_ready = release.fence_ready;
        }
    }

    if let (Some(alerts), Some(error)) = (&shared.alerts, &job.error) {
        if let Some(storage) = &job.storage {
            alerts.post(Alert::DiskJobFailed {
                storage: storage.id(),
                error: error.clone(),
            });
        }
    }

    shared.counters.jobs.fetch_add(1, Ordering::Relaxed);
    shared.completed.lock().push_back(job);
    shared.completed_notify.notify_one();

    if let Some(fence) = fence_ready {
        push_queue_front(shared, fence);
    }
    for j in resubmit {
        if j.flags.contains(JobFlags::FENCE) {
            add_fence_job(shared, j);
        } else {
            add_job(shared, j);
        }
    }
}

fn complete_all(shared: &Arc<Shared>, jobs: Vec<Job>) {
    for job in jobs {
        complete_job(shared, job);
    }
}

fn abort_all(shared: &Arc<Shared>, jobs: Vec<Job>) {
    for mut job in jobs {
        job.error = Some(DiskError::OperationAborted);
        complete_job(shared, job);
    }
}

// ----- worker loop -----

fn worker(shared: Arc<Shared>, thread_id: usize) {
    debug!(thread_id, "disk thread started");
    let hasher = thread_id % 4 == 3;
    let mut last_expiry = Instant::now();
    let mut last_stats = Instant::now();

    loop {
        let job = {
            let mut q = shared.queues.lock();
            loop {
                if q.shutdown || (thread_id > 0 && thread_id >= q.target_threads) {
                    debug!(thread_id, "disk thread exiting");
                    return;
                }
                let popped = if hasher {
                    q.hash.pop_front()
                } else {
                    q.generic.pop_front()
                };
                if let Some(job) = popped {
                    break Some(job);
                }
                let cond = if hasher {
                    &shared.hash_cond
                } else {
                    &shared.job_cond
                };
                let timed_out = cond.wait_for(&mut q, IDLE_WAIT).timed_out();
                // thread 0 runs periodic maintenance even when idle
                if timed_out && thread_id == 0 {
                    break None;
                }
            }
        };

        if thread_id == 0 {
            let now = Instant::now();
            if now.duration_since(last_expiry) >= EXPIRY_INTERVAL {
                last_expiry = now;
                flush_expired_write_blocks(&shared);
            }
            if now.duration_since(last_stats) >= STATS_INTERVAL {
                last_stats = now;
                flip_stats(&shared);
            }
        }

        let Some(job) = job else { continue };
        perform_job(&shared, job);
        check_cache_level(&shared);
    }
}

fn flip_stats(shared: &Arc<Shared>) {
    let jobs = shared.counters.jobs.load(Ordering::Relaxed);
    let last = shared.last_job_flip.swap(jobs, Ordering::Relaxed);
    shared.job_rate.store(jobs.saturating_sub(last), Ordering::Relaxed);
}

fn perform_job(shared: &Arc<Shared>, job: Job) {
    trace!(action = ?job.action, piece = job.piece, "disk job");
    let outcome = match job.action {
        JobAction::Read => do_read(shared, job),
        JobAction::Write => do_uncached_write(shared, job),
        JobAction::Hash => do_hash(shared, job),
        JobAction::MoveStorage => do_move_storage(job),
        JobAction::ReleaseFiles => do_release_files(shared, job),
        JobAction::DeleteFiles => do_delete_files(shared, job),
        JobAction::CheckFastresume => do_check_fastresume(job),
        JobAction::SaveResumeData => do_save_resume_data(shared, job),
        JobAction::RenameFile => do_rename_file(job),
        JobAction::StopTorrent => do_stop_torrent(shared, job),
        JobAction::CachePiece => do_cache_piece(shared, job),
        JobAction::FinalizeFile => do_finalize_file(job),
        JobAction::FlushPiece => do_flush_piece(shared, job),
        JobAction::FlushHashed => do_flush_hashed(shared, job),
        JobAction::FlushStorage => do_flush_storage(shared, job),
        JobAction::TrimCache => do_trim_cache(shared, job),
        JobAction::FilePriority => do_file_priority(job),
        JobAction::LoadTorrent => do_load_torrent(job),
        JobAction::ClearPiece => do_clear_piece(shared, job),
        JobAction::Tick => do_tick(job),
    };

    match outcome {
        Outcome::Done(job) => complete_job(shared, job),
        Outcome::Retry(job) => {
            push_queue(shared, job);
            std::thread::yield_now();
        }
        Outcome::Deferred => {}
    }
}

/// Evicts and, under pressure, flushes down to the cache limit. Runs before
/// and after every job.
fn check_cache_level(shared: &Arc<Shared>) {
    let mut completed = Vec::new();
    {
        let mut cache = shared.cache.lock();
        let evict = cache.num_to_evict(0);
        if evict > 0 {
            let mut drained = Vec::new();
            let left = cache.try_evict_blocks(evict, &mut drained);
            for mut j in drained {
                j.error = Some(DiskError::OperationAborted);
                completed.push(j);
            }
            if left > 0 && shared.num_writing.load(Ordering::Relaxed) == 0 {
                let settings = shared.settings.read().clone();
                try_flush_write_blocks(shared, &mut cache, left, &settings, &mut completed);
            }
        }
    }
    complete_all(shared, completed);
}

// ----- reads -----

fn do_read(shared: &Arc<Shared>, job: Job) -> Outcome {
    let settings = shared.settings.read().clone();
    if !settings.use_read_cache || settings.cache_size == 0 {
        return do_uncached_read(shared, job);
    }

    let storage = job.storage.clone().expect("read jobs carry a storage");
    let key = (storage.id(), job.piece);
    let piece_size = storage.backend().piece_size(job.piece);
    let volatile = job.flags.contains(JobFlags::VOLATILE_READ);
    let line = if volatile {
        1
    } else {
        settings.read_cache_line_size
    };

    // reserve room and allocate the read-ahead buffers
    let mut completed = Vec::new();
    let (start_block, bufs) = {
        let mut cache = shared.cache.lock();
        let (start_block, nblocks) = cache.pad_read(piece_size, job.offset, job.length, line);

        let evict = cache.num_to_evict(nblocks);
        if evict > 0 {
            let mut drained = Vec::new();
            cache.try_evict_blocks(evict, &mut drained);
            for mut j in drained {
                j.error = Some(DiskError::OperationAborted);
                completed.push(j);
            }
        }

        let mut bufs = Vec::with_capacity(nblocks);
        let mut failed = false;
        for _ in 0..nblocks {
            match cache.pool().allocate() {
                Ok(buf) => bufs.push(buf),
                Err(_) => {
                    failed = true;
                    break;
                }
            }
        }
        if failed {
            for buf in bufs {
                cache.pool().recycle(buf);
            }
            drop(cache);
            complete_all(shared, completed);
            return do_uncached_read(shared, job);
        }
        (start_block, bufs)
    };
    complete_all(shared, completed);

    let mut bufs = bufs;
    for (i, buf) in bufs.iter_mut().enumerate() {
        let start = (start_block + i) * BLOCK_SIZE;
        let len = (piece_size as usize - start).min(BLOCK_SIZE);
        buf.resize(len, 0);
    }

    let read_result = {
        let mut slices: Vec<&mut [u8]> = bufs.iter_mut().map(|b| &mut b[..]).collect();
        storage
            .backend()
            .readv(job.piece, (start_block * BLOCK_SIZE) as u32, &mut slices)
    };

    let mut job = job;
    match read_result {
        Err(e) => {
            for buf in bufs {
                shared.pool.recycle(buf);
            }
            job.error = Some(e);
            Outcome::Done(job)
        }
        Ok(_) => {
            shared
                .counters
                .blocks_read
                .fetch_add(bufs.len() as u64, Ordering::Relaxed);
            shared.counters.reads.fetch_add(1, Ordering::Relaxed);
            let frozen: Vec<Bytes> = bufs.into_iter().map(|b| b.freeze()).collect();

            let mut cache = shared.cache.lock();
            let state = if volatile {
                CacheState::VolatileReadLru
            } else {
                CacheState::ReadLru1
            };
            cache.allocate_piece(&storage, job.piece, state, Instant::now());
            cache.insert_blocks(&key, start_block, frozen);
            match cache.try_read(&key, job.offset, job.length, Instant::now()) {
                TryRead::Hit(data) => {
                    drop(cache);
                    job.result = JobResult::Read(data);
                    Outcome::Done(job)
                }
                TryRead::Miss => {
                    drop(cache);
                    job.error = Some(DiskError::Read("cached blocks vanished".into()));
                    Outcome::Done(job)
                }
            }
        }
    }
}

fn do_uncached_read(shared: &Arc<Shared>, mut job: Job) -> Outcome {
    let storage = job.storage.clone().expect("read jobs carry a storage");
    let mut buf = match shared.pool.allocate() {
        Ok(buf) => buf,
        Err(e) => {
            job.error = Some(e);
            return Outcome::Done(job);
        }
    };
    buf.resize(job.length as usize, 0);

    let result = {
        let mut slices = [&mut buf[..]];
        storage.backend().readv(job.piece, job.offset, &mut slices)
    };
    match result {
        Err(e) => {
            shared.pool.recycle(buf);
            job.error = Some(e);
        }
        Ok(_) => {
            shared.counters.blocks_read.fetch_add(1, Ordering::Relaxed);
            shared.counters.reads.fetch_add(1, Ordering::Relaxed);
            job.result = JobResult::Read(buf.freeze());
            shared.pool.released(1);
        }
    }
    Outcome::Done(job)
}

// ----- writes -----

fn do_uncached_write(shared: &Arc<Shared>, mut job: Job) -> Outcome {
    let storage = job.storage.clone().expect("write jobs carry a storage");
    let buf = match job.buffer.take() {
        Some(b) => b,
        None => {
            job.error = Some(DiskError::Write("write job without payload".into()));
            return Outcome::Done(job);
        }
    };

    shared.num_writing.fetch_add(1, Ordering::Relaxed);
    let result = storage.backend().writev(job.piece, job.offset, &[&buf]);
    shared.num_writing.fetch_sub(1, Ordering::Relaxed);

    match result {
        Err(e) => job.error = Some(e),
        Ok(_) => {
            shared
                .counters
                .blocks_written
                .fetch_add(1, Ordering::Relaxed);
            shared.counters.writes.fetch_add(1, Ordering::Relaxed);
        }
    }
    Outcome::Done(job)
}

// ----- flushing -----

/// Marks flushable blocks in `[start, end)` pending and returns
/// `(global_index, buffer)` pairs. `base` offsets indices for multi-piece
/// stripes.
fn build_iovec(pe: &mut PieceEntry, start: usize, end: usize, base: usize) -> Vec<(usize, Bytes)> {
    let end = end.min(pe.blocks_in_piece());
    let mut out = Vec::new();
    for i in start..end {
        let block = &mut pe.blocks[i];
        if block.buf.is_none() || block.pending || !block.dirty {
            continue;
        }
        block.pending = true;
        pe.num_dirty = pe.num_dirty.saturating_sub(1);
        out.push((i + base, block.buf.clone().expect("checked resident")));
    }
    out
}

/// Issues one writev per contiguous block run. Entries use global indices;
/// `base_piece` anchors index zero.
fn flush_iovec(
    shared: &Arc<Shared>,
    storage: &Arc<Storage>,
    base_piece: u32,
    blocks_in_piece: usize,
    entries: &[(usize, Bytes)],
) -> Result<(), DiskError> {
    debug_assert!(!entries.is_empty());
    shared.num_writing.fetch_add(1, Ordering::Relaxed);

    let result = (|| {
        let mut run_start = 0;
        for i in 1..=entries.len() {
            if i < entries.len() && entries[i].0 == entries[i - 1].0 + 1 {
                continue;
            }
            let first = entries[run_start].0;
            let piece = base_piece + (first / blocks_in_piece) as u32;
            let offset = ((first % blocks_in_piece) * BLOCK_SIZE) as u32;
            let iov: Vec<&[u8]> = entries[run_start..i].iter().map(|(_, b)| &b[..]).collect();
            storage.backend().writev(piece, offset, &iov)?;
            run_start = i;
        }
        Ok(())
    })();

    shared.num_writing.fetch_sub(1, Ordering::Relaxed);
    if result.is_ok() {
        shared
            .counters
            .blocks_written
            .fetch_add(entries.len() as u64, Ordering::Relaxed);
        shared.counters.writes.fetch_add(1, Ordering::Relaxed);
    }
    result
}

/// Flushes dirty, non-pending blocks of one piece in `[start, end)`.
/// Returns the number of blocks issued.
fn flush_range(
    shared: &Arc<Shared>,
    cache: &mut MutexGuard<'_, BlockCache>,
    key: PieceKey,
    start: usize,
    end: usize,
    completed: &mut Vec<Job>,
) -> usize {
    let (entries, storage, base_piece, bip) = {
        let Some(pe) = cache.find_mut(&key) else {
            return 0;
        };
        let entries = build_iovec(pe, start, end, 0);
        if entries.is_empty() {
            return 0;
        }
        (entries, pe.storage.clone(), pe.piece, pe.blocks_in_piece())
    };

    cache.pin(&key);
    let mut flush_result = Ok(());
    MutexGuard::unlocked(cache, || {
        flush_result = flush_iovec(shared, &storage, base_piece, bip, &entries);
    });
    cache.unpin(&key);

    let indices: Vec<usize> = entries.iter().map(|(i, _)| *i).collect();
    match flush_result {
        Ok(()) => {
            completed.extend(cache.blocks_flushed(&key, &indices, Instant::now()));
        }
        Err(e) => {
            warn!(piece = key.1, error = %e, "flush failed; keeping blocks dirty");
            for mut job in cache.flush_failed(&key, &indices) {
                job.error = Some(e.clone());
                completed.push(job);
            }
        }
    }

    let evict = cache.num_to_evict(0);
    if evict > 0 {
        let mut drained = Vec::new();
        cache.try_evict_blocks(evict, &mut drained);
        for mut j in drained {
            j.error = Some(DiskError::OperationAborted);
            completed.push(j);
        }
    }
    entries.len()
}

/// Hash-gated write coalescing: flushes a piece once enough contiguous
/// blocks are hashed, the whole piece is hashed, or a read-back is due
/// anyway. A `cont_block` spanning multiple pieces attempts a stripe flush
/// across the aligned piece range.
fn try_flush_hashed(
    shared: &Arc<Shared>,
    cache: &mut MutexGuard<'_, BlockCache>,
    key: PieceKey,
    cont_block: u32,
    settings: &DiskSettings,
    completed: &mut Vec<Job>,
) -> usize {
    let (storage, piece, bip, end) = {
        let Some(pe) = cache.find_mut(&key) else {
            return 0;
        };
        if pe.hash.is_none() && !pe.hashing_done {
            return 0;
        }
        if pe.num_dirty == 0 {
            return 0;
        }

        let bip = pe.blocks_in_piece();
        let mut end = if pe.hashing_done {
            bip
        } else {
            pe.hash_cursor_block()
        };
        if end == 0 && !pe.need_readback {
            return 0;
        }

        let mut block_limit = (cont_block as usize).min(bip);
        if end == bip {
            // everything hashed; flush whatever is there
            block_limit = 1;
        }
        if pe.need_readback {
            // a read-back is due regardless, no point holding blocks
            end = bip;
        }

        let flushable = (0..end)
            .filter(|&i| pe.blocks[i].dirty && !pe.blocks[i].pending)
            .count();
        if block_limit > flushable {
            return 0;
        }
        if !pe.hashing_done && end > pe.hash_cursor_block() {
            pe.need_readback = true;
        }
        (pe.storage.clone(), pe.piece as usize, bip, end)
    };

    let cont_pieces = (cont_block as usize) / bip;
    if cont_pieces <= 1 || settings.allow_partial_writes {
        return flush_range(shared, cache, key, 0, end, completed);
    }

    // stripe flush: the whole aligned piece range must be flush-ready
    let num_pieces = storage.backend().num_pieces() as usize;
    let range_start = (piece / cont_pieces) * cont_pieces;
    let range_end = (range_start + cont_pieces).min(num_pieces);

    for i in range_start..range_end {
        let k = (storage.id(), i as u32);
        let Some(pe) = cache.find(&k) else {
            trace!(piece = i, "stripe incomplete: piece not cached");
            return 0;
        };
        if pe.state != CacheState::WriteLru {
            continue; // already flushed; skip
        }
        let hashed = pe.hashing_done
            || pe.hash_cursor_block() == pe.blocks_in_piece()
            || settings.disable_hash_checks;
        if pe.num_dirty != pe.blocks_in_piece() || !hashed {
            trace!(piece = i, "stripe incomplete: piece not ready");
            return 0;
        }
    }

    // build one iovec spanning the range
    let mut entries: Vec<(usize, Bytes)> = Vec::new();
    let mut flushed_pieces: Vec<(PieceKey, Vec<usize>)> = Vec::new();
    let mut block_base = 0;
    for i in range_start..range_end {
        let k = (storage.id(), i as u32);
        if let Some(pe) = cache.find_mut(&k) {
            if pe.state == CacheState::WriteLru {
                let piece_entries = build_iovec(pe, 0, bip, block_base);
                if !piece_entries.is_empty() {
                    let local: Vec<usize> =
                        piece_entries.iter().map(|(g, _)| g - block_base).collect();
                    entries.extend(piece_entries);
                    flushed_pieces.push((k, local));
                }
            }
        }
        block_base += bip;
    }
    if entries.is_empty() {
        return 0;
    }

    for (k, _) in &flushed_pieces {
        cache.pin(k);
    }

    let mut flush_result = Ok(());
    MutexGuard::unlocked(cache, || {
        flush_result = flush_iovec(shared, &storage, range_start as u32, bip, &entries);
    });

    for (k, local) in &flushed_pieces {
        cache.unpin(k);
        match &flush_result {
            Ok(()) => completed.extend(cache.blocks_flushed(k, local, Instant::now())),
            Err(e) => {
                for mut job in cache.flush_failed(k, local) {
                    job.error = Some(e.clone());
                    completed.push(job);
                }
            }
        }
    }

    let evict = cache.num_to_evict(0);
    if evict > 0 {
        let mut drained = Vec::new();
        cache.try_evict_blocks(evict, &mut drained);
        for mut j in drained {
            j.error = Some(DiskError::OperationAborted);
            completed.push(j);
        }
    }
    entries.len()
}

/// Walks the write LRU oldest-first and flushes pieces whose dirty blocks
/// outlived `cache_expiry`. Bounded per pass.
fn flush_expired_write_blocks(shared: &Arc<Shared>) {
    let settings = shared.settings.read().clone();
    let mut completed = Vec::new();
    {
        let mut cache = shared.cache.lock();
        let now = Instant::now();
        let mut flushed = 0;
        for key in cache.write_lru_pieces() {
            let expired = match cache.find(&key) {
                // oldest-first: once one piece is young, the rest are too
                Some(pe) => {
                    if now.duration_since(pe.expire) < settings.cache_expiry {
                        break;
                    }
                    pe.num_dirty > 0
                }
                None => false,
            };
            if !expired {
                continue;
            }
            flush_range(shared, &mut cache, key, 0, usize::MAX, &mut completed);
            flushed += 1;
            if flushed == MAX_EXPIRED_FLUSH {
                break;
            }
        }
    }
    complete_all(shared, completed);
}

/// Pressure flush: prefer hashed stripes, then degrade to flushing
/// everything dirty in LRU order if no other thread is writing.
fn try_flush_write_blocks(
    shared: &Arc<Shared>,
    cache: &mut MutexGuard<'_, BlockCache>,
    mut num: usize,
    settings: &DiskSettings,
    completed: &mut Vec<Job>,
) {
    let keys = cache.write_lru_pieces();

    for key in &keys {
        if num == 0 {
            return;
        }
        if cache.find(key).map(|p| p.num_dirty).unwrap_or(0) == 0 {
            continue;
        }
        cache.pin(key);
        kick_hasher(cache, *key, completed);
        let flushed = try_flush_hashed(shared, cache, *key, 1, settings, completed);
        cache.unpin(key);
        num = num.saturating_sub(flushed);
    }

    if num == 0 || shared.num_writing.load(Ordering::Relaxed) > 0 {
        return;
    }

    // second pass: flush dirty pieces regardless of hash progress
    for key in &keys {
        if num == 0 {
            return;
        }
        let flushable = match cache.find(key) {
            Some(pe) => pe.num_dirty > 0 && !pe.hashing,
            None => false,
        };
        if !flushable {
            continue;
        }
        cache.pin(key);
        let flushed = flush_range(shared, cache, *key, 0, usize::MAX, completed);
        cache.unpin(key);
        num = num.saturating_sub(flushed);
    }
}

#[derive(Clone, Copy, PartialEq)]
enum FlushMode {
    /// Flush dirty blocks.
    Write,
    /// Drop dirty blocks and abort their jobs.
    Delete,
    /// Flush dirty blocks, then evict everything.
    ReadAndWrite,
}

fn flush_cache_mode(
    shared: &Arc<Shared>,
    cache: &mut MutexGuard<'_, BlockCache>,
    storage: Option<u32>,
    mode: FlushMode,
    completed: &mut Vec<Job>,
) {
    let keys = match storage {
        Some(id) => cache.storage_keys(id),
        None => cache.keys(),
    };

    for key in keys {
        match mode {
            FlushMode::Delete => {
                let mut drained = Vec::new();
                cache.abort_dirty(&key, &mut drained);
                cache.mark_for_deletion(&key, &mut drained);
                for mut job in drained {
                    job.error = Some(DiskError::OperationAborted);
                    completed.push(job);
                }
            }
            FlushMode::Write | FlushMode::ReadAndWrite => {
                if cache.find(&key).map(|p| p.num_dirty > 0).unwrap_or(false) {
                    flush_range(shared, cache, key, 0, usize::MAX, completed);
                }
                if mode == FlushMode::ReadAndWrite {
                    let mut drained = Vec::new();
                    cache.evict_piece(&key, &mut drained);
                    for mut job in drained {
                        job.error = Some(DiskError::OperationAborted);
                        completed.push(job);
                    }
                }
            }
        }
    }
}

// ----- hashing -----

/// Advances the hash cursor over contiguous resident blocks, hashing
/// outside the cache lock. Completed hash jobs parked on the piece are
/// pushed into `completed`.
fn kick_hasher(cache: &mut MutexGuard<'_, BlockCache>, key: PieceKey, completed: &mut Vec<Job>) {
    let (mut cursor, bufs, piece_size) = {
        let Some(pe) = cache.find_mut(&key) else {
            return;
        };
        if pe.hashing || pe.hash.is_none() {
            return;
        }
        let piece_size = pe.piece_size;
        let cursor_ref = pe.hash.as_ref().expect("checked above");
        if cursor_ref.offset >= piece_size {
            return;
        }

        let mut bufs = Vec::new();
        for i in cursor_ref.cursor_block()..pe.blocks_in_piece() {
            match &pe.blocks[i].buf {
                Some(buf) => bufs.push(buf.clone()),
                None => break,
            }
        }
        if bufs.is_empty() {
            return;
        }
        pe.hashing = true;
        (pe.hash.take().expect("checked above"), bufs, piece_size)
    };

    MutexGuard::unlocked(cache, || {
        for buf in &bufs {
            let len = (piece_size - cursor.offset).min(BLOCK_SIZE as u32);
            cursor.hasher.update(&buf[..len as usize]);
            cursor.offset += len;
        }
    });

    let pe = cache
        .find_mut(&key)
        .expect("hashing flag pins the piece in cache");
    pe.hashing = false;

    if cursor.offset == piece_size && pe.jobs.iter().any(|j| j.action == JobAction::Hash) {
        let digest = cursor.finalize();
        let parked = std::mem::take(&mut pe.jobs);
        for mut job in parked {
            if job.action == JobAction::Hash {
                job.result = JobResult::Hash(digest);
                completed.push(job);
            } else {
                pe.jobs.push_back(job);
            }
        }
        if pe.state != CacheState::VolatileReadLru {
            pe.hashing_done = true;
        }
        pe.hash = None;
    } else {
        pe.hash = Some(cursor);
    }
}

fn do_hash(shared: &Arc<Shared>, mut job: Job) -> Outcome {
    let settings = shared.settings.read().clone();
    let storage = job.storage.clone().expect("hash jobs carry a storage");
    if settings.cache_size == 0 {
        return do_uncached_hash(shared, job);
    }

    let key = (storage.id(), job.piece);
    let piece_size = storage.backend().piece_size(job.piece);
    let volatile = job.flags.contains(JobFlags::VOLATILE_READ);
    let mut completed = Vec::new();

    let mut cache = shared.cache.lock();

    if cache.find(&key).is_none() && !settings.use_read_cache {
        // already flushed and the read cache is off: hash from disk
        drop(cache);
        complete_all(shared, completed);
        return do_uncached_hash(shared, job);
    }

    let state = if volatile {
        CacheState::VolatileReadLru
    } else {
        CacheState::ReadLru1
    };
    cache.allocate_piece(&storage, job.piece, state, Instant::now());
    cache.record_hit(key);
    cache.pin(&key);
    kick_hasher(&mut cache, key, &mut completed);

    {
        let pe = cache.find_mut(&key).expect("pinned");
        if pe.hashing {
            // another thread holds the cursor; try again shortly
            drop(pe);
            cache.unpin(&key);
            drop(cache);
            complete_all(shared, completed);
            return Outcome::Retry(job);
        }
        if pe.hash.is_none() {
            pe.hashing_done = false;
            pe.hash = Some(HashCursor::new());
        }
        let done = pe.hash.as_ref().expect("just ensured").offset >= piece_size;
        if done {
            let digest = pe.hash.take().expect("just ensured").finalize();
            if pe.state != CacheState::VolatileReadLru {
                pe.hashing_done = true;
            }
            cache.unpin(&key);
            drop(cache);
            complete_all(shared, completed);
            shared.counters.hashes.fetch_add(1, Ordering::Relaxed);
            job.result = JobResult::Hash(digest);
            return Outcome::Done(job);
        }
        pe.hashing = true;
    }

    let mut cursor = {
        let pe = cache.find_mut(&key).expect("pinned");
        pe.hash.take().expect("ensured above")
    };

    // hash the remainder, reading back blocks the cache no longer holds
    let mut error: Option<DiskError> = None;
    while cursor.offset < piece_size {
        let index = cursor.cursor_block();
        let len = (piece_size - cursor.offset).min(BLOCK_SIZE as u32);
        let resident = cache
            .find(&key)
            .and_then(|pe| pe.blocks[index].buf.clone());

        match resident {
            Some(buf) => {
                MutexGuard::unlocked(&mut cache, || {
                    cursor.hasher.update(&buf[..len as usize]);
                });
                cursor.offset += len;
            }
            None => {
                let mut buf = match cache.pool().allocate() {
                    Ok(b) => b,
                    Err(e) => {
                        error = Some(e);
                        break;
                    }
                };
                buf.resize(len as usize, 0);
                let mut read_result = Ok(0);
                MutexGuard::unlocked(&mut cache, || {
                    let offset = cursor.offset;
                    let mut slices = [&mut buf[..]];
                    read_result = storage.backend().readv(job.piece, offset, &mut slices);
                    if read_result.is_ok() {
                        cursor.hasher.update(&buf[..]);
                    }
                });
                match read_result {
                    Err(e) => {
                        cache.pool().recycle(buf);
                        error = Some(e);
                        break;
                    }
                    Ok(_) => {
                        shared.counters.blocks_read.fetch_add(1, Ordering::Relaxed);
                        cursor.offset += len;
                        cache.insert_blocks(&key, index, vec![buf.freeze()]);
                    }
                }
            }
        }
    }

    let outcome = match error {
        None => {
            {
                let pe = cache.find_mut(&key).expect("pinned");
                pe.hashing = false;
                if pe.state != CacheState::VolatileReadLru {
                    pe.hashing_done = true;
                }
            }
            cache.unpin(&key);
            drop(cache);
            shared.counters.hashes.fetch_add(1, Ordering::Relaxed);
            job.result = JobResult::Hash(cursor.finalize());
            Outcome::Done(job)
        }
        Some(e) => {
            // keep the partial cursor so a retry can resume
            {
                let pe = cache.find_mut(&key).expect("pinned");
                pe.hashing = false;
                pe.hash = Some(cursor);
            }
            cache.unpin(&key);
            drop(cache);
            job.error = Some(e);
            Outcome::Done(job)
        }
    };
    complete_all(shared, completed);
    outcome
}

fn do_uncached_hash(shared: &Arc<Shared>, mut job: Job) -> Outcome {
    let storage = job.storage.clone().expect("hash jobs carry a storage");
    let piece_size = storage.backend().piece_size(job.piece);

    let mut buf = match shared.pool.allocate() {
        Ok(b) => b,
        Err(e) => {
            job.error = Some(e);
            return Outcome::Done(job);
        }
    };

    let mut cursor = HashCursor::new();
    while cursor.offset < piece_size {
        let len = (piece_size - cursor.offset).min(BLOCK_SIZE as u32);
        buf.resize(len as usize, 0);
        let result = {
            let mut slices = [&mut buf[..]];
            storage
                .backend()
                .readv(job.piece, cursor.offset, &mut slices)
        };
        if let Err(e) = result {
            shared.pool.recycle(buf);
            job.error = Some(e);
            return Outcome::Done(job);
        }
        cursor.hasher.update(&buf[..]);
        cursor.offset += len;
    }
    shared.pool.recycle(buf);
    shared.counters.hashes.fetch_add(1, Ordering::Relaxed);
    job.result = JobResult::Hash(cursor.finalize());
    Outcome::Done(job)
}

fn do_cache_piece(shared: &Arc<Shared>, mut job: Job) -> Outcome {
    let settings = shared.settings.read().clone();
    if settings.cache_size == 0 || !settings.use_read_cache {
        return Outcome::Done(job);
    }
    let storage = job.storage.clone().expect("cache jobs carry a storage");
    let key = (storage.id(), job.piece);
    let piece_size = storage.backend().piece_size(job.piece);
    let volatile = job.flags.contains(JobFlags::VOLATILE_READ);

    let mut cache = shared.cache.lock();
    let state = if volatile {
        CacheState::VolatileReadLru
    } else {
        CacheState::ReadLru1
    };
    cache.allocate_piece(&storage, job.piece, state, Instant::now());
    cache.pin(&key);

    let blocks_in_piece = (piece_size as usize).div_ceil(BLOCK_SIZE);
    let mut error = None;
    for index in 0..blocks_in_piece {
        let resident = cache
            .find(&key)
            .map(|pe| pe.blocks[index].buf.is_some())
            .unwrap_or(true);
        if resident {
            continue;
        }
        let mut buf = match cache.pool().allocate() {
            Ok(b) => b,
            Err(e) => {
                error = Some(e);
                break;
            }
        };
        let start = index * BLOCK_SIZE;
        let len = (piece_size as usize - start).min(BLOCK_SIZE);
        buf.resize(len, 0);
        let mut read_result = Ok(0);
        MutexGuard::unlocked(&mut cache, || {
            let mut slices = [&mut buf[..]];
            read_result = storage
                .backend()
                .readv(job.piece, start as u32, &mut slices);
        });
        match read_result {
            Err(e) => {
                cache.pool().recycle(buf);
                error = Some(e);
                break;
            }
            Ok(_) => {
                shared.counters.blocks_read.fetch_add(1, Ordering::Relaxed);
                cache.insert_blocks(&key, index, vec![buf.freeze()]);
            }
        }
    }
    cache.unpin(&key);
    drop(cache);

    job.error = error;
    Outcome::Done(job)
}

// ----- flush job handlers -----

fn do_flush_piece(shared: &Arc<Shared>, job: Job) -> Outcome {
    let settings = shared.settings.read().clone();
    let storage = job.storage.clone().expect("flush jobs carry a storage");
    let key = (storage.id(), job.piece);
    let mut completed = Vec::new();
    {
        let mut cache = shared.cache.lock();
        if cache.find(&key).is_some() {
            try_flush_hashed(
                shared,
                &mut cache,
                key,
                settings.write_cache_line_size,
                &settings,
                &mut completed,
            );
        }
    }
    complete_all(shared, completed);
    Outcome::Done(job)
}

/// Runs on every first dirty block of a piece: progresses the hash cursor
/// and flushes if the piece now satisfies the flush condition.
fn do_flush_hashed(shared: &Arc<Shared>, job: Job) -> Outcome {
    let settings = shared.settings.read().clone();
    let storage = job.storage.clone().expect("flush jobs carry a storage");
    let key = (storage.id(), job.piece);
    let mut completed = Vec::new();
    {
        let mut cache = shared.cache.lock();
        let ready = match cache.find_mut(&key) {
            None => false,
            Some(pe) => {
                pe.outstanding_flush = false;
                if pe.num_dirty == 0 {
                    false
                } else {
                    if !pe.hashing_done
                        && pe.hash.is_none()
                        && !settings.disable_hash_checks
                    {
                        pe.hash = Some(HashCursor::new());
                    }
                    true
                }
            }
        };
        if ready {
            cache.pin(&key);
            kick_hasher(&mut cache, key, &mut completed);
            try_flush_hashed(
                shared,
                &mut cache,
                key,
                settings.write_cache_line_size,
                &settings,
                &mut completed,
            );
            cache.unpin(&key);
        }
    }
    complete_all(shared, completed);
    Outcome::Done(job)
}

fn do_flush_storage(shared: &Arc<Shared>, job: Job) -> Outcome {
    let storage = job.storage.clone().expect("flush jobs carry a storage");
    let mut completed = Vec::new();
    {
        let mut cache = shared.cache.lock();
        flush_cache_mode(
            shared,
            &mut cache,
            Some(storage.id()),
            FlushMode::Write,
            &mut completed,
        );
    }
    complete_all(shared, completed);
    Outcome::Done(job)
}

/// Drops unpinned read blocks until the pool is back under its low
/// watermark.
fn do_trim_cache(shared: &Arc<Shared>, job: Job) -> Outcome {
    let mut completed = Vec::new();
    {
        let mut cache = shared.cache.lock();
        let target = cache.pool().low_watermark();
        let over = cache.pool().in_use().saturating_sub(target);
        if over > 0 {
            let mut drained = Vec::new();
            cache.try_evict_blocks(over, &mut drained);
            for mut j in drained {
                j.error = Some(DiskError::OperationAborted);
                completed.push(j);
            }
        }
    }
    complete_all(shared, completed);
    Outcome::Done(job)
}

// ----- fenced handlers -----

fn do_move_storage(mut job: Job) -> Outcome {
    let storage = job.storage.clone().expect("fenced jobs carry a storage");
    debug_assert_eq!(storage.outstanding_jobs(), 1);
    let path = match job.path.take() {
        Some(p) => p,
        None => {
            job.error = Some(DiskError::Write("move_storage without a path".into()));
            return Outcome::Done(job);
        }
    };
    if let Err(e) = storage.backend().move_storage(&path) {
        job.error = Some(e);
    }
    Outcome::Done(job)
}

fn do_release_files(shared: &Arc<Shared>, mut job: Job) -> Outcome {
    let storage = job.storage.clone().expect("fenced jobs carry a storage");
    let mut completed = Vec::new();
    {
        let mut cache = shared.cache.lock();
        flush_cache_mode(
            shared,
            &mut cache,
            Some(storage.id()),
            FlushMode::Write,
            &mut completed,
        );
    }
    complete_all(shared, completed);
    if let Err(e) = storage.backend().release_files() {
        job.error = Some(e);
    }
    Outcome::Done(job)
}

fn do_delete_files(shared: &Arc<Shared>, mut job: Job) -> Outcome {
    let storage = job.storage.clone().expect("fenced jobs carry a storage");
    let mut completed = Vec::new();
    {
        let mut cache = shared.cache.lock();
        flush_cache_mode(
            shared,
            &mut cache,
            Some(storage.id()),
            FlushMode::Delete,
            &mut completed,
        );
    }
    abort_all(shared, completed);
    if let Err(e) = storage.backend().delete_files() {
        job.error = Some(e);
    }
    Outcome::Done(job)
}

fn do_check_fastresume(mut job: Job) -> Outcome {
    let storage = job.storage.clone().expect("fenced jobs carry a storage");
    debug_assert_eq!(storage.outstanding_jobs(), 1);
    if let Err(e) = storage.backend().check_fastresume(job.resume.as_ref()) {
        job.error = Some(e);
    }
    Outcome::Done(job)
}

fn do_save_resume_data(shared: &Arc<Shared>, mut job: Job) -> Outcome {
    let storage = job.storage.clone().expect("fenced jobs carry a storage");
    let mut completed = Vec::new();
    {
        let mut cache = shared.cache.lock();
        flush_cache_mode(
            shared,
            &mut cache,
            Some(storage.id()),
            FlushMode::Write,
            &mut completed,
        );
    }
    complete_all(shared, completed);
    match storage.backend().write_resume_data() {
        Ok(resume) => job.result = JobResult::ResumeData(resume),
        Err(e) => job.error = Some(e),
    }
    Outcome::Done(job)
}

fn do_rename_file(mut job: Job) -> Outcome {
    let storage = job.storage.clone().expect("fenced jobs carry a storage");
    let name = match job.name.take() {
        Some(n) => n,
        None => {
            job.error = Some(DiskError::RenameFile("missing target name".into()));
            return Outcome::Done(job);
        }
    };
    if let Err(e) = storage.backend().rename_file(job.file, &name) {
        job.error = Some(e);
    }
    Outcome::Done(job)
}

fn do_stop_torrent(shared: &Arc<Shared>, mut job: Job) -> Outcome {
    let storage = job.storage.clone().expect("fenced jobs carry a storage");
    let mut completed = Vec::new();
    {
        let mut cache = shared.cache.lock();
        flush_cache_mode(
            shared,
            &mut cache,
            Some(storage.id()),
            FlushMode::ReadAndWrite,
            &mut completed,
        );
    }
    complete_all(shared, completed);
    if let Err(e) = storage.backend().release_files() {
        job.error = Some(e);
    }
    Outcome::Done(job)
}

fn do_file_priority(mut job: Job) -> Outcome {
    let storage = job.storage.clone().expect("fenced jobs carry a storage");
    let priorities = job.priorities.take().unwrap_or_default();
    if let Err(e) = storage.backend().set_file_priority(&priorities) {
        job.error = Some(e);
    }
    Outcome::Done(job)
}

fn do_finalize_file(mut job: Job) -> Outcome {
    let storage = job.storage.clone().expect("finalize jobs carry a storage");
    if let Err(e) = storage.backend().finalize_file(job.file) {
        job.error = Some(e);
    }
    Outcome::Done(job)
}

fn do_load_torrent(mut job: Job) -> Outcome {
    let path = match job.path.take() {
        Some(p) => p,
        None => {
            job.error = Some(DiskError::FileOpen("load_torrent without a path".into()));
            return Outcome::Done(job);
        }
    };
    match std::fs::read(&path) {
        Err(e) => job.error = Some(DiskError::open(e)),
        Ok(data) => match bencode::decode(&data) {
            Ok(value) => job.result = JobResult::Torrent(value),
            Err(e) => job.error = Some(DiskError::Read(format!("torrent decode: {}", e))),
        },
    }
    Outcome::Done(job)
}

/// Fenced: evicts a piece entirely, hash state included. A piece that
/// still has pinned or in-flight blocks is retried rather than leaking the
/// state.
fn do_clear_piece(shared: &Arc<Shared>, job: Job) -> Outcome {
    let storage = job.storage.clone().expect("fenced jobs carry a storage");
    let key = (storage.id(), job.piece);
    let mut aborted = Vec::new();
    let evicted = {
        let mut cache = shared.cache.lock();
        let prepared = match cache.find_mut(&key) {
            None => Some(true),
            Some(pe) => {
                if pe.hashing {
                    Some(false)
                } else {
                    pe.hashing_done = false;
                    pe.hash = None;
                    pe.marked_for_deletion = true;
                    None
                }
            }
        };
        match prepared {
            Some(done) => done,
            None => cache.evict_piece(&key, &mut aborted),
        }
    };
    abort_all(shared, aborted);
    if evicted {
        Outcome::Done(job)
    } else {
        Outcome::Retry(job)
    }
}

fn do_tick(mut job: Job) -> Outcome {
    let storage = job.storage.clone().expect("tick jobs carry a storage");
    if let Err(e) = storage.backend().tick() {
        job.error = Some(e);
    }
    Outcome::Done(job)
}
