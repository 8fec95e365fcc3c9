use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Instant;

use bytes::{Bytes, BytesMut};
use sha1::{Digest, Sha1};
use tracing::trace;

use super::backend::Storage;
use super::buffer::BufferPool;
use super::job::{Job, JobFlags};
use super::BLOCK_SIZE;

/// Cache identity of a piece: (storage id, piece index).
pub(crate) type PieceKey = (u32, u32);

/// Position of a piece on the 2Q ladder.
///
/// Dirty pieces live in `WriteLru` and return to the read ladder after
/// flushing. A miss enters `ReadLru1`; a second hit promotes to `ReadLru2`.
/// The ghost states hold metadata only (no buffers) so that re-entry within
/// the ghost window is promoted immediately.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum CacheState {
    WriteLru,
    VolatileReadLru,
    ReadLru1,
    ReadLru2,
    ReadLru1Ghost,
    ReadLru2Ghost,
}

impl CacheState {
    fn index(self) -> usize {
        match self {
            CacheState::WriteLru => 0,
            CacheState::VolatileReadLru => 1,
            CacheState::ReadLru1 => 2,
            CacheState::ReadLru2 => 3,
            CacheState::ReadLru1Ghost => 4,
            CacheState::ReadLru2Ghost => 5,
        }
    }

    pub fn is_ghost(self) -> bool {
        matches!(self, CacheState::ReadLru1Ghost | CacheState::ReadLru2Ghost)
    }
}

/// One block slot of a cached piece.
#[derive(Default)]
pub(crate) struct Block {
    pub buf: Option<Bytes>,
    /// Written by a client, not yet persisted.
    pub dirty: bool,
    /// Currently inside a writev.
    pub pending: bool,
}

/// Incremental SHA-1 over a piece. `offset` is always block-aligned except
/// when it has consumed a short final block.
pub(crate) struct HashCursor {
    pub hasher: Sha1,
    pub offset: u32,
}

impl HashCursor {
    pub fn new() -> Self {
        Self {
            hasher: Sha1::new(),
            offset: 0,
        }
    }

    pub fn cursor_block(&self) -> usize {
        self.offset as usize / BLOCK_SIZE
    }

    pub fn finalize(&self) -> [u8; 20] {
        self.hasher.clone().finalize().into()
    }
}

pub(crate) struct PieceEntry {
    pub storage: Arc<Storage>,
    pub piece: u32,
    pub piece_size: u32,
    pub blocks: Vec<Block>,
    /// Count of blocks with `dirty && !pending`; recomputable from
    /// `blocks`.
    pub num_dirty: usize,
    /// Pin count: a pinned piece is never evicted.
    pub refcount: u32,
    pub hash: Option<HashCursor>,
    /// A worker holds the cursor outside the lock right now.
    pub hashing: bool,
    /// The full piece hash has been produced; new dirty blocks are refused
    /// until the piece is cleared.
    pub hashing_done: bool,
    /// Flushed with an incomplete hash; hashing will have to read back.
    pub need_readback: bool,
    /// A flush-hashed job for this piece is already queued.
    pub outstanding_flush: bool,
    pub marked_for_deletion: bool,
    pub state: CacheState,
    /// Last-use stamp driving expiry flushes.
    pub expire: Instant,
    /// Jobs parked on this piece (writes until their block flushes, hash
    /// jobs until the cursor completes).
    pub jobs: VecDeque<Job>,
}

impl PieceEntry {
    pub fn blocks_in_piece(&self) -> usize {
        self.blocks.len()
    }

    pub fn has_pending(&self) -> bool {
        self.blocks.iter().any(|b| b.pending)
    }

    fn resident_blocks(&self) -> usize {
        self.blocks.iter().filter(|b| b.buf.is_some()).count()
    }

    /// Hash progress in whole blocks, rounding a short final block up.
    pub fn hash_cursor_block(&self) -> usize {
        match &self.hash {
            Some(h) => (h.offset as usize).div_ceil(BLOCK_SIZE),
            None => 0,
        }
    }
}

pub(crate) enum TryRead {
    Hit(Bytes),
    Miss,
}

/// Page-cache-like structure mapping `(storage, piece)` to block arrays.
///
/// All mutation happens under the disk subsystem's cache mutex; the methods
/// here assume the caller holds it.
pub(crate) struct BlockCache {
    pieces: HashMap<PieceKey, PieceEntry>,
    /// One ordered key list per `CacheState`.
    lru: [VecDeque<PieceKey>; 6],
    pool: Arc<BufferPool>,
    ghost_capacity: usize,
}

impl BlockCache {
    pub fn new(pool: Arc<BufferPool>) -> Self {
        let ghost_capacity = (pool.limit() / 4).max(8);
        Self {
            pieces: HashMap::new(),
            lru: Default::default(),
            pool,
            ghost_capacity,
        }
    }

    pub fn pool(&self) -> &Arc<BufferPool> {
        &self.pool
    }

    pub fn find(&self, key: &PieceKey) -> Option<&PieceEntry> {
        self.pieces.get(key).filter(|pe| !pe.state.is_ghost())
    }

    pub fn find_mut(&mut self, key: &PieceKey) -> Option<&mut PieceEntry> {
        self.pieces.get_mut(key).filter(|pe| !pe.state.is_ghost())
    }

    pub fn num_pieces(&self) -> usize {
        self.pieces.len()
    }

    pub fn keys(&self) -> Vec<PieceKey> {
        self.pieces.keys().copied().collect()
    }

    pub fn storage_keys(&self, storage: u32) -> Vec<PieceKey> {
        self.pieces
            .keys()
            .filter(|(s, _)| *s == storage)
            .copied()
            .collect()
    }

    /// Write-LRU keys, oldest first.
    pub fn write_lru_pieces(&self) -> Vec<PieceKey> {
        self.lru[CacheState::WriteLru.index()]
            .iter()
            .copied()
            .collect()
    }

    fn lru_remove(&mut self, state: CacheState, key: &PieceKey) {
        self.lru[state.index()].retain(|k| k != key);
    }

    fn lru_push(&mut self, state: CacheState, key: PieceKey) {
        self.lru[state.index()].push_back(key);
    }

    fn set_state(&mut self, key: PieceKey, to: CacheState) {
        if let Some(pe) = self.pieces.get_mut(&key) {
            let from = pe.state;
            if from == to {
                return;
            }
            pe.state = to;
            self.lru_remove(from, &key);
            self.lru_push(to, key);
        }
    }

    /// Finds the piece or creates it in the given state. A ghost entry is
    /// revived with an immediate promotion to `ReadLru2`.
    pub fn allocate_piece(
        &mut self,
        storage: &Arc<Storage>,
        piece: u32,
        state: CacheState,
        now: Instant,
    ) -> PieceKey {
        let key = (storage.id(), piece);

        if let Some(pe) = self.pieces.get_mut(&key) {
            if pe.state.is_ghost() {
                trace!(piece, "reviving ghost piece");
                pe.expire = now;
                let promoted = if state == CacheState::WriteLru {
                    CacheState::WriteLru
                } else {
                    CacheState::ReadLru2
                };
                self.set_state(key, promoted);
            }
            return key;
        }

        let piece_size = storage.backend().piece_size(piece);
        let blocks_in_piece = (piece_size as usize).div_ceil(BLOCK_SIZE);
        let mut blocks = Vec::with_capacity(blocks_in_piece);
        blocks.resize_with(blocks_in_piece, Block::default);

        let pe = PieceEntry {
            storage: storage.clone(),
            piece,
            piece_size,
            blocks,
            num_dirty: 0,
            refcount: 0,
            hash: None,
            hashing: false,
            hashing_done: false,
            need_readback: false,
            outstanding_flush: false,
            marked_for_deletion: false,
            state,
            expire: now,
            jobs: VecDeque::new(),
        };
        self.pieces.insert(key, pe);
        self.lru_push(state, key);
        key
    }

    /// Inserts a write job's payload into its block slot and parks the job
    /// on the piece. Fails (returning the job) when the slot is occupied or
    /// the piece already finished hashing.
    pub fn add_dirty_block(&mut self, mut job: Job, now: Instant) -> Result<PieceKey, Job> {
        let storage = match &job.storage {
            Some(s) => s.clone(),
            None => return Err(job),
        };
        let key = self.allocate_piece(&storage, job.piece, CacheState::WriteLru, now);
        let pe = self.pieces.get_mut(&key).expect("just allocated");

        let index = job.block_index();
        if index >= pe.blocks.len() || pe.blocks[index].buf.is_some() || pe.hashing_done {
            return Err(job);
        }

        let buf = match job.buffer.take() {
            Some(b) => b,
            None => return Err(job),
        };

        pe.blocks[index] = Block {
            buf: Some(buf),
            dirty: true,
            pending: false,
        };
        pe.num_dirty += 1;
        pe.expire = now;
        job.flags.insert(JobFlags::IN_PROGRESS);
        pe.jobs.push_back(job);
        self.pool.charge(1);

        // writes keep the piece hot
        let state = pe.state;
        if state == CacheState::WriteLru {
            self.lru_remove(state, &key);
            self.lru_push(state, key);
        } else {
            self.set_state(key, CacheState::WriteLru);
        }
        Ok(key)
    }

    /// Serves a contiguous read from cached blocks if every covering block
    /// is resident.
    pub fn try_read(&mut self, key: &PieceKey, offset: u32, length: u32, now: Instant) -> TryRead {
        let Some(pe) = self.pieces.get_mut(key) else {
            return TryRead::Miss;
        };
        if pe.state.is_ghost() || length == 0 {
            return TryRead::Miss;
        }
        if offset + length > pe.piece_size {
            return TryRead::Miss;
        }

        let first = offset as usize / BLOCK_SIZE;
        let last = (offset + length - 1) as usize / BLOCK_SIZE;
        for index in first..=last {
            if pe.blocks[index].buf.is_none() {
                return TryRead::Miss;
            }
        }

        let data = if first == last {
            let block = pe.blocks[first].buf.as_ref().expect("checked resident");
            let start = offset as usize - first * BLOCK_SIZE;
            block.slice(start..start + length as usize)
        } else {
            let mut out = BytesMut::with_capacity(length as usize);
            let mut pos = offset as usize;
            let end = (offset + length) as usize;
            for index in first..=last {
                let block = pe.blocks[index].buf.as_ref().expect("checked resident");
                let block_start = index * BLOCK_SIZE;
                let from = pos - block_start;
                let to = (end - block_start).min(block.len());
                out.extend_from_slice(&block[from..to]);
                pos = block_start + to;
            }
            out.freeze()
        };

        pe.expire = now;
        self.record_hit(*key);
        TryRead::Hit(data)
    }

    /// LRU accounting for a cache hit: a second touch promotes `ReadLru1`
    /// to `ReadLru2`; everything else just moves to the back of its list.
    pub fn record_hit(&mut self, key: PieceKey) {
        let Some(pe) = self.pieces.get_mut(&key) else {
            return;
        };
        match pe.state {
            CacheState::ReadLru1 => self.set_state(key, CacheState::ReadLru2),
            state => {
                self.lru_remove(state, &key);
                self.lru_push(state, key);
            }
        }
    }

    /// Installs freshly read blocks starting at `first_block`. Buffers must
    /// already be charged to the pool; slots that filled up in the meantime
    /// release their duplicate.
    pub fn insert_blocks(&mut self, key: &PieceKey, first_block: usize, bufs: Vec<Bytes>) {
        let Some(pe) = self.pieces.get_mut(key) else {
            self.pool.released(bufs.len());
            return;
        };
        let mut dropped = 0;
        for (i, buf) in bufs.into_iter().enumerate() {
            let index = first_block + i;
            if index >= pe.blocks.len() || pe.blocks[index].buf.is_some() {
                dropped += 1;
                continue;
            }
            pe.blocks[index] = Block {
                buf: Some(buf),
                dirty: false,
                pending: false,
            };
        }
        if dropped > 0 {
            self.pool.released(dropped);
        }
    }

    /// Marks a run of blocks as persisted and completes write jobs whose
    /// block is now clean. Returns the completed jobs.
    pub fn blocks_flushed(&mut self, key: &PieceKey, flushed: &[usize], now: Instant) -> Vec<Job> {
        let Some(pe) = self.pieces.get_mut(key) else {
            return Vec::new();
        };

        // num_dirty was already decremented when these went pending
        for &index in flushed {
            let block = &mut pe.blocks[index];
            debug_assert!(block.pending && block.dirty);
            block.pending = false;
            block.dirty = false;
        }
        pe.expire = now;

        let mut completed = Vec::new();
        let parked = std::mem::take(&mut pe.jobs);
        for job in parked {
            let index = job.block_index();
            let done = job.action == super::job::JobAction::Write
                && !pe.blocks[index].dirty
                && !pe.blocks[index].pending;
            if done {
                completed.push(job);
            } else {
                pe.jobs.push_back(job);
            }
        }

        if pe.num_dirty == 0 && pe.state == CacheState::WriteLru && !pe.has_pending() {
            self.set_state(*key, CacheState::ReadLru1);
        }
        completed
    }

    /// Rolls back a failed flush: pending blocks stay dirty so a retry is
    /// possible. Every job parked on the piece fails with the error.
    pub fn flush_failed(&mut self, key: &PieceKey, flushed: &[usize]) -> Vec<Job> {
        let Some(pe) = self.pieces.get_mut(key) else {
            return Vec::new();
        };
        for &index in flushed {
            pe.blocks[index].pending = false;
            pe.num_dirty += 1;
        }
        pe.jobs.drain(..).collect()
    }

    /// Evicts a piece iff it is unpinned and quiescent, moving a read piece
    /// to the matching ghost state. Jobs parked on it are drained into
    /// `out`.
    pub fn evict_piece(&mut self, key: &PieceKey, out: &mut Vec<Job>) -> bool {
        let Some(pe) = self.pieces.get_mut(key) else {
            return true;
        };
        if pe.state.is_ghost() {
            return true;
        }
        if pe.refcount > 0 || pe.hashing || pe.has_pending() {
            return false;
        }
        if pe.num_dirty > 0 && !pe.marked_for_deletion {
            return false;
        }

        let resident = pe.resident_blocks();
        for block in pe.blocks.iter_mut() {
            *block = Block::default();
        }
        pe.num_dirty = 0;
        pe.hash = None;
        out.extend(pe.jobs.drain(..));
        if resident > 0 {
            self.pool.released(resident);
        }

        let pe = self.pieces.get_mut(key).expect("still present");
        let from = pe.state;
        if pe.marked_for_deletion || from == CacheState::VolatileReadLru {
            pe.marked_for_deletion = false;
            self.lru_remove(from, key);
            self.pieces.remove(key);
        } else {
            let ghost = match from {
                CacheState::ReadLru2 => CacheState::ReadLru2Ghost,
                _ => CacheState::ReadLru1Ghost,
            };
            self.set_state(*key, ghost);
            self.trim_ghosts(ghost);
        }
        true
    }

    fn trim_ghosts(&mut self, state: CacheState) {
        while self.lru[state.index()].len() > self.ghost_capacity {
            if let Some(key) = self.lru[state.index()].pop_front() {
                self.pieces.remove(&key);
            }
        }
    }

    /// Number of blocks that must leave the cache for `extra` new ones to
    /// fit under the limit.
    pub fn num_to_evict(&self, extra: usize) -> usize {
        (self.pool.in_use() + extra).saturating_sub(self.pool.limit())
    }

    /// Walks the read ladders oldest-first, evicting unpinned pieces until
    /// `n` blocks have been freed. Returns the shortfall.
    pub fn try_evict_blocks(&mut self, mut n: usize, out: &mut Vec<Job>) -> usize {
        for state in [
            CacheState::VolatileReadLru,
            CacheState::ReadLru1,
            CacheState::ReadLru2,
        ] {
            if n == 0 {
                break;
            }
            let keys: Vec<PieceKey> = self.lru[state.index()].iter().copied().collect();
            for key in keys {
                if n == 0 {
                    break;
                }
                let freed = self
                    .pieces
                    .get(&key)
                    .map(|pe| pe.resident_blocks())
                    .unwrap_or(0);
                if freed == 0 {
                    continue;
                }
                if self.evict_piece(&key, out) {
                    n = n.saturating_sub(freed);
                }
            }
        }
        n
    }

    /// Flags a piece so the next eviction drops it entirely (dirty blocks
    /// included) and tries to evict it now.
    pub fn mark_for_deletion(&mut self, key: &PieceKey, out: &mut Vec<Job>) {
        if let Some(pe) = self.pieces.get_mut(key) {
            pe.marked_for_deletion = true;
        }
        self.evict_piece(key, out);
    }

    /// Drops dirty, non-pending buffers without persisting them. Parked
    /// jobs are drained into `out` for abortion.
    pub fn abort_dirty(&mut self, key: &PieceKey, out: &mut Vec<Job>) {
        let Some(pe) = self.pieces.get_mut(key) else {
            return;
        };
        let mut freed = 0;
        for block in pe.blocks.iter_mut() {
            if block.dirty && !block.pending {
                *block = Block::default();
                freed += 1;
            }
        }
        pe.num_dirty = 0;
        pe.hash = None;
        pe.hashing_done = false;
        out.extend(pe.jobs.drain(..));
        if freed > 0 {
            self.pool.released(freed);
        }
    }

    /// Expands a single-block read into an aligned read-ahead of
    /// `cache_line` blocks. Returns `(first_block, block_count)`.
    pub fn pad_read(
        &self,
        piece_size: u32,
        offset: u32,
        length: u32,
        cache_line: u32,
    ) -> (usize, usize) {
        let blocks_in_piece = (piece_size as usize).div_ceil(BLOCK_SIZE);
        let first = offset as usize / BLOCK_SIZE;
        let last = ((offset + length).saturating_sub(1)) as usize / BLOCK_SIZE;
        let line = (cache_line.max(1)) as usize;

        let start = first - (first % line);
        let end = (start + line.max(last - start + 1)).min(blocks_in_piece);
        (start, end - start)
    }

    /// Drops every piece, draining all parked jobs.
    pub fn clear(&mut self) -> Vec<Job> {
        let mut out = Vec::new();
        let mut freed = 0;
        for (_, pe) in self.pieces.iter_mut() {
            freed += pe.resident_blocks();
            out.extend(pe.jobs.drain(..));
        }
        self.pieces.clear();
        for list in self.lru.iter_mut() {
            list.clear();
        }
        if freed > 0 {
            self.pool.released(freed);
        }
        out
    }

    pub fn pin(&mut self, key: &PieceKey) {
        if let Some(pe) = self.pieces.get_mut(key) {
            pe.refcount += 1;
        }
    }

    pub fn unpin(&mut self, key: &PieceKey) {
        if let Some(pe) = self.pieces.get_mut(key) {
            debug_assert!(pe.refcount > 0);
            pe.refcount = pe.refcount.saturating_sub(1);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::disk::error::DiskError;
    use crate::disk::job::{Job, JobAction};
    use crate::disk::StorageBackend;

    struct NullBackend {
        piece_size: u32,
        pieces: u32,
    }

    impl StorageBackend for NullBackend {
        fn num_pieces(&self) -> u32 {
            self.pieces
        }

        fn piece_size(&self, _piece: u32) -> u32 {
            self.piece_size
        }

        fn readv(
            &self,
            _piece: u32,
            _offset: u32,
            iov: &mut [&mut [u8]],
        ) -> Result<usize, DiskError> {
            Ok(iov.iter().map(|b| b.len()).sum())
        }

        fn writev(&self, _piece: u32, _offset: u32, iov: &[&[u8]]) -> Result<usize, DiskError> {
            Ok(iov.iter().map(|b| b.len()).sum())
        }
    }

    fn storage(piece_size: u32) -> Arc<Storage> {
        Storage::new(
            7,
            Box::new(NullBackend {
                piece_size,
                pieces: 8,
            }),
        )
    }

    fn cache() -> BlockCache {
        BlockCache::new(BufferPool::new(64))
    }

    fn write_job(storage: &Arc<Storage>, piece: u32, block_index: usize) -> Job {
        let mut job = Job::new(JobAction::Write, Some(storage.clone()));
        job.piece = piece;
        job.offset = (block_index * BLOCK_SIZE) as u32;
        job.length = BLOCK_SIZE as u32;
        job.buffer = Some(Bytes::from(vec![0xCD; BLOCK_SIZE]));
        job
    }

    #[test]
    fn test_add_dirty_block_tracks_num_dirty() {
        let mut cache = cache();
        let storage = storage(4 * BLOCK_SIZE as u32);
        let now = Instant::now();

        let key = cache
            .add_dirty_block(write_job(&storage, 0, 0), now)
            .unwrap();
        cache.add_dirty_block(write_job(&storage, 0, 2), now).unwrap();

        let pe = cache.find(&key).unwrap();
        assert_eq!(pe.num_dirty, 2);
        assert_eq!(pe.state, CacheState::WriteLru);
        assert_eq!(cache.pool().in_use(), 2);
    }

    #[test]
    fn test_add_dirty_block_rejects_occupied_slot() {
        let mut cache = cache();
        let storage = storage(4 * BLOCK_SIZE as u32);
        let now = Instant::now();

        cache.add_dirty_block(write_job(&storage, 0, 1), now).unwrap();
        assert!(cache.add_dirty_block(write_job(&storage, 0, 1), now).is_err());
    }

    #[test]
    fn test_pinned_piece_is_not_evicted() {
        let mut cache = cache();
        let storage = storage(2 * BLOCK_SIZE as u32);
        let now = Instant::now();

        let key = cache.allocate_piece(&storage, 3, CacheState::ReadLru1, now);
        cache.pool().charge(1);
        cache.insert_blocks(&key, 0, vec![Bytes::from(vec![1u8; BLOCK_SIZE])]);

        cache.pin(&key);
        let mut drained = Vec::new();
        assert!(!cache.evict_piece(&key, &mut drained));

        cache.unpin(&key);
        assert!(cache.evict_piece(&key, &mut drained));
        assert_eq!(cache.pool().in_use(), 0);
    }

    #[test]
    fn test_ghost_revival_promotes_to_lru2() {
        let mut cache = cache();
        let storage = storage(2 * BLOCK_SIZE as u32);
        let now = Instant::now();

        let key = cache.allocate_piece(&storage, 0, CacheState::ReadLru1, now);
        cache.pool().charge(1);
        cache.insert_blocks(&key, 0, vec![Bytes::from(vec![1u8; BLOCK_SIZE])]);

        let mut drained = Vec::new();
        assert!(cache.evict_piece(&key, &mut drained));
        assert!(cache.find(&key).is_none(), "ghosts are invisible to find");

        let revived = cache.allocate_piece(&storage, 0, CacheState::ReadLru1, now);
        assert_eq!(cache.find(&revived).unwrap().state, CacheState::ReadLru2);
    }

    #[test]
    fn test_try_read_needs_every_covering_block() {
        let mut cache = cache();
        let storage = storage(4 * BLOCK_SIZE as u32);
        let now = Instant::now();

        let key = cache.allocate_piece(&storage, 0, CacheState::ReadLru1, now);
        cache.pool().charge(1);
        cache.insert_blocks(&key, 1, vec![Bytes::from(vec![0xEE; BLOCK_SIZE])]);

        assert!(matches!(
            cache.try_read(&key, 0, BLOCK_SIZE as u32, now),
            TryRead::Miss
        ));
        match cache.try_read(&key, BLOCK_SIZE as u32, BLOCK_SIZE as u32, now) {
            TryRead::Hit(data) => assert!(data.iter().all(|&b| b == 0xEE)),
            TryRead::Miss => panic!("resident block should hit"),
        }
    }

    #[test]
    fn test_pad_read_aligns_to_cache_line() {
        let cache = cache();
        let piece_size = 8 * BLOCK_SIZE as u32;

        // block 5 with a 4-block line pads to blocks [4, 8)
        let (start, n) = cache.pad_read(piece_size, 5 * BLOCK_SIZE as u32, 100, 4);
        assert_eq!((start, n), (4, 4));

        // no padding past the end of the piece
        let (start, n) = cache.pad_read(piece_size, 7 * BLOCK_SIZE as u32, 100, 4);
        assert_eq!(start, 4);
        assert_eq!(start + n, 8);
    }

    #[test]
    fn test_blocks_flushed_moves_piece_to_read_lru() {
        let mut cache = cache();
        let storage = storage(2 * BLOCK_SIZE as u32);
        let now = Instant::now();

        let key = cache
            .add_dirty_block(write_job(&storage, 0, 0), now)
            .unwrap();
        cache.add_dirty_block(write_job(&storage, 0, 1), now).unwrap();

        let entries = {
            let pe = cache.find_mut(&key).unwrap();
            let mut out = Vec::new();
            for (i, block) in pe.blocks.iter_mut().enumerate() {
                block.pending = true;
                pe.num_dirty -= 1;
                out.push(i);
            }
            out
        };
        let completed = cache.blocks_flushed(&key, &entries, now);

        assert_eq!(completed.len(), 2, "both write jobs completed");
        let pe = cache.find(&key).unwrap();
        assert_eq!(pe.num_dirty, 0);
        assert_eq!(pe.state, CacheState::ReadLru1);
    }
}
