use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

use bytes::BytesMut;
use crossbeam::queue::ArrayQueue;
use parking_lot::Mutex;
use tracing::debug;

use super::error::DiskError;
use super::BLOCK_SIZE;

const FREE_LIST_CAP: usize = 256;

/// Notified when the buffer pool drops back below its watermark after
/// having reported pressure. The network layer typically registers one
/// observer per choked-on-disk peer.
pub trait DiskObserver: Send + Sync {
    fn on_disk_ready(&self);
}

/// Accounting and recycling for 16 KiB block buffers.
///
/// Every resident cache block and every scratch buffer handed to a worker
/// counts against `in_use`. Crossing `limit` flips the pool into the
/// exceeded state (back-pressure to callers of [`is_exceeded`]); the hard
/// cap beyond that returns [`DiskError::OutOfMemory`]. The slack between
/// the two absorbs in-flight read-ahead, so the cache bound is only ever
/// overshot for the duration of one flush round.
pub struct BufferPool {
    free: ArrayQueue<BytesMut>,
    in_use: AtomicUsize,
    limit: AtomicUsize,
    exceeded: AtomicBool,
    observers: Mutex<Vec<Weak<dyn DiskObserver>>>,
}

impl BufferPool {
    pub fn new(limit_blocks: usize) -> Arc<Self> {
        Arc::new(Self {
            free: ArrayQueue::new(FREE_LIST_CAP),
            in_use: AtomicUsize::new(0),
            limit: AtomicUsize::new(limit_blocks.max(8)),
            exceeded: AtomicBool::new(false),
            observers: Mutex::new(Vec::new()),
        })
    }

    fn hard_cap(&self) -> usize {
        let limit = self.limit.load(Ordering::Relaxed);
        limit + limit / 8 + 64
    }

    /// Hands out one block-sized buffer, or `OutOfMemory` past the hard
    /// cap.
    pub fn allocate(&self) -> Result<BytesMut, DiskError> {
        let in_use = self.in_use.fetch_add(1, Ordering::Relaxed) + 1;
        if in_use > self.hard_cap() {
            self.in_use.fetch_sub(1, Ordering::Relaxed);
            return Err(DiskError::OutOfMemory);
        }
        if in_use > self.limit.load(Ordering::Relaxed) {
            self.exceeded.store(true, Ordering::Relaxed);
        }
        let mut buf = self
            .free
            .pop()
            .unwrap_or_else(|| BytesMut::with_capacity(BLOCK_SIZE));
        buf.clear();
        Ok(buf)
    }

    /// Counts `n` externally produced buffers (e.g. write payloads moving
    /// into the cache) against the pool.
    pub fn charge(&self, n: usize) {
        let in_use = self.in_use.fetch_add(n, Ordering::Relaxed) + n;
        if in_use > self.limit.load(Ordering::Relaxed) {
            self.exceeded.store(true, Ordering::Relaxed);
        }
    }

    /// Returns a never-frozen scratch buffer to the free list.
    pub fn recycle(&self, buf: BytesMut) {
        let _ = self.free.push(buf);
        self.released(1);
    }

    /// Records that `n` block buffers were dropped (evicted or handed off).
    pub fn released(&self, n: usize) {
        let before = self.in_use.fetch_sub(n, Ordering::Relaxed);
        debug_assert!(before >= n);
        let now = before - n;
        if self.exceeded.load(Ordering::Relaxed) && now <= self.low_watermark() {
            self.exceeded.store(false, Ordering::Relaxed);
            self.notify_observers();
        }
    }

    pub fn in_use(&self) -> usize {
        self.in_use.load(Ordering::Relaxed)
    }

    pub fn limit(&self) -> usize {
        self.limit.load(Ordering::Relaxed)
    }

    pub fn set_limit(&self, limit_blocks: usize) {
        self.limit.store(limit_blocks.max(8), Ordering::Relaxed);
    }

    pub fn low_watermark(&self) -> usize {
        self.limit.load(Ordering::Relaxed) * 3 / 4
    }

    /// True while the pool sits above its configured limit. Callers should
    /// stop issuing writes and register an observer.
    pub fn is_exceeded(&self) -> bool {
        self.exceeded.load(Ordering::Relaxed)
    }

    pub fn subscribe(&self, observer: &Arc<dyn DiskObserver>) {
        self.observers.lock().push(Arc::downgrade(observer));
    }

    fn notify_observers(&self) {
        let mut observers = self.observers.lock();
        observers.retain(|w| {
            if let Some(o) = w.upgrade() {
                o.on_disk_ready();
                true
            } else {
                false
            }
        });
        debug!(observers = observers.len(), "buffer pressure eased");
    }
}
