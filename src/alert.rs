//! Bounded event queue drained by the host.
//!
//! The disk and DHT subsystems post [`Alert`]s; the host drains them in
//! batches with [`AlertManager::get_all`]. The queue is bounded: beyond
//! capacity the oldest alerts are dropped and counted, so a stalled host
//! cannot make the engine grow without bound.

use std::collections::VecDeque;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::Notify;

use crate::disk::DiskError;

/// Events produced by the engine core.
#[derive(Debug, Clone)]
pub enum Alert {
    /// A disk job failed and its error was delivered to the host callback.
    DiskJobFailed { storage: u32, error: DiskError },
    /// The block cache crossed its high watermark; writers should hold off
    /// until pressure eases.
    CachePressure { in_use: usize, limit: usize },
    /// A peer told us our external address (the `ip` entry of a KRPC
    /// reply).
    ExternalAddress { address: IpAddr, from: SocketAddr },
    /// A DHT bootstrap traversal finished.
    DhtBootstrap { nodes: usize },
    /// A get-peers traversal produced peers for an info-hash.
    DhtPeers {
        info_hash: [u8; 20],
        peers: Vec<SocketAddr>,
    },
    /// An announce_peer round was sent to the closest nodes.
    DhtAnnounce { info_hash: [u8; 20], nodes: usize },
}

/// Bounded heterogeneous alert queue.
///
/// A single consumer (the host) drains the queue; any engine thread may
/// post. There is deliberately no synchronous dispatch hook: batching
/// through [`get_all`](Self::get_all) is the only delivery path.
pub struct AlertManager {
    inner: Mutex<Inner>,
    notify: Notify,
    capacity: usize,
}

struct Inner {
    queue: VecDeque<Alert>,
    dropped: u64,
}

impl AlertManager {
    pub fn new(capacity: usize) -> Arc<Self> {
        Arc::new(Self {
            inner: Mutex::new(Inner {
                queue: VecDeque::with_capacity(capacity.min(256)),
                dropped: 0,
            }),
            notify: Notify::new(),
            capacity,
        })
    }

    /// Posts an alert, dropping the oldest entry if the queue is full.
    pub fn post(&self, alert: Alert) {
        {
            let mut inner = self.inner.lock();
            if inner.queue.len() >= self.capacity {
                inner.queue.pop_front();
                inner.dropped += 1;
            }
            inner.queue.push_back(alert);
        }
        self.notify.notify_one();
    }

    /// Drains every queued alert.
    pub fn get_all(&self) -> Vec<Alert> {
        let mut inner = self.inner.lock();
        inner.queue.drain(..).collect()
    }

    /// Waits until at least one alert is queued, then drains the queue.
    pub async fn wait(&self) -> Vec<Alert> {
        loop {
            {
                let mut inner = self.inner.lock();
                if !inner.queue.is_empty() {
                    return inner.queue.drain(..).collect();
                }
            }
            self.notify.notified().await;
        }
    }

    /// Number of alerts discarded because the queue was full.
    pub fn dropped(&self) -> u64 {
        self.inner.lock().dropped
    }

    pub fn len(&self) -> usize {
        self.inner.lock().queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
