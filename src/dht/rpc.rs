use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use bytes::Bytes;

use super::id::NodeId;

/// What an outstanding query was for, so a reply or timeout can be routed
/// to the right handler. The set is closed: each variant maps to one
/// query shape the node emits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObserverKind {
    /// Liveness probe (routing-table maintenance).
    Ping,
    /// get_peers probe refreshing one bucket.
    Refresh,
    /// Query issued on behalf of a traversal.
    Traversal,
    /// announce_peer follow-up after a get-peers traversal.
    Announce,
    /// put follow-up after a get-item traversal.
    Put,
}

/// Callback state for one outstanding query.
#[derive(Debug, Clone)]
pub struct Observer {
    pub kind: ObserverKind,
    /// Owning traversal, when `kind` is `Traversal`.
    pub traversal: Option<u32>,
    pub addr: SocketAddr,
    /// Queried node's id, when known at send time.
    pub node_id: Option<NodeId>,
    pub sent_at: Instant,
}

/// Table of outstanding transactions with their observers.
///
/// Transaction ids are two bytes, monotonically incrementing, so a stale
/// or forged reply matches nothing.
pub struct RpcManager {
    pending: HashMap<u16, Observer>,
    next_tid: u16,
    timeout: Duration,
}

impl RpcManager {
    pub fn new(timeout: Duration) -> Self {
        Self {
            pending: HashMap::new(),
            next_tid: rand::random(),
            timeout,
        }
    }

    /// Allocates a transaction id and registers the observer under it.
    pub fn register(&mut self, observer: Observer) -> Bytes {
        let tid = self.next_tid;
        self.next_tid = self.next_tid.wrapping_add(1);
        self.pending.insert(tid, observer);
        Bytes::copy_from_slice(&tid.to_be_bytes())
    }

    /// Resolves a reply's transaction id, removing and returning its
    /// observer. Replies from a different address than queried are
    /// rejected (reply spoofing).
    pub fn resolve(&mut self, tid: &[u8], from: &SocketAddr) -> Option<Observer> {
        if tid.len() != 2 {
            return None;
        }
        let tid = u16::from_be_bytes([tid[0], tid[1]]);
        let observer = self.pending.get(&tid)?;
        if observer.addr != *from {
            return None;
        }
        self.pending.remove(&tid)
    }

    /// Removes every observer whose query has outlived the timeout.
    /// Returns the expired observers and the delay until the next expiry.
    pub fn tick(&mut self, now: Instant) -> (Vec<Observer>, Duration) {
        let mut expired = Vec::new();
        let mut next = self.timeout;
        self.pending.retain(|_, observer| {
            let age = now.duration_since(observer.sent_at);
            if age >= self.timeout {
                expired.push(observer.clone());
                false
            } else {
                next = next.min(self.timeout - age);
                true
            }
        });
        (expired, next)
    }

    /// Fails every observer pointed at an endpoint the socket reported
    /// unreachable (ICMP error).
    pub fn unreachable(&mut self, addr: &SocketAddr) -> Vec<Observer> {
        let mut failed = Vec::new();
        self.pending.retain(|_, observer| {
            if observer.addr == *addr {
                failed.push(observer.clone());
                false
            } else {
                true
            }
        });
        failed
    }

    /// Drops observers belonging to a finished traversal.
    pub fn drop_traversal(&mut self, traversal: u32) {
        self.pending
            .retain(|_, observer| observer.traversal != Some(traversal));
    }

    pub fn num_pending(&self) -> usize {
        self.pending.len()
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{IpAddr, Ipv4Addr};

    fn addr(n: u8) -> SocketAddr {
        SocketAddr::new(IpAddr::V4(Ipv4Addr::new(192, 0, 2, n)), 6881)
    }

    fn observer(addr: SocketAddr, now: Instant) -> Observer {
        Observer {
            kind: ObserverKind::Ping,
            traversal: None,
            addr,
            node_id: None,
            sent_at: now,
        }
    }

    #[test]
    fn test_register_and_resolve() {
        let mut rpc = RpcManager::new(Duration::from_secs(2));
        let now = Instant::now();
        let tid = rpc.register(observer(addr(1), now));

        assert!(rpc.resolve(&tid, &addr(1)).is_some());
        // a second resolve of the same tid finds nothing
        assert!(rpc.resolve(&tid, &addr(1)).is_none());
    }

    #[test]
    fn test_resolve_rejects_wrong_source() {
        let mut rpc = RpcManager::new(Duration::from_secs(2));
        let tid = rpc.register(observer(addr(1), Instant::now()));
        assert!(rpc.resolve(&tid, &addr(2)).is_none());
        // the original sender can still resolve it
        assert!(rpc.resolve(&tid, &addr(1)).is_some());
    }

    #[test]
    fn test_tick_expires_old_queries() {
        let mut rpc = RpcManager::new(Duration::from_secs(2));
        let start = Instant::now();
        rpc.register(observer(addr(1), start));
        rpc.register(observer(addr(2), start + Duration::from_secs(1)));

        let (expired, _) = rpc.tick(start + Duration::from_millis(2500));
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].addr, addr(1));
        assert_eq!(rpc.num_pending(), 1);
    }

    #[test]
    fn test_unreachable_fails_all_observers_to_endpoint() {
        let mut rpc = RpcManager::new(Duration::from_secs(2));
        let now = Instant::now();
        rpc.register(observer(addr(1), now));
        rpc.register(observer(addr(1), now));
        rpc.register(observer(addr(2), now));

        let failed = rpc.unreachable(&addr(1));
        assert_eq!(failed.len(), 2);
        assert_eq!(rpc.num_pending(), 1);
    }

    #[test]
    fn test_transaction_ids_increment() {
        let mut rpc = RpcManager::new(Duration::from_secs(2));
        let now = Instant::now();
        let a = rpc.register(observer(addr(1), now));
        let b = rpc.register(observer(addr(1), now));
        let a = u16::from_be_bytes([a[0], a[1]]);
        let b = u16::from_be_bytes([b[0], b[1]]);
        assert_eq!(b, a.wrapping_add(1));
    }
}
