use std::collections::VecDeque;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use tracing::trace;

use super::id::NodeId;
use super::msg::NodeInfo;

pub const K: usize = 8;
const NUM_BUCKETS: usize = 160;
const MAX_FAIL_COUNT: u8 = 3;
const REFRESH_AGE: Duration = Duration::from_secs(15 * 60);

/// A known DHT node and its liveness bookkeeping.
#[derive(Debug, Clone)]
pub struct NodeEntry {
    pub id: NodeId,
    pub addr: SocketAddr,
    pub last_seen: Instant,
    pub fail_count: u8,
    pub rtt: Option<Duration>,
    /// Replied to us at least once (as opposed to merely heard about).
    pub confirmed: bool,
}

impl NodeEntry {
    fn new(id: NodeId, addr: SocketAddr, now: Instant, confirmed: bool) -> Self {
        Self {
            id,
            addr,
            last_seen: now,
            fail_count: 0,
            rtt: None,
            confirmed,
        }
    }

    pub fn is_good(&self, now: Instant) -> bool {
        self.fail_count == 0 && now.duration_since(self.last_seen) < REFRESH_AGE
    }

    pub fn info(&self) -> NodeInfo {
        NodeInfo {
            id: self.id,
            addr: self.addr,
        }
    }
}

#[derive(Default)]
struct Bucket {
    nodes: VecDeque<NodeEntry>,
    /// Candidates waiting for a slot.
    replacements: VecDeque<NodeEntry>,
    last_refreshed: Option<Instant>,
}

impl Bucket {
    /// Inserts or refreshes an entry. When the bucket is full the entry
    /// lands in the replacement cache and the least-recently-seen active
    /// node is returned as a ping candidate.
    fn insert(&mut self, entry: NodeEntry, now: Instant) -> Option<NodeEntry> {
        if let Some(existing) = self.nodes.iter_mut().find(|n| n.id == entry.id) {
            existing.addr = entry.addr;
            existing.last_seen = now;
            existing.fail_count = 0;
            existing.confirmed |= entry.confirmed;
            return None;
        }

        if self.nodes.len() < K {
            self.nodes.push_back(entry);
            return None;
        }

        if !self.replacements.iter().any(|n| n.id == entry.id) {
            if self.replacements.len() >= K {
                self.replacements.pop_front();
            }
            self.replacements.push_back(entry);
        }

        // the oldest unconfirmed-or-stale node is worth probing
        self.nodes
            .iter()
            .min_by_key(|n| n.last_seen)
            .filter(|n| !n.is_good(now))
            .cloned()
    }

    fn fail(&mut self, id: &NodeId) {
        let Some(pos) = self.nodes.iter().position(|n| n.id == *id) else {
            return;
        };
        let node = &mut self.nodes[pos];
        node.fail_count = node.fail_count.saturating_add(1);
        if node.fail_count >= MAX_FAIL_COUNT {
            self.nodes.remove(pos);
            if let Some(replacement) = self.replacements.pop_back() {
                self.nodes.push_back(replacement);
            }
        }
    }

    fn oldest(&self) -> Option<&NodeEntry> {
        self.nodes.iter().min_by_key(|n| n.last_seen)
    }
}

/// Kademlia routing table: 160 k-buckets partitioned by distance exponent
/// from our own id, each with a replacement cache.
///
/// With per-exponent buckets, "splitting" is implicit: only the bucket
/// range containing our own id ever subdivides further, which is exactly
/// the fixed indexing by shared-prefix length used here.
pub struct RoutingTable {
    our_id: NodeId,
    buckets: Vec<Bucket>,
}

impl RoutingTable {
    pub fn new(our_id: NodeId) -> Self {
        let mut buckets = Vec::with_capacity(NUM_BUCKETS);
        buckets.resize_with(NUM_BUCKETS, Bucket::default);
        Self { our_id, buckets }
    }

    pub fn our_id(&self) -> &NodeId {
        &self.our_id
    }

    /// Records a node we heard about through a query or compact node list.
    /// Returns a stale node worth pinging when its bucket is full.
    pub fn heard_about(&mut self, id: NodeId, addr: SocketAddr, now: Instant) -> Option<NodeEntry> {
        if id == self.our_id {
            return None;
        }
        let index = self.our_id.bucket_index(&id);
        self.buckets[index].insert(NodeEntry::new(id, addr, now, false), now)
    }

    /// Records a node that proved itself (replied, or presented a valid
    /// write token).
    pub fn node_seen(&mut self, id: NodeId, addr: SocketAddr, rtt: Option<Duration>, now: Instant) {
        if id == self.our_id {
            return;
        }
        let index = self.our_id.bucket_index(&id);
        let mut entry = NodeEntry::new(id, addr, now, true);
        entry.rtt = rtt;
        if let Some(candidate) = self.buckets[index].insert(entry, now) {
            trace!(bucket = index, stale = %candidate.id, "bucket full, stale candidate");
        }
    }

    /// Marks a query to this node as failed; enough failures evict it and
    /// promote a replacement.
    pub fn node_failed(&mut self, id: &NodeId) {
        let index = self.our_id.bucket_index(id);
        self.buckets[index].fail(id);
    }

    pub fn remove(&mut self, id: &NodeId) {
        let index = self.our_id.bucket_index(id);
        self.buckets[index].nodes.retain(|n| n.id != *id);
    }

    /// The `count` nodes closest to `target` by XOR distance. Walks out
    /// from the target's home bucket into adjacent buckets until filled.
    pub fn find_node(&self, target: &NodeId, count: usize) -> Vec<NodeEntry> {
        let count = if count == 0 { K } else { count };
        let home = self.our_id.bucket_index(target);

        let mut found: Vec<NodeEntry> = Vec::with_capacity(count * 2);
        let mut lo = home as isize;
        let mut hi = home as isize + 1;
        while found.len() < count && (lo >= 0 || (hi as usize) < NUM_BUCKETS) {
            if lo >= 0 {
                found.extend(self.buckets[lo as usize].nodes.iter().cloned());
                lo -= 1;
            }
            if found.len() < count && (hi as usize) < NUM_BUCKETS {
                found.extend(self.buckets[hi as usize].nodes.iter().cloned());
                hi += 1;
            }
        }

        found.sort_by(|a, b| a.id.distance(target).cmp(&b.id.distance(target)));
        found.truncate(count);
        found
    }

    pub fn node_count(&self) -> usize {
        self.buckets.iter().map(|b| b.nodes.len()).sum()
    }

    pub fn bucket_size(&self, index: usize) -> usize {
        self.buckets.get(index).map(|b| b.nodes.len()).unwrap_or(0)
    }

    pub fn num_active_buckets(&self) -> usize {
        self.buckets.iter().filter(|b| !b.nodes.is_empty()).count()
    }

    /// Picks one node from the stalest unrefreshed bucket for a refresh
    /// probe, stamping the bucket refreshed.
    pub fn next_refresh(&mut self, now: Instant) -> Option<NodeEntry> {
        let (index, _) = self
            .buckets
            .iter()
            .enumerate()
            .filter(|(_, b)| {
                !b.nodes.is_empty()
                    && b.last_refreshed
                        .map_or(true, |t| now.duration_since(t) >= REFRESH_AGE)
                    && b.oldest()
                        .is_some_and(|n| now.duration_since(n.last_seen) >= REFRESH_AGE)
            })
            .min_by_key(|(_, b)| b.oldest().map(|n| n.last_seen))?;

        self.buckets[index].last_refreshed = Some(now);
        self.buckets[index].oldest().cloned()
    }

    /// All entries, for diagnostics.
    pub fn entries(&self) -> Vec<NodeEntry> {
        self.buckets
            .iter()
            .flat_map(|b| b.nodes.iter().cloned())
            .collect()
    }
}
