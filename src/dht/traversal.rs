use std::net::SocketAddr;

use bytes::Bytes;

use super::id::NodeId;
use super::msg::NodeInfo;
use super::routing::K;
use crate::bencode::Value;

/// Concurrent queries per traversal.
pub const ALPHA: usize = 3;
/// Upper bound on tracked candidates per traversal.
pub const MAX_CANDIDATES: usize = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CandidateState {
    /// Known but not yet queried.
    Initial,
    /// Query in flight.
    Queried,
    /// Replied.
    Alive,
    /// Timed out or returned an error.
    Failed,
}

#[derive(Debug, Clone)]
pub struct Candidate {
    pub info: NodeInfo,
    pub state: CandidateState,
    /// Write token granted by this node, for a later announce or put.
    pub token: Option<Bytes>,
}

pub type PeersCallback = Box<dyn FnOnce(Vec<SocketAddr>) + Send>;
pub type BootstrapCallback = Box<dyn FnOnce(usize) + Send>;

/// How to announce once a get-peers traversal completes.
#[derive(Debug, Clone, Copy)]
pub struct AnnouncePlan {
    pub port: u16,
    pub implied_port: bool,
    pub seed: bool,
}

/// A BEP-44 item as seen (or about to be written) by a get-item traversal.
pub struct ItemValue {
    pub value: Value,
    /// Mutable items carry key material and a sequence number.
    pub mutable: Option<MutableMeta>,
}

pub struct MutableMeta {
    pub public_key: [u8; 32],
    pub signature: [u8; 64],
    pub seq: u64,
    pub salt: Bytes,
}

/// Invoked when a get-item traversal finishes. Returning `true` asks the
/// node to write the (possibly modified) item back to the closest
/// token-granting nodes.
pub type ItemCallback = Box<dyn FnMut(&mut ItemValue) -> bool + Send>;

pub enum TraversalKind {
    /// find_node toward (a secret variant of) our own id; seeds the
    /// routing table.
    Bootstrap { callback: Option<BootstrapCallback> },
    /// Bucket probe; never announces.
    Refresh,
    GetPeers {
        info_hash: NodeId,
        /// The traversal target is a prefix-masked decoy; the true hash is
        /// only revealed to the final hop (BEP-33 privacy lookup).
        obfuscated: bool,
        noseed: bool,
        peers: Vec<SocketAddr>,
        announce: Option<AnnouncePlan>,
        callback: Option<PeersCallback>,
    },
    GetItem {
        /// Key and salt for mutable lookups; `None` for immutable.
        key: Option<([u8; 32], Bytes)>,
        item: Option<ItemValue>,
        callback: Option<ItemCallback>,
    },
}

impl TraversalKind {
    pub fn name(&self) -> &'static str {
        match self {
            TraversalKind::Bootstrap { .. } => "bootstrap",
            TraversalKind::Refresh => "refresh",
            TraversalKind::GetPeers { .. } => "get_peers",
            TraversalKind::GetItem { .. } => "get_item",
        }
    }
}

/// An iterative α-parallel lookup: a distance-ordered candidate set worked
/// through until the k closest nodes have replied.
pub struct Traversal {
    pub id: u32,
    pub target: NodeId,
    pub kind: TraversalKind,
    /// Sorted by XOR distance to `target`.
    pub candidates: Vec<Candidate>,
    pub outstanding: usize,
    pub done: bool,
}

impl Traversal {
    pub fn new(id: u32, target: NodeId, kind: TraversalKind) -> Self {
        Self {
            id,
            target,
            kind,
            candidates: Vec::new(),
            outstanding: 0,
            done: false,
        }
    }

    /// Adds a candidate, keeping the set sorted, deduplicated and capped.
    pub fn add_candidate(&mut self, info: NodeInfo) {
        if self
            .candidates
            .iter()
            .any(|c| c.info.id == info.id || c.info.addr == info.addr)
        {
            return;
        }
        let dist = info.id.distance(&self.target);
        let pos = self
            .candidates
            .partition_point(|c| c.info.id.distance(&self.target) <= dist);
        self.candidates.insert(
            pos,
            Candidate {
                info,
                state: CandidateState::Initial,
                token: None,
            },
        );

        // drop surplus unqueried tail entries
        if self.candidates.len() > MAX_CANDIDATES {
            if let Some(pos) = self
                .candidates
                .iter()
                .rposition(|c| c.state == CandidateState::Initial)
            {
                self.candidates.remove(pos);
            }
        }
    }

    /// Picks the next batch of nodes to query (closest `Initial` first, up
    /// to α in flight) and marks them `Queried`.
    pub fn next_batch(&mut self) -> Vec<NodeInfo> {
        let mut batch = Vec::new();
        if self.done {
            return batch;
        }
        for candidate in self.candidates.iter_mut() {
            if self.outstanding + batch.len() >= ALPHA {
                break;
            }
            if candidate.state == CandidateState::Initial {
                candidate.state = CandidateState::Queried;
                batch.push(candidate.info);
            }
        }
        self.outstanding += batch.len();
        batch
    }

    fn candidate_mut(&mut self, addr: &SocketAddr) -> Option<&mut Candidate> {
        self.candidates.iter_mut().find(|c| c.info.addr == *addr)
    }

    /// Marks a reply from `addr`, recording a token if one was granted.
    pub fn on_reply(&mut self, addr: &SocketAddr, token: Option<Bytes>) {
        if let Some(candidate) = self.candidate_mut(addr) {
            if candidate.state == CandidateState::Queried {
                candidate.state = CandidateState::Alive;
            }
            if token.is_some() {
                candidate.token = token;
            }
        }
        self.outstanding = self.outstanding.saturating_sub(1);
    }

    pub fn on_failure(&mut self, addr: &SocketAddr) {
        if let Some(candidate) = self.candidate_mut(addr) {
            candidate.state = CandidateState::Failed;
        }
        self.outstanding = self.outstanding.saturating_sub(1);
    }

    /// Complete when the k closest non-failed candidates have all replied,
    /// or when no queryable candidate remains.
    pub fn is_complete(&self) -> bool {
        if self.done {
            return true;
        }
        let mut live_seen = 0;
        for candidate in &self.candidates {
            match candidate.state {
                CandidateState::Failed => continue,
                CandidateState::Alive => {
                    live_seen += 1;
                    if live_seen >= K {
                        return true;
                    }
                }
                CandidateState::Initial | CandidateState::Queried => return false,
            }
        }
        self.outstanding == 0
    }

    /// The k closest alive candidates, tokens included.
    pub fn closest_alive(&self) -> Vec<&Candidate> {
        self.candidates
            .iter()
            .filter(|c| c.state == CandidateState::Alive)
            .take(K)
            .collect()
    }

    pub fn num_alive(&self) -> usize {
        self.candidates
            .iter()
            .filter(|c| c.state == CandidateState::Alive)
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{IpAddr, Ipv4Addr};

    fn info(first: u8, tail: u8) -> NodeInfo {
        let mut id = [0u8; 20];
        id[0] = first;
        id[19] = tail;
        NodeInfo {
            id: NodeId(id),
            addr: SocketAddr::new(
                IpAddr::V4(Ipv4Addr::new(10, 0, first, tail)),
                6881 + tail as u16,
            ),
        }
    }

    fn traversal() -> Traversal {
        Traversal::new(
            1,
            NodeId([0u8; 20]),
            TraversalKind::Bootstrap { callback: None },
        )
    }

    #[test]
    fn test_candidates_stay_sorted_by_distance() {
        let mut t = traversal();
        t.add_candidate(info(8, 0));
        t.add_candidate(info(1, 1));
        t.add_candidate(info(4, 2));

        let firsts: Vec<u8> = t.candidates.iter().map(|c| c.info.id.0[0]).collect();
        assert_eq!(firsts, vec![1, 4, 8]);
    }

    #[test]
    fn test_duplicates_ignored() {
        let mut t = traversal();
        t.add_candidate(info(1, 1));
        t.add_candidate(info(1, 1));
        assert_eq!(t.candidates.len(), 1);
    }

    #[test]
    fn test_alpha_limits_outstanding() {
        let mut t = traversal();
        for i in 0..10 {
            t.add_candidate(info(i + 1, i));
        }
        let batch = t.next_batch();
        assert_eq!(batch.len(), ALPHA);
        assert_eq!(t.outstanding, ALPHA);
        // nothing more until a reply or timeout frees a slot
        assert!(t.next_batch().is_empty());

        t.on_reply(&batch[0].addr, None);
        assert_eq!(t.next_batch().len(), 1);
    }

    #[test]
    fn test_batch_prefers_closest() {
        let mut t = traversal();
        t.add_candidate(info(9, 0));
        t.add_candidate(info(1, 1));
        let batch = t.next_batch();
        assert_eq!(batch[0].id.0[0], 1);
    }

    #[test]
    fn test_complete_when_k_closest_alive() {
        let mut t = traversal();
        for i in 0..K as u8 {
            t.add_candidate(info(i + 1, i));
        }
        loop {
            let batch = t.next_batch();
            if batch.is_empty() {
                break;
            }
            for target in batch {
                t.on_reply(&target.addr, None);
            }
        }
        assert!(t.is_complete());
        assert_eq!(t.num_alive(), K);
    }

    #[test]
    fn test_terminates_with_dead_nodes() {
        let mut t = traversal();
        for i in 0..20u8 {
            t.add_candidate(info(i + 1, i));
        }
        // every query times out; the traversal must still terminate
        let mut rounds = 0;
        loop {
            let batch = t.next_batch();
            if batch.is_empty() {
                break;
            }
            for target in batch {
                t.on_failure(&target.addr);
            }
            rounds += 1;
            assert!(rounds < 100, "traversal failed to terminate");
        }
        assert!(t.is_complete());
        assert_eq!(t.num_alive(), 0);
    }

    #[test]
    fn test_candidate_cap() {
        let mut t = traversal();
        for i in 0..150u16 {
            let mut id = [0u8; 20];
            id[0] = (i >> 8) as u8 + 1;
            id[1] = i as u8;
            t.add_candidate(NodeInfo {
                id: NodeId(id),
                addr: SocketAddr::new(
                    IpAddr::V4(Ipv4Addr::new(10, 1, (i >> 8) as u8, i as u8)),
                    7000,
                ),
            });
        }
        assert!(t.candidates.len() <= MAX_CANDIDATES);
    }

    #[test]
    fn test_reply_records_token() {
        let mut t = traversal();
        t.add_candidate(info(1, 1));
        let batch = t.next_batch();
        t.on_reply(&batch[0].addr, Some(Bytes::from_static(b"tok!")));
        assert_eq!(
            t.candidates[0].token.as_deref(),
            Some(b"tok!".as_slice())
        );
    }
}
