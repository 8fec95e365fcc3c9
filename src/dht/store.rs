use std::collections::{BTreeMap, HashMap};
use std::net::{IpAddr, SocketAddr};
use std::time::{Duration, Instant};

use bytes::Bytes;
use tracing::debug;

use super::bloom::{hash_address, BloomFilter};
use super::id::NodeId;

const MAX_TORRENT_NAME: usize = 50;

/// A peer announced for an info-hash. Entries are keyed by endpoint: a
/// re-announce replaces rather than duplicates.
#[derive(Debug, Clone)]
pub struct PeerEntry {
    pub added: Instant,
    pub seed: bool,
}

#[derive(Default)]
pub struct TorrentEntry {
    /// Optional name carried by announce (`n`), first writer wins.
    pub name: Option<String>,
    pub peers: BTreeMap<SocketAddr, PeerEntry>,
}

/// Per-node store of announced peers, capped at `max_torrents`.
pub struct PeerStore {
    torrents: BTreeMap<NodeId, TorrentEntry>,
    max_torrents: usize,
}

impl PeerStore {
    pub fn new(max_torrents: usize) -> Self {
        Self {
            torrents: BTreeMap::new(),
            max_torrents,
        }
    }

    /// Adds (or refreshes) an announced peer. Under capacity pressure the
    /// info-hash with the fewest peers is evicted, never the one being
    /// announced to.
    pub fn announce(
        &mut self,
        info_hash: NodeId,
        peer: SocketAddr,
        seed: bool,
        name: Option<&str>,
        now: Instant,
    ) {
        if !self.torrents.contains_key(&info_hash) && self.torrents.len() >= self.max_torrents {
            let victim = self
                .torrents
                .iter()
                .filter(|(hash, _)| **hash != info_hash)
                .min_by_key(|(_, entry)| entry.peers.len())
                .map(|(hash, _)| *hash);
            if let Some(victim) = victim {
                debug!(victim = %victim, "peer store full, evicting smallest swarm");
                self.torrents.remove(&victim);
            }
        }

        let entry = self.torrents.entry(info_hash).or_default();
        if let (None, Some(name)) = (&entry.name, name) {
            let mut name = name.to_string();
            name.truncate(MAX_TORRENT_NAME);
            entry.name = Some(name);
        }
        entry.peers.insert(peer, PeerEntry { added: now, seed });
    }

    pub fn torrent(&self, info_hash: &NodeId) -> Option<&TorrentEntry> {
        self.torrents.get(info_hash)
    }

    pub fn num_torrents(&self) -> usize {
        self.torrents.len()
    }

    pub fn num_peers(&self, info_hash: &NodeId) -> usize {
        self.torrents
            .get(info_hash)
            .map(|t| t.peers.len())
            .unwrap_or(0)
    }

    /// Drops peers past `1.5 × announce_interval` and empty torrents with
    /// them.
    pub fn purge_expired(&mut self, announce_interval: Duration, now: Instant) {
        let lifetime = announce_interval + announce_interval / 2;
        self.torrents.retain(|_, entry| {
            entry
                .peers
                .retain(|_, peer| now.duration_since(peer.added) < lifetime);
            !entry.peers.is_empty()
        });
    }
}

/// A BEP-44 immutable item: the target is the SHA-1 of the stored value.
pub struct ImmutableItem {
    pub value: Bytes,
    pub last_seen: Instant,
    pub num_announcers: usize,
    ips: BloomFilter<128>,
}

impl ImmutableItem {
    fn new(value: Bytes, now: Instant) -> Self {
        Self {
            value,
            last_seen: now,
            num_announcers: 0,
            ips: BloomFilter::new(),
        }
    }

    /// Counts one announcer per distinct source IP.
    pub fn touch(&mut self, ip: IpAddr, now: Instant) {
        self.last_seen = now;
        let hash = hash_address(ip);
        if !self.ips.contains(&hash) {
            self.ips.set(&hash);
            self.num_announcers += 1;
        }
    }
}

const IMMUTABLE_ITEM_EXPIRY: Duration = Duration::from_secs(60 * 60);

/// Store for immutable items, bounded by `max_items`.
pub struct ImmutableStore {
    items: HashMap<NodeId, ImmutableItem>,
    max_items: usize,
}

impl ImmutableStore {
    pub fn new(max_items: usize) -> Self {
        Self {
            items: HashMap::new(),
            max_items,
        }
    }

    pub fn get(&self, target: &NodeId) -> Option<&ImmutableItem> {
        self.items.get(target)
    }

    /// Inserts the value unless present, evicting the least worthwhile
    /// item under pressure: each 5 announcers buy one bit of distance from
    /// our id, so popular-and-close items survive.
    pub fn put(
        &mut self,
        our_id: &NodeId,
        target: NodeId,
        value: Bytes,
        from: IpAddr,
        now: Instant,
    ) {
        if !self.items.contains_key(&target) && self.items.len() >= self.max_items {
            let victim = self
                .items
                .iter()
                .min_by_key(|(id, item)| {
                    item.num_announcers as isize / 5 - our_id.distance_exp(id) as isize
                })
                .map(|(id, _)| *id);
            if let Some(victim) = victim {
                self.items.remove(&victim);
            }
        }

        self.items
            .entry(target)
            .or_insert_with(|| ImmutableItem::new(value, now))
            .touch(from, now);
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Drops items not refreshed within the last hour.
    pub fn purge_expired(&mut self, now: Instant) {
        self.items
            .retain(|_, item| now.duration_since(item.last_seen) < IMMUTABLE_ITEM_EXPIRY);
    }
}

/// A BEP-44 mutable item: target is SHA-1(public key ‖ salt); updates are
/// gated by signature, sequence number and optional compare-and-swap.
pub struct MutableItem {
    pub value: Bytes,
    pub public_key: [u8; 32],
    pub signature: [u8; 64],
    pub seq: u64,
    pub salt: Bytes,
    pub last_seen: Instant,
    pub num_announcers: usize,
    ips: BloomFilter<128>,
}

impl MutableItem {
    pub fn touch(&mut self, ip: IpAddr, now: Instant) {
        self.last_seen = now;
        let hash = hash_address(ip);
        if !self.ips.contains(&hash) {
            self.ips.set(&hash);
            self.num_announcers += 1;
        }
    }
}

/// Store for mutable items, bounded by `max_items`; eviction drops the
/// item with the fewest announcers.
pub struct MutableStore {
    items: HashMap<NodeId, MutableItem>,
    max_items: usize,
}

impl MutableStore {
    pub fn new(max_items: usize) -> Self {
        Self {
            items: HashMap::new(),
            max_items,
        }
    }

    pub fn get(&self, target: &NodeId) -> Option<&MutableItem> {
        self.items.get(target)
    }

    pub fn get_mut(&mut self, target: &NodeId) -> Option<&mut MutableItem> {
        self.items.get_mut(target)
    }

    /// Inserts a fresh slot (the caller has already verified signature and
    /// sequence rules).
    pub fn insert(
        &mut self,
        target: NodeId,
        value: Bytes,
        public_key: [u8; 32],
        signature: [u8; 64],
        seq: u64,
        salt: Bytes,
        from: IpAddr,
        now: Instant,
    ) {
        if !self.items.contains_key(&target) && self.items.len() >= self.max_items {
            let victim = self
                .items
                .iter()
                .min_by_key(|(_, item)| item.num_announcers)
                .map(|(id, _)| *id);
            if let Some(victim) = victim {
                self.items.remove(&victim);
            }
        }

        let mut item = MutableItem {
            value,
            public_key,
            signature,
            seq,
            salt,
            last_seen: now,
            num_announcers: 0,
            ips: BloomFilter::new(),
        };
        item.touch(from, now);
        self.items.insert(target, item);
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}
