use std::collections::{BTreeMap, HashMap};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use ed25519_dalek::{Signature, VerifyingKey};
use parking_lot::Mutex;
use rand::Rng as _;
use sha1::{Digest, Sha1};
use tracing::{debug, info, trace};

use super::bloom::{hash_address, BloomFilter};
use super::error::krpc;
use super::id::NodeId;
use super::msg::{self, Incoming, NodeInfo, QueryMsg, ReplyMsg};
use super::routing::{RoutingTable, K};
use super::rpc::{Observer, ObserverKind, RpcManager};
use super::store::{ImmutableStore, MutableStore, PeerStore, TorrentEntry};
use super::token::TokenManager;
use super::traversal::{
    AnnouncePlan, BootstrapCallback, ItemCallback, ItemValue, MutableMeta, PeersCallback,
    Traversal, TraversalKind,
};
use crate::alert::{Alert, AlertManager};
use crate::bencode::{encode, Value};

/// Datagram sender, the node's only path to the network. Receive is the
/// host's job: feed packets in through [`Node::incoming`].
pub trait Socket: Send + Sync {
    fn send(&self, data: &[u8], to: SocketAddr);
}

/// Time source, injected so maintenance and expiry are testable.
pub trait Clock: Send + Sync {
    fn now(&self) -> Instant;
}

pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }
}

#[derive(Debug, Clone)]
pub struct DhtSettings {
    /// Cap on info-hashes tracked by the peer store.
    pub max_torrents: usize,
    /// Cap on stored BEP-44 items (immutable and mutable each).
    pub max_dht_items: usize,
    /// Most peers returned in one get_peers reply.
    pub max_peers_reply: usize,
    /// Peers expire at 1.5 times this.
    pub announce_interval: Duration,
    /// Outstanding-query timeout.
    pub rpc_timeout: Duration,
    /// Route announces through the prefix-masked lookup (BEP-33 privacy).
    pub privacy_lookups: bool,
    /// Reject queries whose node id fails BEP-42 for the source IP.
    pub enforce_node_id: bool,
    /// BEP-43: mark outgoing queries `ro` and answer nothing.
    pub read_only: bool,
}

impl Default for DhtSettings {
    fn default() -> Self {
        Self {
            max_torrents: 2000,
            max_dht_items: 700,
            max_peers_reply: 100,
            announce_interval: Duration::from_secs(30 * 60),
            rpc_timeout: Duration::from_secs(2),
            privacy_lookups: false,
            enforce_node_id: false,
            read_only: false,
        }
    }
}

const SELF_REFRESH_INTERVAL: Duration = Duration::from_secs(10 * 60);
const STORE_PURGE_INTERVAL: Duration = Duration::from_secs(2 * 60);
/// Leading bits revealed by the decoy target of an obfuscated lookup.
const OBFUSCATION_PREFIX_BITS: usize = 32;

/// Point-in-time counters, readable from other threads via
/// [`Node::status`].
#[derive(Debug, Clone, Default)]
pub struct NodeStatus {
    pub nodes: usize,
    pub torrents: usize,
    pub immutable_items: usize,
    pub mutable_items: usize,
    pub pending_queries: usize,
    pub active_traversals: usize,
}

/// The DHT node: answers queries against its routing table and stores,
/// and runs iterative lookups for announces, peer discovery and BEP-44
/// items.
///
/// Single-threaded by design: every method takes `&mut self` and is driven
/// from the host's reactor. The one exception is [`status`](Self::status),
/// which snapshots counters behind a mutex.
pub struct Node {
    id: NodeId,
    table: RoutingTable,
    rpc: RpcManager,
    tokens: TokenManager,
    peers: PeerStore,
    immutable: ImmutableStore,
    mutable: MutableStore,
    settings: DhtSettings,
    socket: Arc<dyn Socket>,
    clock: Arc<dyn Clock>,
    alerts: Option<Arc<AlertManager>>,
    traversals: HashMap<u32, Traversal>,
    next_traversal: u32,
    last_self_refresh: Option<Instant>,
    last_store_purge: Instant,
    status: Mutex<NodeStatus>,
}

impl Node {
    pub fn new(
        id: Option<NodeId>,
        settings: DhtSettings,
        socket: Arc<dyn Socket>,
        clock: Arc<dyn Clock>,
        alerts: Option<Arc<AlertManager>>,
    ) -> Self {
        let id = id.unwrap_or_else(NodeId::generate);
        info!(id = %id, "dht node starting");
        let now = clock.now();
        Self {
            id,
            table: RoutingTable::new(id),
            rpc: RpcManager::new(settings.rpc_timeout),
            tokens: TokenManager::new(),
            peers: PeerStore::new(settings.max_torrents),
            immutable: ImmutableStore::new(settings.max_dht_items),
            mutable: MutableStore::new(settings.max_dht_items),
            settings,
            socket,
            clock,
            alerts,
            traversals: HashMap::new(),
            next_traversal: 1,
            last_self_refresh: None,
            last_store_purge: now,
            status: Mutex::new(NodeStatus::default()),
        }
    }

    pub fn our_id(&self) -> &NodeId {
        &self.id
    }

    pub fn routing_table(&self) -> &RoutingTable {
        &self.table
    }

    pub fn status(&self) -> NodeStatus {
        self.status.lock().clone()
    }

    fn update_status(&self) {
        *self.status.lock() = NodeStatus {
            nodes: self.table.node_count(),
            torrents: self.peers.num_torrents(),
            immutable_items: self.immutable.len(),
            mutable_items: self.mutable.len(),
            pending_queries: self.rpc.num_pending(),
            active_traversals: self.traversals.len(),
        };
    }

    /// Rotates the write-token secret. Call roughly every five minutes;
    /// tokens stay valid for exactly one rotation.
    pub fn new_write_key(&mut self) {
        self.tokens.rotate();
    }

    /// The socket reported `ep` unreachable: fail everything pointed at it.
    pub fn unreachable(&mut self, ep: &SocketAddr) {
        for observer in self.rpc.unreachable(ep) {
            self.observer_failed(observer);
        }
    }

    // ----- outgoing plumbing -----

    fn send_value(&self, value: &Value, to: SocketAddr) {
        self.socket.send(&encode(value), to);
    }

    fn invoke(
        &mut self,
        name: &str,
        mut args: BTreeMap<Bytes, Value>,
        to: SocketAddr,
        kind: ObserverKind,
        traversal: Option<u32>,
        node_id: Option<NodeId>,
    ) {
        args.insert(
            Bytes::from_static(b"id"),
            Value::bytes(self.id.as_bytes()),
        );
        let tid = self.rpc.register(Observer {
            kind,
            traversal,
            addr: to,
            node_id,
            sent_at: self.clock.now(),
        });
        let mut packet = msg::build_query(&tid, name, args);
        if self.settings.read_only {
            packet.insert(b"ro", Value::Integer(1));
        }
        self.send_value(&packet, to);
    }

    /// Pings an endpoint; a reply gets it into the routing table.
    pub fn add_node(&mut self, ep: SocketAddr) {
        self.invoke(
            "ping",
            BTreeMap::new(),
            ep,
            ObserverKind::Ping,
            None,
            None,
        );
    }

    // ----- traversal initiation -----

    fn alloc_traversal(&mut self) -> u32 {
        let id = self.next_traversal;
        self.next_traversal = self.next_traversal.wrapping_add(1);
        id
    }

    fn start_traversal(&mut self, mut traversal: Traversal, seeds: Vec<NodeInfo>) {
        for seed in seeds {
            traversal.add_candidate(seed);
        }
        for entry in self.table.find_node(&traversal.target, K) {
            traversal.add_candidate(entry.info());
        }
        let id = traversal.id;
        debug!(traversal = id, kind = traversal.kind.name(), target = %traversal.target, "traversal started");
        self.traversals.insert(id, traversal);
        self.traversal_step(id);
    }

    /// Seeds the routing table by walking toward (a secret variant of) our
    /// own id, starting from the given router endpoints.
    pub fn bootstrap(&mut self, routers: &[SocketAddr], callback: Option<BootstrapCallback>) {
        let target = self.id.secret_suffix();
        let id = self.alloc_traversal();
        let traversal = Traversal::new(id, target, TraversalKind::Bootstrap { callback });

        // routers are id-less; placeholder ids order them arbitrarily and
        // the replies carry the real ones
        let seeds: Vec<NodeInfo> = routers
            .iter()
            .map(|&addr| NodeInfo {
                id: NodeId::generate(),
                addr,
            })
            .collect();
        self.last_self_refresh = Some(self.clock.now());
        self.start_traversal(traversal, seeds);
    }

    /// Looks up peers for an info-hash.
    pub fn get_peers(&mut self, info_hash: NodeId, callback: PeersCallback) {
        self.lookup_and_maybe_announce(info_hash, None, false, Some(callback));
    }

    /// Looks up peers and then announces ourselves to the k closest nodes
    /// that granted a write token.
    pub fn announce(
        &mut self,
        info_hash: NodeId,
        port: u16,
        seed: bool,
        implied_port: bool,
        callback: Option<PeersCallback>,
    ) {
        let plan = AnnouncePlan {
            port,
            implied_port,
            seed,
        };
        self.lookup_and_maybe_announce(info_hash, Some(plan), seed, callback);
    }

    fn lookup_and_maybe_announce(
        &mut self,
        info_hash: NodeId,
        announce: Option<AnnouncePlan>,
        noseed: bool,
        callback: Option<PeersCallback>,
    ) {
        let obfuscated = self.settings.privacy_lookups;
        let target = if obfuscated {
            info_hash.prefix_mask(OBFUSCATION_PREFIX_BITS)
        } else {
            info_hash
        };
        let id = self.alloc_traversal();
        let traversal = Traversal::new(
            id,
            target,
            TraversalKind::GetPeers {
                info_hash,
                obfuscated,
                noseed,
                peers: Vec::new(),
                announce,
                callback,
            },
        );
        self.start_traversal(traversal, Vec::new());
    }

    /// Fetches an immutable item by its SHA-1 target.
    pub fn get_item(&mut self, target: NodeId, callback: ItemCallback) {
        let id = self.alloc_traversal();
        let traversal = Traversal::new(
            id,
            target,
            TraversalKind::GetItem {
                key: None,
                item: None,
                callback: Some(callback),
            },
        );
        self.start_traversal(traversal, Vec::new());
    }

    /// Fetches a mutable item by public key and salt. The callback may
    /// bump the sequence, re-sign and return `true` to publish.
    pub fn get_mutable_item(
        &mut self,
        public_key: [u8; 32],
        salt: Bytes,
        callback: ItemCallback,
    ) {
        let target = mutable_target(&public_key, &salt);
        let id = self.alloc_traversal();
        let traversal = Traversal::new(
            id,
            target,
            TraversalKind::GetItem {
                key: Some((public_key, salt)),
                item: None,
                callback: Some(callback),
            },
        );
        self.start_traversal(traversal, Vec::new());
    }

    // ----- maintenance -----

    /// Periodic self-maintenance: a 10-minute self-refresh, otherwise one
    /// stale-bucket probe.
    pub fn tick(&mut self) {
        let now = self.clock.now();

        let refresh_due = self
            .last_self_refresh
            .map_or(true, |t| now.duration_since(t) >= SELF_REFRESH_INTERVAL);
        if refresh_due {
            let target = self.id.secret_suffix();
            let id = self.alloc_traversal();
            let traversal = Traversal::new(id, target, TraversalKind::Bootstrap { callback: None });
            self.last_self_refresh = Some(now);
            self.start_traversal(traversal, Vec::new());
            self.update_status();
            return;
        }

        if let Some(entry) = self.table.next_refresh(now) {
            let bucket = self.id.bucket_index(&entry.id);
            let target = self.id.random_in_bucket(bucket);
            // get_peers rather than find_node: the reply carries nodes
            // either way, plus a token we may use later
            let mut args = BTreeMap::new();
            args.insert(
                Bytes::from_static(b"info_hash"),
                Value::bytes(target.as_bytes()),
            );
            self.invoke(
                "get_peers",
                args,
                entry.addr,
                ObserverKind::Refresh,
                None,
                Some(entry.id),
            );
        }
        self.update_status();
    }

    /// Expires outstanding queries and, every two minutes, stale store
    /// entries. Returns the delay until the next RPC timeout.
    pub fn connection_timeout(&mut self) -> Duration {
        let now = self.clock.now();
        let (expired, next) = self.rpc.tick(now);
        for observer in expired {
            self.observer_failed(observer);
        }

        if now.duration_since(self.last_store_purge) >= STORE_PURGE_INTERVAL {
            self.last_store_purge = now;
            self.peers
                .purge_expired(self.settings.announce_interval, now);
            self.immutable.purge_expired(now);
        }
        self.update_status();
        next
    }

    // ----- incoming dispatch -----

    /// Feeds one received datagram through the node.
    pub fn incoming(&mut self, data: &[u8], from: SocketAddr) {
        let packet = match msg::parse(data) {
            Ok(packet) => packet,
            Err(e) => {
                trace!(%from, error = %e, "dropping malformed packet");
                return;
            }
        };

        match packet {
            Incoming::Query(query) => {
                // a read-only node never answers (BEP-43)
                if self.settings.read_only {
                    return;
                }
                let response = self.incoming_request(&query, from);
                self.send_value(&response, from);
            }
            Incoming::Reply(reply) => {
                if let Some(external) = reply.external_ip {
                    if let Some(alerts) = &self.alerts {
                        alerts.post(Alert::ExternalAddress {
                            address: external.ip(),
                            from,
                        });
                    }
                }
                let Some(observer) = self.rpc.resolve(&reply.tid, &from) else {
                    trace!(%from, "reply with unknown transaction id");
                    return;
                };
                self.handle_reply(observer, reply, from);
            }
            Incoming::Error { tid, code, message } => {
                debug!(%from, code, message, "remote error");
                if let Some(observer) = self.rpc.resolve(&tid, &from) {
                    self.observer_failed(observer);
                }
            }
        }
    }

    fn handle_reply(&mut self, observer: Observer, reply: ReplyMsg, from: SocketAddr) {
        let now = self.clock.now();
        let rtt = now.duration_since(observer.sent_at);

        if let Some(id) = reply.sender {
            self.table.node_seen(id, from, Some(rtt), now);
        }
        for node in reply.nodes() {
            if let Some(candidate) = self.table.heard_about(node.id, node.addr, now) {
                self.ping_stale(candidate.id, candidate.addr);
            }
        }

        match observer.kind {
            ObserverKind::Ping
            | ObserverKind::Refresh
            | ObserverKind::Announce
            | ObserverKind::Put => {}
            ObserverKind::Traversal => {
                let Some(tid) = observer.traversal else { return };
                if let Some(traversal) = self.traversals.get_mut(&tid) {
                    for node in reply.nodes() {
                        traversal.add_candidate(node);
                    }
                    let token = reply.get_bytes(b"token").cloned();
                    traversal.on_reply(&from, token);
                    apply_traversal_reply(traversal, &reply);
                }
                self.traversal_step(tid);
            }
        }
    }

    fn observer_failed(&mut self, observer: Observer) {
        if let Some(id) = observer.node_id {
            self.table.node_failed(&id);
        }
        if observer.kind == ObserverKind::Traversal {
            if let Some(tid) = observer.traversal {
                if let Some(traversal) = self.traversals.get_mut(&tid) {
                    traversal.on_failure(&observer.addr);
                }
                self.traversal_step(tid);
            }
        }
    }

    fn ping_stale(&mut self, id: NodeId, addr: SocketAddr) {
        trace!(stale = %id, "pinging stale routing-table entry");
        self.invoke(
            "ping",
            BTreeMap::new(),
            addr,
            ObserverKind::Ping,
            None,
            Some(id),
        );
    }

    // ----- traversal driving -----

    fn traversal_step(&mut self, tid: u32) {
        let (batch, target, shape) = {
            let Some(traversal) = self.traversals.get_mut(&tid) else {
                return;
            };
            if traversal.done {
                return;
            }
            if traversal.is_complete() {
                (Vec::new(), traversal.target, None)
            } else {
                let batch = traversal.next_batch();
                let shape = Some(query_shape(&traversal.kind));
                (batch, traversal.target, shape)
            }
        };

        let Some(shape) = shape else {
            self.traversal_completed(tid);
            return;
        };

        for node in batch {
            let mut args = BTreeMap::new();
            let name = match shape {
                QueryShape::FindNode => {
                    args.insert(
                        Bytes::from_static(b"target"),
                        Value::bytes(target.as_bytes()),
                    );
                    "find_node"
                }
                QueryShape::GetPeers => {
                    args.insert(
                        Bytes::from_static(b"info_hash"),
                        Value::bytes(target.as_bytes()),
                    );
                    "get_peers"
                }
                QueryShape::Get => {
                    args.insert(
                        Bytes::from_static(b"target"),
                        Value::bytes(target.as_bytes()),
                    );
                    "get"
                }
            };
            self.invoke(
                name,
                args,
                node.addr,
                ObserverKind::Traversal,
                Some(tid),
                Some(node.id),
            );
        }

        // everything may already be answered or dead
        let complete = self
            .traversals
            .get(&tid)
            .is_some_and(|t| t.is_complete());
        if complete {
            self.traversal_completed(tid);
        }
    }

    fn traversal_completed(&mut self, tid: u32) {
        let Some(mut traversal) = self.traversals.remove(&tid) else {
            return;
        };
        traversal.done = true;
        self.rpc.drop_traversal(tid);
        debug!(traversal = tid, kind = traversal.kind.name(), alive = traversal.num_alive(), "traversal complete");

        match traversal.kind {
            TraversalKind::Refresh => {}
            TraversalKind::Bootstrap { callback } => {
                let nodes = self.table.node_count();
                if let Some(alerts) = &self.alerts {
                    alerts.post(Alert::DhtBootstrap { nodes });
                }
                if let Some(callback) = callback {
                    callback(nodes);
                }
            }
            TraversalKind::GetPeers {
                info_hash,
                obfuscated,
                noseed,
                peers,
                announce,
                callback,
            } => {
                if obfuscated {
                    // decoy phase done: query the closest live nodes with
                    // the true info-hash
                    let id = self.alloc_traversal();
                    let mut next = Traversal::new(
                        id,
                        info_hash,
                        TraversalKind::GetPeers {
                            info_hash,
                            obfuscated: false,
                            noseed,
                            peers,
                            announce,
                            callback,
                        },
                    );
                    for candidate in traversal.candidates.iter().filter(|c| {
                        c.state == super::traversal::CandidateState::Alive
                    }) {
                        next.add_candidate(candidate.info);
                    }
                    self.traversals.insert(id, next);
                    self.traversal_step(id);
                    return;
                }

                if let Some(alerts) = &self.alerts {
                    alerts.post(Alert::DhtPeers {
                        info_hash: info_hash.0,
                        peers: peers.clone(),
                    });
                }
                if let Some(callback) = callback {
                    callback(peers);
                }

                if let Some(plan) = announce {
                    let targets: Vec<(NodeInfo, Bytes)> = traversal
                        .candidates
                        .iter()
                        .filter(|c| c.state == super::traversal::CandidateState::Alive)
                        .filter_map(|c| c.token.clone().map(|t| (c.info, t)))
                        .take(K)
                        .collect();
                    let count = targets.len();
                    for (node, token) in targets {
                        self.send_announce(info_hash, &plan, node, token);
                    }
                    if let Some(alerts) = &self.alerts {
                        alerts.post(Alert::DhtAnnounce {
                            info_hash: info_hash.0,
                            nodes: count,
                        });
                    }
                }
            }
            TraversalKind::GetItem {
                key,
                item,
                callback,
            } => {
                let mut item = item.unwrap_or_else(|| ItemValue {
                    value: Value::Bytes(Bytes::new()),
                    mutable: key.as_ref().map(|(pk, salt)| MutableMeta {
                        public_key: *pk,
                        signature: [0u8; 64],
                        seq: 0,
                        salt: salt.clone(),
                    }),
                });
                let publish = match callback {
                    Some(mut callback) => callback(&mut item),
                    None => false,
                };
                if publish {
                    let targets: Vec<(NodeInfo, Bytes)> = traversal
                        .candidates
                        .iter()
                        .filter(|c| c.state == super::traversal::CandidateState::Alive)
                        .filter_map(|c| c.token.clone().map(|t| (c.info, t)))
                        .take(K)
                        .collect();
                    for (node, token) in targets {
                        self.send_put(&item, node, token);
                    }
                }
            }
        }
        self.update_status();
    }

    fn send_announce(&mut self, info_hash: NodeId, plan: &AnnouncePlan, node: NodeInfo, token: Bytes) {
        let mut args = BTreeMap::new();
        args.insert(
            Bytes::from_static(b"info_hash"),
            Value::bytes(info_hash.as_bytes()),
        );
        args.insert(
            Bytes::from_static(b"port"),
            Value::Integer(plan.port as i64),
        );
        args.insert(Bytes::from_static(b"token"), Value::Bytes(token));
        args.insert(
            Bytes::from_static(b"seed"),
            Value::Integer(plan.seed as i64),
        );
        if plan.implied_port {
            args.insert(Bytes::from_static(b"implied_port"), Value::Integer(1));
        }
        self.invoke(
            "announce_peer",
            args,
            node.addr,
            ObserverKind::Announce,
            None,
            Some(node.id),
        );
    }

    fn send_put(&mut self, item: &ItemValue, node: NodeInfo, token: Bytes) {
        let mut args = BTreeMap::new();
        args.insert(Bytes::from_static(b"v"), item.value.clone());
        args.insert(Bytes::from_static(b"token"), Value::Bytes(token));
        if let Some(meta) = &item.mutable {
            args.insert(
                Bytes::from_static(b"seq"),
                Value::Integer(meta.seq as i64),
            );
            args.insert(Bytes::from_static(b"k"), Value::bytes(&meta.public_key));
            args.insert(Bytes::from_static(b"sig"), Value::bytes(&meta.signature));
            if !meta.salt.is_empty() {
                args.insert(
                    Bytes::from_static(b"salt"),
                    Value::Bytes(meta.salt.clone()),
                );
            }
        }
        self.invoke(
            "put",
            args,
            node.addr,
            ObserverKind::Put,
            None,
            Some(node.id),
        );
    }

    // ----- server side -----

    /// Builds the reply (or error) for an incoming query.
    fn incoming_request(&mut self, query: &QueryMsg, from: SocketAddr) -> Value {
        if self.settings.enforce_node_id && !query.sender.verify_for_ip(from.ip()) {
            return msg::error_reply(&query.tid, krpc::PROTOCOL, "invalid node ID");
        }

        if !query.read_only {
            if let Some(candidate) = self.table.heard_about(query.sender, from, self.clock.now())
            {
                self.ping_stale(candidate.id, candidate.addr);
            }
        }

        let (mut top, mut body) = msg::reply_shell(&query.tid, &from);
        body.insert(
            Bytes::from_static(b"id"),
            Value::bytes(self.id.as_bytes()),
        );
        // mirror the requester's external port
        body.insert(
            Bytes::from_static(b"p"),
            Value::Integer(from.port() as i64),
        );

        let result = match &query.name[..] {
            b"ping" => Ok(()),
            b"find_node" => self.handle_find_node(query, &mut body),
            b"get_peers" => self.handle_get_peers(query, from, &mut body),
            b"announce_peer" => self.handle_announce_peer(query, from),
            b"get" => self.handle_get(query, from, &mut body),
            b"put" => self.handle_put(query, from),
            _ => self.handle_unknown(query, &mut body),
        };

        match result {
            Ok(()) => {
                top.insert(b"r", Value::Dict(body));
                top
            }
            Err((code, message)) => msg::error_reply(&query.tid, code, message),
        }
    }

    fn write_closest_nodes(&self, target: &NodeId, body: &mut BTreeMap<Bytes, Value>) {
        let nodes: Vec<NodeInfo> = self
            .table
            .find_node(target, K)
            .iter()
            .map(|n| n.info())
            .collect();
        body.insert(
            Bytes::from_static(b"nodes"),
            Value::Bytes(msg::write_nodes(&nodes)),
        );
    }

    fn handle_find_node(
        &mut self,
        query: &QueryMsg,
        body: &mut BTreeMap<Bytes, Value>,
    ) -> Result<(), (i64, &'static str)> {
        let target = query
            .arg_hash(b"target")
            .map_err(|_| (krpc::PROTOCOL, "missing or invalid target"))?;
        self.write_closest_nodes(&NodeId(target), body);
        Ok(())
    }

    fn handle_get_peers(
        &mut self,
        query: &QueryMsg,
        from: SocketAddr,
        body: &mut BTreeMap<Bytes, Value>,
    ) -> Result<(), (i64, &'static str)> {
        let info_hash = query
            .arg_hash(b"info_hash")
            .map_err(|_| (krpc::PROTOCOL, "missing or invalid info_hash"))?;
        let info_hash = NodeId(info_hash);
        let noseed = query.arg_int(b"noseed").is_some_and(|v| v != 0);
        let scrape = query.arg_int(b"scrape").is_some_and(|v| v != 0);

        body.insert(
            Bytes::from_static(b"token"),
            Value::Bytes(self.tokens.generate(&from, info_hash.as_bytes())),
        );
        self.write_closest_nodes(&info_hash, body);

        if let Some(entry) = self.peers.torrent(&info_hash) {
            if let Some(name) = &entry.name {
                body.insert(Bytes::from_static(b"n"), Value::string(name));
            }
            if scrape {
                // BEP-33: aggregate bloom filters instead of peer lists
                let mut downloaders: BloomFilter<256> = BloomFilter::new();
                let mut seeds: BloomFilter<256> = BloomFilter::new();
                for (addr, peer) in &entry.peers {
                    let hash = hash_address(addr.ip());
                    if peer.seed {
                        seeds.set(&hash);
                    } else {
                        downloaders.set(&hash);
                    }
                }
                body.insert(
                    Bytes::from_static(b"BFpe"),
                    Value::bytes(downloaders.as_bytes()),
                );
                body.insert(Bytes::from_static(b"BFsd"), Value::bytes(seeds.as_bytes()));
            } else {
                let values = sample_peers(entry, self.settings.max_peers_reply, noseed);
                if !values.is_empty() {
                    body.insert(Bytes::from_static(b"values"), Value::List(values));
                }
            }
        }
        Ok(())
    }

    fn handle_announce_peer(
        &mut self,
        query: &QueryMsg,
        from: SocketAddr,
    ) -> Result<(), (i64, &'static str)> {
        let info_hash = query
            .arg_hash(b"info_hash")
            .map_err(|_| (krpc::PROTOCOL, "missing or invalid info_hash"))?;
        let info_hash = NodeId(info_hash);
        let token = query
            .arg_bytes(b"token")
            .ok_or((krpc::PROTOCOL, "missing token"))?
            .clone();

        let implied_port = query.arg_int(b"implied_port").is_some_and(|v| v != 0);
        let port = if implied_port {
            from.port() as i64
        } else {
            query.arg_int(b"port").ok_or((krpc::PROTOCOL, "missing port"))?
        };
        if !(0..=u16::MAX as i64).contains(&port) {
            return Err((krpc::PROTOCOL, "invalid port"));
        }

        if !self.tokens.verify(&token, &from, info_hash.as_bytes()) {
            debug!(%from, "announce with invalid token");
            return Err((krpc::PROTOCOL, "invalid token"));
        }

        // a valid token proves the source address isn't spoofed
        let now = self.clock.now();
        self.table.node_seen(query.sender, from, None, now);

        let seed = query.arg_int(b"seed").is_some_and(|v| v != 0);
        let name = query.arg_bytes(b"n").and_then(|n| std::str::from_utf8(n).ok().map(str::to_owned));
        let peer = SocketAddr::new(from.ip(), port as u16);
        self.peers
            .announce(info_hash, peer, seed, name.as_deref(), now);
        Ok(())
    }

    fn handle_get(
        &mut self,
        query: &QueryMsg,
        from: SocketAddr,
        body: &mut BTreeMap<Bytes, Value>,
    ) -> Result<(), (i64, &'static str)> {
        let target = query
            .arg_hash(b"target")
            .map_err(|_| (krpc::PROTOCOL, "missing or invalid target"))?;
        let target = NodeId(target);
        let caller_seq = query.arg_int(b"seq");

        body.insert(
            Bytes::from_static(b"token"),
            Value::Bytes(self.tokens.generate(&from, target.as_bytes())),
        );
        self.write_closest_nodes(&target, body);

        // a seq argument implies a mutable lookup; skip the immutable table
        if caller_seq.is_none() {
            if let Some(item) = self.immutable.get(&target) {
                let value = crate::bencode::decode(&item.value)
                    .map_err(|_| (krpc::SERVER, "corrupt stored item"))?;
                body.insert(Bytes::from_static(b"v"), value);
                return Ok(());
            }
        }

        if let Some(item) = self.mutable.get(&target) {
            body.insert(
                Bytes::from_static(b"seq"),
                Value::Integer(item.seq as i64),
            );
            let wants_value = caller_seq.map_or(true, |s| (s as u64) < item.seq);
            if wants_value {
                let value = crate::bencode::decode(&item.value)
                    .map_err(|_| (krpc::SERVER, "corrupt stored item"))?;
                body.insert(Bytes::from_static(b"v"), value);
                body.insert(Bytes::from_static(b"sig"), Value::bytes(&item.signature));
                body.insert(Bytes::from_static(b"k"), Value::bytes(&item.public_key));
            }
        }
        Ok(())
    }

    fn handle_put(
        &mut self,
        query: &QueryMsg,
        from: SocketAddr,
    ) -> Result<(), (i64, &'static str)> {
        let token = query
            .arg_bytes(b"token")
            .ok_or((krpc::PROTOCOL, "missing token"))?
            .clone();
        let value = query.arg(b"v").ok_or((krpc::PROTOCOL, "missing v"))?;

        // canonical encoding is what gets hashed and signed
        let value_bytes = encode(value);
        if value_bytes.is_empty() || value_bytes.len() > 1000 {
            return Err((krpc::MESSAGE_TOO_BIG, "message too big"));
        }

        let salt = query.arg_bytes(b"salt").cloned().unwrap_or_default();
        if salt.len() > 64 {
            return Err((krpc::SALT_TOO_BIG, "salt too big"));
        }

        let seq = query.arg_int(b"seq");
        let public_key = query.arg_bytes(b"k");
        let signature = query.arg_bytes(b"sig");
        let mutable_put = seq.is_some() && public_key.is_some() && signature.is_some();

        let target = if mutable_put {
            let pk = public_key.expect("checked above");
            if pk.len() != 32 {
                return Err((krpc::PROTOCOL, "invalid public key"));
            }
            let mut pk_arr = [0u8; 32];
            pk_arr.copy_from_slice(pk);
            mutable_target(&pk_arr, &salt)
        } else {
            let mut hasher = Sha1::new();
            hasher.update(&value_bytes);
            NodeId(hasher.finalize().into())
        };

        // write tokens are bound to the target of the preceding get
        if !self.tokens.verify(&token, &from, target.as_bytes()) {
            debug!(%from, "put with invalid token");
            return Err((krpc::PROTOCOL, "invalid token"));
        }

        let now = self.clock.now();

        if !mutable_put {
            self.immutable.put(
                &self.id,
                target,
                Bytes::from(value_bytes),
                from.ip(),
                now,
            );
        } else {
            let seq = seq.expect("checked above");
            if seq < 0 {
                return Err((krpc::PROTOCOL, "invalid sequence number"));
            }
            let seq = seq as u64;
            let pk = public_key.expect("checked above");
            let sig = signature.expect("checked above");
            if sig.len() != 64 {
                return Err((krpc::PROTOCOL, "invalid signature length"));
            }
            let mut pk_arr = [0u8; 32];
            pk_arr.copy_from_slice(pk);
            let mut sig_arr = [0u8; 64];
            sig_arr.copy_from_slice(sig);

            if !verify_mutable_signature(&pk_arr, &sig_arr, &salt, seq, &value_bytes) {
                return Err((krpc::INVALID_SIGNATURE, "invalid signature"));
            }

            if let Some(existing) = self.mutable.get_mut(&target) {
                // CAS gate first, then monotonic sequence
                if let Some(cas) = query.arg_int(b"cas") {
                    if existing.seq != cas as u64 {
                        return Err((krpc::CAS_MISMATCH, "CAS mismatch"));
                    }
                }
                if existing.seq > seq {
                    return Err((krpc::SEQ_TOO_LOW, "old sequence number"));
                }
                if existing.seq < seq {
                    existing.value = Bytes::from(value_bytes);
                    existing.signature = sig_arr;
                    existing.seq = seq;
                }
                existing.touch(from.ip(), now);
            } else {
                self.mutable.insert(
                    target,
                    Bytes::from(value_bytes),
                    pk_arr,
                    sig_arr,
                    seq,
                    salt,
                    from.ip(),
                    now,
                );
            }
        }

        self.table.node_seen(query.sender, from, None, now);
        Ok(())
    }

    /// Unknown queries carrying a target or info_hash are answered like
    /// find_node, for forward compatibility.
    fn handle_unknown(
        &mut self,
        query: &QueryMsg,
        body: &mut BTreeMap<Bytes, Value>,
    ) -> Result<(), (i64, &'static str)> {
        let target = query
            .arg_hash(b"target")
            .or_else(|_| query.arg_hash(b"info_hash"))
            .map_err(|_| (krpc::PROTOCOL, "unknown message"))?;
        self.write_closest_nodes(&NodeId(target), body);
        Ok(())
    }
}

#[derive(Clone, Copy)]
enum QueryShape {
    FindNode,
    GetPeers,
    Get,
}

fn query_shape(kind: &TraversalKind) -> QueryShape {
    match kind {
        TraversalKind::Bootstrap { .. } => QueryShape::FindNode,
        TraversalKind::Refresh => QueryShape::GetPeers,
        TraversalKind::GetPeers { .. } => QueryShape::GetPeers,
        TraversalKind::GetItem { .. } => QueryShape::Get,
    }
}

/// Target of a mutable item: SHA-1 of public key followed by salt.
pub fn mutable_target(public_key: &[u8; 32], salt: &[u8]) -> NodeId {
    let mut hasher = Sha1::new();
    hasher.update(public_key);
    hasher.update(salt);
    NodeId(hasher.finalize().into())
}

/// The canonical byte sequence covered by a mutable item signature:
/// `4:salt<len>:<salt>` (when salted) then `3:seqi<seq>e1:v<v>`.
pub fn mutable_signature_buffer(salt: &[u8], seq: u64, value_bytes: &[u8]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(salt.len() + value_bytes.len() + 32);
    if !salt.is_empty() {
        buf.extend_from_slice(b"4:salt");
        buf.extend_from_slice(salt.len().to_string().as_bytes());
        buf.push(b':');
        buf.extend_from_slice(salt);
    }
    buf.extend_from_slice(b"3:seqi");
    buf.extend_from_slice(seq.to_string().as_bytes());
    buf.extend_from_slice(b"e1:v");
    buf.extend_from_slice(value_bytes);
    buf
}

fn verify_mutable_signature(
    public_key: &[u8; 32],
    signature: &[u8; 64],
    salt: &[u8],
    seq: u64,
    value_bytes: &[u8],
) -> bool {
    let Ok(key) = VerifyingKey::from_bytes(public_key) else {
        return false;
    };
    let buf = mutable_signature_buffer(salt, seq, value_bytes);
    key.verify_strict(&buf, &Signature::from_bytes(signature))
        .is_ok()
}

/// Selection-samples up to `max` compact peer endpoints from a swarm.
fn sample_peers(entry: &TorrentEntry, max: usize, noseed: bool) -> Vec<Value> {
    let eligible: Vec<&SocketAddr> = entry
        .peers
        .iter()
        .filter(|(_, peer)| !(noseed && peer.seed))
        .map(|(addr, _)| addr)
        .collect();

    let num = eligible.len().min(max);
    let mut out = Vec::with_capacity(num);
    let mut remaining = eligible.len();
    let mut needed = num;
    let mut rng = rand::rng();

    for addr in eligible {
        if needed == 0 {
            break;
        }
        if rng.random_range(0..remaining) < needed {
            out.push(Value::from(msg::write_endpoint(addr)));
            needed -= 1;
        }
        remaining -= 1;
    }
    out
}

/// Folds a get-item reply into the traversal's best-seen item.
fn apply_traversal_reply(traversal: &mut Traversal, reply: &ReplyMsg) {
    match &mut traversal.kind {
        TraversalKind::GetPeers { peers, .. } => {
            for peer in reply.values() {
                if !peers.contains(&peer) {
                    peers.push(peer);
                }
            }
        }
        TraversalKind::GetItem { key, item, .. } => {
            let Some(value) = reply.get(b"v") else { return };
            let value_bytes = encode(value);

            match key {
                None => {
                    // immutable: the value must hash to the target
                    let mut hasher = Sha1::new();
                    hasher.update(&value_bytes);
                    let target = NodeId(hasher.finalize().into());
                    if target == traversal.target && item.is_none() {
                        *item = Some(ItemValue {
                            value: value.clone(),
                            mutable: None,
                        });
                    }
                }
                Some((expected_pk, salt)) => {
                    let Some(seq) = reply.get(b"seq").and_then(|v| v.as_integer()) else {
                        return;
                    };
                    if seq < 0 {
                        return;
                    }
                    let seq = seq as u64;
                    let Some(pk) = reply.get_bytes(b"k") else { return };
                    let Some(sig) = reply.get_bytes(b"sig") else { return };
                    if pk.len() != 32 || sig.len() != 64 || pk[..] != expected_pk[..] {
                        return;
                    }
                    let mut sig_arr = [0u8; 64];
                    sig_arr.copy_from_slice(sig);
                    if !verify_mutable_signature(expected_pk, &sig_arr, salt, seq, &value_bytes) {
                        return;
                    }
                    let better = item
                        .as_ref()
                        .and_then(|i| i.mutable.as_ref())
                        .map_or(true, |meta| seq > meta.seq);
                    if better {
                        *item = Some(ItemValue {
                            value: value.clone(),
                            mutable: Some(MutableMeta {
                                public_key: *expected_pk,
                                signature: sig_arr,
                                seq,
                                salt: salt.clone(),
                            }),
                        });
                    }
                }
            }
        }
        _ => {}
    }
}
