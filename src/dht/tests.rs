use std::collections::BTreeMap;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use ed25519_dalek::{Signer, SigningKey};
use parking_lot::Mutex;

use super::node::mutable_signature_buffer;
use super::*;
use crate::bencode::{decode, encode, Value};

struct CaptureSocket {
    sent: Mutex<Vec<(Vec<u8>, SocketAddr)>>,
}

impl CaptureSocket {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            sent: Mutex::new(Vec::new()),
        })
    }

    fn take(&self) -> Vec<(Value, SocketAddr)> {
        self.sent
            .lock()
            .drain(..)
            .map(|(data, to)| (decode(&data).expect("node sent valid bencode"), to))
            .collect()
    }
}

impl Socket for CaptureSocket {
    fn send(&self, data: &[u8], to: SocketAddr) {
        self.sent.lock().push((data.to_vec(), to));
    }
}

struct TestClock(Mutex<Instant>);

impl TestClock {
    fn new() -> Arc<Self> {
        Arc::new(Self(Mutex::new(Instant::now())))
    }

    fn advance(&self, by: Duration) {
        let mut now = self.0.lock();
        *now += by;
    }
}

impl Clock for TestClock {
    fn now(&self) -> Instant {
        *self.0.lock()
    }
}

struct TestNode {
    node: Node,
    socket: Arc<CaptureSocket>,
    clock: Arc<TestClock>,
}

fn test_node() -> TestNode {
    let socket = CaptureSocket::new();
    let clock = TestClock::new();
    let node = Node::new(
        Some(NodeId([0x55; 20])),
        DhtSettings::default(),
        socket.clone(),
        clock.clone(),
        None,
    );
    TestNode {
        node,
        socket,
        clock,
    }
}

fn peer_addr(n: u8) -> SocketAddr {
    SocketAddr::new(IpAddr::V4(Ipv4Addr::new(10, 0, 0, n)), 6000 + n as u16)
}

fn query(tid: &[u8], name: &str, sender: &NodeId, extra: &[(&'static [u8], Value)]) -> Vec<u8> {
    let mut args = BTreeMap::new();
    args.insert(
        Bytes::from_static(b"id"),
        Value::bytes(sender.as_bytes()),
    );
    for (key, value) in extra {
        args.insert(Bytes::copy_from_slice(key), value.clone());
    }
    let mut top = Value::dict();
    top.insert(b"t", Value::bytes(tid));
    top.insert(b"y", Value::string("q"));
    top.insert(b"q", Value::string(name));
    top.insert(b"a", Value::Dict(args));
    encode(&top)
}

/// Runs a query through the node and returns the reply it sent back.
fn exchange(t: &mut TestNode, packet: &[u8], from: SocketAddr) -> Value {
    t.node.incoming(packet, from);
    let sent = t.socket.take();
    let (reply, to) = sent
        .into_iter()
        .rev()
        .find(|(_, to)| *to == from)
        .expect("node replied");
    assert_eq!(to, from);
    reply
}

fn grant_token(t: &mut TestNode, from: SocketAddr, sender: &NodeId, info_hash: &NodeId) -> Bytes {
    let reply = exchange(
        t,
        &query(
            b"gt",
            "get_peers",
            sender,
            &[(b"info_hash", Value::bytes(info_hash.as_bytes()))],
        ),
        from,
    );
    reply
        .get(b"r")
        .and_then(|r| r.get_bytes(b"token"))
        .cloned()
        .expect("get_peers reply carries a token")
}

fn grant_put_token(t: &mut TestNode, from: SocketAddr, sender: &NodeId, target: &NodeId) -> Bytes {
    let reply = exchange(
        t,
        &query(
            b"pt",
            "get",
            sender,
            &[(b"target", Value::bytes(target.as_bytes()))],
        ),
        from,
    );
    reply
        .get(b"r")
        .and_then(|r| r.get_bytes(b"token"))
        .cloned()
        .expect("get reply carries a token")
}

#[test]
fn test_ping_reply_echoes_transaction_and_endpoint() {
    let mut t = test_node();
    let from = peer_addr(1);
    let sender = NodeId([0xAA; 20]);

    let reply = exchange(&mut t, &query(b"aa", "ping", &sender, &[]), from);

    assert_eq!(reply.get(b"y").and_then(|v| v.as_str()), Some("r"));
    assert_eq!(
        reply.get(b"t").and_then(|v| v.as_bytes()).map(|b| &b[..]),
        Some(b"aa".as_slice())
    );
    let r = reply.get(b"r").expect("reply body");
    assert_eq!(
        r.get_bytes(b"id").map(|b| &b[..]),
        Some([0x55u8; 20].as_slice())
    );
    // BEP-42 ip echo: our view of the sender, compact-encoded
    let ip = reply.get_bytes(b"ip").expect("ip echo");
    assert_eq!(&ip[..4], &[10, 0, 0, 1]);
    assert_eq!(u16::from_be_bytes([ip[4], ip[5]]), 6001);
}

#[test]
fn test_find_node_returns_known_nodes() {
    let mut t = test_node();

    // introduce a few nodes via pings
    for i in 1..=5u8 {
        let sender = NodeId([i; 20]);
        exchange(&mut t, &query(b"aa", "ping", &sender, &[]), peer_addr(i));
    }

    let target = NodeId([3u8; 20]);
    let reply = exchange(
        &mut t,
        &query(
            b"fn",
            "find_node",
            &NodeId([9; 20]),
            &[(b"target", Value::bytes(target.as_bytes()))],
        ),
        peer_addr(9),
    );

    let nodes = reply
        .get(b"r")
        .and_then(|r| r.get_bytes(b"nodes"))
        .expect("nodes entry");
    assert!(!nodes.is_empty());
    assert_eq!(nodes.len() % 26, 0);
    // the exact target is among the results, first
    assert_eq!(&nodes[..20], target.as_bytes());
}

#[test]
fn test_announce_and_get_peers_round_trip() {
    let mut t = test_node();
    let info_hash = NodeId([0xBB; 20]);

    // three peers announce with distinct ports
    for i in 1..=3u8 {
        let from = peer_addr(i);
        let sender = NodeId([i; 20]);
        let token = grant_token(&mut t, from, &sender, &info_hash);
        let reply = exchange(
            &mut t,
            &query(
                b"an",
                "announce_peer",
                &sender,
                &[
                    (b"info_hash", Value::bytes(info_hash.as_bytes())),
                    (b"port", Value::Integer(7000 + i as i64)),
                    (b"token", Value::Bytes(token)),
                ],
            ),
            from,
        );
        assert_eq!(reply.get(b"y").and_then(|v| v.as_str()), Some("r"));
    }

    // a fourth peer asks for the swarm
    let reply = exchange(
        &mut t,
        &query(
            b"gp",
            "get_peers",
            &NodeId([9; 20]),
            &[(b"info_hash", Value::bytes(info_hash.as_bytes()))],
        ),
        peer_addr(9),
    );

    let values = reply
        .get(b"r")
        .and_then(|r| r.get(b"values"))
        .and_then(|v| v.as_list())
        .expect("values present");
    assert_eq!(values.len(), 3);

    let mut ports: Vec<u16> = values
        .iter()
        .filter_map(|v| v.as_bytes())
        .map(|b| u16::from_be_bytes([b[4], b[5]]))
        .collect();
    ports.sort_unstable();
    assert_eq!(ports, vec![7001, 7002, 7003]);
}

#[test]
fn test_announce_rejects_invalid_token() {
    let mut t = test_node();
    let info_hash = NodeId([0xBB; 20]);

    let reply = exchange(
        &mut t,
        &query(
            b"an",
            "announce_peer",
            &NodeId([1; 20]),
            &[
                (b"info_hash", Value::bytes(info_hash.as_bytes())),
                (b"port", Value::Integer(7001)),
                (b"token", Value::bytes(b"bad!")),
            ],
        ),
        peer_addr(1),
    );

    assert_eq!(reply.get(b"y").and_then(|v| v.as_str()), Some("e"));
    let error = reply.get(b"e").and_then(|v| v.as_list()).unwrap();
    assert_eq!(error[0].as_integer(), Some(krpc::PROTOCOL));
}

#[test]
fn test_implied_port_uses_source_port() {
    let mut t = test_node();
    let info_hash = NodeId([0xCC; 20]);
    let from = peer_addr(2);
    let sender = NodeId([2; 20]);

    let token = grant_token(&mut t, from, &sender, &info_hash);
    exchange(
        &mut t,
        &query(
            b"an",
            "announce_peer",
            &sender,
            &[
                (b"info_hash", Value::bytes(info_hash.as_bytes())),
                (b"port", Value::Integer(1)),
                (b"implied_port", Value::Integer(1)),
                (b"token", Value::Bytes(token)),
            ],
        ),
        from,
    );

    let reply = exchange(
        &mut t,
        &query(
            b"gp",
            "get_peers",
            &NodeId([9; 20]),
            &[(b"info_hash", Value::bytes(info_hash.as_bytes()))],
        ),
        peer_addr(9),
    );
    let values = reply
        .get(b"r")
        .and_then(|r| r.get(b"values"))
        .and_then(|v| v.as_list())
        .unwrap();
    let port = values[0]
        .as_bytes()
        .map(|b| u16::from_be_bytes([b[4], b[5]]))
        .unwrap();
    assert_eq!(port, from.port());
}

#[test]
fn test_scrape_returns_bloom_filters() {
    let mut t = test_node();
    let info_hash = NodeId([0xDD; 20]);

    for (i, seed) in [(1u8, 0i64), (2, 1)] {
        let from = peer_addr(i);
        let sender = NodeId([i; 20]);
        let token = grant_token(&mut t, from, &sender, &info_hash);
        exchange(
            &mut t,
            &query(
                b"an",
                "announce_peer",
                &sender,
                &[
                    (b"info_hash", Value::bytes(info_hash.as_bytes())),
                    (b"port", Value::Integer(7000)),
                    (b"seed", Value::Integer(seed)),
                    (b"token", Value::Bytes(token)),
                ],
            ),
            from,
        );
    }

    let reply = exchange(
        &mut t,
        &query(
            b"sc",
            "get_peers",
            &NodeId([9; 20]),
            &[
                (b"info_hash", Value::bytes(info_hash.as_bytes())),
                (b"scrape", Value::Integer(1)),
            ],
        ),
        peer_addr(9),
    );

    let r = reply.get(b"r").unwrap();
    let downloaders = r.get_bytes(b"BFpe").expect("BFpe");
    let seeds = r.get_bytes(b"BFsd").expect("BFsd");
    assert_eq!(downloaders.len(), 256);
    assert_eq!(seeds.len(), 256);
    assert!(r.get(b"values").is_none(), "scrape suppresses peer lists");

    let mut downloader_filter: BloomFilter<256> = BloomFilter::new();
    downloader_filter.set_ip(peer_addr(1).ip());
    assert_eq!(&downloaders[..], downloader_filter.as_bytes());
}

#[test]
fn test_immutable_put_and_get() {
    let mut t = test_node();
    let from = peer_addr(3);
    let sender = NodeId([3; 20]);

    let value = Value::string("immutable payload");
    let value_bytes = encode(&value);
    let target = {
        use sha1::{Digest, Sha1};
        let mut hasher = Sha1::new();
        hasher.update(&value_bytes);
        NodeId(hasher.finalize().into())
    };

    let token = grant_put_token(&mut t, from, &sender, &target);
    let reply = exchange(
        &mut t,
        &query(
            b"pu",
            "put",
            &sender,
            &[(b"v", value.clone()), (b"token", Value::Bytes(token))],
        ),
        from,
    );
    assert_eq!(reply.get(b"y").and_then(|v| v.as_str()), Some("r"));

    let reply = exchange(
        &mut t,
        &query(
            b"ge",
            "get",
            &NodeId([9; 20]),
            &[(b"target", Value::bytes(target.as_bytes()))],
        ),
        peer_addr(9),
    );
    assert_eq!(
        reply.get(b"r").and_then(|r| r.get(b"v")),
        Some(&value)
    );
}

#[test]
fn test_put_rejects_oversized_value() {
    let mut t = test_node();
    let from = peer_addr(3);
    let sender = NodeId([3; 20]);

    let value = Value::Bytes(Bytes::from(vec![0u8; 1200]));
    let reply = exchange(
        &mut t,
        &query(
            b"pu",
            "put",
            &sender,
            &[(b"v", value), (b"token", Value::bytes(b"xxxx"))],
        ),
        from,
    );
    let error = reply.get(b"e").and_then(|v| v.as_list()).unwrap();
    assert_eq!(error[0].as_integer(), Some(krpc::MESSAGE_TOO_BIG));
}

fn signed_put_args(
    key: &SigningKey,
    value: &Value,
    seq: u64,
    cas: Option<i64>,
    token: Bytes,
) -> Vec<(&'static [u8], Value)> {
    let value_bytes = encode(value);
    let signature = key.sign(&mutable_signature_buffer(&[], seq, &value_bytes));
    let mut args: Vec<(&'static [u8], Value)> = vec![
        (b"v", value.clone()),
        (b"seq", Value::Integer(seq as i64)),
        (b"k", Value::bytes(key.verifying_key().as_bytes())),
        (b"sig", Value::bytes(&signature.to_bytes())),
        (b"token", Value::Bytes(token)),
    ];
    if let Some(cas) = cas {
        args.push((b"cas", Value::Integer(cas)));
    }
    args
}

#[test]
fn test_mutable_put_sequence_and_cas_rules() {
    let mut t = test_node();
    let from = peer_addr(4);
    let sender = NodeId([4; 20]);
    let key = SigningKey::from_bytes(&[7u8; 32]);
    let target = mutable_target(key.verifying_key().as_bytes(), &[]);

    // put seq=5
    let token = grant_put_token(&mut t, from, &sender, &target);
    let v5 = Value::string("five");
    let reply = exchange(
        &mut t,
        &query(b"p1", "put", &sender, &signed_put_args(&key, &v5, 5, None, token)),
        from,
    );
    assert_eq!(reply.get(b"y").and_then(|v| v.as_str()), Some("r"));

    // put seq=4: stale, rejected with 302
    let token = grant_put_token(&mut t, from, &sender, &target);
    let v4 = Value::string("four");
    let reply = exchange(
        &mut t,
        &query(b"p2", "put", &sender, &signed_put_args(&key, &v4, 4, None, token)),
        from,
    );
    let error = reply.get(b"e").and_then(|v| v.as_list()).unwrap();
    assert_eq!(error[0].as_integer(), Some(krpc::SEQ_TOO_LOW));

    // put seq=6 with cas=5: accepted
    let token = grant_put_token(&mut t, from, &sender, &target);
    let v6 = Value::string("six");
    let reply = exchange(
        &mut t,
        &query(b"p3", "put", &sender, &signed_put_args(&key, &v6, 6, Some(5), token)),
        from,
    );
    assert_eq!(reply.get(b"y").and_then(|v| v.as_str()), Some("r"));

    // put seq=7 with stale cas=5: rejected with 301
    let token = grant_put_token(&mut t, from, &sender, &target);
    let v7 = Value::string("seven");
    let reply = exchange(
        &mut t,
        &query(b"p4", "put", &sender, &signed_put_args(&key, &v7, 7, Some(5), token)),
        from,
    );
    let error = reply.get(b"e").and_then(|v| v.as_list()).unwrap();
    assert_eq!(error[0].as_integer(), Some(krpc::CAS_MISMATCH));

    // get with seq=5: stored seq 6 is newer, full item returned
    let reply = exchange(
        &mut t,
        &query(
            b"g1",
            "get",
            &NodeId([9; 20]),
            &[
                (b"target", Value::bytes(target.as_bytes())),
                (b"seq", Value::Integer(5)),
            ],
        ),
        peer_addr(9),
    );
    let r = reply.get(b"r").unwrap();
    assert_eq!(r.get_int(b"seq"), Some(6));
    assert_eq!(r.get(b"v"), Some(&v6));
    assert!(r.get(b"sig").is_some());
    assert!(r.get(b"k").is_some());

    // get with seq=6: caller is current, only seq comes back
    let reply = exchange(
        &mut t,
        &query(
            b"g2",
            "get",
            &NodeId([9; 20]),
            &[
                (b"target", Value::bytes(target.as_bytes())),
                (b"seq", Value::Integer(6)),
            ],
        ),
        peer_addr(9),
    );
    let r = reply.get(b"r").unwrap();
    assert_eq!(r.get_int(b"seq"), Some(6));
    assert!(r.get(b"v").is_none());
    assert!(r.get(b"sig").is_none());
}

#[test]
fn test_mutable_put_rejects_bad_signature() {
    let mut t = test_node();
    let from = peer_addr(4);
    let sender = NodeId([4; 20]);
    let key = SigningKey::from_bytes(&[7u8; 32]);
    let target = mutable_target(key.verifying_key().as_bytes(), &[]);

    let token = grant_put_token(&mut t, from, &sender, &target);
    let value = Value::string("forged");
    let reply = exchange(
        &mut t,
        &query(
            b"pf",
            "put",
            &sender,
            &[
                (b"v", value),
                (b"seq", Value::Integer(1)),
                (b"k", Value::bytes(key.verifying_key().as_bytes())),
                (b"sig", Value::bytes(&[0u8; 64])),
                (b"token", Value::Bytes(token)),
            ],
        ),
        from,
    );
    let error = reply.get(b"e").and_then(|v| v.as_list()).unwrap();
    assert_eq!(error[0].as_integer(), Some(krpc::INVALID_SIGNATURE));
}

#[test]
fn test_unknown_query_with_target_acts_as_find_node() {
    let mut t = test_node();
    for i in 1..=3u8 {
        exchange(
            &mut t,
            &query(b"aa", "ping", &NodeId([i; 20]), &[]),
            peer_addr(i),
        );
    }

    let reply = exchange(
        &mut t,
        &query(
            b"uq",
            "future_query",
            &NodeId([9; 20]),
            &[(b"target", Value::bytes(&[1u8; 20]))],
        ),
        peer_addr(9),
    );
    assert!(reply.get(b"r").and_then(|r| r.get_bytes(b"nodes")).is_some());
}

#[test]
fn test_unknown_query_without_target_errors() {
    let mut t = test_node();
    let reply = exchange(
        &mut t,
        &query(b"uq", "future_query", &NodeId([9; 20]), &[]),
        peer_addr(9),
    );
    assert_eq!(reply.get(b"y").and_then(|v| v.as_str()), Some("e"));
}

#[test]
fn test_read_only_sender_stays_out_of_routing_table() {
    let mut t = test_node();
    let mut top = decode(&query(b"aa", "ping", &NodeId([1; 20]), &[])).unwrap();
    top.insert(b"ro", Value::Integer(1));
    t.node.incoming(&encode(&top), peer_addr(1));
    t.socket.take();

    assert_eq!(t.node.routing_table().node_count(), 0);
}

#[test]
fn test_announce_traversal_end_to_end() {
    let mut t = test_node();
    let info_hash = NodeId([0xEE; 20]);
    let remote_id = NodeId([0x11; 20]);
    let remote = peer_addr(20);

    // the remote introduces itself
    exchange(&mut t, &query(b"aa", "ping", &remote_id, &[]), remote);

    // start an announce; the node queries the remote with get_peers
    let found: Arc<Mutex<Option<Vec<SocketAddr>>>> = Arc::new(Mutex::new(None));
    let slot = found.clone();
    t.node.announce(
        info_hash,
        7777,
        false,
        false,
        Some(Box::new(move |peers| {
            *slot.lock() = Some(peers);
        })),
    );

    let sent = t.socket.take();
    let (packet, to) = sent.first().expect("traversal sent a query");
    assert_eq!(*to, remote);
    assert_eq!(packet.get(b"q").and_then(|v| v.as_str()), Some("get_peers"));
    assert_eq!(
        packet
            .get(b"a")
            .and_then(|a| a.get_bytes(b"info_hash"))
            .map(|b| &b[..]),
        Some(info_hash.as_bytes().as_slice())
    );
    let tid = packet.get_bytes(b"t").unwrap().clone();

    // craft the remote's reply: one peer plus a write token
    let swarm_peer = peer_addr(33);
    let mut body = Value::dict();
    body.insert(b"id", Value::bytes(remote_id.as_bytes()));
    body.insert(b"token", Value::bytes(b"tokn"));
    body.insert(
        b"values",
        Value::List(vec![Value::from(super::msg::write_endpoint(&swarm_peer))]),
    );
    let mut reply = Value::dict();
    reply.insert(b"t", Value::Bytes(tid));
    reply.insert(b"y", Value::string("r"));
    reply.insert(b"r", body);
    t.node.incoming(&encode(&reply), remote);

    // the traversal completed: peers delivered, announce_peer sent back
    assert_eq!(found.lock().take(), Some(vec![swarm_peer]));

    let sent = t.socket.take();
    let announce = sent
        .iter()
        .find(|(p, _)| p.get(b"q").and_then(|v| v.as_str()) == Some("announce_peer"))
        .map(|(p, _)| p)
        .expect("announce_peer follow-up");
    let args = announce.get(b"a").unwrap();
    assert_eq!(
        args.get_bytes(b"info_hash").map(|b| &b[..]),
        Some(info_hash.as_bytes().as_slice())
    );
    assert_eq!(args.get_int(b"port"), Some(7777));
    assert_eq!(args.get_bytes(b"token").map(|b| &b[..]), Some(b"tokn".as_slice()));
}

#[test]
fn test_traversal_terminates_against_dead_nodes() {
    let mut t = test_node();

    // a routing table full of nodes that will never answer
    for i in 1..=20u8 {
        exchange(&mut t, &query(b"aa", "ping", &NodeId([i; 20]), &[]), peer_addr(i));
    }

    t.node.get_peers(NodeId([0x42; 20]), Box::new(|peers| {
        assert!(peers.is_empty());
    }));
    assert!(t.node.status().active_traversals > 0);

    // every round of timeouts fails α queries and issues the next batch
    for _ in 0..40 {
        t.clock.advance(Duration::from_secs(3));
        t.node.connection_timeout();
        t.socket.take();
        if t.node.status().active_traversals == 0 {
            break;
        }
    }
    assert_eq!(t.node.status().active_traversals, 0);
}

#[test]
fn test_peers_expire_after_announce_interval() {
    let mut t = test_node();
    let info_hash = NodeId([0xAB; 20]);
    let from = peer_addr(1);
    let sender = NodeId([1; 20]);

    let token = grant_token(&mut t, from, &sender, &info_hash);
    exchange(
        &mut t,
        &query(
            b"an",
            "announce_peer",
            &sender,
            &[
                (b"info_hash", Value::bytes(info_hash.as_bytes())),
                (b"port", Value::Integer(7001)),
                (b"token", Value::Bytes(token)),
            ],
        ),
        from,
    );
    assert_eq!(t.node.status().torrents, 0); // status lags until maintenance

    // 46 minutes later (1.5 × 30 min + slack) the peer is gone
    t.clock.advance(Duration::from_secs(46 * 60));
    t.node.connection_timeout();

    let reply = exchange(
        &mut t,
        &query(
            b"gp",
            "get_peers",
            &NodeId([9; 20]),
            &[(b"info_hash", Value::bytes(info_hash.as_bytes()))],
        ),
        peer_addr(9),
    );
    assert!(reply.get(b"r").and_then(|r| r.get(b"values")).is_none());
}

#[test]
fn test_node_id_distance_and_bucket_index() {
    let a = NodeId([0u8; 20]);
    let mut b = NodeId([0u8; 20]);
    b.0[0] = 0x80;
    assert_eq!(a.bucket_index(&b), 0);
    assert_eq!(a.distance_exp(&b), 159);

    let mut c = NodeId([0u8; 20]);
    c.0[2] = 0x01;
    assert_eq!(a.bucket_index(&c), 23);
    assert_eq!(a.distance(&a), [0u8; 20]);
}

#[test]
fn test_random_in_bucket_lands_in_bucket() {
    let our = NodeId::generate();
    for bits in [0usize, 5, 8, 21, 100, 159] {
        let probe = our.random_in_bucket(bits);
        assert_eq!(our.bucket_index(&probe), bits, "bits = {}", bits);
    }
}

#[test]
fn test_prefix_mask_keeps_leading_bits() {
    let id = NodeId([0xFF; 20]);
    let masked = id.prefix_mask(12);
    assert_eq!(masked.0[0], 0xFF);
    assert_eq!(masked.0[1], 0xF0);
    assert!(masked.0[2..].iter().all(|&b| b == 0));
}

#[test]
fn test_bep42_generated_id_verifies() {
    let ip: IpAddr = "203.0.113.7".parse().unwrap();
    let id = NodeId::generate_for_ip(ip);
    assert!(id.verify_for_ip(ip));

    // a random id is overwhelmingly unlikely to satisfy the CRC bits
    let mut misses = 0;
    for _ in 0..8 {
        if !NodeId::generate().verify_for_ip(ip) {
            misses += 1;
        }
    }
    assert!(misses >= 7);
}

#[test]
fn test_local_addresses_bypass_bep42() {
    let id = NodeId::generate();
    assert!(id.verify_for_ip("127.0.0.1".parse().unwrap()));
    assert!(id.verify_for_ip("192.168.1.4".parse().unwrap()));
}
