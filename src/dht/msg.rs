use std::collections::BTreeMap;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};

use bytes::Bytes;

use super::error::DhtError;
use super::id::NodeId;
use crate::bencode::{decode, Value};

pub type TransactionId = Bytes;

/// A node as carried in compact `nodes` entries: 20-byte id + 6-byte
/// IPv4 endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NodeInfo {
    pub id: NodeId,
    pub addr: SocketAddr,
}

impl NodeInfo {
    pub const COMPACT_LEN: usize = 26;

    pub fn from_compact(data: &[u8]) -> Option<Self> {
        if data.len() != Self::COMPACT_LEN {
            return None;
        }
        let id = NodeId::from_bytes(&data[..20]).ok()?;
        let addr = read_endpoint(&data[20..])?;
        Some(Self { id, addr })
    }

    pub fn to_compact(&self) -> Option<[u8; Self::COMPACT_LEN]> {
        let mut out = [0u8; Self::COMPACT_LEN];
        out[..20].copy_from_slice(self.id.as_bytes());
        match self.addr {
            SocketAddr::V4(v4) => {
                out[20..24].copy_from_slice(&v4.ip().octets());
                out[24..26].copy_from_slice(&v4.port().to_be_bytes());
                Some(out)
            }
            SocketAddr::V6(_) => None,
        }
    }
}

/// Decodes a compact 6-byte IPv4 endpoint.
pub fn read_endpoint(data: &[u8]) -> Option<SocketAddr> {
    if data.len() < 6 {
        return None;
    }
    let ip = Ipv4Addr::new(data[0], data[1], data[2], data[3]);
    let port = u16::from_be_bytes([data[4], data[5]]);
    Some(SocketAddr::new(IpAddr::V4(ip), port))
}

/// Encodes an endpoint into compact form (6 bytes for IPv4).
pub fn write_endpoint(addr: &SocketAddr) -> Vec<u8> {
    match addr {
        SocketAddr::V4(v4) => {
            let mut out = Vec::with_capacity(6);
            out.extend_from_slice(&v4.ip().octets());
            out.extend_from_slice(&v4.port().to_be_bytes());
            out
        }
        SocketAddr::V6(v6) => {
            let mut out = Vec::with_capacity(18);
            out.extend_from_slice(&v6.ip().octets());
            out.extend_from_slice(&v6.port().to_be_bytes());
            out
        }
    }
}

/// Concatenates nodes into a compact `nodes` byte string, skipping IPv6
/// endpoints.
pub fn write_nodes(nodes: &[NodeInfo]) -> Bytes {
    let mut out = Vec::with_capacity(nodes.len() * NodeInfo::COMPACT_LEN);
    for node in nodes {
        if let Some(compact) = node.to_compact() {
            out.extend_from_slice(&compact);
        }
    }
    Bytes::from(out)
}

/// Parses a compact `nodes` byte string.
pub fn parse_nodes(data: &[u8]) -> Vec<NodeInfo> {
    data.chunks_exact(NodeInfo::COMPACT_LEN)
        .filter_map(NodeInfo::from_compact)
        .collect()
}

/// A decoded incoming KRPC packet, split on the `y` discriminator.
#[derive(Debug)]
pub enum Incoming {
    Query(QueryMsg),
    Reply(ReplyMsg),
    Error {
        tid: TransactionId,
        code: i64,
        message: String,
    },
}

#[derive(Debug)]
pub struct QueryMsg {
    pub tid: TransactionId,
    pub name: Bytes,
    pub args: BTreeMap<Bytes, Value>,
    /// BEP-43: the sender asked to stay out of routing tables.
    pub read_only: bool,
    pub sender: NodeId,
}

impl QueryMsg {
    pub fn arg(&self, key: &[u8]) -> Option<&Value> {
        self.args.get(key)
    }

    pub fn arg_bytes(&self, key: &[u8]) -> Option<&Bytes> {
        self.args.get(key)?.as_bytes()
    }

    pub fn arg_int(&self, key: &[u8]) -> Option<i64> {
        self.args.get(key)?.as_integer()
    }

    /// A 20-byte hash argument (info_hash, target).
    pub fn arg_hash(&self, key: &'static [u8]) -> Result<[u8; 20], DhtError> {
        let bytes = self
            .arg_bytes(key)
            .ok_or(DhtError::MissingKey(std::str::from_utf8(key).unwrap_or("?")))?;
        if bytes.len() != 20 {
            return Err(DhtError::InvalidSize(
                std::str::from_utf8(key).unwrap_or("?"),
            ));
        }
        let mut out = [0u8; 20];
        out.copy_from_slice(bytes);
        Ok(out)
    }
}

#[derive(Debug)]
pub struct ReplyMsg {
    pub tid: TransactionId,
    pub body: BTreeMap<Bytes, Value>,
    /// BEP-42 IP echo: the address the remote saw us as.
    pub external_ip: Option<SocketAddr>,
    pub sender: Option<NodeId>,
}

impl ReplyMsg {
    pub fn get(&self, key: &[u8]) -> Option<&Value> {
        self.body.get(key)
    }

    pub fn get_bytes(&self, key: &[u8]) -> Option<&Bytes> {
        self.body.get(key)?.as_bytes()
    }

    pub fn nodes(&self) -> Vec<NodeInfo> {
        self.get_bytes(b"nodes")
            .map(|data| parse_nodes(data))
            .unwrap_or_default()
    }

    /// The compact peer list of a get_peers reply.
    pub fn values(&self) -> Vec<SocketAddr> {
        self.get(b"values")
            .and_then(|v| v.as_list())
            .map(|list| {
                list.iter()
                    .filter_map(|v| v.as_bytes())
                    .filter_map(|b| read_endpoint(b))
                    .collect()
            })
            .unwrap_or_default()
    }
}

/// Parses a raw datagram into an [`Incoming`] packet.
pub fn parse(data: &[u8]) -> Result<Incoming, DhtError> {
    let value = decode(data)?;
    let dict = value
        .as_dict()
        .ok_or_else(|| DhtError::ParseError("top level is not a dict".into()))?;

    let tid = dict
        .get(b"t".as_slice())
        .and_then(|v| v.as_bytes())
        .cloned()
        .ok_or(DhtError::MissingKey("t"))?;

    let y = dict
        .get(b"y".as_slice())
        .and_then(|v| v.as_bytes())
        .ok_or(DhtError::MissingKey("y"))?;

    match y.first() {
        Some(b'q') => {
            let name = dict
                .get(b"q".as_slice())
                .and_then(|v| v.as_bytes())
                .cloned()
                .ok_or(DhtError::MissingKey("q"))?;
            let args = dict
                .get(b"a".as_slice())
                .and_then(|v| v.as_dict())
                .cloned()
                .ok_or(DhtError::MissingKey("a"))?;
            let sender = args
                .get(b"id".as_slice())
                .and_then(|v| v.as_bytes())
                .ok_or(DhtError::MissingKey("id"))
                .and_then(|b| NodeId::from_bytes(b).map_err(|_| DhtError::InvalidSize("id")))?;
            let read_only = dict
                .get(b"ro".as_slice())
                .and_then(|v| v.as_integer())
                .is_some_and(|v| v != 0);
            Ok(Incoming::Query(QueryMsg {
                tid,
                name,
                args,
                read_only,
                sender,
            }))
        }
        Some(b'r') => {
            let body = dict
                .get(b"r".as_slice())
                .and_then(|v| v.as_dict())
                .cloned()
                .ok_or(DhtError::MissingKey("r"))?;
            // top-level "ip" with a fallback inside "r" for old clients
            let external_ip = dict
                .get(b"ip".as_slice())
                .or_else(|| body.get(b"ip".as_slice()))
                .and_then(|v| v.as_bytes())
                .and_then(|b| read_endpoint(b));
            let sender = body
                .get(b"id".as_slice())
                .and_then(|v| v.as_bytes())
                .and_then(|b| NodeId::from_bytes(b).ok());
            Ok(Incoming::Reply(ReplyMsg {
                tid,
                body,
                external_ip,
                sender,
            }))
        }
        Some(b'e') => {
            let list = dict
                .get(b"e".as_slice())
                .and_then(|v| v.as_list())
                .ok_or(DhtError::MissingKey("e"))?;
            let code = list.first().and_then(|v| v.as_integer()).unwrap_or(0);
            let message = list
                .get(1)
                .and_then(|v| v.as_str())
                .unwrap_or("unknown error")
                .to_string();
            Ok(Incoming::Error { tid, code, message })
        }
        _ => Err(DhtError::UnknownMessage),
    }
}

/// Starts a reply: `{t, y: "r", ip: <requester endpoint>, r: {}}`. The
/// caller fills in the `r` dict and encodes.
pub fn reply_shell(tid: &TransactionId, to: &SocketAddr) -> (Value, BTreeMap<Bytes, Value>) {
    let mut top = Value::dict();
    top.insert(b"t", Value::Bytes(tid.clone()));
    top.insert(b"y", Value::string("r"));
    top.insert(b"ip", Value::from(write_endpoint(to)));
    (top, BTreeMap::new())
}

/// Builds a KRPC error packet: `{t, y: "e", e: [code, message]}`.
pub fn error_reply(tid: &TransactionId, code: i64, message: &str) -> Value {
    let mut top = Value::dict();
    top.insert(b"t", Value::Bytes(tid.clone()));
    top.insert(b"y", Value::string("e"));
    top.insert(
        b"e",
        Value::List(vec![Value::Integer(code), Value::string(message)]),
    );
    top
}

/// Builds an outgoing query packet: `{t, y: "q", q: name, a: args}`.
pub fn build_query(tid: &TransactionId, name: &str, args: BTreeMap<Bytes, Value>) -> Value {
    let mut top = Value::dict();
    top.insert(b"t", Value::Bytes(tid.clone()));
    top.insert(b"y", Value::string("q"));
    top.insert(b"q", Value::string(name));
    top.insert(b"a", Value::Dict(args));
    top
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bencode::encode;

    #[test]
    fn test_parse_ping_query() {
        let raw = b"d1:ad2:id20:abcdefghij0123456789e1:q4:ping1:t2:aa1:y1:qe";
        match parse(raw).unwrap() {
            Incoming::Query(q) => {
                assert_eq!(&q.tid[..], b"aa");
                assert_eq!(&q.name[..], b"ping");
                assert_eq!(q.sender.as_bytes(), b"abcdefghij0123456789");
                assert!(!q.read_only);
            }
            other => panic!("expected query, got {:?}", other),
        }
    }

    #[test]
    fn test_parse_read_only_flag() {
        let raw = b"d1:ad2:id20:abcdefghij0123456789e1:q4:ping2:roi1e1:t2:aa1:y1:qe";
        match parse(raw).unwrap() {
            Incoming::Query(q) => assert!(q.read_only),
            other => panic!("expected query, got {:?}", other),
        }
    }

    #[test]
    fn test_parse_error_packet() {
        let raw = b"d1:eli203e14:Protocol Errore1:t2:aa1:y1:ee";
        match parse(raw).unwrap() {
            Incoming::Error { code, message, .. } => {
                assert_eq!(code, 203);
                assert_eq!(message, "Protocol Error");
            }
            other => panic!("expected error, got {:?}", other),
        }
    }

    #[test]
    fn test_parse_rejects_missing_transaction() {
        let raw = b"d1:y1:qe";
        assert!(parse(raw).is_err());
    }

    #[test]
    fn test_node_info_compact_round_trip() {
        let info = NodeInfo {
            id: NodeId([9u8; 20]),
            addr: "10.0.0.1:6881".parse().unwrap(),
        };
        let compact = info.to_compact().unwrap();
        assert_eq!(NodeInfo::from_compact(&compact), Some(info));
    }

    #[test]
    fn test_reply_shell_embeds_requester_endpoint() {
        let tid = Bytes::from_static(b"xy");
        let to: SocketAddr = "192.0.2.9:1234".parse().unwrap();
        let (mut top, body) = reply_shell(&tid, &to);
        top.insert(b"r", Value::Dict(body));

        let encoded = encode(&top);
        match parse(&encoded).unwrap() {
            Incoming::Reply(r) => assert_eq!(r.external_ip, Some(to)),
            other => panic!("expected reply, got {:?}", other),
        }
    }
}
