//! keel - the core of a BitTorrent engine
//!
//! This library implements the two non-trivial subsystems at the heart of a
//! BitTorrent client: the disk I/O subsystem (a multi-threaded, write-back
//! block cache mediating all piece traffic for many concurrent torrents) and
//! a Kademlia DHT node (BEP-5, with BEP-33/42/43/44 extensions).
//!
//! # Modules
//!
//! - [`bencode`] - BEP-3 Bencode encoding/decoding
//! - [`disk`] - Block cache, disk job thread pool, storage fencing, file pool
//! - [`dht`] - BEP-5 Distributed Hash Table node, routing table, traversals
//! - [`alert`] - Bounded event queue drained by the host
//!
//! The peer-wire protocol, trackers, piece picking and the session event
//! loop are external collaborators: the disk subsystem talks to them through
//! [`disk::StorageBackend`] and job completion handlers, the DHT node
//! through [`dht::Socket`] and [`dht::Clock`].

pub mod alert;
pub mod bencode;
pub mod dht;
pub mod disk;

pub use alert::{Alert, AlertManager};
pub use bencode::{decode, encode, BencodeError, Value};
pub use dht::{
    Clock, DhtError, DhtService, DhtSettings, Node, NodeId, RoutingTable, Socket, SystemClock,
};
pub use disk::{
    DiskError, DiskIo, DiskSettings, FilePool, FileStorage, JobResult, Storage, StorageBackend,
    BLOCK_SIZE,
};
