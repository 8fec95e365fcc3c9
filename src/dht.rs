//! Distributed Hash Table node (BEP-5).
//!
//! A Kademlia node for trackerless peer discovery and BEP-44 value
//! storage. The core state machine ([`Node`]) is single-threaded and
//! I/O-free: it sends through an injected [`Socket`], reads time from a
//! [`Clock`], and is fed received datagrams by the host (or by
//! [`DhtService`], the bundled tokio UDP driver).
//!
//! # Supported extensions
//!
//! - BEP-33: scrape bloom filters (`BFpe`/`BFsd`) and `noseed`
//! - BEP-42: node-id hardening against the source IP
//! - BEP-43: read-only nodes (`ro`)
//! - BEP-44: immutable and mutable item storage with CAS semantics
//!
//! # Components
//!
//! - [`Node`] - query dispatch, stores, traversal coordination
//! - [`RoutingTable`] - 160 k-buckets of [`NodeEntry`] with replacement
//!   caches
//! - [`RpcManager`] - outstanding-transaction table with timeouts
//! - [`Traversal`] - iterative α-parallel lookup state
//! - [`TokenManager`] - rolling write-token secrets

mod bloom;
mod error;
mod id;
mod msg;
mod node;
mod routing;
mod rpc;
mod service;
mod store;
mod token;
mod traversal;

pub use bloom::BloomFilter;
pub use error::{krpc, DhtError};
pub use id::NodeId;
pub use msg::{Incoming, NodeInfo, QueryMsg, ReplyMsg, TransactionId};
pub use node::{
    mutable_signature_buffer, mutable_target, Clock, DhtSettings, Node, NodeStatus, Socket,
    SystemClock,
};
pub use routing::{NodeEntry, RoutingTable, K};
pub use rpc::{Observer, ObserverKind, RpcManager};
pub use service::{DhtService, BOOTSTRAP_NODES};
pub use store::{ImmutableStore, MutableStore, PeerStore};
pub use token::TokenManager;
pub use traversal::{
    AnnouncePlan, Candidate, CandidateState, ItemCallback, ItemValue, MutableMeta, PeersCallback,
    Traversal, TraversalKind, ALPHA,
};

#[cfg(test)]
mod tests;
