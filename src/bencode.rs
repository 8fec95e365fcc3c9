//! Bencode encoding and decoding (BEP-3)
//!
//! Bencode is the encoding used by BitTorrent for torrent metadata and for
//! the KRPC messages exchanged by the DHT. Re-encoding a decoded [`Value`]
//! always yields the canonical form (dictionary keys sorted), which the DHT
//! relies on when hashing `v` payloads into storage targets and when
//! building the byte sequence covered by mutable-item signatures.

mod decode;
mod encode;
mod error;
mod value;

pub use decode::decode;
pub use encode::{encode, encode_into};
pub use error::BencodeError;
pub use value::Value;
