use thiserror::Error;

/// KRPC error codes (BEP-5 / BEP-44).
pub mod krpc {
    pub const GENERIC: i64 = 201;
    pub const SERVER: i64 = 202;
    pub const PROTOCOL: i64 = 203;
    pub const MESSAGE_TOO_BIG: i64 = 205;
    pub const INVALID_SIGNATURE: i64 = 206;
    pub const SALT_TOO_BIG: i64 = 207;
    pub const CAS_MISMATCH: i64 = 301;
    pub const SEQ_TOO_LOW: i64 = 302;
}

#[derive(Debug, Error)]
pub enum DhtError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("bencode error: {0}")]
    Bencode(#[from] crate::bencode::BencodeError),

    #[error("malformed message: {0}")]
    ParseError(String),

    #[error("missing key: {0}")]
    MissingKey(&'static str),

    #[error("invalid size for {0}")]
    InvalidSize(&'static str),

    #[error("unknown message")]
    UnknownMessage,

    #[error("invalid node id length")]
    InvalidNodeId,

    #[error("remote error {code}: {message}")]
    Remote { code: i64, message: String },
}
