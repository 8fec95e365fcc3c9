use thiserror::Error;

#[derive(Debug, Error)]
pub enum BencodeError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("unexpected end of input")]
    UnexpectedEof,

    #[error("unexpected character: {0:?}")]
    UnexpectedChar(char),

    #[error("invalid integer: {0}")]
    InvalidInteger(String),

    #[error("invalid string length prefix")]
    InvalidStringLength,

    #[error("dictionary key is not a byte string")]
    NonStringKey,

    #[error("nesting too deep")]
    NestingTooDeep,

    #[error("trailing data after value")]
    TrailingData,
}
