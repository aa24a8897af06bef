use thiserror::Error;

/// All errors produced by the wiremux runtime.
#[derive(Debug, Error)]
pub enum Error {
    #[error("malformed varint: width exceeds 64 bits")]
    Overflow,

    #[error("unexpected end of transport")]
    UnexpectedEof,

    #[error("short read: frame declared {expected} payload bytes, transport ended after {actual}")]
    ShortRead { expected: usize, actual: usize },

    #[error("stream is closed")]
    StreamClosed,

    #[error("multiplexer is closed")]
    MultiplexClosed,

    #[error("serve() already called on this multiplexer")]
    AlreadyServing,

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
