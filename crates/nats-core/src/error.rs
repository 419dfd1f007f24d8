//! Error types for the wire protocol

use thiserror::Error;

/// Result type alias for protocol operations
pub type Result<T> = std::result::Result<T, Error>;

/// Protocol error types
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// `MSG`/`HMSG` argument line with the wrong number of tokens
    #[error("wrong number of arguments for {op}: '{line}'")]
    WrongArgCount { op: &'static str, line: String },

    /// Sid or size token that is not a non-negative decimal
    #[error("bad or missing sid/size: '{0}'")]
    BadSidOrSize(String),

    /// `HMSG` header length missing, malformed or larger than the total
    #[error("bad or missing header size: '{0}'")]
    BadHeaderSize(String),

    /// Byte that cannot start or continue a known operation
    #[error("parse error at byte 0x{byte:02x} in state {state}")]
    UnexpectedByte { byte: u8, state: &'static str },

    /// Argument line longer than the accepted maximum
    #[error("control line too long: {0} bytes")]
    ControlLineTooLong(usize),

    /// Greeting payload that could not be decoded
    #[error("invalid server info: {0}")]
    InvalidInfo(String),

    /// Malformed header block
    #[error("invalid header: {0}")]
    InvalidHeader(String),

    /// Subject or queue name that cannot be sent on the wire
    #[error("invalid subject: '{0}'")]
    InvalidSubject(String),

    /// Server URL that could not be parsed
    #[error("invalid url: '{0}'")]
    InvalidUrl(String),

    /// Handshake record that could not be encoded
    #[error("encode error: {0}")]
    EncodeError(String),

    /// Cursor moved outside of the buffer
    #[error("buffer too small: need {needed} bytes, have {have}")]
    BufferTooSmall { needed: usize, have: usize },
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::EncodeError(e.to_string())
    }
}
