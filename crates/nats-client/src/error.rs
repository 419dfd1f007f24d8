//! Client error types

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    #[error("protocol error: {0}")]
    Protocol(#[from] nats_core::Error),

    #[error("transport error: {0}")]
    Transport(#[from] nats_transport::TransportError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("connection failed: {0}")]
    ConnectionFailed(String),

    #[error("no servers available for connection")]
    NoServers,

    #[error("authorization failed: {0}")]
    Auth(String),

    #[error("stale connection")]
    StaleConnection,

    #[error("server error: {0}")]
    Server(String),

    #[error("timeout")]
    Timeout,

    #[error("connection closed")]
    Closed,

    #[error("connection draining")]
    Draining,

    #[error("illegal state: {0}")]
    IllegalState(String),

    #[error("invalid subscription")]
    InvalidSubscription,

    #[error("invalid argument: {0}")]
    InvalidArg(String),

    #[error("maximum payload exceeded: {size} > {max}")]
    MaxPayload { size: usize, max: usize },

    #[error("insufficient buffer: reconnect buffer limit of {0} bytes reached")]
    InsufficientBuffer(usize),

    #[error("no responders available for request")]
    NoResponders,

    #[error("slow consumer, messages dropped")]
    SlowConsumer,

    #[error("maximum messages delivered")]
    MaxDeliveredMsgs,
}

impl Error {
    /// Whether the server rejected our credentials
    pub fn is_auth_failure(&self) -> bool {
        matches!(self, Error::Auth(_))
    }

    /// Whether the error is a deadline expiring
    pub fn is_timeout(&self) -> bool {
        match self {
            Error::Timeout => true,
            Error::Transport(e) => e.is_timeout(),
            Error::Io(e) => matches!(
                e.kind(),
                std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut
            ),
            _ => false,
        }
    }
}
