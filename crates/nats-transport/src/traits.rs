//! Transport trait definitions

use std::io::{Read, Write};
use std::net::SocketAddr;
use std::time::Duration;

use crate::error::{Result, TransportError};
use crate::tls::TlsConnector;

/// Something that can open a [`Stream`] to a server
pub trait Transport: Send + Sync {
    /// Open a stream to `host:port`, giving up after `timeout`
    fn connect(&self, host: &str, port: u16, timeout: Duration) -> Result<Box<dyn Stream>>;
}

/// A connected duplex byte stream.
///
/// `read` returns `Ok(0)` at end of stream and an error of kind
/// `WouldBlock` when the stream is non-blocking and no data is ready.
pub trait Stream: Read + Write + Send {
    /// Open a second handle on the same connection.
    ///
    /// Used to give the reader and the writer their own handle.
    fn try_clone(&self) -> Result<Box<dyn Stream>>;

    /// Shut down both directions; pending reads on any handle return
    fn shutdown(&self) -> Result<()>;

    /// Deadline for a single `read` call, `None` blocks indefinitely
    fn set_read_timeout(&self, timeout: Option<Duration>) -> Result<()>;

    fn set_nonblocking(&self, nonblocking: bool) -> Result<()>;

    /// Whether the stream is encrypted
    fn is_secure(&self) -> bool {
        false
    }

    fn peer_addr(&self) -> Option<SocketAddr>;

    /// Replace this stream with a TLS session running over it
    fn upgrade(
        self: Box<Self>,
        _connector: &TlsConnector,
        _host: &str,
        _timeout: Duration,
    ) -> Result<Box<dyn Stream>> {
        Err(TransportError::UpgradeUnsupported)
    }
}
