//! TCP transport implementation
//!
//! Plain blocking TCP. Sockets are created through `socket2` so that the
//! connect timeout, keep-alive and `TCP_NODELAY` are applied before the
//! stream is handed out.

use socket2::{Domain, Protocol, SockAddr, Socket, TcpKeepalive, Type};
use std::net::{Shutdown, SocketAddr, TcpStream, ToSocketAddrs};
use std::time::Duration;
use tracing::{debug, info};

use crate::error::{Result, TransportError};
use crate::tls::TlsConnector;
use crate::traits::{Stream, Transport};

/// TCP configuration
#[derive(Debug, Clone)]
pub struct TcpConfig {
    /// Keep-alive idle time (`None` = disabled)
    pub keepalive: Option<Duration>,
    /// Disable Nagle's algorithm
    pub nodelay: bool,
}

impl Default for TcpConfig {
    fn default() -> Self {
        Self {
            keepalive: Some(Duration::from_secs(30)),
            nodelay: true,
        }
    }
}

/// TCP transport
#[derive(Debug, Clone, Default)]
pub struct TcpTransport {
    config: TcpConfig,
}

impl TcpTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_config(config: TcpConfig) -> Self {
        Self { config }
    }

    /// Connect to a TCP server, trying every resolved address in turn
    pub fn connect_stream(&self, host: &str, port: u16, timeout: Duration) -> Result<TcpStream> {
        debug!("Connecting to TCP: {}:{}", host, port);

        let addrs: Vec<SocketAddr> = (host, port)
            .to_socket_addrs()
            .map_err(|e| TransportError::ConnectionFailed(format!("{}:{}: {}", host, port, e)))?
            .collect();

        let mut last_err = None;
        for addr in addrs {
            match self.connect_addr(addr, timeout) {
                Ok(stream) => {
                    info!("TCP connected to {}", addr);
                    return Ok(stream);
                }
                Err(e) => {
                    debug!("TCP connect to {} failed: {}", addr, e);
                    last_err = Some(e);
                }
            }
        }

        Err(match last_err {
            Some(e) if e.kind() == std::io::ErrorKind::TimedOut => TransportError::Timeout,
            Some(e) => TransportError::ConnectionFailed(format!("{}:{}: {}", host, port, e)),
            None => TransportError::ConnectionFailed(format!("{}:{}: no address", host, port)),
        })
    }

    fn connect_addr(&self, addr: SocketAddr, timeout: Duration) -> std::io::Result<TcpStream> {
        let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
        let target = SockAddr::from(addr);
        if timeout.is_zero() {
            socket.connect(&target)?;
        } else {
            socket.connect_timeout(&target, timeout)?;
        }

        if self.config.nodelay {
            socket.set_nodelay(true)?;
        }
        if let Some(idle) = self.config.keepalive {
            let keepalive = TcpKeepalive::new().with_time(idle);
            // Not every platform accepts every keep-alive knob.
            let _ = socket.set_tcp_keepalive(&keepalive);
        }

        Ok(socket.into())
    }
}

impl Transport for TcpTransport {
    fn connect(&self, host: &str, port: u16, timeout: Duration) -> Result<Box<dyn Stream>> {
        let stream = self.connect_stream(host, port, timeout)?;
        Ok(Box::new(stream))
    }
}

impl Stream for TcpStream {
    fn try_clone(&self) -> Result<Box<dyn Stream>> {
        Ok(Box::new(TcpStream::try_clone(self)?))
    }

    fn shutdown(&self) -> Result<()> {
        match TcpStream::shutdown(self, Shutdown::Both) {
            Ok(()) => Ok(()),
            // Already disconnected by the peer.
            Err(e) if e.kind() == std::io::ErrorKind::NotConnected => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn set_read_timeout(&self, timeout: Option<Duration>) -> Result<()> {
        // A zero duration is rejected by the OS; treat it as "poll once".
        let timeout = timeout.map(|t| t.max(Duration::from_millis(1)));
        TcpStream::set_read_timeout(self, timeout)?;
        Ok(())
    }

    fn set_nonblocking(&self, nonblocking: bool) -> Result<()> {
        TcpStream::set_nonblocking(self, nonblocking)?;
        Ok(())
    }

    fn peer_addr(&self) -> Option<SocketAddr> {
        TcpStream::peer_addr(self).ok()
    }

    fn upgrade(
        self: Box<Self>,
        connector: &TlsConnector,
        host: &str,
        timeout: Duration,
    ) -> Result<Box<dyn Stream>> {
        let tls = connector.connect(*self, host, timeout)?;
        Ok(Box::new(tls))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpListener;

    #[test]
    fn test_connect_refused() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let result = TcpTransport::new().connect("127.0.0.1", port, Duration::from_secs(1));
        assert!(result.is_err());
    }

    #[test]
    fn test_unresolvable_host() {
        let result = TcpTransport::new().connect("host.invalid", 4222, Duration::from_secs(1));
        assert!(matches!(result, Err(TransportError::ConnectionFailed(_))));
    }
}
