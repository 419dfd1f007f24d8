//! nats-rs Transport Layer
//!
//! Blocking duplex byte streams for the client:
//! - TCP (keep-alive, connect timeout)
//! - TLS upgrade of an established TCP stream (rustls)

pub mod error;
pub mod tcp;
pub mod tls;
pub mod traits;

pub use error::{Result, TransportError};
pub use tcp::{TcpConfig, TcpTransport};
pub use tls::{TlsConnector, TlsOptions, TlsStream};
pub use traits::{Stream, Transport};
