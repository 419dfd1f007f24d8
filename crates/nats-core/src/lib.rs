//! nats-rs Core
//!
//! Wire protocol primitives for a NATS-style publish/subscribe client.
//!
//! This crate provides:
//! - A growable byte [`Buffer`] with explicit consume/move-cursor operations
//! - The incremental protocol [`Parser`] turning a byte stream into [`ParsedEvent`]s
//! - Outbound command encoding ([`proto`])
//! - Message headers ([`HeaderMap`]) and the [`Message`] type
//! - The server greeting ([`ServerInfo`]) and handshake ([`ConnectInfo`]) records
//! - Connection-level traffic [`Statistics`]

pub mod buffer;
pub mod error;
pub mod headers;
pub mod info;
pub mod message;
pub mod parser;
pub mod proto;
pub mod stats;

pub use buffer::Buffer;
pub use error::{Error, Result};
pub use headers::HeaderMap;
pub use info::{ConnectInfo, ServerInfo};
pub use message::Message;
pub use parser::{MsgEvent, ParsedEvent, Parser};
pub use stats::{Statistics, StatsSnapshot};

/// Protocol version announced in the handshake
pub const PROTOCOL_VERSION: u8 = 1;

/// Client language announced in the handshake
pub const LANG: &str = "rust";

/// Client version announced in the handshake
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Default server port
pub const DEFAULT_PORT: u16 = 4222;

/// URL used when no server is configured
pub const DEFAULT_URL: &str = "nats://localhost:4222";

/// Default prefix of reply subjects
pub const INBOX_PREFIX: &str = "_INBOX";

/// Longest argument line accepted from the server
pub const MAX_CONTROL_LINE_SIZE: usize = 64 * 1024;
