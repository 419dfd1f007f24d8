//! nats-rs Client Library
//!
//! Thread-based publish/subscribe client: one connection multiplexes any
//! number of subscriptions, survives server restarts by reconnecting
//! through a pool of servers, and offers request/reply on top.
//!
//! # Example
//!
//! ```ignore
//! use nats_client::Options;
//! use std::time::Duration;
//!
//! fn main() -> nats_client::Result<()> {
//!     let conn = Options::new().url("nats://localhost:4222").connect()?;
//!
//!     conn.subscribe("updates.>", |msg| {
//!         println!("{}: {:?}", msg.subject, msg.payload);
//!     })?;
//!     conn.publish("updates.lights", "on")?;
//!
//!     let reply = conn.request("service.time", "", Duration::from_secs(1))?;
//!     println!("time is {:?}", reply.payload);
//!
//!     conn.drain()
//! }
//! ```

mod auth;
pub mod connection;
pub mod context;
mod dispatch;
pub mod error;
pub mod event_loop;
mod handshake;
pub mod inbox;
pub mod options;
mod reader;
mod reconnect;
mod request;
pub mod server_pool;
pub mod subscription;
mod sync;
mod writer;

pub use connection::{Connection, Status};
pub use context::Context;
pub use error::{Error, Result};
pub use event_loop::EventLoop;
pub use inbox::new_inbox;
pub use options::Options;
pub use server_pool::{ServerPool, ServerUrl};
pub use subscription::{DrainStatus, MsgHandler, SubscribeOptions, Subscription, SubscriptionStats};

pub use nats_core::{HeaderMap, Message, ServerInfo, StatsSnapshot};
pub use nats_transport::TlsOptions;

/// Connect to `url` with default options
pub fn connect(url: &str) -> Result<Connection> {
    Options::new().url(url).connect()
}

/// Prelude for convenient imports
pub mod prelude {
    pub use crate::connection::{Connection, Status};
    pub use crate::error::{Error, Result};
    pub use crate::options::Options;
    pub use crate::subscription::{SubscribeOptions, Subscription};
    pub use nats_core::{HeaderMap, Message};
}
