//! External event loop integration
//!
//! By default a connection runs its own reader and flusher threads. An
//! application that already polls sockets can take over instead: register
//! an [`EventLoop`] in the options and call
//! [`Connection::process_read_event`] / [`Connection::process_write_event`]
//! when the socket is ready. The socket is non-blocking in this mode.

use crate::connection::Connection;
use crate::Result;

/// Hooks called by the connection to drive an external poller
pub trait EventLoop: Send + Sync {
    /// A new socket was installed for `conn`. Called on every (re)connect.
    fn attach(&self, conn: &Connection) -> Result<()>;

    /// Start or stop polling for readability
    fn read_interest(&self, enable: bool);

    /// Start or stop polling for writability
    fn write_interest(&self, enable: bool);

    /// The socket is gone
    fn detach(&self);
}
