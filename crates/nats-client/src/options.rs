//! Connection options
//!
//! Every setting has a default; the consuming builder methods only
//! override what the caller cares about:
//!
//! ```ignore
//! let conn = Options::new()
//!     .url("nats://localhost:4222")
//!     .name("worker")
//!     .max_reconnect(10)
//!     .connect()?;
//! ```

use std::sync::Arc;
use std::time::Duration;

use nats_core::INBOX_PREFIX;
use nats_transport::{TcpTransport, TlsOptions, Transport};

use crate::context::Context;
use crate::event_loop::EventLoop;
use crate::{Connection, Error, Result, Subscription};

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(2);
pub const DEFAULT_RECONNECT_WAIT: Duration = Duration::from_secs(2);
pub const DEFAULT_MAX_RECONNECT: i32 = 60;
pub const DEFAULT_RECONNECT_JITTER: Duration = Duration::from_millis(100);
pub const DEFAULT_RECONNECT_JITTER_TLS: Duration = Duration::from_secs(1);
pub const DEFAULT_PING_INTERVAL: Duration = Duration::from_secs(120);
pub const DEFAULT_MAX_PINGS_OUT: u32 = 2;
pub const DEFAULT_IO_BUF_SIZE: usize = 32 * 1024;
pub const DEFAULT_RECONNECT_BUF_SIZE: usize = 8 * 1024 * 1024;
pub const DEFAULT_MAX_PENDING_MSGS: i64 = 65536;
pub const DEFAULT_MAX_PENDING_BYTES: i64 = 64 * 1024 * 1024;
pub const DEFAULT_DRAIN_TIMEOUT: Duration = Duration::from_secs(30);
pub const DEFAULT_MAX_AUTH_FAILURES: u32 = 2;
pub const DEFAULT_DISPATCH_POOL_SIZE: usize = 1;
pub const DEFAULT_RESP_MUX_POOL_SIZE: usize = 1;

/// Connection lifecycle notification
pub type ConnectionCallback = Arc<dyn Fn(&Connection) + Send + Sync>;

/// Asynchronous error notification, with the subscription involved if any
pub type ErrorCallback = Arc<dyn Fn(&Connection, Option<&Subscription>, &Error) + Send + Sync>;

/// Produces a fresh auth token for every connect
pub type TokenHandler = Arc<dyn Fn() -> String + Send + Sync>;

/// Produces the user JWT for every connect
pub type JwtHandler = Arc<dyn Fn() -> Result<String> + Send + Sync>;

/// Signs the server nonce
pub type SignatureHandler = Arc<dyn Fn(&[u8]) -> Result<Vec<u8>> + Send + Sync>;

/// Delay before the next pass over the pool, given the attempts made so far
pub type ReconnectDelayHandler = Arc<dyn Fn(u32) -> Duration + Send + Sync>;

/// Connection options
#[derive(Clone)]
pub struct Options {
    pub(crate) url: Option<String>,
    pub(crate) servers: Vec<String>,
    pub(crate) no_randomize: bool,
    pub(crate) timeout: Duration,
    pub(crate) name: Option<String>,
    pub(crate) verbose: bool,
    pub(crate) pedantic: bool,
    pub(crate) no_echo: bool,

    pub(crate) user: Option<String>,
    pub(crate) password: Option<String>,
    pub(crate) token: Option<String>,
    pub(crate) token_handler: Option<TokenHandler>,
    pub(crate) user_jwt: Option<JwtHandler>,
    pub(crate) nkey: Option<String>,
    pub(crate) signature_handler: Option<SignatureHandler>,

    pub(crate) secure: bool,
    pub(crate) tls: TlsOptions,

    pub(crate) allow_reconnect: bool,
    pub(crate) max_reconnect: i32,
    pub(crate) reconnect_wait: Duration,
    pub(crate) reconnect_jitter: Duration,
    pub(crate) reconnect_jitter_tls: Duration,
    pub(crate) custom_reconnect_delay: Option<ReconnectDelayHandler>,
    pub(crate) reconnect_buffer_size: usize,
    pub(crate) retry_on_failed_connect: bool,
    pub(crate) max_auth_failures: u32,
    pub(crate) keep_explicit_servers: bool,
    pub(crate) ignore_discovered_servers: bool,

    pub(crate) max_pending_msgs: i64,
    pub(crate) max_pending_bytes: i64,
    pub(crate) ping_interval: Duration,
    pub(crate) max_pings_outstanding: u32,
    pub(crate) io_buf_size: usize,
    pub(crate) send_asap: bool,

    pub(crate) use_old_request_style: bool,
    pub(crate) fail_requests_on_disconnect: bool,
    pub(crate) disable_no_responders: bool,
    pub(crate) inbox_prefix: String,
    pub(crate) resp_mux_pool_size: usize,
    pub(crate) drain_timeout: Duration,

    pub(crate) dispatch_pool_size: usize,
    pub(crate) context: Option<Arc<Context>>,
    pub(crate) event_loop: Option<Arc<dyn EventLoop>>,
    pub(crate) transport: Arc<dyn Transport>,

    pub(crate) closed_cb: Option<ConnectionCallback>,
    pub(crate) disconnected_cb: Option<ConnectionCallback>,
    pub(crate) reconnected_cb: Option<ConnectionCallback>,
    pub(crate) discovered_servers_cb: Option<ConnectionCallback>,
    pub(crate) lame_duck_cb: Option<ConnectionCallback>,
    pub(crate) error_cb: Option<ErrorCallback>,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            url: None,
            servers: Vec::new(),
            no_randomize: false,
            timeout: DEFAULT_TIMEOUT,
            name: None,
            verbose: false,
            pedantic: false,
            no_echo: false,
            user: None,
            password: None,
            token: None,
            token_handler: None,
            user_jwt: None,
            nkey: None,
            signature_handler: None,
            secure: false,
            tls: TlsOptions::default(),
            allow_reconnect: true,
            max_reconnect: DEFAULT_MAX_RECONNECT,
            reconnect_wait: DEFAULT_RECONNECT_WAIT,
            reconnect_jitter: DEFAULT_RECONNECT_JITTER,
            reconnect_jitter_tls: DEFAULT_RECONNECT_JITTER_TLS,
            custom_reconnect_delay: None,
            reconnect_buffer_size: DEFAULT_RECONNECT_BUF_SIZE,
            retry_on_failed_connect: false,
            max_auth_failures: DEFAULT_MAX_AUTH_FAILURES,
            keep_explicit_servers: false,
            ignore_discovered_servers: false,
            max_pending_msgs: DEFAULT_MAX_PENDING_MSGS,
            max_pending_bytes: DEFAULT_MAX_PENDING_BYTES,
            ping_interval: DEFAULT_PING_INTERVAL,
            max_pings_outstanding: DEFAULT_MAX_PINGS_OUT,
            io_buf_size: DEFAULT_IO_BUF_SIZE,
            send_asap: false,
            use_old_request_style: false,
            fail_requests_on_disconnect: false,
            disable_no_responders: false,
            inbox_prefix: INBOX_PREFIX.to_string(),
            resp_mux_pool_size: DEFAULT_RESP_MUX_POOL_SIZE,
            drain_timeout: DEFAULT_DRAIN_TIMEOUT,
            dispatch_pool_size: DEFAULT_DISPATCH_POOL_SIZE,
            context: None,
            event_loop: None,
            transport: Arc::new(TcpTransport::new()),
            closed_cb: None,
            disconnected_cb: None,
            reconnected_cb: None,
            discovered_servers_cb: None,
            lame_duck_cb: None,
            error_cb: None,
        }
    }
}

impl std::fmt::Debug for Options {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Options")
            .field("url", &self.url)
            .field("servers", &self.servers)
            .field("name", &self.name)
            .field("secure", &self.secure)
            .field("allow_reconnect", &self.allow_reconnect)
            .field("max_reconnect", &self.max_reconnect)
            .field("reconnect_wait", &self.reconnect_wait)
            .field("ping_interval", &self.ping_interval)
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

impl Options {
    pub fn new() -> Self {
        Self::default()
    }

    /// Server tried first, before the `servers` list
    pub fn url(mut self, url: &str) -> Self {
        self.url = Some(url.to_string());
        self
    }

    /// Servers of the cluster
    pub fn servers<S: AsRef<str>>(mut self, servers: &[S]) -> Self {
        self.servers = servers.iter().map(|s| s.as_ref().to_string()).collect();
        self
    }

    /// Keep the configured server order
    pub fn no_randomize(mut self, no_randomize: bool) -> Self {
        self.no_randomize = no_randomize;
        self
    }

    /// Connect and flush timeout
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn name(mut self, name: &str) -> Self {
        self.name = Some(name.to_string());
        self
    }

    /// Ask the server to acknowledge every operation with `+OK`
    pub fn verbose(mut self, verbose: bool) -> Self {
        self.verbose = verbose;
        self
    }

    pub fn pedantic(mut self, pedantic: bool) -> Self {
        self.pedantic = pedantic;
        self
    }

    /// Do not receive messages this connection publishes
    pub fn no_echo(mut self, no_echo: bool) -> Self {
        self.no_echo = no_echo;
        self
    }

    pub fn user_info(mut self, user: &str, password: &str) -> Self {
        self.user = Some(user.to_string());
        self.password = Some(password.to_string());
        self
    }

    pub fn token(mut self, token: &str) -> Self {
        self.token = Some(token.to_string());
        self
    }

    pub fn token_handler<F>(mut self, handler: F) -> Self
    where
        F: Fn() -> String + Send + Sync + 'static,
    {
        self.token_handler = Some(Arc::new(handler));
        self
    }

    /// JWT credentials: the JWT and a signature over the server nonce
    pub fn user_credentials<J, S>(mut self, jwt: J, signature: S) -> Self
    where
        J: Fn() -> Result<String> + Send + Sync + 'static,
        S: Fn(&[u8]) -> Result<Vec<u8>> + Send + Sync + 'static,
    {
        self.user_jwt = Some(Arc::new(jwt));
        self.signature_handler = Some(Arc::new(signature));
        self
    }

    /// NKey authentication: the public key and a signature over the nonce
    pub fn nkey<S>(mut self, public_key: &str, signature: S) -> Self
    where
        S: Fn(&[u8]) -> Result<Vec<u8>> + Send + Sync + 'static,
    {
        self.nkey = Some(public_key.to_string());
        self.signature_handler = Some(Arc::new(signature));
        self
    }

    /// Require TLS even if the server does not
    pub fn secure(mut self, secure: bool) -> Self {
        self.secure = secure;
        self
    }

    pub fn tls_options(mut self, tls: TlsOptions) -> Self {
        self.tls = tls;
        self
    }

    pub fn allow_reconnect(mut self, allow: bool) -> Self {
        self.allow_reconnect = allow;
        self
    }

    /// Attempts per server before it is dropped from the pool (negative = unlimited)
    pub fn max_reconnect(mut self, max: i32) -> Self {
        self.max_reconnect = max;
        self
    }

    pub fn reconnect_wait(mut self, wait: Duration) -> Self {
        self.reconnect_wait = wait;
        self
    }

    /// Random extra wait, for plain and TLS connections
    pub fn reconnect_jitter(mut self, jitter: Duration, jitter_tls: Duration) -> Self {
        self.reconnect_jitter = jitter;
        self.reconnect_jitter_tls = jitter_tls;
        self
    }

    /// Replace wait and jitter with a computed delay
    pub fn custom_reconnect_delay<F>(mut self, delay: F) -> Self
    where
        F: Fn(u32) -> Duration + Send + Sync + 'static,
    {
        self.custom_reconnect_delay = Some(Arc::new(delay));
        self
    }

    /// Bytes of outbound data kept while reconnecting
    pub fn reconnect_buffer_size(mut self, size: usize) -> Self {
        self.reconnect_buffer_size = size;
        self
    }

    /// Keep retrying in the background when the first connect fails
    pub fn retry_on_failed_connect(mut self, retry: bool) -> Self {
        self.retry_on_failed_connect = retry;
        self
    }

    /// Consecutive authentication failures that stop reconnection
    pub fn max_auth_failures(mut self, max: u32) -> Self {
        self.max_auth_failures = max;
        self
    }

    /// Never drop configured servers from the pool
    pub fn keep_explicit_servers(mut self, keep: bool) -> Self {
        self.keep_explicit_servers = keep;
        self
    }

    pub fn ignore_discovered_servers(mut self, ignore: bool) -> Self {
        self.ignore_discovered_servers = ignore;
        self
    }

    /// Default pending limits for new subscriptions (negative = unlimited)
    pub fn max_pending(mut self, msgs: i64, bytes: i64) -> Self {
        self.max_pending_msgs = msgs;
        self.max_pending_bytes = bytes;
        self
    }

    /// Interval between keep-alive PINGs; zero disables them
    pub fn ping_interval(mut self, interval: Duration) -> Self {
        self.ping_interval = interval;
        self
    }

    pub fn max_pings_outstanding(mut self, max: u32) -> Self {
        self.max_pings_outstanding = max;
        self
    }

    /// Size of the read buffer and of the write batch
    pub fn io_buf_size(mut self, size: usize) -> Self {
        self.io_buf_size = size;
        self
    }

    /// Write every frame immediately instead of batching
    pub fn send_asap(mut self, send_asap: bool) -> Self {
        self.send_asap = send_asap;
        self
    }

    /// One inbox subscription per request instead of the shared ones
    pub fn use_old_request_style(mut self, old: bool) -> Self {
        self.use_old_request_style = old;
        self
    }

    pub fn fail_requests_on_disconnect(mut self, fail: bool) -> Self {
        self.fail_requests_on_disconnect = fail;
        self
    }

    pub fn disable_no_responders(mut self, disable: bool) -> Self {
        self.disable_no_responders = disable;
        self
    }

    pub fn inbox_prefix(mut self, prefix: &str) -> Self {
        self.inbox_prefix = prefix.trim_end_matches('.').to_string();
        self
    }

    /// Number of shared reply subscriptions
    pub fn resp_mux_pool_size(mut self, size: usize) -> Self {
        self.resp_mux_pool_size = size;
        self
    }

    pub fn drain_timeout(mut self, timeout: Duration) -> Self {
        self.drain_timeout = timeout;
        self
    }

    /// Dispatcher threads of the private context
    pub fn dispatch_pool_size(mut self, size: usize) -> Self {
        self.dispatch_pool_size = size;
        self
    }

    /// Share a context (dispatchers, notification thread) between connections
    pub fn context(mut self, context: Arc<Context>) -> Self {
        self.context = Some(context);
        self
    }

    /// Let an external event loop drive reads and writes
    pub fn event_loop(mut self, event_loop: Arc<dyn EventLoop>) -> Self {
        self.event_loop = Some(event_loop);
        self
    }

    pub fn transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = transport;
        self
    }

    pub fn closed_callback<F>(mut self, cb: F) -> Self
    where
        F: Fn(&Connection) + Send + Sync + 'static,
    {
        self.closed_cb = Some(Arc::new(cb));
        self
    }

    pub fn disconnected_callback<F>(mut self, cb: F) -> Self
    where
        F: Fn(&Connection) + Send + Sync + 'static,
    {
        self.disconnected_cb = Some(Arc::new(cb));
        self
    }

    pub fn reconnected_callback<F>(mut self, cb: F) -> Self
    where
        F: Fn(&Connection) + Send + Sync + 'static,
    {
        self.reconnected_cb = Some(Arc::new(cb));
        self
    }

    pub fn discovered_servers_callback<F>(mut self, cb: F) -> Self
    where
        F: Fn(&Connection) + Send + Sync + 'static,
    {
        self.discovered_servers_cb = Some(Arc::new(cb));
        self
    }

    pub fn lame_duck_callback<F>(mut self, cb: F) -> Self
    where
        F: Fn(&Connection) + Send + Sync + 'static,
    {
        self.lame_duck_cb = Some(Arc::new(cb));
        self
    }

    pub fn error_callback<F>(mut self, cb: F) -> Self
    where
        F: Fn(&Connection, Option<&Subscription>, &Error) + Send + Sync + 'static,
    {
        self.error_cb = Some(Arc::new(cb));
        self
    }

    /// Validate and connect
    pub fn connect(self) -> Result<Connection> {
        Connection::connect(self)
    }

    /// Reject combinations that cannot work
    pub(crate) fn validate(&self) -> Result<()> {
        if self.timeout.is_zero() {
            return Err(Error::InvalidArg("timeout must be positive".into()));
        }
        if self.io_buf_size == 0 {
            return Err(Error::InvalidArg("io buffer size must be positive".into()));
        }
        if self.dispatch_pool_size == 0 {
            return Err(Error::InvalidArg("dispatch pool size must be at least 1".into()));
        }
        if self.resp_mux_pool_size == 0 {
            return Err(Error::InvalidArg("reply pool size must be at least 1".into()));
        }
        if self.max_pending_msgs == 0 || self.max_pending_bytes == 0 {
            return Err(Error::InvalidArg("pending limits cannot be zero".into()));
        }
        if self.token.is_some() && self.token_handler.is_some() {
            return Err(Error::IllegalState(
                "token and token handler are mutually exclusive".into(),
            ));
        }
        if (self.user_jwt.is_some() || self.nkey.is_some()) && self.signature_handler.is_none() {
            return Err(Error::InvalidArg("signature handler required".into()));
        }
        if self.inbox_prefix.is_empty() || self.inbox_prefix.contains(['*', '>', ' ']) {
            return Err(Error::InvalidArg(format!(
                "invalid inbox prefix '{}'",
                self.inbox_prefix
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let opts = Options::new();
        assert_eq!(opts.timeout, Duration::from_secs(2));
        assert_eq!(opts.max_reconnect, 60);
        assert_eq!(opts.reconnect_buffer_size, 8 * 1024 * 1024);
        assert_eq!(opts.inbox_prefix, "_INBOX");
        assert!(opts.allow_reconnect);
        assert!(!opts.keep_explicit_servers);
        assert!(opts.validate().is_ok());
    }

    #[test]
    fn test_invalid_combinations() {
        assert!(Options::new().dispatch_pool_size(0).validate().is_err());
        assert!(Options::new().max_pending(0, 10).validate().is_err());
        assert!(Options::new()
            .token("t")
            .token_handler(|| "t".to_string())
            .validate()
            .is_err());
        assert!(Options::new().inbox_prefix("bad.>").validate().is_err());
    }
}
