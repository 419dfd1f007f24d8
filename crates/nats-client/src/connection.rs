//! Connection handle and shared state
//!
//! A [`Connection`] is a cheap, cloneable handle on one [`ConnInner`]. The
//! state lives behind two locks, always taken in this order:
//! - `core`: status, server pool, server info, subscription map
//! - `out`: the outbound buffer, the writer half of the socket and the
//!   queue of PINGs waiting for a PONG
//!
//! Background threads (reader, flusher, pinger, reconnect) hold their own
//! reference to the inner state and exit once the connection is closed.

use dashmap::DashMap;
use parking_lot::{Condvar, Mutex};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use nats_core::{proto, HeaderMap, Message, ServerInfo, Statistics, StatsSnapshot};
use nats_transport::TlsConnector;

use crate::context::Context;
use crate::inbox;
use crate::options::{ConnectionCallback, Options};
use crate::reader::ReadSide;
use crate::request::RespMux;
use crate::server_pool::{ServerPool, ServerUrl};
use crate::subscription::{
    Delivery, Ending, MsgHandler, SubShared, SubscribeOptions, Subscription,
};
use crate::sync::Completion;
use crate::writer::Outbound;
use crate::{Error, Result};

/// Connection status
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Connecting,
    Connected,
    Reconnecting,
    Draining,
    Closed,
}

impl std::fmt::Display for Status {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Status::Connecting => "connecting",
            Status::Connected => "connected",
            Status::Reconnecting => "reconnecting",
            Status::Draining => "draining",
            Status::Closed => "closed",
        };
        f.write_str(s)
    }
}

pub(crate) struct Core {
    pub(crate) status: Status,
    pub(crate) pool: ServerPool,
    pub(crate) info: ServerInfo,
    pub(crate) connected_url: Option<ServerUrl>,
    pub(crate) subs: HashMap<u64, Arc<SubShared>>,
    pub(crate) last_error: Option<Arc<Error>>,
    /// Consecutive handshakes rejected for authentication
    pub(crate) auth_failures: u32,
    /// Bumped on every new socket and every disconnect; threads tied to an
    /// older socket ignore their own failures
    pub(crate) generation: u64,
    pub(crate) reconnect_running: bool,
    /// Threads joined on close
    pub(crate) threads: Vec<JoinHandle<()>>,
}

pub(crate) struct ConnInner {
    pub(crate) opts: Options,
    pub(crate) core: Mutex<Core>,
    /// Signalled on every status change
    pub(crate) cond: Condvar,
    pub(crate) out: Mutex<Outbound>,
    /// Wakes the flusher
    pub(crate) out_cond: Condvar,
    /// Reader half when an external event loop drives reads
    pub(crate) read_side: Mutex<Option<ReadSide>>,
    pub(crate) closed: AtomicBool,
    pub(crate) pings_out: AtomicU32,
    next_sid: AtomicU64,
    pub(crate) stats: Arc<Statistics>,
    pub(crate) ctx: Arc<Context>,
    private_ctx: bool,
    pub(crate) requests: DashMap<String, Arc<Completion<Result<Message>>>>,
    pub(crate) resp_mux: Mutex<RespMux>,
    pub(crate) tls: Mutex<Option<TlsConnector>>,
}

/// A client connection
#[derive(Clone)]
pub struct Connection {
    pub(crate) inner: Arc<ConnInner>,
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("status", &self.status())
            .field("url", &self.connected_url())
            .finish()
    }
}

impl ConnInner {
    fn new(opts: Options, pool: ServerPool, ctx: Arc<Context>, private_ctx: bool) -> Self {
        let io_buf_size = opts.io_buf_size;
        Self {
            opts,
            core: Mutex::new(Core {
                status: Status::Connecting,
                pool,
                info: ServerInfo::default(),
                connected_url: None,
                subs: HashMap::new(),
                last_error: None,
                auth_failures: 0,
                generation: 0,
                reconnect_running: false,
                threads: Vec::new(),
            }),
            cond: Condvar::new(),
            out: Mutex::new(Outbound::new(io_buf_size)),
            out_cond: Condvar::new(),
            read_side: Mutex::new(None),
            closed: AtomicBool::new(false),
            pings_out: AtomicU32::new(0),
            next_sid: AtomicU64::new(1),
            stats: Arc::new(Statistics::default()),
            ctx,
            private_ctx,
            requests: DashMap::new(),
            resp_mux: Mutex::new(RespMux::default()),
            tls: Mutex::new(None),
        }
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub(crate) fn status(&self) -> Status {
        self.core.lock().status
    }

    pub(crate) fn handle(self: &Arc<Self>) -> Connection {
        Connection {
            inner: self.clone(),
        }
    }

    // ========================================================================
    // Notifications
    // ========================================================================

    /// Run a connection callback on the notification thread
    pub(crate) fn notify(self: &Arc<Self>, cb: &Option<ConnectionCallback>) {
        if let Some(cb) = cb.clone() {
            let conn = self.handle();
            self.ctx.post_event(Box::new(move || cb(&conn)));
        }
    }

    /// Report an error that no caller is waiting for
    pub(crate) fn notify_error(self: &Arc<Self>, sub: Option<Arc<SubShared>>, err: Error) {
        match self.opts.error_cb.clone() {
            Some(cb) => {
                let conn = self.handle();
                self.ctx.post_event(Box::new(move || {
                    let sub = sub.map(Subscription::from_shared);
                    cb(&conn, sub.as_ref(), &err);
                }));
            }
            None => warn!("Asynchronous error: {}", err),
        }
    }

    /// Keep a background thread to join on close
    pub(crate) fn track_thread(&self, handle: JoinHandle<()>) {
        let mut core = self.core.lock();
        core.threads.retain(|h| !h.is_finished());
        core.threads.push(handle);
    }

    pub(crate) fn tls_connector(&self) -> Result<TlsConnector> {
        let mut cached = self.tls.lock();
        if let Some(connector) = cached.as_ref() {
            return Ok(connector.clone());
        }
        let connector = TlsConnector::new(&self.opts.tls)?;
        *cached = Some(connector.clone());
        Ok(connector)
    }

    // ========================================================================
    // Publishing
    // ========================================================================

    pub(crate) fn publish(
        self: &Arc<Self>,
        subject: &str,
        reply: Option<&str>,
        headers: Option<&HeaderMap>,
        payload: &[u8],
    ) -> Result<()> {
        proto::validate_subject(subject)?;
        if let Some(reply) = reply {
            proto::validate_subject(reply)?;
        }

        let (max_payload, server_headers) = {
            let core = self.core.lock();
            if core.status == Status::Closed {
                return Err(Error::Closed);
            }
            (core.info.max_payload, core.info.headers)
        };

        let encoded = headers.map(HeaderMap::encode);
        // An empty greeting means we never reached a server yet.
        if max_payload > 0 {
            if encoded.is_some() && !server_headers {
                return Err(Error::IllegalState("headers not supported by server".into()));
            }
            let size = payload.len() + encoded.as_ref().map_or(0, Vec::len);
            if size > max_payload {
                return Err(Error::MaxPayload {
                    size,
                    max: max_payload,
                });
            }
        }

        self.send(false, |buf| match &encoded {
            Some(hdr) => proto::write_hpub(buf, subject, reply, hdr, payload),
            None => proto::write_pub(buf, subject, reply, payload),
        })?;
        self.stats.record_out(payload.len() as u64);
        Ok(())
    }

    /// Send a PING and wait for its PONG
    pub(crate) fn flush_timeout(self: &Arc<Self>, timeout: Duration) -> Result<()> {
        if self.is_closed() {
            return Err(Error::Closed);
        }
        let waiter = Arc::new(Completion::new());
        self.send_ping(Some(waiter.clone()))?;
        waiter.wait(timeout).unwrap_or(Err(Error::Timeout))
    }

    // ========================================================================
    // Subscriptions
    // ========================================================================

    pub(crate) fn async_delivery(
        &self,
        subject: &str,
        handler: MsgHandler,
        dedicated: bool,
    ) -> Result<Delivery> {
        let dispatcher = if dedicated {
            self.ctx.dedicated(subject)?
        } else {
            self.ctx.assign()
        };
        Ok(Delivery::Async {
            handler,
            dispatcher,
            dedicated,
        })
    }

    pub(crate) fn subscribe(
        self: &Arc<Self>,
        subject: &str,
        queue: Option<&str>,
        delivery: Delivery,
        limits: Option<(i64, i64)>,
    ) -> Result<Arc<SubShared>> {
        let limits = limits.unwrap_or((self.opts.max_pending_msgs, self.opts.max_pending_bytes));
        let sid = self.next_sid.fetch_add(1, Ordering::Relaxed);
        let sub = SubShared::new(
            sid,
            subject.to_string(),
            queue.map(str::to_string),
            delivery,
            limits,
            Arc::downgrade(self),
        );

        let registered: Result<Status> = (|| {
            proto::validate_subject(subject)?;
            if let Some(queue) = queue {
                proto::validate_queue(queue)?;
            }
            if limits.0 == 0 || limits.1 == 0 {
                return Err(Error::InvalidArg("pending limits cannot be zero".into()));
            }
            let mut core = self.core.lock();
            match core.status {
                Status::Closed => return Err(Error::Closed),
                Status::Draining if !sub.is_internal() => return Err(Error::Draining),
                _ => {}
            }
            core.subs.insert(sid, sub.clone());
            Ok(core.status)
        })();
        let status = match registered {
            Ok(status) => status,
            Err(e) => {
                sub.finish(Ending::Unsubscribed, false);
                return Err(e);
            }
        };

        // Replayed from the subscription map once the next server is up.
        if status == Status::Reconnecting {
            debug!("Subscribed to '{}' (sid {}) while reconnecting", subject, sid);
            return Ok(sub);
        }
        if let Err(e) = self.send(false, |buf| proto::write_sub(buf, subject, queue, sid)) {
            self.forget_sub(sid);
            sub.finish(Ending::Unsubscribed, false);
            return Err(e);
        }
        debug!("Subscribed to '{}' (sid {})", subject, sid);
        Ok(sub)
    }

    /// Stop routing messages to `sid`
    pub(crate) fn forget_sub(&self, sid: u64) {
        self.core.lock().subs.remove(&sid);
    }

    pub(crate) fn unsubscribe(self: &Arc<Self>, sub: &Arc<SubShared>) -> Result<()> {
        {
            let mut core = self.core.lock();
            if core.status == Status::Closed {
                return Err(Error::Closed);
            }
            if core.subs.remove(&sub.sid).is_none() {
                return Err(Error::InvalidSubscription);
            }
        }
        let sent = self.send(false, |buf| proto::write_unsub(buf, sub.sid, None));
        sub.finish(Ending::Unsubscribed, false);
        sent
    }

    pub(crate) fn auto_unsubscribe(
        self: &Arc<Self>,
        sub: &Arc<SubShared>,
        max: u64,
    ) -> Result<()> {
        if max == 0 {
            return Err(Error::InvalidArg("maximum must be positive".into()));
        }
        let (reached, reconnecting) = {
            let core = self.core.lock();
            if core.status == Status::Closed {
                return Err(Error::Closed);
            }
            if !core.subs.contains_key(&sub.sid) {
                return Err(Error::InvalidSubscription);
            }
            (sub.set_max(max), core.status == Status::Reconnecting)
        };
        if reached {
            return self.unsubscribe(sub);
        }
        // The limit goes out with the SUB replayed on reconnect.
        if reconnecting {
            return Ok(());
        }
        self.send(false, |buf| proto::write_unsub(buf, sub.sid, Some(max)))
    }

    /// Drain one subscription: UNSUB, flush, then let the queue empty
    pub(crate) fn drain_sub(
        self: &Arc<Self>,
        sub: &Arc<SubShared>,
        timeout: Duration,
    ) -> Result<()> {
        {
            let core = self.core.lock();
            match core.status {
                Status::Closed => return Err(Error::Closed),
                Status::Connecting | Status::Reconnecting => {
                    return Err(Error::IllegalState("cannot drain while reconnecting".into()))
                }
                _ => {}
            }
            if !core.subs.contains_key(&sub.sid) {
                return Err(Error::InvalidSubscription);
            }
        }

        if !sub.begin_drain(Instant::now() + timeout)? {
            return Ok(());
        }
        debug!("Draining subscription {} on '{}'", sub.sid, sub.subject);
        self.send(false, |buf| proto::write_unsub(buf, sub.sid, None))?;

        let flushed = self.flush_timeout(timeout);
        self.forget_sub(sub.sid);
        match flushed {
            Ok(()) => {
                sub.seal_drain();
                Ok(())
            }
            Err(Error::Timeout) => {
                sub.finish(Ending::DrainTimedOut, false);
                Err(Error::Timeout)
            }
            Err(e) => {
                sub.finish(Ending::ConnectionClosed, false);
                Err(e)
            }
        }
    }

    /// Drain every subscription, flush, then close
    pub(crate) fn drain(self: &Arc<Self>, timeout: Duration) -> Result<()> {
        let subs: Vec<Arc<SubShared>> = {
            let mut core = self.core.lock();
            match core.status {
                Status::Closed => return Err(Error::Closed),
                Status::Draining => return Ok(()),
                Status::Connecting | Status::Reconnecting => {
                    return Err(Error::IllegalState("cannot drain while reconnecting".into()))
                }
                Status::Connected => core.status = Status::Draining,
            }
            self.cond.notify_all();
            core.subs.values().cloned().collect()
        };
        info!("Draining connection ({} subscriptions)", subs.len());

        let deadline = Instant::now() + timeout;
        let remaining = || deadline.saturating_duration_since(Instant::now());

        let mut draining = Vec::with_capacity(subs.len());
        for sub in subs {
            match sub.begin_drain(deadline) {
                Ok(true) => {
                    if let Err(e) = self.send(false, |buf| proto::write_unsub(buf, sub.sid, None))
                    {
                        debug!("Could not send UNSUB for sid {}: {}", sub.sid, e);
                    }
                    draining.push(sub);
                }
                Ok(false) => draining.push(sub),
                Err(_) => {}
            }
        }

        let flushed = self.flush_timeout(remaining());
        let mut timed_out = flushed.is_err();
        for sub in &draining {
            self.forget_sub(sub.sid);
            match &flushed {
                Ok(()) => sub.seal_drain(),
                Err(Error::Timeout) => {
                    sub.finish(Ending::DrainTimedOut, false);
                }
                Err(_) => {
                    sub.finish(Ending::ConnectionClosed, false);
                }
            }
        }

        for sub in &draining {
            if sub.wait_drain(remaining()).is_err() {
                timed_out = true;
            }
        }

        if !remaining().is_zero() && self.flush_timeout(remaining()).is_err() {
            timed_out = true;
        }
        self.close_with(None, true);

        if timed_out {
            warn!("Drain did not complete in {:?}", timeout);
            Err(Error::Timeout)
        } else {
            info!("Drain complete");
            Ok(())
        }
    }

    // ========================================================================
    // Teardown
    // ========================================================================

    /// Close for good. `notify` fires the closed callback.
    pub(crate) fn close_with(self: &Arc<Self>, err: Option<Error>, notify: bool) {
        let (subs, threads) = {
            let mut core = self.core.lock();
            if core.status == Status::Closed {
                return;
            }
            core.status = Status::Closed;
            core.generation += 1;
            self.closed.store(true, Ordering::Release);
            if let Some(err) = err {
                warn!("Closing connection: {}", err);
                core.last_error = Some(Arc::new(err));
            }
            self.cond.notify_all();
            let subs: Vec<_> = core.subs.drain().map(|(_, sub)| sub).collect();
            (subs, std::mem::take(&mut core.threads))
        };

        let pongs = {
            let mut out = self.out.lock();
            if out.stream.is_some() && self.opts.event_loop.is_none() {
                if let Err(e) = out.write_pending() {
                    debug!("Could not flush before close: {}", e);
                }
            }
            if let Some(stream) = out.stream.take() {
                let _ = stream.shutdown();
            }
            out.buf.reset();
            self.out_cond.notify_all();
            std::mem::take(&mut out.pongs)
        };
        for pong in pongs {
            if let Some(waiter) = pong.waiter {
                waiter.complete(Err(Error::Closed));
            }
        }

        if let Some(side) = self.read_side.lock().take() {
            let _ = side.stream.shutdown();
        }
        if let Some(event_loop) = &self.opts.event_loop {
            event_loop.detach();
        }

        self.fail_requests(|| Error::Closed);
        self.resp_mux.lock().clear();

        for sub in subs {
            sub.finish(Ending::ConnectionClosed, false);
        }

        info!("Connection closed");
        if notify {
            self.notify(&self.opts.closed_cb);
        }

        let current = std::thread::current().id();
        for handle in threads {
            if handle.thread().id() != current {
                let _ = handle.join();
            }
        }
        if self.private_ctx {
            self.ctx.shutdown();
        }
    }

    pub(crate) fn fail_requests(&self, err: impl Fn() -> Error) {
        let tokens: Vec<String> = self.requests.iter().map(|e| e.key().clone()).collect();
        for token in tokens {
            if let Some((_, waiter)) = self.requests.remove(&token) {
                waiter.complete(Err(err()));
            }
        }
    }
}

impl Connection {
    /// Connect with `opts`: try every server of the pool once.
    ///
    /// With `retry_on_failed_connect`, a connection that could not reach
    /// any server is returned in the reconnecting state instead.
    pub(crate) fn connect(opts: Options) -> Result<Connection> {
        opts.validate()?;
        let pool = ServerPool::build(opts.url.as_deref(), &opts.servers, !opts.no_randomize)?;
        let (ctx, private_ctx) = match &opts.context {
            Some(ctx) => (ctx.clone(), false),
            None => (Context::new(opts.dispatch_pool_size)?, true),
        };
        let inner = Arc::new(ConnInner::new(opts, pool, ctx, private_ctx));
        if let Err(e) = inner.start_background() {
            inner.close_with(None, false);
            return Err(e);
        }

        let attempts = inner.core.lock().pool.len();
        let mut last_err = None;
        for _ in 0..attempts {
            let (url, credentials) = {
                let mut core = inner.core.lock();
                let Some(entry) = core.pool.current() else {
                    break;
                };
                let url = entry.url.clone();
                core.pool.mark_attempt(&url.key());
                (url, core.pool.owned_credentials())
            };

            match inner.establish(&url, credentials) {
                Ok(session) => match inner.install(session) {
                    Ok(()) => {
                        info!("Connected to {}", url);
                        return Ok(Connection { inner });
                    }
                    Err(e) => {
                        inner.close_with(None, false);
                        return Err(e);
                    }
                },
                Err(e) => {
                    warn!("Connect to {} failed: {}", url, e);
                    let mut core = inner.core.lock();
                    core.pool.mark_failed(&url.key());
                    core.pool.next_candidate(-1, true);
                    last_err = Some(e);
                }
            }
        }

        if inner.opts.retry_on_failed_connect && inner.opts.allow_reconnect {
            {
                let mut core = inner.core.lock();
                core.status = Status::Reconnecting;
                core.reconnect_running = true;
                if let Some(e) = last_err {
                    core.last_error = Some(Arc::new(e));
                }
            }
            info!("No server reachable, retrying in the background");
            inner.spawn_reconnect();
            return Ok(Connection { inner });
        }

        inner.close_with(None, false);
        Err(last_err.unwrap_or(Error::NoServers))
    }

    // ========================================================================
    // Publishing
    // ========================================================================

    pub fn publish(&self, subject: &str, payload: impl AsRef<[u8]>) -> Result<()> {
        self.inner.publish(subject, None, None, payload.as_ref())
    }

    pub fn publish_with_reply(
        &self,
        subject: &str,
        reply: &str,
        payload: impl AsRef<[u8]>,
    ) -> Result<()> {
        self.inner.publish(subject, Some(reply), None, payload.as_ref())
    }

    pub fn publish_with_headers(
        &self,
        subject: &str,
        reply: Option<&str>,
        headers: &HeaderMap,
        payload: impl AsRef<[u8]>,
    ) -> Result<()> {
        self.inner
            .publish(subject, reply, Some(headers), payload.as_ref())
    }

    pub fn publish_message(&self, msg: &Message) -> Result<()> {
        self.inner.publish(
            &msg.subject,
            msg.reply.as_deref(),
            msg.headers.as_ref(),
            &msg.payload,
        )
    }

    /// Wait until the server processed everything sent so far, using the
    /// connect timeout
    pub fn flush(&self) -> Result<()> {
        self.inner.flush_timeout(self.inner.opts.timeout)
    }

    pub fn flush_timeout(&self, timeout: Duration) -> Result<()> {
        self.inner.flush_timeout(timeout)
    }

    // ========================================================================
    // Subscribing
    // ========================================================================

    /// Subscribe with a handler run on a dispatcher thread
    pub fn subscribe<F>(&self, subject: &str, handler: F) -> Result<Subscription>
    where
        F: Fn(Message) + Send + Sync + 'static,
    {
        self.subscribe_with(subject, None, SubscribeOptions::default(), handler)
    }

    pub fn queue_subscribe<F>(&self, subject: &str, queue: &str, handler: F) -> Result<Subscription>
    where
        F: Fn(Message) + Send + Sync + 'static,
    {
        self.subscribe_with(subject, Some(queue), SubscribeOptions::default(), handler)
    }

    pub fn subscribe_with<F>(
        &self,
        subject: &str,
        queue: Option<&str>,
        options: SubscribeOptions,
        handler: F,
    ) -> Result<Subscription>
    where
        F: Fn(Message) + Send + Sync + 'static,
    {
        let delivery =
            self.inner
                .async_delivery(subject, Arc::new(handler), options.dedicated_thread)?;
        let shared = self
            .inner
            .subscribe(subject, queue, delivery, options.pending_limits)?;
        Ok(Subscription::from_shared(shared))
    }

    /// Subscribe and pull messages with [`Subscription::next_message`]
    pub fn subscribe_sync(&self, subject: &str) -> Result<Subscription> {
        let shared = self.inner.subscribe(subject, None, Delivery::Sync, None)?;
        Ok(Subscription::from_shared(shared))
    }

    pub fn queue_subscribe_sync(&self, subject: &str, queue: &str) -> Result<Subscription> {
        let shared = self
            .inner
            .subscribe(subject, Some(queue), Delivery::Sync, None)?;
        Ok(Subscription::from_shared(shared))
    }

    // ========================================================================
    // Requests
    // ========================================================================

    /// Publish and wait for the first reply
    pub fn request(
        &self,
        subject: &str,
        payload: impl AsRef<[u8]>,
        timeout: Duration,
    ) -> Result<Message> {
        self.inner.request(subject, None, payload.as_ref(), timeout)
    }

    pub fn request_with_headers(
        &self,
        subject: &str,
        headers: &HeaderMap,
        payload: impl AsRef<[u8]>,
        timeout: Duration,
    ) -> Result<Message> {
        self.inner
            .request(subject, Some(headers), payload.as_ref(), timeout)
    }

    pub fn request_message(&self, msg: &Message, timeout: Duration) -> Result<Message> {
        self.inner
            .request(&msg.subject, msg.headers.as_ref(), &msg.payload, timeout)
    }

    /// A fresh subject under the configured inbox prefix
    pub fn new_inbox(&self) -> String {
        inbox::new_inbox(&self.inner.opts.inbox_prefix)
    }

    // ========================================================================
    // Lifecycle
    // ========================================================================

    /// Drain with the configured drain timeout
    pub fn drain(&self) -> Result<()> {
        self.inner.drain(self.inner.opts.drain_timeout)
    }

    pub fn drain_timeout(&self, timeout: Duration) -> Result<()> {
        self.inner.drain(timeout)
    }

    /// Drain one subscription of this connection
    pub fn drain_subscription(&self, sub: &Subscription) -> Result<()> {
        let owned = sub
            .shared
            .conn
            .upgrade()
            .is_some_and(|conn| Arc::ptr_eq(&conn, &self.inner));
        if !owned {
            return Err(Error::IllegalState(
                "subscription belongs to another connection".into(),
            ));
        }
        self.inner.drain_sub(&sub.shared, self.inner.opts.drain_timeout)
    }

    pub fn close(&self) {
        self.inner.close_with(None, true);
    }

    /// Feed readable data from an external event loop
    pub fn process_read_event(&self) {
        self.inner.on_readable();
    }

    /// Write buffered data when an external event loop reports the socket
    /// writable
    pub fn process_write_event(&self) {
        self.inner.on_writable();
    }

    // ========================================================================
    // Observers
    // ========================================================================

    pub fn status(&self) -> Status {
        self.inner.status()
    }

    pub fn is_closed(&self) -> bool {
        self.inner.is_closed()
    }

    pub fn is_reconnecting(&self) -> bool {
        self.status() == Status::Reconnecting
    }

    pub fn is_draining(&self) -> bool {
        self.status() == Status::Draining
    }

    /// URL of the server in use
    pub fn connected_url(&self) -> Option<String> {
        let core = self.inner.core.lock();
        match core.status {
            Status::Connected | Status::Draining => {
                core.connected_url.as_ref().map(ToString::to_string)
            }
            _ => None,
        }
    }

    pub fn connected_server_id(&self) -> Option<String> {
        let core = self.inner.core.lock();
        match core.status {
            Status::Connected | Status::Draining => Some(core.info.server_id.clone()),
            _ => None,
        }
    }

    /// Latest greeting received from the server
    pub fn server_info(&self) -> ServerInfo {
        self.inner.core.lock().info.clone()
    }

    /// Every server of the pool
    pub fn servers(&self) -> Vec<String> {
        self.inner.core.lock().pool.servers()
    }

    pub fn discovered_servers(&self) -> Vec<String> {
        self.inner.core.lock().pool.discovered()
    }

    pub fn max_payload(&self) -> usize {
        self.inner.core.lock().info.max_payload
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.inner.stats.snapshot()
    }

    /// Round trip time of a PING
    pub fn rtt(&self) -> Result<Duration> {
        if self.status() != Status::Connected {
            return Err(Error::IllegalState(format!(
                "cannot measure round trip while {}",
                self.status()
            )));
        }
        let start = Instant::now();
        self.inner.flush_timeout(self.inner.opts.timeout)?;
        Ok(start.elapsed())
    }

    pub fn last_error(&self) -> Option<Arc<Error>> {
        self.inner.core.lock().last_error.clone()
    }

    /// Bytes waiting to be written
    pub fn buffered(&self) -> usize {
        self.inner.out.lock().buf.len()
    }
}
