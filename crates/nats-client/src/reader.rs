//! Inbound path
//!
//! The reader thread owns the read half of the socket and the protocol
//! parser. It routes messages to subscriptions, answers PINGs, and hands
//! any socket or protocol failure to the reconnect logic. With an external
//! event loop the same work runs from [`ConnInner::on_readable`] instead.

use std::io::{self, Read};
use std::sync::Arc;
use tracing::{debug, info, trace, warn};

use nats_core::{proto, Message, MsgEvent, ParsedEvent, Parser, ServerInfo};
use nats_transport::{Stream, TransportError};

use crate::auth::{self, ServerErrorKind};
use crate::connection::ConnInner;
use crate::server_pool::ServerUrl;
use crate::subscription::Enqueued;
use crate::{Error, Result};

/// Read half of a connection
pub(crate) struct ReadSide {
    pub(crate) stream: Box<dyn Stream>,
    pub(crate) parser: Parser,
    pub(crate) gen: u64,
    buf: Vec<u8>,
}

impl ReadSide {
    pub(crate) fn new(stream: Box<dyn Stream>, parser: Parser, gen: u64, buf_size: usize) -> Self {
        Self {
            stream,
            parser,
            gen,
            buf: vec![0u8; buf_size],
        }
    }

    /// One blocking read. `Ok(false)` when the read timed out.
    fn read_once(&mut self, events: &mut Vec<ParsedEvent>) -> Result<bool> {
        match self.stream.read(&mut self.buf) {
            Ok(0) => Err(TransportError::ConnectionClosed.into()),
            Ok(n) => {
                self.parser.feed_into(&self.buf[..n], events)?;
                Ok(true)
            }
            Err(e)
                if matches!(
                    e.kind(),
                    io::ErrorKind::Interrupted | io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut
                ) =>
            {
                Ok(false)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Read a non-blocking socket until it has nothing more
    fn read_available(&mut self, events: &mut Vec<ParsedEvent>) -> Result<()> {
        while self.read_once(events)? {}
        Ok(())
    }
}

/// Reader thread body: runs until the socket fails or is replaced
pub(crate) fn read_loop(inner: Arc<ConnInner>, mut side: ReadSide, leftover: Vec<ParsedEvent>) {
    let gen = side.gen;
    debug!("Reader started (generation {})", gen);
    let err = read_until_error(&inner, &mut side, leftover);
    let _ = side.stream.shutdown();
    if !inner.is_closed() {
        debug!("Reader stopped: {}", err);
        inner.handle_disconnect(gen, err);
    }
}

fn read_until_error(
    inner: &Arc<ConnInner>,
    side: &mut ReadSide,
    mut events: Vec<ParsedEvent>,
) -> Error {
    loop {
        for event in events.drain(..) {
            if let Err(e) = inner.process_event(event) {
                return e;
            }
        }
        if inner.is_closed() {
            return Error::Closed;
        }
        if let Err(e) = side.read_once(&mut events) {
            // Frames parsed ahead of a protocol error still count.
            for event in events.drain(..) {
                if inner.process_event(event).is_err() {
                    break;
                }
            }
            return e;
        }
    }
}

impl ConnInner {
    pub(crate) fn process_event(self: &Arc<Self>, event: ParsedEvent) -> Result<()> {
        match event {
            ParsedEvent::Msg(msg) => self.process_msg(msg),
            ParsedEvent::Ping => self.send(true, proto::write_pong)?,
            ParsedEvent::Pong => self.process_pong(),
            ParsedEvent::Info(raw) => self.process_info(&raw)?,
            ParsedEvent::Ok => {}
            ParsedEvent::Err(text) => return self.process_err(text),
        }
        Ok(())
    }

    fn process_msg(self: &Arc<Self>, event: MsgEvent) {
        let sub = self.core.lock().subs.get(&event.sid).cloned();
        let Some(sub) = sub else {
            trace!("Message for unknown sid {} on '{}'", event.sid, event.subject);
            return;
        };
        let msg = match Message::from_event(event) {
            Ok(msg) => msg,
            Err(e) => {
                warn!("Dropping malformed message on '{}': {}", sub.subject, e);
                return;
            }
        };
        match sub.enqueue(msg) {
            Enqueued::Queued { reached_max: true } => self.forget_sub(sub.sid),
            Enqueued::Dropped { notify: true } => {
                warn!("Slow consumer on '{}' (sid {})", sub.subject, sub.sid);
                self.notify_error(Some(sub), Error::SlowConsumer);
            }
            _ => {}
        }
    }

    /// Asynchronous INFO: cluster topology or lame duck mode changed
    fn process_info(self: &Arc<Self>, raw: &[u8]) -> Result<()> {
        let info = ServerInfo::parse(raw)?;
        let lame_duck = info.lame_duck_mode;
        let added = {
            let mut core = self.core.lock();
            let added = if self.opts.ignore_discovered_servers || info.connect_urls.is_empty() {
                false
            } else {
                let current = core.connected_url.as_ref().map(ServerUrl::key);
                core.pool
                    .merge_discovered(&info.connect_urls, current.as_deref())
            };
            core.info = info;
            added
        };

        if added {
            info!("Discovered new servers");
            self.notify(&self.opts.discovered_servers_cb);
        }
        if lame_duck {
            warn!("Server entered lame duck mode");
            self.notify(&self.opts.lame_duck_cb);
        }
        Ok(())
    }

    fn process_err(self: &Arc<Self>, text: String) -> Result<()> {
        match auth::classify(&text) {
            ServerErrorKind::Permissions => {
                warn!("Server: {}", text);
                self.notify_error(None, Error::Server(text));
                Ok(())
            }
            ServerErrorKind::Stale | ServerErrorKind::Auth => Err(auth::server_error(&text)),
            ServerErrorKind::Other => {
                self.close_with(Some(Error::Server(text)), true);
                Err(Error::Closed)
            }
        }
    }

    /// Event loop reports the socket readable
    pub(crate) fn on_readable(self: &Arc<Self>) {
        let mut events = Vec::new();
        let (gen, outcome) = {
            let mut guard = self.read_side.lock();
            let Some(side) = guard.as_mut() else {
                return;
            };
            (side.gen, side.read_available(&mut events))
        };

        for event in events {
            if let Err(e) = self.process_event(event) {
                self.handle_disconnect(gen, e);
                return;
            }
        }
        if let Err(e) = outcome {
            self.handle_disconnect(gen, e);
        }
    }
}
