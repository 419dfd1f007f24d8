//! Connection handshake
//!
//! `INFO` from the server, optional TLS upgrade, then `CONNECT` + `PING`
//! answered by `PONG`. Everything happens on the calling thread with the
//! connect timeout as read deadline.

use std::collections::VecDeque;
use std::io::{Read, Write};
use std::sync::Arc;
use std::time::Instant;
use tracing::debug;

use nats_core::{proto, Buffer, ParsedEvent, Parser, ServerInfo};
use nats_transport::{Stream, TransportError};

use crate::auth;
use crate::connection::ConnInner;
use crate::server_pool::ServerUrl;
use crate::{Error, Result};

/// A socket that completed the handshake
pub(crate) struct Session {
    pub(crate) stream: Box<dyn Stream>,
    pub(crate) parser: Parser,
    pub(crate) info: ServerInfo,
    pub(crate) url: ServerUrl,
    /// Frames read past the handshake `PONG`
    pub(crate) leftover: Vec<ParsedEvent>,
}

struct Reader<'s> {
    stream: &'s mut Box<dyn Stream>,
    parser: &'s mut Parser,
    pending: VecDeque<ParsedEvent>,
    deadline: Instant,
}

impl Reader<'_> {
    fn next_event(&mut self) -> Result<ParsedEvent> {
        let mut chunk = [0u8; 4096];
        loop {
            if let Some(event) = self.pending.pop_front() {
                return Ok(event);
            }
            if Instant::now() >= self.deadline {
                return Err(Error::Timeout);
            }
            let n = match self.stream.read(&mut chunk) {
                Ok(0) => {
                    return Err(Error::ConnectionFailed(
                        "connection closed during handshake".into(),
                    ))
                }
                Ok(n) => n,
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) if matches!(
                    e.kind(),
                    std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut
                ) =>
                {
                    return Err(Error::Timeout)
                }
                Err(e) => return Err(e.into()),
            };
            let mut events = Vec::new();
            self.parser.feed_into(&chunk[..n], &mut events)?;
            self.pending.extend(events);
        }
    }
}

impl ConnInner {
    /// Open a socket to `url` and run the handshake
    pub(crate) fn establish(
        self: &Arc<Self>,
        url: &ServerUrl,
        credentials: Option<(String, Option<String>)>,
    ) -> Result<Session> {
        let timeout = self.opts.timeout;
        let deadline = Instant::now() + timeout;
        debug!("Connecting to {}", url);

        let mut stream = self
            .opts
            .transport
            .connect(url.connect_host(), url.port, timeout)?;
        stream.set_read_timeout(Some(timeout))?;
        let mut parser = Parser::with_stats(self.stats.clone());

        let mut info = {
            let mut reader = Reader {
                stream: &mut stream,
                parser: &mut parser,
                pending: VecDeque::new(),
                deadline,
            };
            match reader.next_event()? {
                ParsedEvent::Info(raw) => ServerInfo::parse(&raw)?,
                ParsedEvent::Err(text) => return Err(auth::server_error(&text)),
                other => {
                    return Err(Error::ConnectionFailed(format!(
                        "expected INFO, got {:?}",
                        other
                    )))
                }
            }
        };

        let secure = self.opts.secure || info.tls_required || url.is_tls();
        if self.opts.secure && !info.tls_required && !info.tls_available {
            return Err(Error::ConnectionFailed(
                "secure connection required but server does not support TLS".into(),
            ));
        }
        if secure {
            let connector = self.tls_connector()?;
            stream = stream.upgrade(&connector, url.connect_host(), timeout)?;
            stream.set_read_timeout(Some(timeout))?;
            debug!("TLS established with {}", url);
        }

        let creds = credentials
            .as_ref()
            .map(|(u, p)| (u.as_str(), p.as_deref()));
        let connect = auth::connect_info(&self.opts, url, creds, &info, secure)?;
        let mut backing = [0u8; 512];
        let mut buf = Buffer::borrowed(&mut backing);
        proto::write_connect(&mut buf, &connect)?;
        proto::write_ping(&mut buf);
        stream.write_all(buf.data())?;
        stream.flush()?;

        let leftover = {
            let mut reader = Reader {
                stream: &mut stream,
                parser: &mut parser,
                pending: VecDeque::new(),
                deadline,
            };
            loop {
                match reader.next_event()? {
                    ParsedEvent::Pong => break,
                    ParsedEvent::Ping => {
                        let mut pong = Buffer::new();
                        proto::write_pong(&mut pong);
                        reader.stream.write_all(pong.data())?;
                    }
                    ParsedEvent::Info(raw) => info = ServerInfo::parse(&raw)?,
                    ParsedEvent::Err(text) => return Err(auth::server_error(&text)),
                    ParsedEvent::Ok => {}
                    ParsedEvent::Msg(_) => {
                        return Err(Error::ConnectionFailed(
                            "message received before handshake completed".into(),
                        ))
                    }
                }
            }
            reader.pending.into_iter().collect()
        };

        stream.set_read_timeout(None)?;
        if secure && !stream.is_secure() {
            return Err(TransportError::UpgradeUnsupported.into());
        }
        Ok(Session {
            stream,
            parser,
            info,
            url: url.clone(),
            leftover,
        })
    }
}
