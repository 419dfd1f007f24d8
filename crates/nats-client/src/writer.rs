//! Outbound path
//!
//! Every command is encoded into one shared buffer under the `out` lock.
//! Small writes are coalesced and pushed to the socket by the flusher
//! thread; a full buffer, a flush or `send_asap` writes inline. While
//! disconnected, commands keep accumulating (up to the reconnect buffer
//! size) and go out after the handshake of the next server.

use std::collections::VecDeque;
use std::io::{self, Write};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tracing::{debug, trace};

use nats_core::{proto, Buffer};
use nats_transport::Stream;

use crate::connection::ConnInner;
use crate::sync::Completion;
use crate::{Error, Result};

/// A PING waiting for its PONG
pub(crate) struct PendingPong {
    /// Buffer offset (in bytes appended) right after the PING
    pub(crate) end: u64,
    pub(crate) waiter: Option<Arc<Completion<Result<()>>>>,
}

pub(crate) struct Outbound {
    pub(crate) buf: Buffer<'static>,
    pub(crate) stream: Option<Box<dyn Stream>>,
    /// Connection generation the stream belongs to
    pub(crate) gen: u64,
    /// Total bytes appended and written, used to tell which PINGs reached
    /// the socket
    appended: u64,
    written: u64,
    pub(crate) pongs: VecDeque<PendingPong>,
    signaled: bool,
}

impl Outbound {
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            buf: Buffer::with_capacity(capacity),
            stream: None,
            gen: 0,
            appended: 0,
            written: 0,
            pongs: VecDeque::new(),
            signaled: false,
        }
    }

    /// Write as much of the buffer as the socket takes.
    ///
    /// Returns false when a non-blocking socket stopped accepting data.
    pub(crate) fn write_pending(&mut self) -> io::Result<bool> {
        let Some(stream) = self.stream.as_mut() else {
            return Ok(false);
        };
        while !self.buf.is_empty() {
            match stream.write(self.buf.data()) {
                Ok(0) => return Err(io::ErrorKind::WriteZero.into()),
                Ok(n) => {
                    self.buf.consume(n);
                    self.written += n as u64;
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(false),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(e),
            }
        }
        stream.flush()?;
        Ok(true)
    }

    /// Install the stream of a new connection. Buffered bytes count as not
    /// yet written.
    pub(crate) fn attach(&mut self, stream: Box<dyn Stream>, gen: u64) {
        self.stream = Some(stream);
        self.gen = gen;
        self.written = self.appended - self.buf.len() as u64;
    }

    /// Drop the stream and fail the PINGs that went out on it
    pub(crate) fn detach(&mut self) -> Vec<Arc<Completion<Result<()>>>> {
        if let Some(stream) = self.stream.take() {
            let _ = stream.shutdown();
        }
        let written = self.written;
        let mut lost = Vec::new();
        while self.pongs.front().is_some_and(|p| p.end <= written) {
            if let Some(waiter) = self.pongs.pop_front().and_then(|p| p.waiter) {
                lost.push(waiter);
            }
        }
        lost
    }
}

impl ConnInner {
    /// Encode a command into the outbound buffer under the lock
    fn append_locked<F>(&self, out: &mut Outbound, encode: F) -> Result<()>
    where
        F: FnOnce(&mut Buffer<'static>),
    {
        if self.is_closed() {
            return Err(Error::Closed);
        }
        let before = out.buf.len();
        encode(&mut out.buf);
        if out.stream.is_none() && out.buf.len() > self.opts.reconnect_buffer_size {
            out.buf.move_to(before)?;
            return Err(Error::InsufficientBuffer(self.opts.reconnect_buffer_size));
        }
        out.appended += (out.buf.len() - before) as u64;
        Ok(())
    }

    /// Queue a command; `flush_now` pushes it to the socket right away
    pub(crate) fn send<F>(self: &Arc<Self>, flush_now: bool, encode: F) -> Result<()>
    where
        F: FnOnce(&mut Buffer<'static>),
    {
        let mut out = self.out.lock();
        self.append_locked(&mut out, encode)?;
        self.kick(out, flush_now);
        Ok(())
    }

    /// Queue a PING; the waiter completes on the matching PONG
    pub(crate) fn send_ping(
        self: &Arc<Self>,
        waiter: Option<Arc<Completion<Result<()>>>>,
    ) -> Result<()> {
        let mut out = self.out.lock();
        self.append_locked(&mut out, proto::write_ping)?;
        let end = out.appended;
        out.pongs.push_back(PendingPong { end, waiter });
        self.kick(out, true);
        Ok(())
    }

    /// Get freshly buffered bytes moving
    fn kick(self: &Arc<Self>, mut out: parking_lot::MutexGuard<'_, Outbound>, flush_now: bool) {
        if out.stream.is_none() {
            return;
        }
        if let Some(event_loop) = &self.opts.event_loop {
            drop(out);
            event_loop.write_interest(true);
            return;
        }
        if flush_now || self.opts.send_asap || out.buf.len() >= self.opts.io_buf_size {
            if let Err(e) = out.write_pending() {
                let gen = out.gen;
                drop(out);
                self.handle_disconnect(gen, e.into());
            }
            return;
        }
        if !out.signaled {
            out.signaled = true;
            self.out_cond.notify_one();
        }
    }

    /// PONG from the server: release the oldest PING
    pub(crate) fn process_pong(&self) {
        self.pings_out.store(0, Ordering::Release);
        let waiter = self.out.lock().pongs.pop_front().and_then(|p| p.waiter);
        if let Some(waiter) = waiter {
            waiter.complete(Ok(()));
        }
    }

    /// Event loop reports the socket writable
    pub(crate) fn on_writable(self: &Arc<Self>) {
        let mut out = self.out.lock();
        match out.write_pending() {
            Ok(true) => {
                drop(out);
                if let Some(event_loop) = &self.opts.event_loop {
                    event_loop.write_interest(false);
                }
            }
            Ok(false) => {}
            Err(e) => {
                let gen = out.gen;
                drop(out);
                self.handle_disconnect(gen, e.into());
            }
        }
    }
}

/// Background writer: coalesces small commands into fewer syscalls
pub(crate) fn flusher_loop(inner: Arc<ConnInner>) {
    debug!("Flusher started");
    let mut out = inner.out.lock();
    loop {
        while !out.signaled && !inner.is_closed() {
            inner.out_cond.wait(&mut out);
        }
        if inner.is_closed() {
            break;
        }
        out.signaled = false;
        if out.stream.is_none() || out.buf.is_empty() {
            continue;
        }
        trace!("Flushing {} buffered bytes", out.buf.len());
        if let Err(e) = out.write_pending() {
            let gen = out.gen;
            let inner = inner.clone();
            parking_lot::MutexGuard::unlocked(&mut out, move || {
                inner.handle_disconnect(gen, e.into());
            });
        }
    }
    debug!("Flusher stopped");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_detach_fails_only_sent_pings() {
        let mut out = Outbound::new(64);
        let sent = Arc::new(Completion::new());
        let unsent = Arc::new(Completion::new());
        out.appended = 20;
        out.written = 10;
        out.pongs.push_back(PendingPong {
            end: 6,
            waiter: Some(sent.clone()),
        });
        out.pongs.push_back(PendingPong {
            end: 20,
            waiter: Some(unsent.clone()),
        });

        let lost = out.detach();
        assert_eq!(lost.len(), 1);
        assert!(Arc::ptr_eq(&lost[0], &sent));
        assert_eq!(out.pongs.len(), 1);
    }

    #[test]
    fn test_write_pending_without_stream() {
        let mut out = Outbound::new(64);
        out.buf.append(b"PING\r\n");
        assert!(!out.write_pending().unwrap());
        assert_eq!(out.buf.len(), 6);
    }
}
