//! Connection lifecycle: installing a socket, losing it, getting another
//!
//! Each installed socket gets a new generation number. A thread that
//! notices a failure reports it with the generation it was working on;
//! reports about a socket that was already replaced are ignored, so a
//! disconnect is handled exactly once.

use rand::Rng;
use std::io::Write;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

use nats_core::{proto, Buffer};

use crate::connection::{ConnInner, Status};
use crate::handshake::Session;
use crate::reader::{self, ReadSide};
use crate::writer;
use crate::{Error, Result};

impl ConnInner {
    /// Start the threads that live as long as the connection
    pub(crate) fn start_background(self: &Arc<Self>) -> Result<()> {
        let inner = self.clone();
        let pinger = std::thread::Builder::new()
            .name("nats-pinger".into())
            .spawn(move || pinger_loop(inner))?;
        self.track_thread(pinger);

        if self.opts.event_loop.is_none() {
            let inner = self.clone();
            let flusher = std::thread::Builder::new()
                .name("nats-flusher".into())
                .spawn(move || writer::flusher_loop(inner))?;
            self.track_thread(flusher);
        }
        Ok(())
    }

    /// Make a freshly handshaked socket the live one.
    ///
    /// Restores subscriptions, then releases everything buffered while
    /// disconnected.
    pub(crate) fn install(self: &Arc<Self>, session: Session) -> Result<()> {
        let Session {
            mut stream,
            parser,
            info,
            url,
            leftover,
        } = session;
        let key = url.key();

        let (gen, reconnected, subs) = {
            let mut core = self.core.lock();
            if core.status == Status::Closed {
                let _ = stream.shutdown();
                return Err(Error::Closed);
            }
            let reconnected = core.status == Status::Reconnecting;
            core.status = Status::Connected;
            core.generation += 1;
            core.reconnect_running = false;
            core.auth_failures = 0;
            core.pool.make_current(&key);
            core.pool.mark_connected(&key);
            if !self.opts.ignore_discovered_servers && !info.connect_urls.is_empty() {
                core.pool.merge_discovered(&info.connect_urls, Some(&key));
            }
            core.info = info;
            core.connected_url = Some(url.clone());
            let subs: Vec<_> = core
                .subs
                .values()
                .filter_map(|sub| sub.resend_info().map(|max| (sub.clone(), max)))
                .collect();
            self.cond.notify_all();
            (core.generation, reconnected, subs)
        };
        self.pings_out.store(0, Ordering::Release);

        if !subs.is_empty() {
            let mut buf = Buffer::new();
            for (sub, max) in &subs {
                proto::write_sub(&mut buf, &sub.subject, sub.queue.as_deref(), sub.sid);
                if let Some(max) = max {
                    proto::write_unsub(&mut buf, sub.sid, Some(*max));
                }
            }
            if let Err(e) = stream.write_all(buf.data()) {
                let _ = stream.shutdown();
                self.handle_disconnect(gen, e.into());
                return Ok(());
            }
            debug!("Restored {} subscriptions", subs.len());
        }

        let writer = match stream.try_clone() {
            Ok(writer) => writer,
            Err(e) => {
                let _ = stream.shutdown();
                self.handle_disconnect(gen, e.into());
                return Ok(());
            }
        };
        let event_loop = self.opts.event_loop.clone();
        if event_loop.is_some() {
            if let Err(e) = stream.set_nonblocking(true) {
                let _ = stream.shutdown();
                self.handle_disconnect(gen, e.into());
                return Ok(());
            }
        }

        let flushed = {
            let mut out = self.out.lock();
            out.attach(writer, gen);
            if event_loop.is_some() {
                Ok(())
            } else {
                out.write_pending().map(|_| ())
            }
        };
        if let Err(e) = flushed {
            self.handle_disconnect(gen, e.into());
            return Ok(());
        }

        let side = ReadSide::new(stream, parser, gen, self.opts.io_buf_size);
        match &event_loop {
            None => {
                let inner = self.clone();
                let spawned = std::thread::Builder::new()
                    .name("nats-reader".into())
                    .spawn(move || reader::read_loop(inner, side, leftover));
                match spawned {
                    Ok(handle) => self.track_thread(handle),
                    Err(e) => {
                        self.handle_disconnect(gen, e.into());
                        return Ok(());
                    }
                }
            }
            Some(event_loop) => {
                *self.read_side.lock() = Some(side);
                if let Err(e) = event_loop.attach(&self.handle()) {
                    self.handle_disconnect(gen, e);
                    return Ok(());
                }
                event_loop.read_interest(true);
                event_loop.write_interest(true);
                for event in leftover {
                    if let Err(e) = self.process_event(event) {
                        self.handle_disconnect(gen, e);
                        return Ok(());
                    }
                }
            }
        }

        if reconnected {
            self.stats.record_reconnect();
            info!("Reconnected to {}", url);
            self.notify(&self.opts.reconnected_cb);
        }
        Ok(())
    }

    /// The socket of generation `gen` failed
    pub(crate) fn handle_disconnect(self: &Arc<Self>, gen: u64, err: Error) {
        let spawn = {
            let mut core = self.core.lock();
            if core.generation != gen
                || !matches!(core.status, Status::Connected | Status::Draining)
            {
                return;
            }
            warn!("Disconnected: {}", err);
            if !self.opts.allow_reconnect || core.status == Status::Draining {
                drop(core);
                self.close_with(Some(err), true);
                return;
            }
            core.status = Status::Reconnecting;
            core.generation += 1;
            if let Some(entry) = core.pool.current() {
                let key = entry.url.key();
                core.pool.mark_attempt(&key);
            }
            let spawn = !core.reconnect_running;
            core.reconnect_running = true;
            core.last_error = Some(Arc::new(clone_for_report(&err)));
            self.cond.notify_all();
            spawn
        };

        let lost = self.out.lock().detach();
        for waiter in lost {
            waiter.complete(Err(Error::ConnectionFailed(
                "connection lost before reply".into(),
            )));
        }
        if let Some(side) = self.read_side.lock().take() {
            let _ = side.stream.shutdown();
        }
        if let Some(event_loop) = &self.opts.event_loop {
            event_loop.detach();
        }
        self.pings_out.store(0, Ordering::Release);

        if self.opts.fail_requests_on_disconnect {
            self.fail_requests(|| Error::ConnectionFailed("disconnected".into()));
        }
        if matches!(err, Error::Protocol(_)) {
            self.notify_error(None, err);
        }
        self.notify(&self.opts.disconnected_cb);

        if spawn {
            self.spawn_reconnect();
        }
    }

    pub(crate) fn spawn_reconnect(self: &Arc<Self>) {
        let inner = self.clone();
        let spawned = std::thread::Builder::new()
            .name("nats-reconnect".into())
            .spawn(move || reconnect_loop(inner));
        match spawned {
            Ok(handle) => self.track_thread(handle),
            Err(e) => {
                error!("Could not start reconnect thread: {}", e);
                self.close_with(Some(e.into()), true);
            }
        }
    }

    /// Sleep until `until`, waking early if the connection leaves the
    /// reconnecting state
    fn sleep_reconnecting(&self, until: Instant) {
        let mut core = self.core.lock();
        while core.status == Status::Reconnecting {
            if self.cond.wait_until(&mut core, until).timed_out() {
                break;
            }
        }
    }
}

/// Keep enough of an error to report it as the last error
fn clone_for_report(err: &Error) -> Error {
    match err {
        Error::StaleConnection => Error::StaleConnection,
        Error::Auth(text) => Error::Auth(text.clone()),
        Error::Timeout => Error::Timeout,
        other => Error::ConnectionFailed(other.to_string()),
    }
}

fn reconnect_loop(inner: Arc<ConnInner>) {
    let opts = &inner.opts;
    debug!("Reconnect loop started");
    // Attempts in the current pass over the pool
    let mut pass_attempts = 0usize;
    let mut passes = 0u32;

    loop {
        let (url, credentials, last_attempt, pool_len) = {
            let mut core = inner.core.lock();
            if core.status != Status::Reconnecting {
                core.reconnect_running = false;
                return;
            }
            if core.pool.exhausted(opts.max_reconnect) {
                drop(core);
                info!("Giving up reconnecting: server pool exhausted");
                inner.close_with(Some(Error::NoServers), true);
                return;
            }
            let keep = opts.keep_explicit_servers;
            let Some(entry) = core.pool.next_candidate(opts.max_reconnect, keep) else {
                drop(core);
                inner.close_with(Some(Error::NoServers), true);
                return;
            };
            let url = entry.url.clone();
            let last_attempt = entry.last_attempt;
            (
                url,
                core.pool.owned_credentials(),
                last_attempt,
                core.pool.len(),
            )
        };

        match &opts.custom_reconnect_delay {
            Some(delay) => {
                if pass_attempts >= pool_len {
                    pass_attempts = 0;
                    passes += 1;
                    let wait = delay(passes);
                    debug!("Custom reconnect delay {:?} after pass {}", wait, passes);
                    inner.sleep_reconnecting(Instant::now() + wait);
                }
            }
            None => {
                if let Some(last) = last_attempt {
                    let elapsed = last.elapsed();
                    if elapsed < opts.reconnect_wait {
                        let jitter = if url.is_tls() {
                            opts.reconnect_jitter_tls
                        } else {
                            opts.reconnect_jitter
                        };
                        let extra = if jitter.is_zero() {
                            Duration::ZERO
                        } else {
                            rand::thread_rng().gen_range(Duration::ZERO..=jitter)
                        };
                        let wait = opts.reconnect_wait - elapsed + extra;
                        inner.sleep_reconnecting(Instant::now() + wait);
                    }
                }
            }
        }
        pass_attempts += 1;

        {
            let mut core = inner.core.lock();
            if core.status != Status::Reconnecting {
                core.reconnect_running = false;
                return;
            }
            core.pool.mark_attempt(&url.key());
        }

        debug!("Reconnecting to {}", url);
        match inner.establish(&url, credentials) {
            Ok(session) => {
                if inner.install(session).is_err() {
                    debug!("Connection closed while reconnecting");
                }
                return;
            }
            Err(e) => {
                debug!("Reconnect to {} failed: {}", url, e);
                let give_up = {
                    let mut core = inner.core.lock();
                    core.pool.mark_failed(&url.key());
                    if e.is_auth_failure() {
                        core.auth_failures += 1;
                    } else {
                        core.auth_failures = 0;
                    }
                    core.last_error = Some(Arc::new(clone_for_report(&e)));
                    e.is_auth_failure() && core.auth_failures >= opts.max_auth_failures
                };
                if give_up {
                    warn!("Giving up after repeated authentication failures");
                    inner.close_with(Some(e), true);
                    return;
                }
            }
        }
    }
}

/// Send a PING every interval; too many unanswered means the server is gone
fn pinger_loop(inner: Arc<ConnInner>) {
    let interval = inner.opts.ping_interval;
    if interval.is_zero() {
        debug!("Pinging disabled");
        let mut core = inner.core.lock();
        while core.status != Status::Closed {
            inner.cond.wait(&mut core);
        }
        return;
    }
    loop {
        let gen = {
            let deadline = Instant::now() + interval;
            let mut core = inner.core.lock();
            while core.status != Status::Closed {
                if inner.cond.wait_until(&mut core, deadline).timed_out() {
                    break;
                }
            }
            match core.status {
                Status::Closed => break,
                Status::Connected => core.generation,
                _ => continue,
            }
        };

        let outstanding = inner.pings_out.fetch_add(1, Ordering::AcqRel) + 1;
        if outstanding > inner.opts.max_pings_outstanding {
            warn!("{} PINGs without answer", outstanding - 1);
            inner.handle_disconnect(gen, Error::StaleConnection);
        } else if let Err(e) = inner.send_ping(None) {
            debug!("Could not send PING: {}", e);
        }
    }
    debug!("Pinger stopped");
}
