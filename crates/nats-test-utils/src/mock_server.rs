//! In-process mock server
//!
//! Speaks enough of the server side of the protocol to exercise a client:
//! INFO/CONNECT handshake with optional authentication, PING/PONG,
//! SUB/UNSUB (with auto-unsubscribe), PUB/HPUB routing with `*` and `>`
//! wildcards, queue groups, and no-responders replies. Tests can inject
//! errors and asynchronous INFO, cut clients off, and stop and restart the
//! server on the same port.

use parking_lot::Mutex;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::io::{BufRead, BufReader, Read, Write};
use std::net::{Shutdown, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::debug;

use crate::{wait_for, DEFAULT_CHECK_INTERVAL};

const NO_RESPONDERS_HEADER: &[u8] = b"NATS/1.0 503\r\n\r\n";

/// How the mock server behaves
#[derive(Debug, Clone)]
pub struct MockServerConfig {
    pub server_id: String,
    pub max_payload: usize,
    pub headers: bool,
    /// Token a client must present
    pub auth_token: Option<String>,
    /// User and password a client must present
    pub user_password: Option<(String, String)>,
    /// Announced cluster members, `host:port`
    pub connect_urls: Vec<String>,
    pub nonce: Option<String>,
    /// Answer PINGs after the handshake
    pub respond_to_ping: bool,
}

impl Default for MockServerConfig {
    fn default() -> Self {
        Self {
            server_id: "MOCK".to_string(),
            max_payload: 1024 * 1024,
            headers: true,
            auth_token: None,
            user_password: None,
            connect_urls: Vec::new(),
            nonce: None,
            respond_to_ping: true,
        }
    }
}

/// A message received from a client
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Published {
    pub subject: String,
    pub reply: Option<String>,
    pub headers: Option<Vec<u8>>,
    pub payload: Vec<u8>,
}

struct SubEntry {
    subject: String,
    queue: Option<String>,
    max: Option<u64>,
    delivered: u64,
}

struct Client {
    id: u64,
    writer: Mutex<TcpStream>,
    subs: Mutex<HashMap<u64, SubEntry>>,
    echo: AtomicBool,
    no_responders: AtomicBool,
}

impl Client {
    fn write(&self, data: &[u8]) {
        let mut writer = self.writer.lock();
        if writer.write_all(data).is_err() {
            let _ = writer.shutdown(Shutdown::Both);
        }
    }

    fn shutdown(&self) {
        let _ = self.writer.lock().shutdown(Shutdown::Both);
    }
}

struct Shared {
    config: Mutex<MockServerConfig>,
    port: u16,
    running: AtomicBool,
    clients: Mutex<HashMap<u64, Arc<Client>>>,
    next_client: AtomicU64,
    connects: Mutex<Vec<Value>>,
    auth_failures: AtomicUsize,
    published: Mutex<Vec<Published>>,
    queue_rr: AtomicUsize,
    sub_commands: AtomicUsize,
    unsub_commands: AtomicUsize,
}

/// A test server that stops on drop
pub struct MockServer {
    shared: Arc<Shared>,
    accept: Option<JoinHandle<()>>,
}

impl MockServer {
    /// Start on a random port with the default configuration
    pub fn start() -> Self {
        Self::start_with(MockServerConfig::default())
    }

    pub fn start_with(config: MockServerConfig) -> Self {
        Self::start_on(0, config)
    }

    /// Start on `port`, 0 for any
    pub fn start_on(port: u16, config: MockServerConfig) -> Self {
        let listener = TcpListener::bind(("127.0.0.1", port)).unwrap();
        listener.set_nonblocking(true).unwrap();
        let port = listener.local_addr().unwrap().port();

        let shared = Arc::new(Shared {
            config: Mutex::new(config),
            port,
            running: AtomicBool::new(true),
            clients: Mutex::new(HashMap::new()),
            next_client: AtomicU64::new(1),
            connects: Mutex::new(Vec::new()),
            auth_failures: AtomicUsize::new(0),
            published: Mutex::new(Vec::new()),
            queue_rr: AtomicUsize::new(0),
            sub_commands: AtomicUsize::new(0),
            unsub_commands: AtomicUsize::new(0),
        });
        let accept_shared = shared.clone();
        let accept = std::thread::spawn(move || accept_loop(accept_shared, listener));
        debug!("Mock server listening on {}", port);

        Self {
            shared,
            accept: Some(accept),
        }
    }

    pub fn port(&self) -> u16 {
        self.shared.port
    }

    pub fn url(&self) -> String {
        format!("nats://127.0.0.1:{}", self.shared.port)
    }

    /// Change the configuration; applies to new connections
    pub fn configure<F: FnOnce(&mut MockServerConfig)>(&self, f: F) {
        f(&mut self.shared.config.lock());
    }

    pub fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::SeqCst)
    }

    /// Stop listening and drop every client
    pub fn stop(&mut self) {
        self.shared.running.store(false, Ordering::SeqCst);
        if let Some(handle) = self.accept.take() {
            let _ = handle.join();
        }
        self.disconnect_clients();
    }

    /// Stop, then listen again on the same port with the same configuration
    pub fn restart(&mut self) {
        self.stop();
        let config = self.shared.config.lock().clone();
        *self = Self::start_on(self.shared.port, config);
    }

    /// Cut every client connection; the server keeps accepting
    pub fn disconnect_clients(&self) {
        let clients: Vec<_> = self.shared.clients.lock().drain().map(|(_, c)| c).collect();
        for client in clients {
            client.shutdown();
        }
    }

    pub fn client_count(&self) -> usize {
        self.shared.clients.lock().len()
    }

    /// CONNECT records accepted so far
    pub fn connects(&self) -> Vec<Value> {
        self.shared.connects.lock().clone()
    }

    pub fn connect_count(&self) -> usize {
        self.shared.connects.lock().len()
    }

    pub fn auth_failures(&self) -> usize {
        self.shared.auth_failures.load(Ordering::SeqCst)
    }

    /// Messages published by clients, in arrival order
    pub fn published(&self) -> Vec<Published> {
        self.shared.published.lock().clone()
    }

    /// SUB commands received since start, duplicates included
    pub fn sub_commands(&self) -> usize {
        self.shared.sub_commands.load(Ordering::SeqCst)
    }

    pub fn unsub_commands(&self) -> usize {
        self.shared.unsub_commands.load(Ordering::SeqCst)
    }

    /// Live subscriptions across all clients
    pub fn sub_count(&self) -> usize {
        self.shared
            .clients
            .lock()
            .values()
            .map(|c| c.subs.lock().len())
            .sum()
    }

    /// Wait until at least `n` subscriptions are registered
    pub fn wait_for_subs(&self, n: usize, max_wait: Duration) -> bool {
        wait_for(|| self.sub_count() >= n, DEFAULT_CHECK_INTERVAL, max_wait)
    }

    pub fn wait_for_clients(&self, n: usize, max_wait: Duration) -> bool {
        wait_for(|| self.client_count() >= n, DEFAULT_CHECK_INTERVAL, max_wait)
    }

    /// Route a message as if a client had published it
    pub fn publish(&self, subject: &str, reply: Option<&str>, payload: &[u8]) {
        route(&self.shared, None, subject, reply, None, payload);
    }

    /// Send `-ERR '<text>'` to every client
    pub fn send_err(&self, text: &str) {
        let frame = format!("-ERR '{}'\r\n", text);
        for client in self.shared.clients.lock().values() {
            client.write(frame.as_bytes());
        }
    }

    /// Send an asynchronous INFO announcing `connect_urls` to every client
    pub fn send_info(&self, connect_urls: &[&str], lame_duck: bool) {
        let mut info = info_json(&self.shared);
        info["connect_urls"] = json!(connect_urls);
        if lame_duck {
            info["ldm"] = json!(true);
        }
        let frame = format!("INFO {}\r\n", info);
        for client in self.shared.clients.lock().values() {
            client.write(frame.as_bytes());
        }
    }
}

impl Drop for MockServer {
    fn drop(&mut self) {
        self.stop();
    }
}

fn info_json(shared: &Shared) -> Value {
    let config = shared.config.lock();
    let mut info = json!({
        "server_id": config.server_id,
        "version": "2.10.0",
        "proto": 1,
        "host": "127.0.0.1",
        "port": shared.port,
        "max_payload": config.max_payload,
        "headers": config.headers,
        "auth_required": config.auth_token.is_some() || config.user_password.is_some(),
    });
    if !config.connect_urls.is_empty() {
        info["connect_urls"] = json!(config.connect_urls);
    }
    if let Some(nonce) = &config.nonce {
        info["nonce"] = json!(nonce);
    }
    info
}

fn accept_loop(shared: Arc<Shared>, listener: TcpListener) {
    while shared.running.load(Ordering::SeqCst) {
        match listener.accept() {
            Ok((stream, _)) => {
                let _ = stream.set_nonblocking(false);
                let _ = stream.set_nodelay(true);
                let shared = shared.clone();
                std::thread::spawn(move || serve(shared, stream));
            }
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                std::thread::sleep(Duration::from_millis(5));
            }
            Err(_) => break,
        }
    }
}

fn authorized(config: &MockServerConfig, connect: &Value) -> bool {
    if config.auth_token.is_none() && config.user_password.is_none() {
        return true;
    }
    if let Some(token) = &config.auth_token {
        if connect["auth_token"].as_str() == Some(token.as_str()) {
            return true;
        }
    }
    if let Some((user, pass)) = &config.user_password {
        if connect["user"].as_str() == Some(user.as_str())
            && connect["pass"].as_str() == Some(pass.as_str())
        {
            return true;
        }
    }
    false
}

fn serve(shared: Arc<Shared>, stream: TcpStream) {
    let Ok(writer) = stream.try_clone() else {
        return;
    };
    let client = Arc::new(Client {
        id: shared.next_client.fetch_add(1, Ordering::SeqCst),
        writer: Mutex::new(writer),
        subs: Mutex::new(HashMap::new()),
        echo: AtomicBool::new(true),
        no_responders: AtomicBool::new(false),
    });

    client.write(format!("INFO {}\r\n", info_json(&shared)).as_bytes());
    let mut reader = BufReader::new(stream);
    if handle_commands(&shared, &client, &mut reader).is_err() {
        debug!("Mock client {} gone", client.id);
    }
    shared.clients.lock().remove(&client.id);
    client.shutdown();
}

fn handle_commands(
    shared: &Arc<Shared>,
    client: &Arc<Client>,
    reader: &mut BufReader<TcpStream>,
) -> std::io::Result<()> {
    let mut connected = false;
    let mut handshake_done = false;
    let mut line = String::new();

    loop {
        line.clear();
        if reader.read_line(&mut line)? == 0 {
            return Ok(());
        }
        let trimmed = line.trim_end_matches(['\r', '\n']);
        let (op, rest) = trimmed.split_once(' ').unwrap_or((trimmed, ""));
        let args: Vec<&str> = rest.split_whitespace().collect();

        match op.to_ascii_uppercase().as_str() {
            "CONNECT" => {
                if !shared.running.load(Ordering::SeqCst) {
                    return Ok(());
                }
                let connect: Value = serde_json::from_str(rest).unwrap_or(Value::Null);
                if !authorized(&shared.config.lock(), &connect) {
                    shared.auth_failures.fetch_add(1, Ordering::SeqCst);
                    client.write(b"-ERR 'Authorization Violation'\r\n");
                    return Ok(());
                }
                client
                    .echo
                    .store(connect["echo"].as_bool().unwrap_or(true), Ordering::SeqCst);
                client.no_responders.store(
                    connect["no_responders"].as_bool().unwrap_or(false)
                        && connect["headers"].as_bool().unwrap_or(false),
                    Ordering::SeqCst,
                );
                shared.connects.lock().push(connect);
                shared.clients.lock().insert(client.id, client.clone());
                connected = true;
            }
            "PING" => {
                if !connected {
                    continue;
                }
                if !handshake_done || shared.config.lock().respond_to_ping {
                    client.write(b"PONG\r\n");
                }
                handshake_done = true;
            }
            "PONG" => {}
            "SUB" if connected => {
                let (subject, queue, sid) = match args.as_slice() {
                    [subject, sid] => (*subject, None, *sid),
                    [subject, queue, sid] => (*subject, Some(queue.to_string()), *sid),
                    _ => continue,
                };
                let Ok(sid) = sid.parse::<u64>() else {
                    continue;
                };
                shared.sub_commands.fetch_add(1, Ordering::SeqCst);
                client.subs.lock().insert(
                    sid,
                    SubEntry {
                        subject: subject.to_string(),
                        queue,
                        max: None,
                        delivered: 0,
                    },
                );
            }
            "UNSUB" if connected => {
                let Some(Ok(sid)) = args.first().map(|s| s.parse::<u64>()) else {
                    continue;
                };
                shared.unsub_commands.fetch_add(1, Ordering::SeqCst);
                let max = args.get(1).and_then(|m| m.parse::<u64>().ok());
                let mut subs = client.subs.lock();
                match max {
                    Some(max) => {
                        let done = subs.get_mut(&sid).is_some_and(|entry| {
                            entry.max = Some(max);
                            entry.delivered >= max
                        });
                        if done {
                            subs.remove(&sid);
                        }
                    }
                    None => {
                        subs.remove(&sid);
                    }
                }
            }
            "PUB" if connected => {
                let (subject, reply, size) = match args.as_slice() {
                    [subject, size] => (*subject, None, *size),
                    [subject, reply, size] => (*subject, Some(*reply), *size),
                    _ => return Ok(()),
                };
                let size: usize = size.parse().unwrap_or(0);
                let mut payload = vec![0u8; size + 2];
                reader.read_exact(&mut payload)?;
                payload.truncate(size);
                route(shared, Some(client), subject, reply, None, &payload);
            }
            "HPUB" if connected => {
                let (subject, reply, hdr, total) = match args.as_slice() {
                    [subject, hdr, total] => (*subject, None, *hdr, *total),
                    [subject, reply, hdr, total] => (*subject, Some(*reply), *hdr, *total),
                    _ => return Ok(()),
                };
                let hdr: usize = hdr.parse().unwrap_or(0);
                let total: usize = total.parse().unwrap_or(0);
                let mut data = vec![0u8; total + 2];
                reader.read_exact(&mut data)?;
                data.truncate(total);
                let payload = data.split_off(hdr.min(total));
                route(shared, Some(client), subject, reply, Some(&data), &payload);
            }
            "" => {}
            _ => {
                client.write(b"-ERR 'Unknown Protocol Operation'\r\n");
            }
        }
    }
}

/// Whether `subject` matches the subscription `pattern`
pub(crate) fn subject_matches(pattern: &str, subject: &str) -> bool {
    let mut pattern = pattern.split('.');
    let mut subject = subject.split('.');
    loop {
        match (pattern.next(), subject.next()) {
            (Some(">"), Some(_)) => return true,
            (Some("*"), Some(_)) => {}
            (Some(p), Some(s)) if p == s => {}
            (None, None) => return true,
            _ => return false,
        }
    }
}

struct Target {
    client: Arc<Client>,
    sid: u64,
}

fn route(
    shared: &Arc<Shared>,
    from: Option<&Arc<Client>>,
    subject: &str,
    reply: Option<&str>,
    headers: Option<&[u8]>,
    payload: &[u8],
) {
    shared.published.lock().push(Published {
        subject: subject.to_string(),
        reply: reply.map(str::to_string),
        headers: headers.map(<[u8]>::to_vec),
        payload: payload.to_vec(),
    });

    let mut targets = Vec::new();
    let mut groups: HashMap<String, Vec<Target>> = HashMap::new();
    {
        let clients = shared.clients.lock();
        let mut ids: Vec<_> = clients.keys().copied().collect();
        ids.sort_unstable();
        for id in ids {
            let client = &clients[&id];
            let is_sender = from.is_some_and(|f| f.id == client.id);
            if is_sender && !client.echo.load(Ordering::SeqCst) {
                continue;
            }
            let subs = client.subs.lock();
            let mut sids: Vec<_> = subs.keys().copied().collect();
            sids.sort_unstable();
            for sid in sids {
                let entry = &subs[&sid];
                if !subject_matches(&entry.subject, subject) {
                    continue;
                }
                let target = Target {
                    client: client.clone(),
                    sid,
                };
                match &entry.queue {
                    Some(queue) => groups.entry(queue.clone()).or_default().push(target),
                    None => targets.push(target),
                }
            }
        }
    }
    for (_, mut members) in groups {
        let pick = shared.queue_rr.fetch_add(1, Ordering::SeqCst) % members.len();
        targets.push(members.swap_remove(pick));
    }

    if targets.is_empty() {
        if let (Some(from), Some(reply)) = (from, reply) {
            if from.no_responders.load(Ordering::SeqCst) && shared.config.lock().headers {
                no_responders(from, reply);
            }
        }
        return;
    }

    for target in targets {
        if !claim_delivery(&target) {
            continue;
        }
        target
            .client
            .write(&msg_frame(subject, target.sid, reply, headers, payload));
    }
}

/// Count a delivery against the subscription's auto-unsubscribe budget
fn claim_delivery(target: &Target) -> bool {
    let mut subs = target.client.subs.lock();
    let Some(entry) = subs.get_mut(&target.sid) else {
        return false;
    };
    entry.delivered += 1;
    if entry.max.is_some_and(|max| entry.delivered >= max) {
        subs.remove(&target.sid);
    }
    true
}

fn no_responders(client: &Arc<Client>, reply: &str) {
    let sid = {
        let subs = client.subs.lock();
        subs.iter()
            .filter(|(_, e)| subject_matches(&e.subject, reply))
            .map(|(sid, _)| *sid)
            .min()
    };
    if let Some(sid) = sid {
        client.write(&msg_frame(reply, sid, None, Some(NO_RESPONDERS_HEADER), b""));
    }
}

fn msg_frame(
    subject: &str,
    sid: u64,
    reply: Option<&str>,
    headers: Option<&[u8]>,
    payload: &[u8],
) -> Vec<u8> {
    let reply = reply.map(|r| format!(" {}", r)).unwrap_or_default();
    let mut frame = match headers {
        Some(hdr) => format!(
            "HMSG {} {}{} {} {}\r\n",
            subject,
            sid,
            reply,
            hdr.len(),
            hdr.len() + payload.len()
        )
        .into_bytes(),
        None => format!("MSG {} {}{} {}\r\n", subject, sid, reply, payload.len()).into_bytes(),
    };
    if let Some(hdr) = headers {
        frame.extend_from_slice(hdr);
    }
    frame.extend_from_slice(payload);
    frame.extend_from_slice(b"\r\n");
    frame
}
