//! Reconnect Integration Tests
//!
//! These tests verify that a connection:
//! 1. Reconnects after the server goes away and restores subscriptions
//! 2. Buffers publishes while disconnected, up to the configured limit
//! 3. Honors the reconnect wait, custom delays and the attempt limit
//! 4. Gives up after repeated authentication failures
//! 5. Detects stale connections through unanswered PINGs
//! 6. Learns cluster members and lame duck mode from asynchronous INFO

use nats_client::{Connection, Error, Options, Status};
use nats_test_utils::{
    find_available_port, init_tracing, wait_for, wait_for_count, wait_for_flag, MessageCollector,
    MockServer, MockServerConfig, DEFAULT_CHECK_INTERVAL, DEFAULT_TIMEOUT,
};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Options with fast, deterministic reconnects
fn fast_reconnect() -> Options {
    init_tracing();
    Options::new()
        .reconnect_wait(Duration::from_millis(50))
        .reconnect_jitter(Duration::ZERO, Duration::ZERO)
}

fn flag() -> Arc<AtomicBool> {
    Arc::new(AtomicBool::new(false))
}

fn wait_status(conn: &Connection, status: Status) -> bool {
    wait_for(|| conn.status() == status, DEFAULT_CHECK_INTERVAL, DEFAULT_TIMEOUT)
}

// ============================================================================
// Reconnect and resubscribe
// ============================================================================

#[test]
fn test_reconnect_restores_subscriptions() {
    let mut server = MockServer::start();
    let disconnected = flag();
    let reconnected = flag();
    let (d, r) = (disconnected.clone(), reconnected.clone());
    let conn = fast_reconnect()
        .url(&server.url())
        .disconnected_callback(move |_| d.store(true, Ordering::SeqCst))
        .reconnected_callback(move |_| r.store(true, Ordering::SeqCst))
        .connect()
        .unwrap();

    let collector = MessageCollector::new();
    let _sub = conn.subscribe("foo", collector.callback()).unwrap();
    conn.flush().unwrap();

    server.restart();
    assert!(wait_for_flag(&disconnected, DEFAULT_TIMEOUT));
    assert!(wait_for_flag(&reconnected, DEFAULT_TIMEOUT));
    assert!(server.wait_for_subs(1, DEFAULT_TIMEOUT));

    server.publish("foo", None, b"after");
    assert!(collector.wait_for_count(1, DEFAULT_TIMEOUT));
    assert_eq!(collector.payloads(), vec![b"after".to_vec()]);
    assert_eq!(conn.stats().reconnects, 1);
    assert_eq!(conn.status(), Status::Connected);
}

#[test]
fn test_auto_unsubscribe_remainder_restored() {
    let mut server = MockServer::start();
    let conn = fast_reconnect().url(&server.url()).connect().unwrap();

    let sub = conn.subscribe_sync("counted").unwrap();
    sub.auto_unsubscribe(3).unwrap();
    conn.publish("counted", "1").unwrap();
    sub.next_message(DEFAULT_TIMEOUT).unwrap();

    server.restart();
    assert!(server.wait_for_subs(1, DEFAULT_TIMEOUT));
    assert!(wait_status(&conn, Status::Connected));

    for _ in 0..5 {
        server.publish("counted", None, b"x");
    }
    sub.next_message(DEFAULT_TIMEOUT).unwrap();
    sub.next_message(DEFAULT_TIMEOUT).unwrap();
    assert!(matches!(
        sub.next_message(Duration::from_millis(100)),
        Err(Error::MaxDeliveredMsgs)
    ));
}

#[test]
fn test_publish_buffered_while_disconnected() {
    let mut server = MockServer::start();
    let port = server.port();
    let conn = fast_reconnect().url(&server.url()).connect().unwrap();

    server.stop();
    assert!(wait_status(&conn, Status::Reconnecting));
    assert!(conn.is_reconnecting());
    conn.publish("buffered", "kept").unwrap();
    assert!(conn.buffered() > 0);

    let server = MockServer::start_on(port, MockServerConfig::default());
    assert!(wait_for(
        || server.published().iter().any(|p| p.subject == "buffered"),
        DEFAULT_CHECK_INTERVAL,
        DEFAULT_TIMEOUT
    ));
    let published = server.published();
    let msg = published.iter().find(|p| p.subject == "buffered").unwrap();
    assert_eq!(msg.payload, b"kept");
}

#[test]
fn test_subscribe_while_reconnecting_sent_once() {
    let mut server = MockServer::start();
    let port = server.port();
    let conn = fast_reconnect().url(&server.url()).connect().unwrap();

    server.stop();
    assert!(wait_status(&conn, Status::Reconnecting));
    let sub = conn.subscribe_sync("late.sub").unwrap();
    sub.auto_unsubscribe(5).unwrap();
    assert_eq!(conn.buffered(), 0);

    let server = MockServer::start_on(port, MockServerConfig::default());
    assert!(wait_status(&conn, Status::Connected));
    conn.flush().unwrap();
    assert_eq!(server.sub_commands(), 1);
    assert_eq!(server.unsub_commands(), 1);

    server.publish("late.sub", None, b"x");
    sub.next_message(DEFAULT_TIMEOUT).unwrap();
}

#[test]
fn test_reconnect_buffer_limit() {
    let mut server = MockServer::start();
    let conn = fast_reconnect()
        .url(&server.url())
        .reconnect_buffer_size(32)
        .connect()
        .unwrap();

    server.stop();
    assert!(wait_status(&conn, Status::Reconnecting));
    let err = conn.publish("too.big", [0u8; 64]).unwrap_err();
    assert!(matches!(err, Error::InsufficientBuffer(32)));
    assert_eq!(conn.buffered(), 0);
}

#[test]
fn test_no_reconnect_closes() {
    let server = MockServer::start();
    let closed = flag();
    let c = closed.clone();
    init_tracing();
    let conn = Options::new()
        .url(&server.url())
        .allow_reconnect(false)
        .closed_callback(move |_| c.store(true, Ordering::SeqCst))
        .connect()
        .unwrap();

    server.disconnect_clients();
    assert!(wait_for_flag(&closed, DEFAULT_TIMEOUT));
    assert!(conn.is_closed());
}

// ============================================================================
// Reconnect pacing and limits
// ============================================================================

#[test]
fn test_reconnect_wait_respected() {
    let server = MockServer::start();
    let reconnected = flag();
    let r = reconnected.clone();
    init_tracing();
    let conn = Options::new()
        .url(&server.url())
        .reconnect_wait(Duration::from_millis(400))
        .reconnect_jitter(Duration::ZERO, Duration::ZERO)
        .reconnected_callback(move |_| r.store(true, Ordering::SeqCst))
        .connect()
        .unwrap();

    let start = Instant::now();
    server.disconnect_clients();
    assert!(wait_for_flag(&reconnected, DEFAULT_TIMEOUT));
    assert!(
        start.elapsed() >= Duration::from_millis(350),
        "reconnected after {:?}",
        start.elapsed()
    );
    assert_eq!(conn.status(), Status::Connected);
}

#[test]
fn test_max_reconnect_closes() {
    let mut server = MockServer::start();
    let closed = flag();
    let c = closed.clone();
    let conn = fast_reconnect()
        .url(&server.url())
        .max_reconnect(2)
        .reconnect_wait(Duration::from_millis(20))
        .closed_callback(move |_| c.store(true, Ordering::SeqCst))
        .connect()
        .unwrap();

    server.stop();
    assert!(wait_for_flag(&closed, DEFAULT_TIMEOUT));
    assert!(conn.is_closed());
    assert!(matches!(*conn.last_error().unwrap(), Error::NoServers));
}

#[test]
fn test_attempt_limit_spaced_by_wait() {
    let mut server = MockServer::start();
    let closed = Arc::new(Mutex::new(None));
    let c = closed.clone();
    let conn = fast_reconnect()
        .url(&server.url())
        .max_reconnect(3)
        .reconnect_wait(Duration::from_millis(100))
        .timeout(Duration::from_millis(500))
        .closed_callback(move |_| *c.lock() = Some(Instant::now()))
        .connect()
        .unwrap();

    let start = Instant::now();
    server.stop();
    assert!(wait_for(
        || closed.lock().is_some(),
        DEFAULT_CHECK_INTERVAL,
        DEFAULT_TIMEOUT
    ));
    let elapsed = closed.lock().unwrap_or_else(Instant::now) - start;
    assert!(elapsed >= Duration::from_millis(280), "closed after {:?}", elapsed);
    assert!(
        elapsed < Duration::from_millis(300) + Duration::from_millis(500) + Duration::from_millis(300),
        "closed after {:?}",
        elapsed
    );
    assert!(conn.is_closed());
}

#[test]
fn test_custom_reconnect_delay() {
    let mut server = MockServer::start();
    let calls = Arc::new(AtomicU32::new(0));
    let counter = calls.clone();
    let conn = fast_reconnect()
        .url(&server.url())
        .custom_reconnect_delay(move |_passes| {
            counter.fetch_add(1, Ordering::SeqCst);
            Duration::from_millis(10)
        })
        .connect()
        .unwrap();

    server.stop();
    assert!(wait_for_count(&calls, 3, DEFAULT_TIMEOUT));
    conn.close();
}

#[test]
fn test_close_joins_reconnect_loop() {
    let port = find_available_port();
    let calls = Arc::new(AtomicU32::new(0));
    let counter = calls.clone();
    let conn = fast_reconnect()
        .url(&format!("nats://127.0.0.1:{}", port))
        .retry_on_failed_connect(true)
        .max_reconnect(-1)
        .custom_reconnect_delay(move |_passes| {
            counter.fetch_add(1, Ordering::SeqCst);
            Duration::from_millis(5)
        })
        .connect()
        .unwrap();
    assert!(wait_for_count(&calls, 2, DEFAULT_TIMEOUT));

    conn.close();
    let after_close = calls.load(Ordering::SeqCst);
    std::thread::sleep(Duration::from_millis(100));
    assert_eq!(calls.load(Ordering::SeqCst), after_close);
}

#[test]
fn test_retry_on_failed_connect() {
    let port = find_available_port();
    let conn = fast_reconnect()
        .url(&format!("nats://127.0.0.1:{}", port))
        .retry_on_failed_connect(true)
        .connect()
        .unwrap();
    assert_eq!(conn.status(), Status::Reconnecting);
    assert!(conn.connected_url().is_none());

    let server = MockServer::start_on(port, MockServerConfig::default());
    assert!(wait_status(&conn, Status::Connected));
    assert_eq!(server.connect_count(), 1);
    conn.publish("up", "now").unwrap();
}

#[test]
fn test_failover_to_second_server() {
    let first = MockServer::start();
    let second = MockServer::start();
    let conn = fast_reconnect()
        .servers(&[first.url(), second.url()])
        .no_randomize(true)
        .connect()
        .unwrap();
    assert!(conn.connected_url().unwrap().contains(&first.port().to_string()));

    drop(first);
    assert!(wait_for(
        || conn
            .connected_url()
            .is_some_and(|u| u.contains(&second.port().to_string())),
        DEFAULT_CHECK_INTERVAL,
        DEFAULT_TIMEOUT
    ));
    assert_eq!(conn.servers().len(), 2);
}

// ============================================================================
// Authentication failures
// ============================================================================

#[test]
fn test_auth_failures_stop_reconnect() {
    let server = MockServer::start_with(MockServerConfig {
        auth_token: Some("first".into()),
        ..Default::default()
    });
    let closed = flag();
    let c = closed.clone();
    let conn = fast_reconnect()
        .url(&server.url())
        .token("first")
        .max_auth_failures(2)
        .closed_callback(move |_| c.store(true, Ordering::SeqCst))
        .connect()
        .unwrap();

    server.configure(|cfg| cfg.auth_token = Some("rotated".into()));
    server.disconnect_clients();

    assert!(wait_for_flag(&closed, DEFAULT_TIMEOUT));
    assert!(conn.last_error().unwrap().is_auth_failure());
    assert_eq!(server.auth_failures(), 2);
}

// ============================================================================
// Stale connections
// ============================================================================

#[test]
fn test_unanswered_pings_trigger_reconnect() {
    let server = MockServer::start_with(MockServerConfig {
        respond_to_ping: false,
        ..Default::default()
    });
    let disconnected = flag();
    let d = disconnected.clone();
    let conn = fast_reconnect()
        .url(&server.url())
        .ping_interval(Duration::from_millis(50))
        .max_pings_outstanding(2)
        .disconnected_callback(move |_| d.store(true, Ordering::SeqCst))
        .connect()
        .unwrap();

    assert!(wait_for_flag(&disconnected, DEFAULT_TIMEOUT));
    assert!(wait_for(
        || server.connect_count() >= 2,
        DEFAULT_CHECK_INTERVAL,
        DEFAULT_TIMEOUT
    ));
    conn.close();
}

#[test]
fn test_stale_connection_error_reconnects() {
    let server = MockServer::start();
    let reconnected = flag();
    let r = reconnected.clone();
    let conn = fast_reconnect()
        .url(&server.url())
        .reconnected_callback(move |_| r.store(true, Ordering::SeqCst))
        .connect()
        .unwrap();

    server.send_err("Stale Connection");
    assert!(wait_for_flag(&reconnected, DEFAULT_TIMEOUT));
    assert_eq!(conn.status(), Status::Connected);
    assert!(matches!(
        *conn.last_error().unwrap(),
        Error::StaleConnection
    ));
}

#[test]
fn test_zero_ping_interval_disables_pinging() {
    let server = MockServer::start_with(MockServerConfig {
        respond_to_ping: false,
        ..Default::default()
    });
    let conn = fast_reconnect()
        .url(&server.url())
        .ping_interval(Duration::ZERO)
        .max_pings_outstanding(1)
        .connect()
        .unwrap();

    std::thread::sleep(Duration::from_millis(300));
    assert_eq!(conn.status(), Status::Connected);
    assert_eq!(conn.stats().reconnects, 0);
    assert_eq!(server.connect_count(), 1);
    conn.close();
}

#[test]
fn test_pending_flush_fails_on_disconnect() {
    let server = MockServer::start_with(MockServerConfig {
        respond_to_ping: false,
        ..Default::default()
    });
    let conn = fast_reconnect().url(&server.url()).connect().unwrap();

    let cutter = std::thread::spawn({
        let conn = conn.clone();
        move || {
            let result = conn.flush_timeout(Duration::from_secs(5));
            assert!(matches!(result, Err(Error::ConnectionFailed(_))));
        }
    });
    std::thread::sleep(Duration::from_millis(200));
    server.disconnect_clients();
    cutter.join().unwrap();
}

// ============================================================================
// Cluster topology
// ============================================================================

#[test]
fn test_discovered_servers() {
    let server = MockServer::start();
    let discovered = flag();
    let d = discovered.clone();
    let conn = fast_reconnect()
        .url(&server.url())
        .discovered_servers_callback(move |_| d.store(true, Ordering::SeqCst))
        .connect()
        .unwrap();
    assert!(conn.discovered_servers().is_empty());

    server.send_info(&["127.0.0.1:4333", "127.0.0.1:4334"], false);
    assert!(wait_for_flag(&discovered, DEFAULT_TIMEOUT));
    let found = conn.discovered_servers();
    assert_eq!(found.len(), 2);
    assert!(found.iter().any(|s| s.contains("4333")));
    assert_eq!(conn.servers().len(), 3);
}

#[test]
fn test_ignore_discovered_servers() {
    let server = MockServer::start();
    let conn = fast_reconnect()
        .url(&server.url())
        .ignore_discovered_servers(true)
        .connect()
        .unwrap();

    server.send_info(&["127.0.0.1:4333"], false);
    conn.flush().unwrap();
    assert!(conn.discovered_servers().is_empty());
}

#[test]
fn test_lame_duck_mode() {
    let server = MockServer::start();
    let lame = flag();
    let l = lame.clone();
    let conn = fast_reconnect()
        .url(&server.url())
        .lame_duck_callback(move |_| l.store(true, Ordering::SeqCst))
        .connect()
        .unwrap();

    server.send_info(&[], true);
    assert!(wait_for_flag(&lame, DEFAULT_TIMEOUT));
    assert_eq!(conn.status(), Status::Connected);
}

#[test]
fn test_callbacks_run_in_order() {
    let mut server = MockServer::start();
    let events = Arc::new(Mutex::new(Vec::new()));
    let (e1, e2, e3) = (events.clone(), events.clone(), events.clone());
    let conn = fast_reconnect()
        .url(&server.url())
        .disconnected_callback(move |_| e1.lock().push("disconnected"))
        .reconnected_callback(move |_| e2.lock().push("reconnected"))
        .closed_callback(move |_| e3.lock().push("closed"))
        .connect()
        .unwrap();

    server.restart();
    assert!(wait_status(&conn, Status::Connected));
    assert!(wait_for(
        || events.lock().len() >= 2,
        DEFAULT_CHECK_INTERVAL,
        DEFAULT_TIMEOUT
    ));
    conn.close();
    assert!(wait_for(
        || events.lock().len() >= 3,
        DEFAULT_CHECK_INTERVAL,
        DEFAULT_TIMEOUT
    ));
    assert_eq!(*events.lock(), vec!["disconnected", "reconnected", "closed"]);
}
