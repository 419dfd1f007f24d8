//! Common test helpers and utilities for nats-rs tests
//!
//! This crate provides:
//! - An in-process [`MockServer`] speaking the server side of the protocol
//! - Condition-based waiting (no hardcoded sleeps)
//! - A [`MessageCollector`] for subscription callbacks

mod mock_server;

pub use mock_server::{MockServer, MockServerConfig, Published};

use nats_core::Message;
use parking_lot::{Condvar, Mutex};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Default test timeout
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

/// Default condition check interval
pub const DEFAULT_CHECK_INTERVAL: Duration = Duration::from_millis(10);

/// Route `tracing` output to the test harness, once per process
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_test_writer()
        .try_init();
}

// ============================================================================
// Port Allocation
// ============================================================================

/// Find an available TCP port for testing
pub fn find_available_port() -> u16 {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap().port()
}

// ============================================================================
// Condition-Based Waiting
// ============================================================================

/// Poll `check` until it holds or `max_wait` elapsed
pub fn wait_for<F>(check: F, interval: Duration, max_wait: Duration) -> bool
where
    F: Fn() -> bool,
{
    let start = Instant::now();
    while start.elapsed() < max_wait {
        if check() {
            return true;
        }
        std::thread::sleep(interval);
    }
    check()
}

/// Wait for an atomic counter to reach a target value
pub fn wait_for_count(counter: &AtomicU32, target: u32, max_wait: Duration) -> bool {
    wait_for(
        || counter.load(Ordering::SeqCst) >= target,
        DEFAULT_CHECK_INTERVAL,
        max_wait,
    )
}

/// Wait for a boolean flag to become true
pub fn wait_for_flag(flag: &AtomicBool, max_wait: Duration) -> bool {
    wait_for(
        || flag.load(Ordering::SeqCst),
        DEFAULT_CHECK_INTERVAL,
        max_wait,
    )
}

// ============================================================================
// Test Collectors - for verifying received messages
// ============================================================================

/// Collector for subscription messages with thread-safe access
#[derive(Clone, Default)]
pub struct MessageCollector {
    inner: Arc<(Mutex<Vec<Message>>, Condvar)>,
}

impl MessageCollector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a handler for asynchronous subscriptions
    pub fn callback(&self) -> impl Fn(Message) + Send + Sync + 'static {
        let inner = self.inner.clone();
        move |msg| {
            let (messages, cond) = &*inner;
            messages.lock().push(msg);
            cond.notify_all();
        }
    }

    pub fn count(&self) -> usize {
        self.inner.0.lock().len()
    }

    /// Wait for at least `n` messages
    pub fn wait_for_count(&self, n: usize, max_wait: Duration) -> bool {
        let deadline = Instant::now() + max_wait;
        let (messages, cond) = &*self.inner;
        let mut guard = messages.lock();
        while guard.len() < n {
            if cond.wait_until(&mut guard, deadline).timed_out() {
                return guard.len() >= n;
            }
        }
        true
    }

    pub fn messages(&self) -> Vec<Message> {
        self.inner.0.lock().clone()
    }

    pub fn subjects(&self) -> Vec<String> {
        self.inner.0.lock().iter().map(|m| m.subject.clone()).collect()
    }

    pub fn payloads(&self) -> Vec<Vec<u8>> {
        self.inner
            .0
            .lock()
            .iter()
            .map(|m| m.payload.to_vec())
            .collect()
    }

    pub fn last(&self) -> Option<Message> {
        self.inner.0.lock().last().cloned()
    }

    pub fn clear(&self) {
        self.inner.0.lock().clear();
    }
}
