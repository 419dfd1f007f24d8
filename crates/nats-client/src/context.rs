//! Process-wide client context
//!
//! A [`Context`] owns the threads that run user code: a fixed pool of
//! message dispatchers shared by asynchronous subscriptions, and one
//! notification thread for connection callbacks. Connections created
//! without an explicit context get a private one that is shut down when
//! the connection closes.

use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use tracing::debug;

use crate::dispatch::{Callback, Dispatcher, Work};
use crate::{Error, Result};

pub struct Context {
    dispatchers: Vec<Dispatcher>,
    events: Dispatcher,
    next: AtomicUsize,
    handles: Mutex<Vec<JoinHandle<()>>>,
    /// Per-subscription workers still running
    dedicated: Mutex<Vec<(Dispatcher, JoinHandle<()>)>>,
    shut_down: AtomicBool,
}

impl std::fmt::Debug for Context {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Context")
            .field("dispatch_pool_size", &self.dispatchers.len())
            .field("shut_down", &self.shut_down.load(Ordering::Relaxed))
            .finish()
    }
}

impl Context {
    /// Start a context with `dispatch_pool_size` message dispatchers
    pub fn new(dispatch_pool_size: usize) -> Result<Arc<Self>> {
        if dispatch_pool_size == 0 {
            return Err(Error::InvalidArg(
                "dispatch pool size must be at least 1".into(),
            ));
        }

        let mut handles = Vec::with_capacity(dispatch_pool_size + 1);
        let mut dispatchers = Vec::with_capacity(dispatch_pool_size);
        for i in 0..dispatch_pool_size {
            let (dispatcher, handle) = Dispatcher::spawn(format!("nats-dispatch-{}", i))?;
            dispatchers.push(dispatcher);
            handles.push(handle);
        }
        let (events, handle) = Dispatcher::spawn("nats-events".to_string())?;
        handles.push(handle);

        debug!("Context started with {} dispatchers", dispatch_pool_size);
        Ok(Arc::new(Self {
            dispatchers,
            events,
            next: AtomicUsize::new(0),
            handles: Mutex::new(handles),
            dedicated: Mutex::new(Vec::new()),
            shut_down: AtomicBool::new(false),
        }))
    }

    pub fn dispatch_pool_size(&self) -> usize {
        self.dispatchers.len()
    }

    pub fn is_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::Acquire)
    }

    /// Pick a pooled dispatcher, round-robin
    pub(crate) fn assign(&self) -> Dispatcher {
        let idx = self.next.fetch_add(1, Ordering::Relaxed) % self.dispatchers.len();
        self.dispatchers[idx].clone()
    }

    /// A dispatcher with its own thread, ended by its subscription
    pub(crate) fn dedicated(&self, subject: &str) -> Result<Dispatcher> {
        let (dispatcher, handle) = Dispatcher::spawn(format!("nats-sub-{}", subject))?;
        let mut dedicated = self.dedicated.lock();
        // Checked under the lock that shutdown takes the workers with
        if self.is_shut_down() {
            dispatcher.stop();
            return Err(Error::IllegalState("context shut down".into()));
        }
        dedicated.retain(|(_, h)| !h.is_finished());
        dedicated.push((dispatcher.clone(), handle));
        Ok(dispatcher)
    }

    /// Run `cb` on the notification thread
    pub(crate) fn post_event(&self, cb: Callback) {
        if !self.events.push(Work::Event(cb)) {
            debug!("Context shut down, dropping notification");
        }
    }

    /// Stop every worker once it has run what is already queued.
    ///
    /// Waits for the workers, except the one calling if called from
    /// a callback.
    pub fn shutdown(&self) {
        if self.shut_down.swap(true, Ordering::AcqRel) {
            return;
        }
        for dispatcher in &self.dispatchers {
            dispatcher.stop();
        }
        self.events.stop();
        let dedicated = std::mem::take(&mut *self.dedicated.lock());
        for (dispatcher, _) in &dedicated {
            dispatcher.stop();
        }

        let current = std::thread::current().id();
        let mut handles = std::mem::take(&mut *self.handles.lock());
        handles.extend(dedicated.into_iter().map(|(_, handle)| handle));
        for handle in handles {
            if handle.thread().id() != current {
                let _ = handle.join();
            }
        }
        debug!("Context shut down");
    }
}

impl Drop for Context {
    fn drop(&mut self) {
        self.shutdown();
    }
}
