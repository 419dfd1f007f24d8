//! Dispatch workers
//!
//! A worker owns one thread and a FIFO of [`Work`]. Asynchronous
//! subscriptions sharing a worker get their callbacks invoked one at a
//! time, in enqueue order. A subscription's drain marker goes through the
//! same FIFO as its messages, so completion always runs after the last
//! callback has returned.

use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::sync::Arc;
use std::thread::JoinHandle;
use tracing::{debug, trace};

use crate::subscription::SubShared;
use crate::Result;

pub(crate) type Callback = Box<dyn FnOnce() + Send>;

pub(crate) enum Work {
    /// Deliver the oldest pending message of the subscription
    Deliver(Arc<SubShared>),
    /// Every message queued before the drain was delivered
    DrainDone(Arc<SubShared>),
    /// The subscription is gone; run its completion callback
    Complete {
        on_complete: Option<Callback>,
        last: bool,
    },
    /// Connection notification
    Event(Callback),
    Stop,
}

struct Queue {
    items: VecDeque<Work>,
    stopped: bool,
}

struct Shared {
    queue: Mutex<Queue>,
    cond: Condvar,
}

/// Handle on a worker thread
#[derive(Clone)]
pub(crate) struct Dispatcher {
    shared: Arc<Shared>,
}

impl Dispatcher {
    /// Start a worker thread named `name`
    pub(crate) fn spawn(name: String) -> Result<(Self, JoinHandle<()>)> {
        let shared = Arc::new(Shared {
            queue: Mutex::new(Queue {
                items: VecDeque::new(),
                stopped: false,
            }),
            cond: Condvar::new(),
        });
        let worker = shared.clone();
        let handle = std::thread::Builder::new()
            .name(name.clone())
            .spawn(move || run(worker, name))?;
        Ok((Self { shared }, handle))
    }

    /// Queue work. Returns false once the worker has been stopped.
    pub(crate) fn push(&self, work: Work) -> bool {
        let mut queue = self.shared.queue.lock();
        if queue.stopped {
            return false;
        }
        if matches!(work, Work::Stop) {
            queue.stopped = true;
        }
        queue.items.push_back(work);
        self.shared.cond.notify_one();
        true
    }

    pub(crate) fn stop(&self) {
        self.push(Work::Stop);
    }

    #[cfg(test)]
    pub(crate) fn same_worker(&self, other: &Dispatcher) -> bool {
        Arc::ptr_eq(&self.shared, &other.shared)
    }
}

fn run(shared: Arc<Shared>, name: String) {
    debug!("Dispatcher {} started", name);
    loop {
        let work = {
            let mut queue = shared.queue.lock();
            loop {
                if let Some(work) = queue.items.pop_front() {
                    break work;
                }
                shared.cond.wait(&mut queue);
            }
        };

        match work {
            Work::Deliver(sub) => sub.deliver_next(),
            Work::DrainDone(sub) => {
                sub.drain_done();
                if sub.has_dedicated_worker() {
                    break;
                }
            }
            Work::Complete { on_complete, last } => {
                if let Some(cb) = on_complete {
                    cb();
                }
                if last {
                    break;
                }
            }
            Work::Event(cb) => cb(),
            Work::Stop => break,
        }
    }

    let mut queue = shared.queue.lock();
    queue.stopped = true;
    trace!("Dispatcher {} dropped {} queued items", name, queue.items.len());
    queue.items.clear();
    debug!("Dispatcher {} stopped", name);
}
