//! One-shot completion slot

use parking_lot::{Condvar, Mutex};
use std::time::{Duration, Instant};

/// A value produced once by one thread and collected by another.
///
/// The first `complete` wins; later ones are ignored.
pub(crate) struct Completion<T> {
    slot: Mutex<Slot<T>>,
    cond: Condvar,
}

struct Slot<T> {
    value: Option<T>,
    done: bool,
}

impl<T> Completion<T> {
    pub(crate) fn new() -> Self {
        Self {
            slot: Mutex::new(Slot {
                value: None,
                done: false,
            }),
            cond: Condvar::new(),
        }
    }

    /// Store `value` and wake the waiter. Returns false if already completed.
    pub(crate) fn complete(&self, value: T) -> bool {
        let mut slot = self.slot.lock();
        if slot.done {
            return false;
        }
        slot.done = true;
        slot.value = Some(value);
        self.cond.notify_all();
        true
    }

    /// Block until completed or `timeout` elapsed, taking the value
    pub(crate) fn wait(&self, timeout: Duration) -> Option<T> {
        let deadline = Instant::now() + timeout;
        let mut slot = self.slot.lock();
        while !slot.done {
            if self.cond.wait_until(&mut slot, deadline).timed_out() {
                break;
            }
        }
        slot.value.take()
    }
}
