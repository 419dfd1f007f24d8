//! Subscriptions
//!
//! Messages routed to a subscription are queued under the subscription's
//! own lock, so unrelated subscriptions never contend with each other or
//! with the connection lock. Each queue is bounded by a message count and a
//! byte count; once either limit is hit, incoming messages are dropped and
//! the subscription is flagged as a slow consumer until a message fits
//! again.
//!
//! Delivery comes in three flavours:
//! - synchronous: the application pulls with [`Subscription::next_message`]
//! - asynchronous: a dispatcher thread invokes the handler
//! - internal: the handler runs on the reader thread (library use only)

use parking_lot::{Condvar, Mutex};
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tracing::debug;

use nats_core::Message;

use crate::connection::ConnInner;
use crate::dispatch::{Callback, Dispatcher, Work};
use crate::{Error, Result};

/// Message handler of an asynchronous subscription
pub type MsgHandler = Arc<dyn Fn(Message) + Send + Sync>;

pub(crate) enum Delivery {
    Sync,
    Async {
        handler: MsgHandler,
        dispatcher: Dispatcher,
        dedicated: bool,
    },
    Internal(MsgHandler),
}

/// Per-subscription settings
#[derive(Debug, Clone, Copy, Default)]
pub struct SubscribeOptions {
    /// Run the handler on a thread of its own instead of the shared pool
    pub dedicated_thread: bool,
    /// Pending limits (messages, bytes), overriding the connection defaults
    pub pending_limits: Option<(i64, i64)>,
}

/// Where a drain stands
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DrainStatus {
    Draining,
    Completed,
    TimedOut,
    ConnectionClosed,
}

/// Counters of one subscription
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SubscriptionStats {
    pub pending_msgs: usize,
    pub pending_bytes: usize,
    pub max_pending_msgs: usize,
    pub max_pending_bytes: usize,
    pub delivered: u64,
    pub dropped: u64,
}

/// Why a subscription stopped
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Ending {
    Unsubscribed,
    MaxReached,
    DrainCompleted,
    DrainTimedOut,
    ConnectionClosed,
}

/// Result of routing one message to a subscription
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Enqueued {
    Queued { reached_max: bool },
    /// Over a pending limit; `notify` is set on the first drop of an episode
    Dropped { notify: bool },
    Ignored,
}

struct SubState {
    msgs: VecDeque<Message>,
    pending_bytes: usize,
    limit_msgs: i64,
    limit_bytes: i64,
    hwm_msgs: usize,
    hwm_bytes: usize,
    /// Messages accepted into the queue
    received: u64,
    delivered: u64,
    dropped: u64,
    slow: bool,
    max: Option<u64>,
    /// No further delivery
    closed: bool,
    /// Stops messages from the network once a drain's flush returned
    gate_closed: bool,
    ending: Option<Ending>,
    drain: Option<DrainStatus>,
    drain_deadline: Option<Instant>,
    on_complete: Option<Callback>,
}

pub(crate) struct SubShared {
    pub(crate) sid: u64,
    pub(crate) subject: String,
    pub(crate) queue: Option<String>,
    delivery: Delivery,
    state: Mutex<SubState>,
    cond: Condvar,
    pub(crate) conn: Weak<ConnInner>,
}

impl SubShared {
    pub(crate) fn new(
        sid: u64,
        subject: String,
        queue: Option<String>,
        delivery: Delivery,
        limits: (i64, i64),
        conn: Weak<ConnInner>,
    ) -> Arc<Self> {
        Arc::new(Self {
            sid,
            subject,
            queue,
            delivery,
            state: Mutex::new(SubState {
                msgs: VecDeque::new(),
                pending_bytes: 0,
                limit_msgs: limits.0,
                limit_bytes: limits.1,
                hwm_msgs: 0,
                hwm_bytes: 0,
                received: 0,
                delivered: 0,
                dropped: 0,
                slow: false,
                max: None,
                closed: false,
                gate_closed: false,
                ending: None,
                drain: None,
                drain_deadline: None,
                on_complete: None,
            }),
            cond: Condvar::new(),
            conn,
        })
    }

    pub(crate) fn is_internal(&self) -> bool {
        matches!(self.delivery, Delivery::Internal(_))
    }

    pub(crate) fn has_dedicated_worker(&self) -> bool {
        matches!(self.delivery, Delivery::Async { dedicated: true, .. })
    }

    pub(crate) fn is_finished(&self) -> bool {
        self.state.lock().ending.is_some()
    }

    /// Route a message from the network
    pub(crate) fn enqueue(self: &Arc<Self>, msg: Message) -> Enqueued {
        if let Delivery::Internal(handler) = &self.delivery {
            {
                let mut st = self.state.lock();
                if st.closed {
                    return Enqueued::Ignored;
                }
                st.received += 1;
                st.delivered += 1;
            }
            handler(msg);
            return Enqueued::Queued { reached_max: false };
        }

        let mut st = self.state.lock();
        if st.closed || st.gate_closed || st.max.is_some_and(|m| st.received >= m) {
            return Enqueued::Ignored;
        }

        let size = msg.size();
        let over_msgs = st.limit_msgs > 0 && st.msgs.len() as i64 >= st.limit_msgs;
        let over_bytes = st.limit_bytes > 0 && (st.pending_bytes + size) as i64 > st.limit_bytes;
        if over_msgs || over_bytes {
            st.dropped += 1;
            let notify = !st.slow;
            st.slow = true;
            return Enqueued::Dropped { notify };
        }

        st.slow = false;
        st.received += 1;
        st.pending_bytes += size;
        st.msgs.push_back(msg);
        st.hwm_msgs = st.hwm_msgs.max(st.msgs.len());
        st.hwm_bytes = st.hwm_bytes.max(st.pending_bytes);
        let reached_max = st.max.is_some_and(|m| st.received >= m);

        // Pushed under the lock so a drain marker can never overtake it.
        match &self.delivery {
            Delivery::Async { dispatcher, .. } => {
                dispatcher.push(Work::Deliver(self.clone()));
            }
            _ => {
                self.cond.notify_one();
            }
        }
        Enqueued::Queued { reached_max }
    }

    /// Invoke the handler with the oldest message (dispatcher thread)
    pub(crate) fn deliver_next(self: &Arc<Self>) {
        let Delivery::Async { handler, .. } = &self.delivery else {
            return;
        };

        let (msg, done) = {
            let mut st = self.state.lock();
            if st.closed {
                return;
            }
            if st.drain_deadline.is_some_and(|d| Instant::now() >= d) {
                drop(st);
                self.finish(Ending::DrainTimedOut, false);
                return;
            }
            let Some(msg) = st.msgs.pop_front() else {
                return;
            };
            st.pending_bytes -= msg.size();
            st.delivered += 1;
            (msg, st.max.is_some_and(|m| st.delivered >= m))
        };

        handler(msg);

        if done {
            self.finish(Ending::MaxReached, false);
            if let Some(conn) = self.conn.upgrade() {
                conn.forget_sub(self.sid);
            }
        }
    }

    /// Drain marker reached the front of the dispatcher queue
    pub(crate) fn drain_done(self: &Arc<Self>) {
        let ending = {
            let st = self.state.lock();
            if st.ending.is_some() {
                return;
            }
            match st.drain_deadline {
                Some(d) if Instant::now() >= d => Ending::DrainTimedOut,
                _ => Ending::DrainCompleted,
            }
        };
        self.finish(ending, true);
    }

    /// Pull the next message of a synchronous subscription
    pub(crate) fn next_message(self: &Arc<Self>, timeout: Duration) -> Result<Message> {
        if !matches!(self.delivery, Delivery::Sync) {
            return Err(Error::IllegalState(
                "not a synchronous subscription".into(),
            ));
        }

        let deadline = Instant::now() + timeout;
        let mut st = self.state.lock();
        loop {
            if let Some(msg) = st.msgs.pop_front() {
                st.pending_bytes -= msg.size();
                st.delivered += 1;
                let max_reached = st.max.is_some_and(|m| st.delivered >= m);
                let drained = st.gate_closed && st.msgs.is_empty();
                drop(st);

                if max_reached {
                    self.finish(Ending::MaxReached, false);
                    if let Some(conn) = self.conn.upgrade() {
                        conn.forget_sub(self.sid);
                    }
                } else if drained {
                    self.finish(Ending::DrainCompleted, false);
                }
                return Ok(msg);
            }

            if let Some(ending) = st.ending {
                return Err(match ending {
                    Ending::MaxReached => Error::MaxDeliveredMsgs,
                    Ending::ConnectionClosed => Error::Closed,
                    _ => Error::InvalidSubscription,
                });
            }
            if st.gate_closed {
                drop(st);
                self.finish(Ending::DrainCompleted, false);
                return Err(Error::InvalidSubscription);
            }
            if st.slow {
                // Report the drops to the reader once.
                st.slow = false;
                return Err(Error::SlowConsumer);
            }
            if self.cond.wait_until(&mut st, deadline).timed_out() && st.msgs.is_empty() {
                return Err(Error::Timeout);
            }
        }
    }

    /// Terminate the subscription. Only the first call has an effect.
    ///
    /// The completion callback of an asynchronous subscription runs on its
    /// dispatcher, after any handler call in progress; `inline` runs it
    /// right away when already on that dispatcher.
    pub(crate) fn finish(self: &Arc<Self>, ending: Ending, inline: bool) -> bool {
        let cb = {
            let mut st = self.state.lock();
            if st.ending.is_some() {
                return false;
            }
            st.ending = Some(ending);
            st.closed = true;
            st.msgs.clear();
            st.pending_bytes = 0;
            if st.drain.is_some() {
                st.drain = Some(match ending {
                    Ending::DrainTimedOut => DrainStatus::TimedOut,
                    Ending::ConnectionClosed => DrainStatus::ConnectionClosed,
                    _ => DrainStatus::Completed,
                });
            }
            self.cond.notify_all();

            let cb = st.on_complete.take();
            match &self.delivery {
                Delivery::Async {
                    dispatcher,
                    dedicated,
                    ..
                } if !inline => {
                    dispatcher.push(Work::Complete {
                        on_complete: cb,
                        last: *dedicated,
                    });
                    None
                }
                _ => cb,
            }
        };

        debug!("Subscription {} on '{}' ended: {:?}", self.sid, self.subject, ending);
        if let Some(cb) = cb {
            cb();
        }
        true
    }

    /// Mark the subscription as draining. False if it already was.
    pub(crate) fn begin_drain(&self, deadline: Instant) -> Result<bool> {
        let mut st = self.state.lock();
        if st.ending.is_some() {
            return Err(Error::InvalidSubscription);
        }
        if st.drain.is_some() {
            return Ok(false);
        }
        st.drain = Some(DrainStatus::Draining);
        st.drain_deadline = Some(deadline);
        Ok(true)
    }

    /// Stop accepting network messages and complete once the queue empties
    pub(crate) fn seal_drain(self: &Arc<Self>) {
        let mut st = self.state.lock();
        if st.ending.is_some() {
            return;
        }
        st.gate_closed = true;
        match &self.delivery {
            Delivery::Async { dispatcher, .. } => {
                dispatcher.push(Work::DrainDone(self.clone()));
            }
            Delivery::Sync => {
                let empty = st.msgs.is_empty();
                self.cond.notify_all();
                drop(st);
                if empty {
                    self.finish(Ending::DrainCompleted, false);
                }
            }
            Delivery::Internal(_) => {
                drop(st);
                self.finish(Ending::DrainCompleted, false);
            }
        }
    }

    /// Block until the drain finished or `timeout` elapsed
    pub(crate) fn wait_drain(self: &Arc<Self>, timeout: Duration) -> Result<()> {
        let wait_deadline = Instant::now() + timeout;
        let mut st = self.state.lock();
        loop {
            match st.drain {
                None => {
                    return Err(Error::IllegalState("subscription is not draining".into()))
                }
                Some(DrainStatus::Completed) => return Ok(()),
                Some(DrainStatus::TimedOut) => return Err(Error::Timeout),
                Some(DrainStatus::ConnectionClosed) => return Err(Error::Closed),
                Some(DrainStatus::Draining) => {}
            }

            let drain_deadline = st.drain_deadline;
            let until = match drain_deadline {
                Some(d) if d < wait_deadline => d,
                _ => wait_deadline,
            };
            if Instant::now() >= until {
                if drain_deadline.is_some_and(|d| Instant::now() >= d) {
                    drop(st);
                    self.finish(Ending::DrainTimedOut, false);
                }
                return Err(Error::Timeout);
            }
            self.cond.wait_until(&mut st, until);
        }
    }

    pub(crate) fn drain_status(&self) -> Option<DrainStatus> {
        self.state.lock().drain
    }

    /// Limit delivery to `max` messages in total. True if already reached.
    pub(crate) fn set_max(&self, max: u64) -> bool {
        let mut st = self.state.lock();
        st.max = Some(max);
        st.delivered >= max
    }

    /// What to send when re-subscribing: `None` if the subscription should
    /// not be restored, otherwise the remaining auto-unsubscribe budget.
    pub(crate) fn resend_info(&self) -> Option<Option<u64>> {
        let st = self.state.lock();
        if st.ending.is_some() || st.drain.is_some() {
            return None;
        }
        Some(st.max.map(|m| m.saturating_sub(st.received)))
    }

    pub(crate) fn set_on_complete(&self, cb: Callback) -> Result<()> {
        let mut st = self.state.lock();
        if st.ending.is_some() {
            return Err(Error::InvalidSubscription);
        }
        st.on_complete = Some(cb);
        Ok(())
    }

    pub(crate) fn set_pending_limits(&self, msgs: i64, bytes: i64) -> Result<()> {
        if msgs == 0 || bytes == 0 {
            return Err(Error::InvalidArg("pending limits cannot be zero".into()));
        }
        let mut st = self.state.lock();
        st.limit_msgs = msgs;
        st.limit_bytes = bytes;
        Ok(())
    }

    pub(crate) fn stats(&self) -> SubscriptionStats {
        let st = self.state.lock();
        SubscriptionStats {
            pending_msgs: st.msgs.len(),
            pending_bytes: st.pending_bytes,
            max_pending_msgs: st.hwm_msgs,
            max_pending_bytes: st.hwm_bytes,
            delivered: st.delivered,
            dropped: st.dropped,
        }
    }
}

/// Handle on a subscription
#[derive(Clone)]
pub struct Subscription {
    pub(crate) shared: Arc<SubShared>,
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("sid", &self.shared.sid)
            .field("subject", &self.shared.subject)
            .field("queue", &self.shared.queue)
            .finish()
    }
}

impl Subscription {
    pub(crate) fn from_shared(shared: Arc<SubShared>) -> Self {
        Self { shared }
    }

    fn connection(&self) -> Result<Arc<ConnInner>> {
        self.shared.conn.upgrade().ok_or(Error::Closed)
    }

    pub fn sid(&self) -> u64 {
        self.shared.sid
    }

    pub fn subject(&self) -> &str {
        &self.shared.subject
    }

    pub fn queue(&self) -> Option<&str> {
        self.shared.queue.as_deref()
    }

    /// Whether messages can still be delivered
    pub fn is_valid(&self) -> bool {
        !self.shared.is_finished() && self.shared.conn.strong_count() > 0
    }

    /// Next message of a synchronous subscription.
    ///
    /// Returns `Error::SlowConsumer` once after messages were dropped.
    pub fn next_message(&self, timeout: Duration) -> Result<Message> {
        self.shared.next_message(timeout)
    }

    /// Messages and bytes waiting for delivery
    pub fn pending(&self) -> (usize, usize) {
        let stats = self.shared.stats();
        (stats.pending_msgs, stats.pending_bytes)
    }

    /// Change the pending limits; negative values mean unlimited
    pub fn set_pending_limits(&self, msgs: i64, bytes: i64) -> Result<()> {
        self.shared.set_pending_limits(msgs, bytes)
    }

    pub fn pending_limits(&self) -> (i64, i64) {
        let st = self.shared.state.lock();
        (st.limit_msgs, st.limit_bytes)
    }

    /// Highest pending messages and bytes seen
    pub fn max_pending(&self) -> (usize, usize) {
        let stats = self.shared.stats();
        (stats.max_pending_msgs, stats.max_pending_bytes)
    }

    pub fn clear_max_pending(&self) {
        let mut st = self.shared.state.lock();
        st.hwm_msgs = 0;
        st.hwm_bytes = 0;
    }

    pub fn delivered(&self) -> u64 {
        self.shared.stats().delivered
    }

    pub fn dropped(&self) -> u64 {
        self.shared.stats().dropped
    }

    pub fn queued_msgs(&self) -> usize {
        self.shared.stats().pending_msgs
    }

    pub fn stats(&self) -> SubscriptionStats {
        self.shared.stats()
    }

    /// Unsubscribe once `max` messages in total have been delivered
    pub fn auto_unsubscribe(&self, max: u64) -> Result<()> {
        self.connection()?.auto_unsubscribe(&self.shared, max)
    }

    pub fn unsubscribe(&self) -> Result<()> {
        self.connection()?.unsubscribe(&self.shared)
    }

    /// Deliver what is already on its way, then stop, using the
    /// connection's drain timeout
    pub fn drain(&self) -> Result<()> {
        let conn = self.connection()?;
        let timeout = conn.opts.drain_timeout;
        conn.drain_sub(&self.shared, timeout)
    }

    pub fn drain_timeout(&self, timeout: Duration) -> Result<()> {
        self.connection()?.drain_sub(&self.shared, timeout)
    }

    pub fn wait_for_drain_completion(&self, timeout: Duration) -> Result<()> {
        self.shared.wait_drain(timeout)
    }

    /// `None` when no drain was started
    pub fn drain_completion_status(&self) -> Option<DrainStatus> {
        self.shared.drain_status()
    }

    /// Called once when the subscription ends, never concurrently with the
    /// message handler
    pub fn set_on_complete<F>(&self, cb: F) -> Result<()>
    where
        F: FnOnce() + Send + 'static,
    {
        self.shared.set_on_complete(Box::new(cb))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sync_sub(limits: (i64, i64)) -> Arc<SubShared> {
        SubShared::new(1, "foo".into(), None, Delivery::Sync, limits, Weak::new())
    }

    #[test]
    fn test_limit_drops_and_notifies_once() {
        let sub = sync_sub((3, -1));
        let mut notifications = 0;
        let mut dropped = 0;
        for i in 0..8 {
            match sub.enqueue(Message::new("foo", format!("m{}", i))) {
                Enqueued::Dropped { notify } => {
                    dropped += 1;
                    if notify {
                        notifications += 1;
                    }
                }
                Enqueued::Queued { .. } => {}
                Enqueued::Ignored => panic!("message ignored"),
            }
        }
        assert_eq!(dropped, 5);
        assert_eq!(notifications, 1);
        assert_eq!(sub.stats().dropped, 5);
        assert_eq!(sub.stats().pending_msgs, 3);
    }

    #[test]
    fn test_slow_flag_resets_when_backlog_clears() {
        let sub = sync_sub((1, -1));
        assert!(matches!(sub.enqueue(Message::new("foo", "a")), Enqueued::Queued { .. }));
        assert_eq!(sub.enqueue(Message::new("foo", "b")), Enqueued::Dropped { notify: true });
        sub.next_message(Duration::from_millis(10)).unwrap();
        assert!(matches!(sub.enqueue(Message::new("foo", "c")), Enqueued::Queued { .. }));
        assert_eq!(sub.enqueue(Message::new("foo", "d")), Enqueued::Dropped { notify: true });
    }

    #[test]
    fn test_byte_limit() {
        let sub = sync_sub((-1, 10));
        assert!(matches!(sub.enqueue(Message::new("foo", "12345")), Enqueued::Queued { .. }));
        assert!(matches!(sub.enqueue(Message::new("foo", "12345")), Enqueued::Queued { .. }));
        assert!(matches!(sub.enqueue(Message::new("foo", "1")), Enqueued::Dropped { .. }));
    }

    #[test]
    fn test_high_water_mark_clear_keeps_pending() {
        let sub = sync_sub((-1, -1));
        for _ in 0..4 {
            sub.enqueue(Message::new("foo", "x"));
        }
        sub.next_message(Duration::from_millis(10)).unwrap();
        let handle = Subscription::from_shared(sub);
        assert_eq!(handle.max_pending().0, 4);
        handle.clear_max_pending();
        assert_eq!(handle.max_pending(), (0, 0));
        assert_eq!(handle.pending().0, 3);
    }

    #[test]
    fn test_next_message_timeout() {
        let sub = sync_sub((-1, -1));
        assert!(matches!(
            sub.next_message(Duration::from_millis(20)),
            Err(Error::Timeout)
        ));
    }

    #[test]
    fn test_max_delivered() {
        let sub = sync_sub((-1, -1));
        sub.set_max(2);
        for _ in 0..3 {
            sub.enqueue(Message::new("foo", "x"));
        }
        assert!(sub.next_message(Duration::from_millis(10)).is_ok());
        assert!(sub.next_message(Duration::from_millis(10)).is_ok());
        assert!(matches!(
            sub.next_message(Duration::from_millis(10)),
            Err(Error::MaxDeliveredMsgs)
        ));
    }

    #[test]
    fn test_sync_drain_completes_when_consumed() {
        let sub = sync_sub((-1, -1));
        sub.enqueue(Message::new("foo", "a"));
        sub.enqueue(Message::new("foo", "b"));
        assert!(sub.begin_drain(Instant::now() + Duration::from_secs(5)).unwrap());
        sub.seal_drain();
        assert_eq!(sub.drain_status(), Some(DrainStatus::Draining));

        sub.next_message(Duration::from_millis(10)).unwrap();
        sub.next_message(Duration::from_millis(10)).unwrap();
        assert_eq!(sub.drain_status(), Some(DrainStatus::Completed));
        assert!(sub.wait_drain(Duration::from_millis(10)).is_ok());
    }

    #[test]
    fn test_drain_deadline() {
        let sub = sync_sub((-1, -1));
        sub.enqueue(Message::new("foo", "a"));
        sub.begin_drain(Instant::now() + Duration::from_millis(20)).unwrap();
        sub.seal_drain();
        assert!(matches!(
            sub.wait_drain(Duration::from_secs(5)),
            Err(Error::Timeout)
        ));
        assert_eq!(sub.drain_status(), Some(DrainStatus::TimedOut));
    }

    #[test]
    fn test_finish_runs_on_complete_once() {
        let sub = sync_sub((-1, -1));
        let (tx, rx) = std::sync::mpsc::channel();
        sub.set_on_complete(Box::new(move || tx.send(()).unwrap())).unwrap();
        assert!(sub.finish(Ending::Unsubscribed, false));
        assert!(!sub.finish(Ending::ConnectionClosed, false));
        assert_eq!(rx.try_iter().count(), 1);
    }
}
